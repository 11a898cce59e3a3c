pub mod auth;
pub mod config;
pub mod core;
pub mod follow;
pub mod models;
pub mod posts;
pub mod session;
pub mod templates;
pub mod users;

use actix_web::{web, HttpResponse};

use crate::config::Config;
use crate::core::db::Database;
use crate::core::errors::{AppError, Result};

/// Shared by every worker through `web::Data`.
pub struct AppState {
    pub db: Database,
    pub config: Config,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Self {
        Self { db, config }
    }
}

// === Routes ===
pub fn configure(cfg: &mut web::ServiceConfig) {
    // Malformed form bodies are a client error, not a validation message
    cfg.app_data(web::FormConfig::default().error_handler(|err, _req| {
        AppError::BadRequest(err.to_string()).into()
    }));

    cfg.service(
        web::resource(["/", "/index"])
            .route(web::get().to(posts::index))
            .route(web::post().to(posts::create_post)),
    )
    .service(
        web::resource("/login")
            .route(web::get().to(auth::login_page))
            .route(web::post().to(auth::login)),
    )
    .route("/logout", web::get().to(auth::logout))
    .service(
        web::resource("/register")
            .route(web::get().to(users::register_page))
            .route(web::post().to(users::register)),
    )
    .route("/user/{username}", web::get().to(users::user_profile))
    .service(
        web::resource("/edit_profile")
            .route(web::get().to(users::edit_profile_page))
            .route(web::post().to(users::edit_profile)),
    )
    .route("/follow/{username}", web::post().to(follow::follow))
    .route("/unfollow/{username}", web::post().to(follow::unfollow))
    // Old form action without the separator
    .route("/unfollow{username}", web::post().to(follow::unfollow))
    .route("/explore", web::get().to(posts::explore))
    .route("/static/{file:.*}", web::get().to(core::static_server::serve_static))
    .default_service(web::to(not_found));
}

async fn not_found() -> Result<HttpResponse> {
    Err(AppError::NotFound("route".to_string()))
}
