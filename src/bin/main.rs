use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use tracing::info;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

use murmur::config::Config;
use murmur::core::db::{init_test_data, Database};
use murmur::session::{purge_expired_sessions, session_middleware};
use murmur::AppState;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,murmur=debug")),
        )
        .init();

    let config = Config::from_env();
    info!("Starting murmur v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::open(&config.database_path)?;
    info!(path = %config.database_path.display(), "database ready");

    if config.seed_demo_data {
        init_test_data(&db)?;
        info!("demo users seeded (test, alice, bob)");
    }

    let purged = db.with_tx(|conn| purge_expired_sessions(conn, &config))?;
    info!(purged, "expired sessions cleared");

    let bind_addr = config.bind_addr.clone();
    let state = web::Data::new(AppState::new(db, config));

    info!("Server listening on http://{bind_addr}");
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(from_fn(session_middleware))
            .wrap(TracingLogger::default())
            .configure(murmur::configure)
    })
    .bind(&bind_addr)?
    .run()
    .await?;

    Ok(())
}
