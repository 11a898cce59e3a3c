use actix_web::{web, HttpRequest, HttpResponse};
use rusqlite::Connection;

use crate::core::errors::{AppError, Result};
use crate::core::helpers::{redirect, verify_password};
use crate::core::query_params::{get_string, parse_query_params};
use crate::core::validation::{required, FormErrors};
use crate::models::models::{LoginForm, Session, User};
use crate::session::{
    create_session, delete_session, purge_expired_sessions, push_flash, removal_cookie,
    session_cookie, verify_csrf,
};
use crate::templates::{attr, csrf_input, field_errors, Page};
use crate::users::find_user_by_username;
use crate::AppState;

pub const INVALID_CREDENTIALS: &str = "Invalid username or password";

/// Accept `next` only when it is a path on this site. Anything with a scheme
/// or host (including protocol-relative `//host`) falls back to `/index`.
/// Browsers drop tabs and newlines from URLs, so `/\t/host` is `//host` to
/// them; control characters and whitespace are refused outright.
pub fn safe_next_target(next: Option<&str>) -> String {
    match next {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.contains("://")
                && !path.chars().any(|c| c.is_control() || c.is_whitespace()) =>
        {
            path.to_string()
        }
        _ => "/index".to_string(),
    }
}

fn next_param(req: &HttpRequest) -> Option<String> {
    let params = parse_query_params(&req.uri().to_string());
    get_string(&params, "next")
}

fn render_login(
    conn: &Connection,
    session: &Session,
    next: Option<&str>,
    form: &LoginForm,
    errors: &FormErrors,
) -> Result<HttpResponse> {
    let action = match next {
        Some(next) => format!("/login?next={}", urlencoding::encode(next)),
        None => "/login".to_string(),
    };
    let remember_checked = if form.remember_me.is_some() { " checked" } else { "" };

    Page::new(conn, session, None, "Sign In")?.render(
        "login.html",
        &[
            ("action", attr(&action)),
            ("csrf", csrf_input(session)),
            ("username", attr(&form.username)),
            ("username_errors", field_errors(errors, "username")),
            ("password_errors", field_errors(errors, "password")),
            ("remember_checked", remember_checked.to_string()),
        ],
    )
}

pub async fn login_page(
    state: web::Data<AppState>,
    session: Session,
    req: HttpRequest,
) -> Result<HttpResponse> {
    if session.user_id.is_some() {
        return Ok(redirect("/index"));
    }
    let next = next_param(&req);
    state.db.with_tx(|conn| {
        render_login(conn, &session, next.as_deref(), &LoginForm::default(), &FormErrors::default())
    })
}

/// Outcome of the locked part of a login attempt.
enum Attempt {
    Rejected(HttpResponse),
    Candidate(Option<User>),
}

pub async fn login(
    state: web::Data<AppState>,
    session: Session,
    req: HttpRequest,
    form: web::Form<LoginForm>,
) -> Result<HttpResponse> {
    if session.user_id.is_some() {
        return Ok(redirect("/index"));
    }
    let form = form.into_inner();
    let next = next_param(&req);

    let attempt = state.db.with_tx(|conn| {
        let mut errors = FormErrors::default();
        required(&mut errors, "username", &form.username);
        required(&mut errors, "password", &form.password);
        if !verify_csrf(&session, &form.csrf_token) {
            errors.add("csrf_token", "The CSRF token is invalid.");
            push_flash(conn, &session.id, "The form expired, please try again.")?;
        }
        if !errors.is_empty() {
            let page = render_login(conn, &session, next.as_deref(), &form, &errors)?;
            return Ok(Attempt::Rejected(page));
        }
        Ok(Attempt::Candidate(find_user_by_username(conn, &form.username)?))
    })?;

    // Password check runs without the database lock held
    let user = match attempt {
        Attempt::Rejected(page) => return Ok(page),
        Attempt::Candidate(user) => {
            user.filter(|user| verify_password(&form.password, &user.password_hash))
        }
    };

    state.db.with_tx(|conn| {
        // Unknown user and wrong password take the same path
        let Some(user) = user else {
            tracing::info!("failed login attempt");
            push_flash(conn, &session.id, INVALID_CREDENTIALS)?;
            return Ok(redirect("/login"));
        };

        // Fresh id on privilege change
        let remember = form.remember_me.is_some();
        delete_session(conn, &session.id)?;
        let purged = purge_expired_sessions(conn, &state.config)?;
        let logged_in = create_session(conn, Some(&user.id), remember)?;
        tracing::info!(user_id = %user.id, remember, purged, "user logged in");

        let mut response = redirect(&safe_next_target(next.as_deref()));
        response
            .add_cookie(&session_cookie(&logged_in, &state.config))
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(response)
    })
}

pub async fn logout(state: web::Data<AppState>, session: Session) -> Result<HttpResponse> {
    state.db.with_tx(|conn| delete_session(conn, &session.id))?;
    if let Some(user_id) = &session.user_id {
        tracing::info!(%user_id, "user logged out");
    }

    let mut response = redirect("/index");
    response
        .add_cookie(&removal_cookie())
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(response)
}
