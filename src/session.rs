//! Server-side sessions.
//!
//! Every visitor gets a row in `sessions`, identified by a random id carried
//! in the [`SESSION_COOKIE`]. The row records the logged-in user (if any), the
//! remember-me flag and the anti-forgery token. Flash messages hang off the
//! session and are consumed by the next rendered page.
//!
//! [`session_middleware`] resolves the session before any handler runs and
//! stores it in the request extensions; handlers receive it through the
//! [`Session`] and [`CurrentUser`] extractors.

use std::future::{ready, Ready};

use actix_web::body::MessageBody;
use actix_web::cookie::{time::Duration, Cookie, SameSite};
use actix_web::dev::{Payload, ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, Error, FromRequest, HttpMessage, HttpRequest};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::config::{Config, CSRF_TOKEN_LENGTH, SESSION_COOKIE};
use crate::core::errors::{AppError, Result};
use crate::core::db::timestamp_column;
use crate::core::helpers::{format_timestamp, random_token};
use crate::models::models::{Session, User};
use crate::users::{find_user_by_id, touch_last_seen};
use crate::AppState;

pub const LOGIN_REQUIRED_MESSAGE: &str = "Please log in to access this page.";

// === Store ===

pub fn create_session(conn: &Connection, user_id: Option<&str>, remember: bool) -> Result<Session> {
    let session = Session {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.map(str::to_string),
        remember,
        csrf_token: random_token(CSRF_TOKEN_LENGTH),
        created_at: Utc::now(),
    };

    conn.execute(
        "INSERT INTO sessions (id, user_id, remember, csrf_token, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            session.id,
            session.user_id,
            session.remember,
            session.csrf_token,
            format_timestamp(&session.created_at),
        ],
    )?;
    Ok(session)
}

pub fn find_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            "SELECT id, user_id, remember, csrf_token, created_at FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    remember: row.get(2)?,
                    csrf_token: row.get(3)?,
                    created_at: timestamp_column(row, 4)?,
                })
            },
        )
        .optional()?;
    Ok(session)
}

pub fn delete_session(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn push_flash(conn: &Connection, session_id: &str, message: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO flashes (session_id, message) VALUES (?1, ?2)",
        params![session_id, message],
    )?;
    Ok(())
}

/// Return the queued flash messages in the order they were added and forget
/// them.
pub fn take_flashes(conn: &Connection, session_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT message FROM flashes WHERE session_id = ?1 ORDER BY id ASC")?;
    let messages = stmt
        .query_map(params![session_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    conn.execute("DELETE FROM flashes WHERE session_id = ?1", params![session_id])?;
    Ok(messages)
}

fn is_expired(session: &Session, config: &Config) -> bool {
    let lifetime = if session.remember {
        chrono::Duration::days(config.remember_days)
    } else {
        chrono::Duration::hours(config.session_expiration_hours)
    };
    Utc::now() - session.created_at > lifetime
}

/// Delete every session past its lifetime, along with its flashes. Returns
/// the number of sessions removed.
pub fn purge_expired_sessions(conn: &Connection, config: &Config) -> Result<usize> {
    let now = Utc::now();
    let plain_cutoff = format_timestamp(&(now - chrono::Duration::hours(config.session_expiration_hours)));
    let remember_cutoff = format_timestamp(&(now - chrono::Duration::days(config.remember_days)));

    let purged = conn.execute(
        "DELETE FROM sessions
         WHERE (remember = 0 AND created_at < ?1)
            OR (remember <> 0 AND created_at < ?2)",
        params![plain_cutoff, remember_cutoff],
    )?;
    if purged > 0 {
        tracing::debug!(purged, "expired sessions removed");
    }
    Ok(purged)
}

/// Load the session named by the cookie, or start a fresh anonymous one when
/// the cookie is missing, unknown or expired. The flag is true when a new
/// session was created. A logged-in user's last-seen time is bumped.
pub fn resolve_session(
    conn: &Connection,
    cookie_id: Option<&str>,
    config: &Config,
) -> Result<(Session, bool)> {
    if let Some(id) = cookie_id {
        match find_session(conn, id)? {
            Some(session) if !is_expired(&session, config) => {
                if let Some(user_id) = &session.user_id {
                    touch_last_seen(conn, user_id)?;
                }
                return Ok((session, false));
            }
            Some(expired) => {
                tracing::debug!(session_id = %expired.id, "session expired");
                delete_session(conn, &expired.id)?;
            }
            None => {}
        }
    }

    Ok((create_session(conn, None, false)?, true))
}

/// Build the cookie for a session. Remembered sessions get a persistent
/// cookie; others last for the browser session.
pub fn session_cookie(session: &Session, config: &Config) -> Cookie<'static> {
    let mut cookie = Cookie::build(SESSION_COOKIE, session.id.clone())
        .path("/")
        .http_only(true)
        .secure(config.secure_cookies)
        .same_site(SameSite::Lax)
        .finish();
    if session.remember {
        cookie.set_max_age(Duration::days(config.remember_days));
    }
    cookie
}

pub fn removal_cookie() -> Cookie<'static> {
    let mut cookie = Cookie::build(SESSION_COOKIE, "").path("/").finish();
    cookie.make_removal();
    cookie
}

pub fn verify_csrf(session: &Session, token: &str) -> bool {
    !token.is_empty() && session.csrf_token == token
}

// === Middleware ===

pub async fn session_middleware(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> std::result::Result<ServiceResponse<impl MessageBody>, Error> {
    // Assets never need a session
    if req.path().starts_with("/static/") {
        return next.call(req).await;
    }

    let state = req
        .app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or_else(|| AppError::Internal("application state not configured".to_string()))?;

    let cookie_id = req.cookie(SESSION_COOKIE).map(|c| c.value().to_string());
    let (session, fresh) = state
        .db
        .with_tx(|conn| resolve_session(conn, cookie_id.as_deref(), &state.config))?;

    req.extensions_mut().insert(session.clone());
    let mut res = next.call(req).await?;

    // Handlers that rotate or drop the session set the cookie themselves
    let handler_set_cookie = res
        .response()
        .cookies()
        .any(|c| c.name() == SESSION_COOKIE);
    if fresh && !handler_set_cookie {
        res.response_mut()
            .add_cookie(&session_cookie(&session, &state.config))
            .map_err(|e| AppError::Internal(e.to_string()))?;
    }
    Ok(res)
}

// === Extractors ===

fn request_session(req: &HttpRequest) -> Result<Session> {
    req.extensions()
        .get::<Session>()
        .cloned()
        .ok_or_else(|| AppError::Internal("session middleware not installed".to_string()))
}

fn request_state(req: &HttpRequest) -> Result<web::Data<AppState>> {
    req.app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or_else(|| AppError::Internal("application state not configured".to_string()))
}

impl FromRequest for Session {
    type Error = AppError;
    type Future = Ready<Result<Self>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(request_session(req))
    }
}

/// The logged-in user. Anonymous requests are rejected with a redirect to
/// the login page and a flash asking to log in.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl std::ops::Deref for CurrentUser {
    type Target = User;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn current_user(req: &HttpRequest) -> Result<CurrentUser> {
    let session = request_session(req)?;
    let state = request_state(req)?;

    let user = state.db.with_tx(|conn| {
        if let Some(user_id) = &session.user_id {
            if let Some(user) = find_user_by_id(conn, user_id)? {
                return Ok(Some(user));
            }
        }
        push_flash(conn, &session.id, LOGIN_REQUIRED_MESSAGE)?;
        Ok(None)
    })?;

    user.map(CurrentUser).ok_or_else(|| {
        let next = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.path().to_string());
        AppError::LoginRequired { next }
    })
}

impl FromRequest for CurrentUser {
    type Error = AppError;
    type Future = Ready<Result<Self>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(current_user(req))
    }
}
