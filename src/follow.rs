use actix_web::{web, HttpResponse};
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::errors::Result;
use crate::core::helpers::redirect;
use crate::models::models::{EmptyForm, Session};
use crate::session::{push_flash, verify_csrf, CurrentUser};
use crate::templates::user_url;
use crate::users::find_user_by_username;
use crate::AppState;

/// Add the edge follower -> followed. Following twice is a no-op; a
/// self-follow still trips the CHECK constraint.
pub fn follow_user(conn: &Connection, follower_id: &str, followed_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO followers (follower_id, followed_id) VALUES (?1, ?2)
         ON CONFLICT (follower_id, followed_id) DO NOTHING",
        params![follower_id, followed_id],
    )?;
    Ok(())
}

/// Remove the edge follower -> followed if present.
pub fn unfollow_user(conn: &Connection, follower_id: &str, followed_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM followers WHERE follower_id = ?1 AND followed_id = ?2",
        params![follower_id, followed_id],
    )?;
    Ok(())
}

pub fn is_following(conn: &Connection, follower_id: &str, followed_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM followers WHERE follower_id = ?1 AND followed_id = ?2",
            params![follower_id, followed_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(found)
}

pub fn count_followers(conn: &Connection, user_id: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM followers WHERE followed_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_following(conn: &Connection, user_id: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM followers WHERE follower_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// === HTTP Handlers ===

#[derive(Clone, Copy)]
enum Action {
    Follow,
    Unfollow,
}

fn handle(
    state: &AppState,
    session: &Session,
    current: &CurrentUser,
    form: &EmptyForm,
    username: &str,
    action: Action,
) -> Result<HttpResponse> {
    if !verify_csrf(session, &form.csrf_token) {
        tracing::warn!(user_id = %current.id, "follow action with invalid csrf token");
        return Ok(redirect("/index"));
    }

    state.db.with_tx(|conn| {
        let Some(target) = find_user_by_username(conn, username)? else {
            push_flash(conn, &session.id, &format!("User {username} not found."))?;
            return Ok(redirect("/index"));
        };

        if target.id == current.id {
            let message = match action {
                Action::Follow => "You cannot follow yourself!",
                Action::Unfollow => "You cannot unfollow yourself!",
            };
            push_flash(conn, &session.id, message)?;
            return Ok(redirect(&user_url(username)));
        }

        let message = match action {
            Action::Follow => {
                follow_user(conn, &current.id, &target.id)?;
                format!("You are following {username}!")
            }
            Action::Unfollow => {
                unfollow_user(conn, &current.id, &target.id)?;
                format!("You are not following {username}.")
            }
        };
        tracing::debug!(follower = %current.id, followed = %target.id, "follow relation updated");
        push_flash(conn, &session.id, &message)?;
        Ok(redirect(&user_url(username)))
    })
}

pub async fn follow(
    state: web::Data<AppState>,
    session: Session,
    current: CurrentUser,
    path: web::Path<String>,
    form: web::Form<EmptyForm>,
) -> Result<HttpResponse> {
    handle(&state, &session, &current, &form, &path, Action::Follow)
}

pub async fn unfollow(
    state: web::Data<AppState>,
    session: Session,
    current: CurrentUser,
    path: web::Path<String>,
    form: web::Form<EmptyForm>,
) -> Result<HttpResponse> {
    handle(&state, &session, &current, &form, &path, Action::Unfollow)
}
