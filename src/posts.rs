use actix_web::{web, HttpResponse};
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::config::MAX_POST_LENGTH;
use crate::core::errors::Result;
use crate::core::db::timestamp_column;
use crate::core::helpers::{format_timestamp, redirect};
use crate::core::validation::{max_length, required, FormErrors};
use crate::models::models::{Post, PostForm, Session, User};
use crate::session::{push_flash, verify_csrf, CurrentUser};
use crate::templates::{csrf_input, esc, field_errors, fill, render_posts, Page};
use crate::AppState;

// Equal timestamps keep insertion order; rowid grows with every insert.
const POST_SELECT: &str = "SELECT p.id, p.user_id, u.username, p.body, p.created_at
     FROM posts p JOIN users u ON u.id = p.user_id";
const POST_ORDER: &str = "ORDER BY p.created_at DESC, p.rowid ASC";

fn row_to_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        user_id: row.get(1)?,
        author: row.get(2)?,
        body: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

fn query_posts(conn: &Connection, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Post>> {
    let mut stmt = conn.prepare(&format!("{POST_SELECT} {filter} {POST_ORDER}"))?;
    let posts = stmt
        .query_map(args, row_to_post)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(posts)
}

pub fn insert_post(conn: &Connection, user_id: &str, body: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO posts (id, body, created_at, user_id) VALUES (?1, ?2, ?3, ?4)",
        params![id, body, format_timestamp(&Utc::now()), user_id],
    )?;
    Ok(id)
}

/// Home feed: posts written by the viewer or by anyone the viewer follows,
/// newest first.
pub fn following_posts(conn: &Connection, viewer_id: &str) -> Result<Vec<Post>> {
    query_posts(
        conn,
        "LEFT JOIN followers f ON f.followed_id = p.user_id AND f.follower_id = ?1
         WHERE f.follower_id IS NOT NULL OR p.user_id = ?1",
        &[&viewer_id],
    )
}

/// Every post in the system, newest first.
pub fn explore_posts(conn: &Connection) -> Result<Vec<Post>> {
    query_posts(conn, "", &[])
}

pub fn posts_by_user(conn: &Connection, user_id: &str) -> Result<Vec<Post>> {
    query_posts(conn, "WHERE p.user_id = ?1", &[&user_id])
}

// === HTTP Handlers ===

fn render_feed(
    conn: &Connection,
    session: &Session,
    user: &User,
    title: &str,
    post_form: Option<(&PostForm, &FormErrors)>,
    posts: &[Post],
) -> Result<HttpResponse> {
    let post_form = match post_form {
        Some((form, errors)) => fill(
            "post_form.html",
            &[
                ("csrf", csrf_input(session)),
                ("post", esc(&form.post)),
                ("post_errors", field_errors(errors, "post")),
            ],
        )?,
        None => String::new(),
    };

    Page::new(conn, session, Some(user), title)?.render(
        "index.html",
        &[
            ("username", esc(&user.username)),
            ("post_form", post_form),
            ("posts", render_posts(posts)),
        ],
    )
}

pub async fn index(
    state: web::Data<AppState>,
    session: Session,
    current: CurrentUser,
) -> Result<HttpResponse> {
    state.db.with_tx(|conn| {
        let posts = following_posts(conn, &current.id)?;
        let form = (&PostForm::default(), &FormErrors::default());
        render_feed(conn, &session, &current, "Home", Some(form), &posts)
    })
}

pub async fn create_post(
    state: web::Data<AppState>,
    session: Session,
    current: CurrentUser,
    form: web::Form<PostForm>,
) -> Result<HttpResponse> {
    let form = form.into_inner();
    let body = form.post.trim();

    state.db.with_tx(|conn| {
        let mut errors = FormErrors::default();
        if required(&mut errors, "post", body) {
            max_length(&mut errors, "post", body, MAX_POST_LENGTH);
        }
        if !verify_csrf(&session, &form.csrf_token) {
            errors.add("csrf_token", "The CSRF token is invalid.");
            push_flash(conn, &session.id, "The form expired, please try again.")?;
        }
        if !errors.is_empty() {
            let posts = following_posts(conn, &current.id)?;
            return render_feed(conn, &session, &current, "Home", Some((&form, &errors)), &posts);
        }

        let post_id = insert_post(conn, &current.id, body)?;
        tracing::debug!(%post_id, user_id = %current.id, "post created");
        push_flash(conn, &session.id, "Your post is now live!")?;
        Ok(redirect("/index"))
    })
}

pub async fn explore(
    state: web::Data<AppState>,
    session: Session,
    current: CurrentUser,
) -> Result<HttpResponse> {
    state.db.with_tx(|conn| {
        let posts = explore_posts(conn)?;
        render_feed(conn, &session, &current, "Explore", None, &posts)
    })
}
