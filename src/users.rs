use actix_web::{web, HttpResponse};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::config::MAX_ABOUT_ME_LENGTH;
use crate::core::errors::{AppError, Result};
use crate::core::db::timestamp_column;
use crate::core::helpers::{format_timestamp, hash_password, now_iso, redirect};
use crate::core::validation::{check_email, check_username, max_length, required, FormErrors};
use crate::follow::{count_followers, count_following, is_following};
use crate::models::models::{EditProfileForm, RegistrationForm, Session, User};
use crate::posts::posts_by_user;
use crate::session::{push_flash, verify_csrf, CurrentUser};
use crate::templates::{attr, csrf_input, esc, field_errors, render_posts, Page};
use crate::AppState;

const USER_COLUMNS: &str = "id, username, email, password_hash, about_me, last_seen";

pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: String,
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        about_me: row.get(4)?,
        last_seen: timestamp_column(row, 5)?,
    })
}

/// Insert a user. A taken username or email surfaces as
/// [`AppError::Conflict`] from the UNIQUE constraints.
pub fn insert_user(conn: &Connection, new_user: NewUser<'_>) -> Result<User> {
    let user = User {
        id: Uuid::new_v4().to_string(),
        username: new_user.username.to_string(),
        email: new_user.email.to_string(),
        password_hash: new_user.password_hash,
        about_me: None,
        last_seen: Utc::now(),
    };

    conn.execute(
        "INSERT INTO users (id, username, email, password_hash, about_me, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user.id,
            user.username,
            user.email,
            user.password_hash,
            user.about_me,
            format_timestamp(&user.last_seen),
        ],
    )?;
    Ok(user)
}

pub fn find_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
            params![username],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub fn find_user_by_id(conn: &Connection, id: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub fn email_taken(conn: &Connection, email: &str) -> Result<bool> {
    let taken = conn
        .query_row("SELECT 1 FROM users WHERE email = ?1", params![email], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(taken)
}

pub fn update_profile(
    conn: &Connection,
    user_id: &str,
    username: &str,
    about_me: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE users SET username = ?1, about_me = ?2 WHERE id = ?3",
        params![username, about_me, user_id],
    )?;
    Ok(())
}

pub fn touch_last_seen(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET last_seen = ?1 WHERE id = ?2",
        params![now_iso(), user_id],
    )?;
    Ok(())
}

// === Registration ===

fn validate_registration(conn: &Connection, form: &RegistrationForm) -> Result<FormErrors> {
    let mut errors = FormErrors::default();
    check_username(&mut errors, &form.username);
    check_email(&mut errors, &form.email);
    required(&mut errors, "password", &form.password);
    if required(&mut errors, "password2", &form.password2) && form.password2 != form.password {
        errors.add("password2", "Field must be equal to password.");
    }

    if !errors.has("username") && find_user_by_username(conn, &form.username)?.is_some() {
        errors.add("username", "Please use a different username.");
    }
    if !errors.has("email") && email_taken(conn, &form.email)? {
        errors.add("email", "Please use a different email address.");
    }
    Ok(errors)
}

fn render_register(
    conn: &Connection,
    session: &Session,
    form: &RegistrationForm,
    errors: &FormErrors,
) -> Result<HttpResponse> {
    Page::new(conn, session, None, "Register")?.render(
        "register.html",
        &[
            ("csrf", csrf_input(session)),
            ("username", attr(&form.username)),
            ("email", attr(&form.email)),
            ("username_errors", field_errors(errors, "username")),
            ("email_errors", field_errors(errors, "email")),
            ("password_errors", field_errors(errors, "password")),
            ("password2_errors", field_errors(errors, "password2")),
        ],
    )
}

pub async fn register_page(state: web::Data<AppState>, session: Session) -> Result<HttpResponse> {
    if session.user_id.is_some() {
        return Ok(redirect("/index"));
    }
    state.db.with_tx(|conn| {
        render_register(conn, &session, &RegistrationForm::default(), &FormErrors::default())
    })
}

pub async fn register(
    state: web::Data<AppState>,
    session: Session,
    form: web::Form<RegistrationForm>,
) -> Result<HttpResponse> {
    if session.user_id.is_some() {
        return Ok(redirect("/index"));
    }
    let form = form.into_inner();

    let rejected = state.db.with_tx(|conn| {
        let mut errors = validate_registration(conn, &form)?;
        if !verify_csrf(&session, &form.csrf_token) {
            errors.add("csrf_token", "The CSRF token is invalid.");
            push_flash(conn, &session.id, "The form expired, please try again.")?;
        }
        if errors.is_empty() {
            return Ok(None);
        }
        render_register(conn, &session, &form, &errors).map(Some)
    })?;
    if let Some(page) = rejected {
        return Ok(page);
    }

    // Hashing stays outside the transaction
    let password_hash = hash_password(&form.password)?;

    state.db.with_tx(|conn| {
        let new_user = NewUser {
            username: &form.username,
            email: &form.email,
            password_hash,
        };
        match insert_user(conn, new_user) {
            Ok(user) => {
                tracing::info!(user_id = %user.id, username = %user.username, "registered user");
                push_flash(conn, &session.id, "Congratulations, you are now a registered user!")?;
                Ok(redirect("/login"))
            }
            // Lost a race with a concurrent registration
            Err(AppError::Conflict(_)) => {
                let mut errors = FormErrors::default();
                errors.add("username", "Please use a different username or email address.");
                render_register(conn, &session, &form, &errors)
            }
            Err(e) => Err(e),
        }
    })
}

// === Profile ===

pub async fn user_profile(
    state: web::Data<AppState>,
    session: Session,
    current: CurrentUser,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let username = path.into_inner();

    state.db.with_tx(|conn| {
        let user = find_user_by_username(conn, &username)?
            .ok_or_else(|| AppError::NotFound(format!("user {username}")))?;
        let posts = posts_by_user(conn, &user.id)?;

        let about_me = user
            .about_me
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| format!("<p>{}</p>", esc(s)))
            .unwrap_or_default();
        let last_seen = format!(
            "<p>Last seen on: {}</p>",
            user.last_seen.format("%Y-%m-%d %H:%M UTC")
        );

        let action = if user.id == current.id {
            r#"<p><a href="/edit_profile">Edit your profile</a></p>"#.to_string()
        } else {
            let (verb, label) = if is_following(conn, &current.id, &user.id)? {
                ("unfollow", "Unfollow")
            } else {
                ("follow", "Follow")
            };
            format!(
                r#"<form action="/{verb}/{}" method="post">{}<input type="submit" value="{label}"></form>"#,
                urlencoding::encode(&user.username),
                csrf_input(&session),
            )
        };

        Page::new(conn, &session, Some(&current.0), &format!("User: {}", user.username))?.render(
            "user.html",
            &[
                ("username", esc(&user.username)),
                ("about_me", about_me),
                ("last_seen", last_seen),
                ("followers", count_followers(conn, &user.id)?.to_string()),
                ("following", count_following(conn, &user.id)?.to_string()),
                ("action", action),
                ("posts", render_posts(&posts)),
            ],
        )
    })
}

fn render_edit_profile(
    conn: &Connection,
    session: &Session,
    current: &User,
    form: &EditProfileForm,
    errors: &FormErrors,
) -> Result<HttpResponse> {
    Page::new(conn, session, Some(current), "Edit Profile")?.render(
        "edit_profile.html",
        &[
            ("csrf", csrf_input(session)),
            ("username", attr(&form.username)),
            ("about_me", esc(&form.about_me)),
            ("username_errors", field_errors(errors, "username")),
            ("about_me_errors", field_errors(errors, "about_me")),
        ],
    )
}

pub async fn edit_profile_page(
    state: web::Data<AppState>,
    session: Session,
    current: CurrentUser,
) -> Result<HttpResponse> {
    let form = EditProfileForm {
        username: current.username.clone(),
        about_me: current.about_me.clone().unwrap_or_default(),
        csrf_token: String::new(),
    };
    state
        .db
        .with_tx(|conn| render_edit_profile(conn, &session, &current, &form, &FormErrors::default()))
}

pub async fn edit_profile(
    state: web::Data<AppState>,
    session: Session,
    current: CurrentUser,
    form: web::Form<EditProfileForm>,
) -> Result<HttpResponse> {
    let form = form.into_inner();

    state.db.with_tx(|conn| {
        let mut errors = FormErrors::default();
        check_username(&mut errors, &form.username);
        max_length(&mut errors, "about_me", &form.about_me, MAX_ABOUT_ME_LENGTH);
        if !errors.has("username")
            && form.username != current.username
            && find_user_by_username(conn, &form.username)?.is_some()
        {
            errors.add("username", "Please use a different username.");
        }
        if !verify_csrf(&session, &form.csrf_token) {
            errors.add("csrf_token", "The CSRF token is invalid.");
            push_flash(conn, &session.id, "The form expired, please try again.")?;
        }
        if !errors.is_empty() {
            return render_edit_profile(conn, &session, &current, &form, &errors);
        }

        let about_me = Some(form.about_me.trim()).filter(|s| !s.is_empty());
        update_profile(conn, &current.id, &form.username, about_me)?;
        tracing::debug!(user_id = %current.id, "profile updated");
        push_flash(conn, &session.id, "Your changes have been saved.")?;
        Ok(redirect("/edit_profile"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::Database;

    fn new_user<'a>(username: &'a str, email: &'a str) -> NewUser<'a> {
        NewUser {
            username,
            email,
            password_hash: hash_password("pw").unwrap(),
        }
    }

    #[test]
    fn duplicate_username_or_email_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.with_tx(|conn| {
            insert_user(conn, new_user("alice", "alice@example.com"))?;

            let dup_name = insert_user(conn, new_user("alice", "other@example.com"));
            assert!(matches!(dup_name, Err(AppError::Conflict(_))));
            let dup_email = insert_user(conn, new_user("alice2", "alice@example.com"));
            assert!(matches!(dup_email, Err(AppError::Conflict(_))));

            let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn usernames_are_case_sensitive() {
        let db = Database::open_in_memory().unwrap();
        db.with_tx(|conn| {
            insert_user(conn, new_user("alice", "alice@example.com"))?;
            assert!(find_user_by_username(conn, "Alice")?.is_none());
            insert_user(conn, new_user("Alice", "Alice@example.com"))?;
            assert!(find_user_by_username(conn, "Alice")?.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn registration_validation_messages() {
        let db = Database::open_in_memory().unwrap();
        db.with_tx(|conn| {
            insert_user(conn, new_user("alice", "alice@example.com"))?;

            let form = RegistrationForm {
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                password: "a".to_string(),
                password2: "b".to_string(),
                csrf_token: String::new(),
            };
            let errors = validate_registration(conn, &form)?;
            assert_eq!(errors.get("username"), ["Please use a different username.".to_string()]);
            assert_eq!(errors.get("email"), ["Please use a different email address.".to_string()]);
            assert_eq!(errors.get("password2"), ["Field must be equal to password.".to_string()]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn corrupt_last_seen_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        let result = db.with_tx(|conn| {
            let user = insert_user(conn, new_user("alice", "alice@example.com"))?;
            conn.execute(
                "UPDATE users SET last_seen = 'not a date' WHERE id = ?1",
                params![user.id],
            )?;
            find_user_by_id(conn, &user.id)
        });
        assert!(matches!(result, Err(AppError::Database(_))));
    }

    #[test]
    fn profile_update_and_last_seen() {
        let db = Database::open_in_memory().unwrap();
        db.with_tx(|conn| {
            let user = insert_user(conn, new_user("alice", "alice@example.com"))?;
            conn.execute(
                "UPDATE users SET last_seen = '2020-01-01T00:00:00.000000Z' WHERE id = ?1",
                params![user.id],
            )?;

            update_profile(conn, &user.id, "alicia", Some("hi there"))?;
            touch_last_seen(conn, &user.id)?;

            let updated = find_user_by_id(conn, &user.id)?.unwrap();
            assert_eq!(updated.username, "alicia");
            assert_eq!(updated.about_me.as_deref(), Some("hi there"));
            assert!(updated.last_seen.format("%Y").to_string() != "2020");
            Ok(())
        })
        .unwrap();
    }
}
