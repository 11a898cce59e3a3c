use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

use crate::core::errors::{AppError, Result};
use crate::core::helpers::{hash_password, parse_timestamp};
use crate::follow::follow_user;
use crate::posts::insert_post;
use crate::users::{find_user_by_username, insert_user, NewUser};

const CURRENT_VERSION: u32 = 2;

const V001_INITIAL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    username      TEXT NOT NULL UNIQUE,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,               -- argon2 PHC string
    about_me      TEXT,
    last_seen     TEXT NOT NULL                -- RFC 3339, UTC, micros
);

CREATE TABLE IF NOT EXISTS posts (
    id         TEXT PRIMARY KEY NOT NULL,
    body       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    user_id    TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_posts_user_id ON posts(user_id);

CREATE TABLE IF NOT EXISTS followers (
    follower_id TEXT NOT NULL,
    followed_id TEXT NOT NULL,

    PRIMARY KEY (follower_id, followed_id),
    CHECK (follower_id <> followed_id),
    FOREIGN KEY (follower_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (followed_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_followers_followed ON followers(followed_id);

CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY NOT NULL,
    user_id    TEXT,
    remember   INTEGER NOT NULL DEFAULT 0,
    csrf_token TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS flashes (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    message    TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);
"#;

const V002_SESSION_EXPIRY: &str = r#"
CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at);
"#;

/// The relational store. A single connection guarded by a mutex; every
/// request does its work inside [`Database::with_tx`].
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if path == Path::new(":memory:") {
            return Self::open_in_memory();
        }

        tracing::info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Run `f` inside a transaction. Commits when `f` succeeds; the
    /// transaction is rolled back when dropped on error.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Read a stored RFC 3339 timestamp column. Anything unparsable is a
/// conversion error, not a default date.
pub fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp {raw:?}").into(),
        )
    })
}

fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::debug!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "checking database migrations"
    );

    if current < 1 {
        tracing::info!("applying migration v001_initial");
        conn.execute_batch(V001_INITIAL)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    if current < 2 {
        tracing::info!("applying migration v002_session_expiry");
        conn.execute_batch(V002_SESSION_EXPIRY)?;
        conn.pragma_update(None, "user_version", 2)?;
    }

    Ok(())
}

/// Ensure the demo accounts `test`, `alice` and `bob` exist, each with the
/// username as password, and that `test` follows `bob`.
pub fn init_test_data(db: &Database) -> Result<()> {
    const DEMO: &[(&str, &str, &[&str])] = &[
        ("test", "Test user bio", &["This is my first post!"]),
        (
            "alice",
            "Hello, I'm Alice!",
            &[
                "Welcome to my board! Excited to share thoughts here.",
                "Just finished an amazing project. Feeling productive today!",
            ],
        ),
        (
            "bob",
            "Bob's corner of the internet",
            &["Hey everyone! Just joined, looking forward to connecting with you all."],
        ),
    ];

    db.with_tx(|conn| {
        for &(username, about_me, posts) in DEMO {
            if find_user_by_username(conn, username)?.is_some() {
                continue;
            }

            let user = insert_user(
                conn,
                NewUser {
                    username,
                    email: &format!("{username}@example.com"),
                    password_hash: hash_password(username)?,
                },
            )?;
            crate::users::update_profile(conn, &user.id, username, Some(about_me))?;

            for body in posts {
                insert_post(conn, &user.id, body)?;
            }
            tracing::info!(username, "created demo user");
        }

        let test = find_user_by_username(conn, "test")?;
        let bob = find_user_by_username(conn, "bob")?;
        if let (Some(test), Some(bob)) = (test, bob) {
            follow_user(conn, &test.id, &bob.id)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.db");

        let db = Database::open(&path).expect("should open");
        init_test_data(&db).unwrap();
        drop(db);

        let db = Database::open(&path).expect("should reopen");
        let alice = db
            .with_tx(|conn| find_user_by_username(conn, "alice"))
            .unwrap();
        assert!(alice.is_some());
    }

    #[test]
    fn seeding_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        init_test_data(&db).unwrap();
        init_test_data(&db).unwrap();

        let (users, posts, edges): (i64, i64, i64) = db
            .with_tx(|conn| {
                let count = |sql: &str| conn.query_row(sql, [], |r| r.get::<_, i64>(0));
                Ok((
                    count("SELECT COUNT(*) FROM users")?,
                    count("SELECT COUNT(*) FROM posts")?,
                    count("SELECT COUNT(*) FROM followers")?,
                ))
            })
            .unwrap();

        assert_eq!((users, posts, edges), (3, 4, 1));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.with_tx(|conn| {
            insert_user(
                conn,
                NewUser {
                    username: "carol",
                    email: "carol@example.com",
                    password_hash: "x".to_string(),
                },
            )?;
            Err(AppError::Internal("boom".to_string()))
        });
        assert!(result.is_err());

        let carol = db
            .with_tx(|conn| find_user_by_username(conn, "carol"))
            .unwrap();
        assert!(carol.is_none());
    }
}
