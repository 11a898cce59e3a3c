use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub about_me: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// A post joined with its author's username, as shown in feeds.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    pub remember: bool,
    pub csrf_token: String,
    pub created_at: DateTime<Utc>,
}

// === Submitted forms ===
// Fields default to empty so that validation, not deserialization, reports
// what is missing.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    pub remember_me: Option<String>,
    pub csrf_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegistrationForm {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password2: String,
    pub csrf_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PostForm {
    pub post: String,
    pub csrf_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EditProfileForm {
    pub username: String,
    pub about_me: String,
    pub csrf_token: String,
}

/// Form with nothing but the anti-forgery token (follow/unfollow buttons).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EmptyForm {
    pub csrf_token: String,
}
