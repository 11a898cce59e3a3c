use std::path::PathBuf;

pub const MAX_POST_LENGTH: usize = 140;
pub const MAX_ABOUT_ME_LENGTH: usize = 140;
pub const MAX_USERNAME_LENGTH: usize = 64;
pub const MAX_EMAIL_LENGTH: usize = 120;

pub const SESSION_COOKIE: &str = "murmur_session";
pub const CSRF_FIELD: &str = "csrf_token";
pub const CSRF_TOKEN_LENGTH: usize = 40;

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Env: `MURMUR_BIND_ADDR`, default `0.0.0.0:8080`
    pub bind_addr: String,
    /// Env: `MURMUR_DATABASE_PATH`, default `murmur.db`
    pub database_path: PathBuf,
    /// Lifetime of a non-remembered session.
    /// Env: `MURMUR_SESSION_EXPIRATION_HOURS`, default 24
    pub session_expiration_hours: i64,
    /// Lifetime of a "remember me" session and its cookie.
    /// Env: `MURMUR_REMEMBER_DAYS`, default 365
    pub remember_days: i64,
    /// Env: `MURMUR_SEED_DEMO_DATA`, default false
    pub seed_demo_data: bool,
    /// Env: `MURMUR_SECURE_COOKIES`, default false
    pub secure_cookies: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_string("MURMUR_BIND_ADDR", "0.0.0.0:8080"),
            database_path: PathBuf::from(env_string("MURMUR_DATABASE_PATH", "murmur.db")),
            session_expiration_hours: env_parse("MURMUR_SESSION_EXPIRATION_HOURS", 24),
            remember_days: env_parse("MURMUR_REMEMBER_DAYS", 365),
            seed_demo_data: env_parse("MURMUR_SEED_DEMO_DATA", false),
            secure_cookies: env_parse("MURMUR_SECURE_COOKIES", false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from(":memory:"),
            session_expiration_hours: 24,
            remember_days: 365,
            seed_demo_data: false,
            secure_cookies: false,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_values_fall_back_to_default() {
        std::env::set_var("MURMUR_TEST_NOT_A_NUMBER", "abc");
        assert_eq!(env_parse("MURMUR_TEST_NOT_A_NUMBER", 24i64), 24);
        assert_eq!(env_parse("MURMUR_TEST_UNSET_KEY", true), true);
    }
}
