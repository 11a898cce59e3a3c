use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{MAX_EMAIL_LENGTH, MAX_USERNAME_LENGTH};

/// Per-field validation messages for a submitted form.
#[derive(Debug, Default)]
pub struct FormErrors {
    fields: BTreeMap<&'static str, Vec<String>>,
}

impl FormErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.entry(field).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has(&self, field: &str) -> bool {
        !self.get(field).is_empty()
    }
}

fn username_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("Regex should compile"))
}

fn email_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Regex should compile")
    })
}

pub fn required(errors: &mut FormErrors, field: &'static str, value: &str) -> bool {
    if value.trim().is_empty() {
        errors.add(field, "This field is required.");
        return false;
    }
    true
}

pub fn max_length(errors: &mut FormErrors, field: &'static str, value: &str, max: usize) {
    if value.chars().count() > max {
        errors.add(field, format!("Field cannot be longer than {max} characters."));
    }
}

pub fn check_username(errors: &mut FormErrors, username: &str) {
    if !required(errors, "username", username) {
        return;
    }
    max_length(errors, "username", username, MAX_USERNAME_LENGTH);
    if !username_regex().is_match(username) {
        errors.add(
            "username",
            "Usernames may only contain letters, digits, '_', '.' and '-'.",
        );
    }
}

pub fn check_email(errors: &mut FormErrors, email: &str) {
    if !required(errors, "email", email) {
        return;
    }
    max_length(errors, "email", email, MAX_EMAIL_LENGTH);
    if !email_regex().is_match(email) {
        errors.add("email", "Invalid email address.");
    }
}
