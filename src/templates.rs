use std::sync::OnceLock;

use actix_web::HttpResponse;
use ammonia::Builder;
use html_escape::{encode_double_quoted_attribute, encode_text};
use regex::Regex;
use rusqlite::Connection;
use rust_embed::RustEmbed;

use crate::config::CSRF_FIELD;
use crate::core::errors::{AppError, Result};
use crate::core::validation::FormErrors;
use crate::models::models::{Post, Session, User};
use crate::session::take_flashes;

#[derive(RustEmbed)]
#[folder = "templates"]
struct Templates;

fn load(name: &str) -> Result<String> {
    let file = Templates::get(name)
        .ok_or_else(|| AppError::Internal(format!("template {name} not found")))?;
    String::from_utf8(file.data.into_owned())
        .map_err(|e| AppError::Internal(format!("template {name} is not UTF-8: {e}")))
}

fn placeholder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").expect("Regex should compile"))
}

/// Substitute `{{key}}` placeholders in the named template in a single pass.
/// Values are inserted verbatim, so callers escape anything user-provided.
/// Unknown placeholders render as nothing.
pub fn fill(name: &str, vars: &[(&str, String)]) -> Result<String> {
    let template = load(name)?;
    let html = placeholder_regex().replace_all(&template, |caps: &regex::Captures| {
        vars.iter()
            .find(|(key, _)| *key == &caps[1])
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    });
    Ok(html.into_owned())
}

pub fn esc(text: &str) -> String {
    encode_text(text).into_owned()
}

/// Escape a value placed inside a double-quoted attribute.
pub fn attr(text: &str) -> String {
    encode_double_quoted_attribute(text).into_owned()
}

pub fn user_url(username: &str) -> String {
    format!("/user/{}", urlencoding::encode(username))
}

pub fn csrf_input(session: &Session) -> String {
    format!(
        r#"<input type="hidden" name="{}" value="{}">"#,
        CSRF_FIELD,
        encode_double_quoted_attribute(&session.csrf_token)
    )
}

pub fn field_errors(errors: &FormErrors, field: &str) -> String {
    errors
        .get(field)
        .iter()
        .map(|msg| format!(r#"<br><span class="error">[{}]</span>"#, esc(msg)))
        .collect()
}

fn url_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"https?://[^\s<>]+").expect("Regex should compile"))
}

/// Escape a post body and turn http(s) URLs into links. The result goes
/// through the sanitizer as a last line of defence.
pub fn render_post_body(body: &str) -> String {
    let mut html = String::with_capacity(body.len());
    let mut last = 0;
    for m in url_regex().find_iter(body) {
        html.push_str(&encode_text(&body[last..m.start()]));
        html.push_str(&format!(
            r#"<a href="{}" target="_blank">{}</a>"#,
            encode_double_quoted_attribute(m.as_str()),
            encode_text(m.as_str())
        ));
        last = m.end();
    }
    html.push_str(&encode_text(&body[last..]));

    Builder::default()
        .link_rel(Some("noopener noreferrer"))
        .add_tag_attributes("a", &["target"])
        .clean(&html)
        .to_string()
}

pub fn render_posts(posts: &[Post]) -> String {
    if posts.is_empty() {
        return r#"<p class="empty">No posts yet.</p>"#.to_string();
    }

    posts
        .iter()
        .map(|post| {
            format!(
                r#"<table class="post"><tr><td><a href="{}">{}</a> says:<br>{}<br><span class="timestamp">{}</span></td></tr></table>"#,
                encode_double_quoted_attribute(&user_url(&post.author)),
                esc(&post.author),
                render_post_body(&post.body),
                post.created_at.format("%Y-%m-%d %H:%M UTC"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn nav(user: Option<&str>) -> String {
    match user {
        Some(username) => format!(
            r#"<a href="{}">Profile</a> <a href="/logout">Logout</a>"#,
            encode_double_quoted_attribute(&user_url(username))
        ),
        None => r#"<a href="/login">Login</a>"#.to_string(),
    }
}

fn flashes_html(flashes: &[String]) -> String {
    if flashes.is_empty() {
        return String::new();
    }
    let items: String = flashes
        .iter()
        .map(|msg| format!("<li>{}</li>", esc(msg)))
        .collect();
    format!(r#"<ul class="flashes">{items}</ul>"#)
}

fn layout(title: &str, user: Option<&str>, flashes: &[String], content: &str) -> Result<String> {
    fill(
        "base.html",
        &[
            ("title", esc(title)),
            ("nav", nav(user)),
            ("flashes", flashes_html(flashes)),
            ("content", content.to_string()),
        ],
    )
}

/// A full page for the current request. Creating it consumes the session's
/// pending flash messages.
pub struct Page {
    title: String,
    username: Option<String>,
    flashes: Vec<String>,
}

impl Page {
    pub fn new(conn: &Connection, session: &Session, user: Option<&User>, title: &str) -> Result<Self> {
        Ok(Self {
            title: title.to_string(),
            username: user.map(|u| u.username.clone()),
            flashes: take_flashes(conn, &session.id)?,
        })
    }

    pub fn render(&self, template: &str, vars: &[(&str, String)]) -> Result<HttpResponse> {
        let content = fill(template, vars)?;
        let html = layout(&self.title, self.username.as_deref(), &self.flashes, &content)?;
        Ok(HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(html))
    }
}

/// Standalone error page, used where no session context is at hand.
pub fn render_error_page(code: u16) -> String {
    let (template, title) = match code {
        404 => ("404.html", "Not Found"),
        _ => ("500.html", "An unexpected error has occurred"),
    };
    fill(template, &[])
        .and_then(|content| layout(title, None, &[], &content))
        .unwrap_or_else(|_| title.to_string())
}
