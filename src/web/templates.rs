//! HTML pages for the human entry flow.
//!
//! Pure rendering: each page takes the few strings it shows and nothing else.

use askama::Template;
use axum::{
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
};
use tracing::error;

pub const EMPTY_VALUE_ERROR: &str = "Secret value must not be empty.";

#[derive(Template)]
#[template(path = "entry_form.html")]
pub struct EntryFormPage<'a> {
    pub secret_ref: &'a str,
    pub token: &'a str,
    pub error: &'a str,
}

#[derive(Template)]
#[template(path = "stored.html")]
pub struct StoredPage<'a> {
    pub secret_ref: &'a str,
}

#[derive(Template)]
#[template(path = "expired.html")]
pub struct ExpiredPage;

#[derive(Template)]
#[template(path = "error.html")]
pub struct ErrorPage<'a> {
    pub message: &'a str,
}

/// Render `page` with `status`, never cached by the browser.
pub fn render<T: Template>(status: StatusCode, page: T) -> Response {
    match page.render() {
        Ok(body) => (
            status,
            [(header::CACHE_CONTROL, "no-store")],
            Html(body),
        )
            .into_response(),
        Err(e) => {
            error!("template render failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_form_binds_token_and_ref() {
        let html = EntryFormPage {
            secret_ref: "openai_key",
            token: "tok123",
            error: "",
        }
        .render()
        .unwrap();
        assert!(html.contains("openai_key"));
        assert!(html.contains(r#"action="/s/tok123""#));
        assert!(html.contains(r#"name="secret_value""#));
        assert!(!html.contains("class=\"error\""));
    }

    #[test]
    fn test_entry_form_shows_error() {
        let html = EntryFormPage {
            secret_ref: "k",
            token: "t",
            error: EMPTY_VALUE_ERROR,
        }
        .render()
        .unwrap();
        assert!(html.contains("must not be empty"));
    }

    #[test]
    fn test_secret_ref_is_escaped() {
        let html = StoredPage {
            secret_ref: "<script>alert(1)</script>",
        }
        .render()
        .unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_render_sets_status_and_no_store() {
        let resp = render(StatusCode::GONE, ExpiredPage);
        assert_eq!(resp.status(), StatusCode::GONE);
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-store");
    }
}
