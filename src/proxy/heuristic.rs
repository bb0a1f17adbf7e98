//! Anti-bot response heuristic
//!
//! Challenge pages served by bot mitigation layers carry a recognizable
//! document title even when the status code is 200. The detector extracts the
//! first `<title>` element and looks for the challenge marker.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};

static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("valid title selector"));

/// Extract the text of the first `<title>` element, if any
pub fn page_title(body: &[u8]) -> Option<String> {
    let html = String::from_utf8_lossy(body);
    let document = Html::parse_document(&html);
    document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|element| element.text().collect::<String>())
}

/// Check whether a response body looks like an anti-bot challenge page
pub fn is_challenge(body: &[u8]) -> bool {
    page_title(body)
        .map(|title| title.to_lowercase().contains("captcha"))
        .unwrap_or(false)
}
