//! Main-content extraction from documentation HTML.
//!
//! Strips page chrome (scripts, sidebars, screen-reader-only nodes), picks
//! the best content container, and returns the page title plus the
//! container's text with whitespace collapsed to single spaces.

pub mod chunk;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

pub use chunk::{ChunkOptions, chunk_text};

/// Content containers tried in priority order; `body` is the fallback.
const CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    "#content",
    ".content",
    ".docs-content",
    ".site-content",
    ".slds-container",
];

/// Element names whose subtrees never contribute text.
const SKIP_ELEMENTS: &[&str] = &["script", "style", "noscript"];

/// Class names marking sidebars and screen-reader-only content.
const SKIP_CLASSES: &[&str] = &[
    "sidebar",
    "side-nav",
    "sr-only",
    "screen-reader-text",
    "visually-hidden",
    "skip-link",
];

// ---------------------------------------------------------------------------
// PageText
// ---------------------------------------------------------------------------

/// Extraction result for a single page.
#[derive(Debug, Clone)]
pub struct PageText {
    /// First non-empty of `<title>`, `<h1>`, then the page URL.
    pub title: String,
    /// Collapsed text of the selected content container.
    pub text: String,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract the title and main text from an HTML document.
///
/// `fallback_title` (normally the page URL) is used when the document has
/// neither a `<title>` nor an `<h1>`.
pub fn extract_page(html: &str, fallback_title: &str) -> PageText {
    let doc = Html::parse_document(html);

    let title = extract_title(&doc)
        .unwrap_or_else(|| fallback_title.to_string());

    let text = extract_text(&doc);

    debug!(
        title = %title,
        text_len = text.len(),
        "extracted page content"
    );

    PageText { title, text }
}

/// Pick the first priority container yielding non-empty text, else `body`.
fn extract_text(doc: &Html) -> String {
    for sel_str in CONTENT_SELECTORS {
        let selector = Selector::parse(sel_str).expect("valid selector");
        for el in doc.select(&selector) {
            let text = collapsed_text(el);
            if !text.is_empty() {
                return text;
            }
        }
    }

    let body_sel = Selector::parse("body").expect("valid selector");
    doc.select(&body_sel)
        .next()
        .map(collapsed_text)
        .unwrap_or_default()
}

/// First non-empty of `<title>` then `<h1>`.
fn extract_title(doc: &Html) -> Option<String> {
    for sel_str in ["title", "h1"] {
        let selector = Selector::parse(sel_str).expect("valid selector");
        if let Some(el) = doc.select(&selector).next() {
            let text = el.text().collect::<String>();
            let text = collapse_whitespace(&text);
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Collect an element's text, skipping excluded subtrees, and collapse
/// whitespace to single spaces.
fn collapsed_text(el: ElementRef<'_>) -> String {
    let mut raw = String::new();
    collect_text(el, &mut raw);
    collapse_whitespace(&raw)
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    if is_excluded(el) {
        return;
    }
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_el) = ElementRef::wrap(child) {
            collect_text(child_el, out);
        }
    }
}

fn is_excluded(el: ElementRef<'_>) -> bool {
    let value = el.value();
    if SKIP_ELEMENTS.contains(&value.name()) {
        return true;
    }
    value
        .classes()
        .any(|class| SKIP_CLASSES.iter().any(|skip| class.eq_ignore_ascii_case(skip)))
        || value.id().is_some_and(|id| id.eq_ignore_ascii_case("sidebar"))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
