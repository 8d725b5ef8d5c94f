//! PDF fetching and text extraction for single-document ingest.

use std::time::Duration;

use percent_encoding::percent_decode_str;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use docdex_shared::{DocdexError, Result};

/// A fetched and parsed PDF.
#[derive(Debug, Clone)]
pub struct PdfDocument {
    /// Filename stem of the URL, or the host as a fallback.
    pub title: String,
    /// Extracted text of the whole document.
    pub text: String,
    pub page_count: usize,
    /// Raw document size in bytes.
    pub size: usize,
}

/// Fetch a PDF (≤5 redirects, status < 400) and extract its text and page
/// count. Parsing runs on the blocking pool.
#[instrument(skip_all, fields(url = %url))]
pub async fn fetch_pdf(url: &Url, timeout: Duration, user_agent: &str) -> Result<PdfDocument> {
    let client = Client::builder()
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .map_err(|e| DocdexError::Network(format!("failed to build HTTP client: {e}")))?;

    let response = client
        .get(url.as_str())
        .header(
            reqwest::header::ACCEPT,
            "application/pdf, application/octet-stream",
        )
        .send()
        .await
        .map_err(|e| DocdexError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(DocdexError::Network(format!("{url}: HTTP {status}")));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| DocdexError::Network(format!("{url}: body read failed: {e}")))?;
    let size = bytes.len();

    debug!(size, "pdf fetched, extracting text");

    let title = title_from_url(url);
    let parsed = tokio::task::spawn_blocking(move || -> Result<(String, usize)> {
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| DocdexError::parse(format!("PDF text extraction failed: {e}")))?;
        let page_count = lopdf::Document::load_mem(&bytes)
            .map(|doc| doc.get_pages().len())
            .unwrap_or(0);
        Ok((text, page_count))
    })
    .await
    .map_err(|e| DocdexError::parse(format!("PDF parse task failed: {e}")))??;

    let (text, page_count) = parsed;
    Ok(PdfDocument {
        title,
        text,
        page_count,
        size,
    })
}

/// Human-readable title: the decoded filename stem, else the host.
fn title_from_url(url: &Url) -> String {
    let stem = url
        .path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let decoded = percent_decode_str(&segment).decode_utf8_lossy().into_owned();
            match decoded.rsplit_once('.') {
                Some((stem, _ext)) if !stem.is_empty() => stem.to_string(),
                _ => decoded,
            }
        });

    stem.unwrap_or_else(|| url.host_str().unwrap_or("document").to_string())
}
