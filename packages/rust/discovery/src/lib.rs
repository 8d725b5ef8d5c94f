//! Sitemap discovery: robots.txt and sitemap.xml expansion.
//!
//! Before crawling a site, docdex probes the origin for sitemaps and uses
//! the listed URLs as crawl seeds, which is faster and more complete than
//! pure link-following on sites with sparse navigation.

use std::collections::{HashSet, VecDeque};

use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

use docdex_shared::{DocdexError, Result};

/// Same-host endpoints probed in order.
const SITEMAP_PROBES: &[&str] = &[
    "/robots.txt",
    "/sitemap.xml",
    "/docs/sitemap.xml",
    "/sitemap_index.xml",
];

/// Maximum number of redirects to follow when fetching sitemaps.
const MAX_REDIRECTS: usize = 3;

/// Default timeout in seconds for discovery requests.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Maximum response size we consider valid (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// Sitemap-index nesting bound.
const MAX_SITEMAP_DEPTH: usize = 3;

// ---------------------------------------------------------------------------
// Discovery options
// ---------------------------------------------------------------------------

/// Configuration for the discovery process.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
    /// User-Agent header for discovery requests.
    pub user_agent: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: concat!("Docdex/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Discover page URLs from the seed's origin sitemaps.
///
/// Probes `/robots.txt` (for `Sitemap:` directives), `/sitemap.xml`,
/// `/docs/sitemap.xml`, and `/sitemap_index.xml`; expands sitemap indexes
/// recursively (bounded depth); returns deduplicated same-host page URLs.
/// A site without sitemaps yields an empty list, not an error.
#[instrument(skip_all, fields(url = %seed))]
pub async fn discover(seed: &Url, opts: &DiscoveryOptions) -> Result<Vec<Url>> {
    let origin = origin_url(seed)?;
    let host = seed
        .host_str()
        .unwrap_or_default()
        .to_ascii_lowercase();

    let client = build_client(opts)?;

    // Sitemap documents still waiting to be fetched, with their index depth.
    let mut pending: VecDeque<(String, usize)> = VecDeque::new();
    let mut fetched_sitemaps: HashSet<String> = HashSet::new();

    for probe in SITEMAP_PROBES {
        let probe_url = format!("{origin}{probe}");
        if *probe == "/robots.txt" {
            match fetch(&client, &probe_url).await {
                Ok(body) => {
                    for sitemap in robots_sitemaps(&body.text) {
                        pending.push_back((sitemap, 0));
                    }
                }
                Err(e) => debug!(url = %probe_url, error = %e, "robots.txt not available"),
            }
        } else {
            pending.push_back((probe_url, 0));
        }
    }

    let mut pages: Vec<Url> = Vec::new();
    let mut seen_pages: HashSet<String> = HashSet::new();

    while let Some((sitemap_url, depth)) = pending.pop_front() {
        if depth > MAX_SITEMAP_DEPTH {
            warn!(url = %sitemap_url, "sitemap index nesting too deep, skipping");
            continue;
        }
        if !same_host(&sitemap_url, &host) || !fetched_sitemaps.insert(sitemap_url.clone()) {
            continue;
        }

        let body = match fetch(&client, &sitemap_url).await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %sitemap_url, error = %e, "sitemap not available");
                continue;
            }
        };

        if body.looks_like_xml() {
            match parse_sitemap_xml(&body.text) {
                Ok(SitemapXml::Index(children)) => {
                    for child in children {
                        pending.push_back((child, depth + 1));
                    }
                }
                Ok(SitemapXml::Pages(urls)) => {
                    for loc in urls {
                        push_page(&loc, &host, &mut pages, &mut seen_pages);
                    }
                }
                Err(e) => debug!(url = %sitemap_url, error = %e, "invalid sitemap XML"),
            }
        } else {
            // Plain-text sitemap: one URL per line.
            for line in body.text.lines() {
                let line = line.trim();
                if line.starts_with("http") {
                    push_page(line, &host, &mut pages, &mut seen_pages);
                }
            }
        }
    }

    info!(pages = pages.len(), "sitemap discovery complete");
    Ok(pages)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parsed shape of a sitemap XML document.
enum SitemapXml {
    /// A `<sitemapindex>`: child sitemap URLs to expand.
    Index(Vec<String>),
    /// A `<urlset>` (or bare `<loc>` list): page URLs.
    Pages(Vec<String>),
}

fn parse_sitemap_xml(text: &str) -> Result<SitemapXml> {
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| DocdexError::parse(format!("sitemap XML: {e}")))?;

    // Compare local names only: sitemaps carry a default xmlns.
    let locs: Vec<String> = doc
        .descendants()
        .filter(|n| n.tag_name().name() == "loc")
        .filter_map(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if doc.root_element().tag_name().name() == "sitemapindex" {
        Ok(SitemapXml::Index(locs))
    } else {
        Ok(SitemapXml::Pages(locs))
    }
}

/// Extract every `Sitemap:` directive value from a robots.txt body.
fn robots_sitemaps(robots: &str) -> Vec<String> {
    robots
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            } else {
                None
            }
        })
        .collect()
}

fn push_page(loc: &str, host: &str, pages: &mut Vec<Url>, seen: &mut HashSet<String>) {
    let Ok(url) = Url::parse(loc) else {
        debug!(loc, "skipping unparseable sitemap entry");
        return;
    };
    if !url
        .host_str()
        .is_some_and(|h| h.eq_ignore_ascii_case(host))
    {
        return;
    }
    if seen.insert(url.as_str().to_string()) {
        pages.push(url);
    }
}

fn same_host(url: &str, host: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(host)))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// A fetched probe body plus its declared content type.
struct FetchedBody {
    content_type: String,
    text: String,
}

impl FetchedBody {
    fn looks_like_xml(&self) -> bool {
        self.content_type.contains("xml") || self.text.trim_start().starts_with('<')
    }
}

/// Extract the origin (scheme + host + port) from a URL.
fn origin_url(url: &Url) -> Result<String> {
    let scheme = url.scheme();
    let host = url
        .host_str()
        .ok_or_else(|| DocdexError::validation(format!("URL has no host: {url}")))?;

    match url.port() {
        Some(port) => Ok(format!("{scheme}://{host}:{port}")),
        None => Ok(format!("{scheme}://{host}")),
    }
}

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &DiscoveryOptions) -> Result<Client> {
    Client::builder()
        .user_agent(&opts.user_agent)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(std::time::Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| DocdexError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fetch a URL and return its body text with the declared content type.
async fn fetch(client: &Client, url: &str) -> Result<FetchedBody> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| DocdexError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DocdexError::Network(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(DocdexError::validation(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let text = response
        .text()
        .await
        .map_err(|e| DocdexError::Network(format!("{url}: failed to read body: {e}")))?;

    Ok(FetchedBody { content_type, text })
}
