//! Concurrent, scope-aware BFS crawler engine.
//!
//! The crawler starts from a seed URL (plus optional sitemap seeds), walks
//! same-host documentation pages breadth-first under a concurrency cap, and
//! streams each successfully fetched page to an async sink exactly once.
//! The visited set and queue are owned by the coordinating task; fetches fan
//! out through a `JoinSet`.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use docdex_extract::extract_page;
use docdex_shared::{CrawlConfig, DocdexError, Result};

use crate::canonical::{canonicalize, is_asset_url};

/// Built-in path excludes: authentication pages, category/tag/feed pages,
/// and non-HTML media descriptors.
static DEFAULT_EXCLUDES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)/(log[-_]?in|sign[-_]?in|sign[-_]?up|register|auth|account)(/|$)",
        r"(?i)/(category|categories|tag|tags|feed)(/|$)",
        r"(?i)\.(rss|atom)$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

// ---------------------------------------------------------------------------
// CrawledPage / CrawlSummary
// ---------------------------------------------------------------------------

/// One successfully fetched page, delivered to the sink exactly once.
#[derive(Debug, Clone)]
pub struct CrawledPage {
    /// Canonical page URL.
    pub url: Url,
    /// Extracted title.
    pub title: String,
    /// Extracted main text, whitespace-collapsed. May be empty.
    pub text: String,
}

/// Summary of a completed crawl operation.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    /// Pages delivered to the sink.
    pub pages_delivered: usize,
    /// URLs skipped (errors, non-HTML, SSRF guard).
    pub pages_skipped: usize,
    /// Distinct URLs enqueued over the whole crawl (delivered or not).
    pub urls_seen: usize,
    /// Errors encountered (URL, error message).
    pub errors: Vec<(String, String)>,
    /// Total duration of the crawl.
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Concurrent web crawler with scope-aware page fetching.
pub struct Crawler {
    config: CrawlConfig,
    client: Client,
}

impl Crawler {
    /// Create a new crawler with the given configuration.
    pub fn new(config: CrawlConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()
            .map_err(|e| DocdexError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Crawl starting from `seed` plus `extra_seeds`, delivering each fetched
    /// page to `sink`. A sink error aborts the crawl; per-URL fetch errors
    /// are swallowed and counted.
    #[instrument(skip_all, fields(seed = %seed, max_pages = self.config.max_pages))]
    pub async fn crawl<S, Fut>(
        &self,
        seed: &Url,
        extra_seeds: &[Url],
        mut sink: S,
    ) -> Result<CrawlSummary>
    where
        S: FnMut(CrawledPage) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let start = Instant::now();
        let scope = CrawlScope::new(seed, &self.config)?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<Url> = VecDeque::new();
        let mut in_flight: JoinSet<(Url, Result<FetchedDoc>)> = JoinSet::new();

        for candidate in std::iter::once(seed).chain(extra_seeds) {
            enqueue(candidate, &scope, &mut visited, &mut queue);
        }

        let mut delivered = 0usize;
        let mut skipped = 0usize;
        let mut errors: Vec<(String, String)> = Vec::new();

        info!(
            concurrency = self.config.concurrency,
            seeds = queue.len(),
            "starting crawl"
        );

        while delivered < self.config.max_pages && (!queue.is_empty() || !in_flight.is_empty()) {
            // Keep the worker pool full, but never fetch more pages than the
            // bound still admits.
            while in_flight.len() < self.config.concurrency.max(1)
                && delivered + in_flight.len() < self.config.max_pages
            {
                let Some(url) = queue.pop_front() else { break };

                if !self.config.allow_private_hosts && is_private_target(&url) {
                    warn!(%url, "private-network target blocked");
                    skipped += 1;
                    continue;
                }

                let client = self.client.clone();
                in_flight.spawn(async move {
                    let fetched = fetch_html(&client, &url).await;
                    (url, fetched)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            match joined {
                Ok((url, Ok(doc))) => {
                    for link in &doc.links {
                        enqueue(link, &scope, &mut visited, &mut queue);
                    }

                    let page = extract_page(&doc.body, url.as_str());
                    delivered += 1;
                    sink(CrawledPage {
                        url,
                        title: page.title,
                        text: page.text,
                    })
                    .await?;
                }
                Ok((url, Err(e))) => {
                    debug!(%url, error = %e, "fetch failed, continuing");
                    errors.push((url.to_string(), e.to_string()));
                    skipped += 1;
                }
                Err(e) => {
                    errors.push(("task".into(), e.to_string()));
                    skipped += 1;
                }
            }
        }

        // Page bound reached: discard the remaining queue and in-flight work.
        in_flight.abort_all();

        let summary = CrawlSummary {
            pages_delivered: delivered,
            pages_skipped: skipped,
            urls_seen: visited.len(),
            errors,
            duration: start.elapsed(),
        };

        info!(
            pages_delivered = summary.pages_delivered,
            pages_skipped = summary.pages_skipped,
            urls_seen = summary.urls_seen,
            errors = summary.errors.len(),
            duration_ms = summary.duration.as_millis(),
            "crawl completed"
        );

        Ok(summary)
    }
}

/// Canonicalize and enqueue a URL if it is in scope and unseen.
fn enqueue(url: &Url, scope: &CrawlScope, visited: &mut HashSet<String>, queue: &mut VecDeque<Url>) {
    let canonical = canonicalize(url);
    if !scope.in_scope(&canonical) || is_asset_url(&canonical) {
        return;
    }
    if visited.insert(canonical.as_str().to_string()) {
        queue.push_back(canonical);
    }
}

// ---------------------------------------------------------------------------
// Scope checking
// ---------------------------------------------------------------------------

/// Determines which URLs are in scope for a crawl.
struct CrawlScope {
    base_host: String,
    /// Seed path prefix, enforced when the seed is not at the site root.
    path_prefix: Option<String>,
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
}

impl CrawlScope {
    fn new(seed: &Url, config: &CrawlConfig) -> Result<Self> {
        let base_host = seed
            .host_str()
            .ok_or_else(|| DocdexError::validation(format!("seed URL has no host: {seed}")))?
            .to_ascii_lowercase();

        let seed_path = canonicalize(seed).path().to_string();
        let path_prefix = (seed_path != "/" && !seed_path.is_empty()).then_some(seed_path);

        Ok(Self {
            base_host,
            path_prefix,
            include_patterns: compile_patterns(&config.include_patterns)?,
            exclude_patterns: compile_patterns(&config.exclude_patterns)?,
        })
    }

    fn in_scope(&self, url: &Url) -> bool {
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }

        if !url
            .host_str()
            .is_some_and(|h| h.eq_ignore_ascii_case(&self.base_host))
        {
            return false;
        }

        let path = url.path();

        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }

        if DEFAULT_EXCLUDES.iter().any(|p| p.is_match(path)) {
            return false;
        }
        if self.exclude_patterns.iter().any(|p| p.is_match(path)) {
            return false;
        }

        if !self.include_patterns.is_empty() {
            return self.include_patterns.iter().any(|p| p.is_match(path));
        }

        true
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| DocdexError::config(format!("invalid URL pattern {p:?}: {e}")))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Private-network protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a loopback/private/reserved network location.
fn is_private_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost"
            || host.ends_with(".local")
            || host.ends_with(".internal")
        {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

// ---------------------------------------------------------------------------
// Page fetching
// ---------------------------------------------------------------------------

/// A fetched HTML body with its outbound links.
struct FetchedDoc {
    body: String,
    links: Vec<Url>,
}

/// Fetch a single page, requiring an HTML content type and a non-error
/// status after at most five redirects.
async fn fetch_html(client: &Client, url: &Url) -> Result<FetchedDoc> {
    debug!(%url, "fetching page");

    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| DocdexError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(DocdexError::Network(format!("{url}: HTTP {status}")));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("text/html") {
        return Err(DocdexError::Network(format!(
            "{url}: not HTML (content-type {content_type:?})"
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| DocdexError::Network(format!("{url}: body read failed: {e}")))?;

    let links = {
        let doc = Html::parse_document(&body);
        extract_links(&doc, url)
    };

    Ok(FetchedDoc { body, links })
}

/// Extract all links from a document, resolved against the base URL.
fn extract_links(doc: &Html, base_url: &Url) -> Vec<Url> {
    let link_sel = Selector::parse("a[href]").expect("valid selector");
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        if let Some(href) = el.value().attr("href") {
            if href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
            {
                continue;
            }

            if let Ok(resolved) = base_url.join(href) {
                links.push(resolved);
            }
        }
    }

    links
}

#[cfg(test)]
mod crawler_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(max_pages: usize) -> CrawlConfig {
        CrawlConfig {
            max_pages,
            concurrency: 2,
            timeout: Duration::from_secs(5),
            user_agent: "docdex-test".into(),
            include_patterns: vec![],
            exclude_patterns: vec![],
            allow_private_hosts: true,
        }
    }

    fn html_response(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
    }

    async fn collect_crawl(
        crawler: &Crawler,
        seed: &Url,
    ) -> (CrawlSummary, Vec<CrawledPage>) {
        let pages = Arc::new(Mutex::new(Vec::new()));
        let sink_pages = pages.clone();
        let summary = crawler
            .crawl(seed, &[], move |page| {
                let pages = sink_pages.clone();
                async move {
                    pages.lock().await.push(page);
                    Ok(())
                }
            })
            .await
            .expect("crawl");
        let pages = Arc::try_unwrap(pages).expect("sink done").into_inner();
        (summary, pages)
    }

    #[test]
    fn scope_same_host_and_default_excludes() {
        let seed = Url::parse("https://docs.example.com/").unwrap();
        let scope = CrawlScope::new(&seed, &test_config(10)).unwrap();

        assert!(scope.in_scope(&Url::parse("https://docs.example.com/guide").unwrap()));
        assert!(!scope.in_scope(&Url::parse("https://other.example.com/guide").unwrap()));
        assert!(!scope.in_scope(&Url::parse("ftp://docs.example.com/guide").unwrap()));
        // Built-in excludes.
        assert!(!scope.in_scope(&Url::parse("https://docs.example.com/login").unwrap()));
        assert!(!scope.in_scope(&Url::parse("https://docs.example.com/tag/rust").unwrap()));
        assert!(!scope.in_scope(&Url::parse("https://docs.example.com/feed.atom").unwrap()));
    }

    #[test]
    fn scope_path_prefix_from_non_root_seed() {
        let seed = Url::parse("https://docs.example.com/guide/").unwrap();
        let scope = CrawlScope::new(&seed, &test_config(10)).unwrap();

        assert!(scope.in_scope(&Url::parse("https://docs.example.com/guide/intro").unwrap()));
        assert!(!scope.in_scope(&Url::parse("https://docs.example.com/blog/post").unwrap()));
    }

    #[test]
    fn scope_include_and_exclude_patterns() {
        let seed = Url::parse("https://docs.example.com/").unwrap();
        let mut config = test_config(10);
        config.include_patterns = vec!["^/docs/".into()];
        config.exclude_patterns = vec!["/internal/".into()];
        let scope = CrawlScope::new(&seed, &config).unwrap();

        assert!(scope.in_scope(&Url::parse("https://docs.example.com/docs/a").unwrap()));
        assert!(!scope.in_scope(&Url::parse("https://docs.example.com/about").unwrap()));
        assert!(!scope.in_scope(&Url::parse("https://docs.example.com/docs/internal/x").unwrap()));
    }

    #[test]
    fn private_targets_detected() {
        for target in [
            "http://localhost:3000/api",
            "http://127.0.0.1:8080/",
            "http://10.0.0.1/",
            "http://192.168.1.1/admin",
            "file:///etc/passwd",
        ] {
            assert!(is_private_target(&Url::parse(target).unwrap()), "{target}");
        }
        assert!(!is_private_target(
            &Url::parse("https://docs.example.com/page").unwrap()
        ));
    }

    #[tokio::test]
    async fn crawl_follows_links_and_delivers_each_page_once() {
        let server = MockServer::start().await;

        let page1 = r#"<html><body><main>
            <h1>Page One</h1><p>Welcome to page one.</p>
            <a href="/page2">Go to page 2</a>
            <a href="/page2#section">Anchor dupe</a>
        </main></body></html>"#;
        let page2 = r#"<html><body><main>
            <h1>Page Two</h1><p>This is page two.</p>
            <a href="/page3">Go to page 3</a>
        </main></body></html>"#;
        let page3 = r#"<html><body><main>
            <h1>Page Three</h1><p>Final page.</p>
        </main></body></html>"#;

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html_response(page1))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page2"))
            .respond_with(html_response(page2))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page3"))
            .respond_with(html_response(page3))
            .mount(&server)
            .await;

        let crawler = Crawler::new(test_config(100)).unwrap();
        let seed = Url::parse(&server.uri()).unwrap();
        let (summary, pages) = collect_crawl(&crawler, &seed).await;

        assert_eq!(summary.pages_delivered, 3);
        assert!(summary.errors.is_empty());

        let mut titles: Vec<&str> = pages.iter().map(|p| p.title.as_str()).collect();
        titles.sort_unstable();
        assert_eq!(titles, vec!["Page One", "Page Three", "Page Two"]);
        assert!(pages.iter().all(|p| !p.text.is_empty()));
    }

    #[tokio::test]
    async fn crawl_respects_max_pages_bound() {
        let server = MockServer::start().await;

        let links: String = (1..=10)
            .map(|i| format!(r#"<a href="/p{i}">link {i}</a>"#))
            .collect();
        let seed_page = format!("<html><body><main><h1>Seed</h1>{links}</main></body></html>");

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html_response(&seed_page))
            .mount(&server)
            .await;
        for i in 1..=10 {
            let body = format!("<html><body><main><h1>P{i}</h1><p>text</p></main></body></html>");
            Mock::given(method("GET"))
                .and(path(format!("/p{i}")))
                .respond_with(html_response(&body))
                .mount(&server)
                .await;
        }

        let crawler = Crawler::new(test_config(3)).unwrap();
        let seed = Url::parse(&server.uri()).unwrap();
        let (summary, pages) = collect_crawl(&crawler, &seed).await;

        // Exactly three pages delivered; the rest of the queue is discarded.
        assert_eq!(summary.pages_delivered, 3);
        assert_eq!(pages.len(), 3);
        assert!(summary.urls_seen > 3);
    }

    #[tokio::test]
    async fn crawl_skips_non_html_and_continues() {
        let server = MockServer::start().await;

        let seed_page = r#"<html><body><main>
            <h1>Seed</h1>
            <a href="/data.json">data</a>
            <a href="/real">real page</a>
        </main></body></html>"#;

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html_response(seed_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{}")
                    .insert_header("content-type", "application/json"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/real"))
            .respond_with(html_response(
                "<html><body><main><h1>Real</h1><p>x</p></main></body></html>",
            ))
            .mount(&server)
            .await;

        let crawler = Crawler::new(test_config(100)).unwrap();
        let seed = Url::parse(&server.uri()).unwrap();
        let (summary, pages) = collect_crawl(&crawler, &seed).await;

        assert_eq!(summary.pages_delivered, 2);
        assert_eq!(summary.pages_skipped, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(pages.iter().any(|p| p.title == "Real"));
    }

    #[tokio::test]
    async fn crawl_swallows_fetch_errors() {
        let server = MockServer::start().await;

        let seed_page = r#"<html><body><main>
            <h1>Seed</h1>
            <a href="/missing">404 page</a>
        </main></body></html>"#;

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html_response(seed_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let crawler = Crawler::new(test_config(100)).unwrap();
        let seed = Url::parse(&server.uri()).unwrap();
        let (summary, pages) = collect_crawl(&crawler, &seed).await;

        assert_eq!(summary.pages_delivered, 1);
        assert_eq!(pages.len(), 1);
        assert_eq!(summary.errors.len(), 1);
    }
}
