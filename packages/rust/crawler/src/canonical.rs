//! URL canonicalization rules shared by the crawler and seed expansion.

use url::Url;

/// Exact query-parameter names stripped during canonicalization
/// (`utm_*` prefixes are stripped as well).
const STRIPPED_PARAMS: &[&str] = &["icid", "gclid", "fbclid", "ref", "source"];

/// Extensions the HTML crawler never enqueues.
const ASSET_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "pdf", "zip", "tar", "gz", "tgz", "mp4", "mp3", "wav",
    "webm", "ico",
];

/// Canonicalize a URL for deduplication and storage.
///
/// Drops the fragment, strips tracking query parameters, rewrites a
/// `/index.html` suffix to `/`, and removes the trailing slash (non-root).
/// Idempotent: `canonicalize(canonicalize(u)) == canonicalize(u)`.
pub fn canonicalize(url: &Url) -> Url {
    let mut out = url.clone();
    out.set_fragment(None);

    let kept: Vec<(String, String)> = out
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    out.set_query(None);
    if !kept.is_empty() {
        out.query_pairs_mut().extend_pairs(kept);
    }

    let mut path = out.path().to_string();
    if let Some(stripped) = path.strip_suffix("/index.html") {
        path = format!("{stripped}/");
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    out.set_path(&path);

    out
}

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || STRIPPED_PARAMS.contains(&name)
}

/// Whether a URL points at a binary/media asset by extension.
pub fn is_asset_url(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| ASSET_EXTENSIONS.contains(&ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(input: &str) -> String {
        canonicalize(&Url::parse(input).unwrap()).to_string()
    }

    #[test]
    fn strips_tracking_params_and_fragment() {
        assert_eq!(
            canon("https://x.test/a/?utm_source=b&keep=1#frag"),
            "https://x.test/a?keep=1"
        );
    }

    #[test]
    fn rewrites_index_html() {
        assert_eq!(canon("https://x.test/a/index.html"), "https://x.test/a");
        assert_eq!(canon("https://x.test/index.html"), "https://x.test/");
    }

    #[test]
    fn removes_trailing_slash_except_root() {
        assert_eq!(canon("https://x.test/a/b/"), "https://x.test/a/b");
        assert_eq!(canon("https://x.test/"), "https://x.test/");
    }

    #[test]
    fn strips_known_click_ids() {
        assert_eq!(
            canon("https://x.test/p?gclid=123&fbclid=456&icid=x&ref=home&source=rss&q=rust"),
            "https://x.test/p?q=rust"
        );
    }

    #[test]
    fn keeps_non_tracking_query_order() {
        assert_eq!(
            canon("https://x.test/p?b=2&utm_campaign=x&a=1"),
            "https://x.test/p?b=2&a=1"
        );
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for input in [
            "https://x.test/a/?utm_source=b&keep=1#frag",
            "https://x.test/a/index.html",
            "https://x.test/",
            "https://x.test/docs/guide?page=2",
        ] {
            let once = canonicalize(&Url::parse(input).unwrap());
            let twice = canonicalize(&once);
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn asset_extensions_detected() {
        for asset in [
            "https://x.test/logo.png",
            "https://x.test/v.mp4",
            "https://x.test/archive.tar.gz",
            "https://x.test/manual.PDF",
        ] {
            assert!(is_asset_url(&Url::parse(asset).unwrap()), "{asset}");
        }

        for page in [
            "https://x.test/docs/intro",
            "https://x.test/page.html",
            "https://x.test/changelog.v2",
        ] {
            assert!(!is_asset_url(&Url::parse(page).unwrap()), "{page}");
        }
    }
}
