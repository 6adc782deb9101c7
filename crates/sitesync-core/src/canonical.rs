//! URL canonicalization (spec §3: "scheme+host lowercased, fragment
//! stripped, default ports removed, trailing-slash policy fixed").
//!
//! Shared by the Task Queue (enqueue dedupes on the canonical form), the
//! Worker (outbound link discovery), and the Frontier Filter (host/path
//! extraction), so it lives here rather than being duplicated per crate.

use url::Url;

/// Canonicalizes `raw` relative to `base` (the page it was discovered on, if
/// any). Returns `None` for URLs that cannot be parsed or that use a scheme
/// we don't crawl (anything but http/https).
pub fn canonicalize(raw: &str, base: Option<&str>) -> Option<String> {
    let parsed = match base {
        Some(base) => {
            let base = Url::parse(base).ok()?;
            base.join(raw).ok()?
        }
        None => Url::parse(raw).ok()?,
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }

    let mut out = Url::parse(&format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str()?.to_ascii_lowercase()
    ))
    .ok()?;

    if let Some(port) = parsed.port() {
        let default_port = match parsed.scheme() {
            "http" => 80,
            "https" => 443,
            _ => 0,
        };
        if port != default_port {
            out.set_port(Some(port)).ok()?;
        }
    }

    out.set_path(normalize_path(parsed.path()).as_str());
    out.set_query(parsed.query());
    // Fragment is intentionally dropped.

    Some(out.into())
}

/// Trailing-slash policy: keep a single trailing slash only for the root
/// path; strip it everywhere else so `/docs` and `/docs/` canonicalize to
/// the same task.
fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    if path == "/" {
        return "/".to_string();
    }
    path.strip_suffix('/').unwrap_or(path).to_string()
}

/// Extracts the lowercased host from an already-canonical URL, for Frontier
/// Filter domain lookups.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_ascii_lowercase)
}

/// Extracts the path component from an already-canonical URL, for Frontier
/// Filter glob matching.
pub fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_scheme_and_host() {
        assert_eq!(
            canonicalize("HTTPS://Example.COM/Docs", None).as_deref(),
            Some("https://example.com/Docs")
        );
    }

    #[test]
    fn strips_default_port() {
        assert_eq!(
            canonicalize("https://example.com:443/a", None).as_deref(),
            Some("https://example.com/a")
        );
    }

    #[test]
    fn keeps_non_default_port() {
        assert_eq!(
            canonicalize("https://example.com:8443/a", None).as_deref(),
            Some("https://example.com:8443/a")
        );
    }

    #[test]
    fn strips_fragment() {
        assert_eq!(
            canonicalize("https://example.com/a#section", None).as_deref(),
            Some("https://example.com/a")
        );
    }

    #[test]
    fn trailing_slash_policy() {
        assert_eq!(
            canonicalize("https://example.com/docs/", None).as_deref(),
            Some("https://example.com/docs")
        );
        assert_eq!(
            canonicalize("https://example.com/", None).as_deref(),
            Some("https://example.com/")
        );
    }

    #[test]
    fn resolves_relative_against_base() {
        assert_eq!(
            canonicalize("/b", Some("https://example.com/a/")).as_deref(),
            Some("https://example.com/b")
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert_eq!(canonicalize("mailto:a@example.com", None), None);
    }
}
