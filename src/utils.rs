//! Crate-wide utility functions (URL normalization, resource name slugs).

/// Returns true if `s` is a non-empty absolute HTTP or HTTPS URL (after trimming).
pub fn is_absolute_http_url(s: &str) -> bool {
    let s = s.trim();
    (s.starts_with("https://") || s.starts_with("http://")) && s.len() > 8
}

/// Normalize an endpoint URL: trim, drop trailing slashes, and prepend `http://`
/// when no scheme is given (e.g. `localhost:8000` → `http://localhost:8000`).
/// Local engine and liveness endpoints are plain HTTP, so that is the default scheme.
pub fn normalize_endpoint_url(url: &str) -> String {
    let s = url.trim().trim_end_matches('/');
    if s.is_empty() {
        return s.to_string();
    }
    if s.starts_with("https://") || s.starts_with("http://") {
        return s.to_string();
    }
    format!("http://{}", s)
}

/// Join a base URL and a path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        normalize_endpoint_url(base),
        path.trim_start_matches('/')
    )
}

/// Lowercase ASCII slug: alphanumerics kept, every other run of characters becomes a
/// single dash, no leading or trailing dash (e.g. `vLLM PoC` → `vllm-poc`).
/// Used to derive logical resource names that every provider accepts.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_http_url() {
        assert!(is_absolute_http_url("https://engine.internal"));
        assert!(is_absolute_http_url("http://host"));
        assert!(is_absolute_http_url("  https://x.co  "));
        assert!(!is_absolute_http_url("localhost:8000"));
        assert!(!is_absolute_http_url(""));
        assert!(!is_absolute_http_url("https://")); // len <= 8
    }

    #[test]
    fn test_normalize_endpoint_url() {
        assert_eq!(normalize_endpoint_url("localhost:8000"), "http://localhost:8000");
        assert_eq!(normalize_endpoint_url("https://api.example.com/"), "https://api.example.com");
        assert_eq!(normalize_endpoint_url("  10.0.1.5:8000  "), "http://10.0.1.5:8000");
        assert_eq!(normalize_endpoint_url(""), "");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("localhost:8000", "/health"), "http://localhost:8000/health");
        assert_eq!(join_url("http://engine:8000/", "v1/chat/completions"), "http://engine:8000/v1/chat/completions");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify(""), "");
        assert_eq!(slugify("vLLM PoC"), "vllm-poc");
        assert_eq!(slugify("--My__Service--"), "my-service");
        assert_eq!(slugify("ABC-123"), "abc-123");
    }
}
