//! Widget-origin domain checks.

use url::Url;

/// Whether `candidate` equals `domain` or is a proper subdomain of it.
///
/// The empty-label form `.domain.com` does not count as a subdomain.
pub fn is_subdomain_or_domain(candidate: &str, domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    if candidate.eq_ignore_ascii_case(domain) {
        return true;
    }
    let candidate = candidate.to_ascii_lowercase();
    let suffix = format!(".{}", domain.to_ascii_lowercase());
    candidate.ends_with(&suffix) && candidate.len() > suffix.len()
}

/// Extract the host from a property's configured domain field.
///
/// Accepts both bare hosts (`bar.com`) and full URLs (`https://bar.com/api`).
pub fn parse_domain_name(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = Url::parse(raw)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| Url::parse(&format!("https://{}", raw)).ok());
    parsed
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_or_domain() {
        assert!(is_subdomain_or_domain("app.domain.com", "domain.com"));
        assert!(is_subdomain_or_domain("domain.com", "domain.com"));
        assert!(!is_subdomain_or_domain(".domain.com", "domain.com"));
        assert!(!is_subdomain_or_domain("a.com", "b.com"));
        assert!(!is_subdomain_or_domain("evildomain.com", "domain.com"));
        assert!(!is_subdomain_or_domain("app.domain.com", ""));
    }

    #[test]
    fn test_parse_domain_name() {
        assert_eq!(parse_domain_name("https://bar.com/api").as_deref(), Some("bar.com"));
        assert_eq!(parse_domain_name("bar.com").as_deref(), Some("bar.com"));
        assert_eq!(
            parse_domain_name("http://localhost:8080/x").as_deref(),
            Some("localhost")
        );
        assert_eq!(parse_domain_name(""), None);
    }
}
