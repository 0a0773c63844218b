//! Route labels used as rate-limit and metrics table keys.

/// Prefix shared by all portal API routes.
pub const API_PREFIX: &str = "/api/v1/";

/// Join a method and path segments into a stable route label.
///
/// `route("POST", &["org", "1", "property", "1"])` yields
/// `POST /api/v1/org/1/property/1`.
pub fn route(method: &str, parts: &[&str]) -> String {
    format!("{} {}{}", method, API_PREFIX, parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(
            route("POST", &["org", "1", "property", "1"]),
            format!("POST {}org/1/property/1", API_PREFIX)
        );
        assert_eq!(route("GET", &[]), format!("GET {}", API_PREFIX));
    }
}
