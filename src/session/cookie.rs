//! Session cookie handling.
//!
//! HttpOnly, SameSite=Lax, URL-encoded value. `Secure` is always set in
//! production and otherwise inferred from `X-Forwarded-Proto: https` on the
//! incoming request.

use std::time::Duration;

use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};

/// Cookie parameters for the session store.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    /// Cookie name.
    pub name: String,
    /// Cookie path.
    pub path: String,
    /// Session lifetime; also the cookie `Max-Age`.
    pub max_lifetime: Duration,
    /// Whether the process runs in production (forces `Secure`).
    pub production: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "pc_session".to_string(),
            path: "/".to_string(),
            max_lifetime: Duration::from_secs(7 * 24 * 60 * 60),
            production: false,
        }
    }
}

fn request_is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

/// Build the `Set-Cookie` value carrying a session ID.
pub fn session_cookie(
    config: &CookieConfig,
    session_id: &str,
    request_headers: &HeaderMap,
) -> HeaderValue {
    let secure = config.production || request_is_https(request_headers);
    let cookie = format!(
        "{}={}; Path={}; Max-Age={}; HttpOnly; SameSite=Lax{}",
        config.name,
        urlencoding::encode(session_id),
        config.path,
        config.max_lifetime.as_secs(),
        if secure { "; Secure" } else { "" }
    );
    HeaderValue::from_str(&cookie)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid-session-cookie"))
}

/// Build the `Set-Cookie` value that clears the session cookie.
pub fn expired_cookie(config: &CookieConfig) -> HeaderValue {
    let cookie = format!(
        "{}=; Path={}; Max-Age=-1; HttpOnly; SameSite=Lax",
        config.name, config.path
    );
    HeaderValue::from_str(&cookie)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid-session-cookie"))
}

/// Extract the session ID from a request's `Cookie` header.
pub fn read_session_cookie(config: &CookieConfig, headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some((name, value)) = pair.split_once('=') {
                if name == config.name && !value.is_empty() {
                    return urlencoding::decode(value).ok().map(|v| v.into_owned());
                }
            }
        }
    }
    None
}

/// Append a `Set-Cookie` header to a response header map.
pub fn apply_cookie(headers: &mut HeaderMap, cookie: HeaderValue) {
    headers.append(SET_COOKIE, cookie);
}
