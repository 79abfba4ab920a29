//! Debug protocol (§6): detecting whether a request asked to enter debug mode, and the
//! basic-auth/dedicated-header credential check gating it. Grounded on
//! `syncserver::web::extractors`'s header/query extraction helpers and `frontik/debug.py`'s
//! `DEBUG_HEADER_NAME` / `DEBUG_AUTH_HEADER_NAME` checks. Response wrapping into the debug JSON
//! envelope and the HTML-template rendering of that envelope are page-rendering concerns outside
//! this crate's scope (§1 "only the extension points they plug into").
use actix_web::http::header::HeaderMap;
use actix_web::{HttpMessage, HttpRequest};
use base64::Engine;

use crate::error::{ApiError, ApiErrorKind};

pub const DEBUG_HEADER_NAME: &str = "x-hh-debug";
pub const DEBUG_AUTH_HEADER_NAME: &str = "x-hh-debug-auth";
const DEBUG_COOKIE_NAME: &str = "debug";
const DEBUG_QUERY_PARAM: &str = "debug";

/// True if the request asked for debug mode via header, query parameter, or cookie (§6).
pub fn requested(req: &HttpRequest) -> bool {
    header_is_true(req.headers())
        || req.query_string().split('&').any(|pair| {
            let mut parts = pair.splitn(2, '=');
            matches!(parts.next(), Some(name) if name == DEBUG_QUERY_PARAM)
        })
        || req.cookie(DEBUG_COOKIE_NAME).is_some()
}

fn header_is_true(headers: &HeaderMap) -> bool {
    headers
        .get(DEBUG_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Check the request's credentials against the configured `debug_login`/`debug_password`,
/// accepting either HTTP basic auth or the dedicated `x-hh-debug-auth: login:password` header.
/// Returns `DebugUnauthorized` (§7) when debug mode was requested but credentials don't match.
pub fn check_credentials(
    req: &HttpRequest,
    debug_login: Option<&str>,
    debug_password: Option<&str>,
) -> Result<(), ApiError> {
    let (Some(login), Some(password)) = (debug_login, debug_password) else {
        // No credentials configured: debug mode is open to anyone who asks.
        return Ok(());
    };

    let supplied = basic_auth_credentials(req.headers()).or_else(|| dedicated_header_credentials(req.headers()));

    match supplied {
        Some((ref user, ref pass)) if user == login && pass == password => Ok(()),
        _ => Err(ApiErrorKind::DebugUnauthorized.into()),
    }
}

fn basic_auth_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(actix_web::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

fn dedicated_header_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(DEBUG_AUTH_HEADER_NAME)?.to_str().ok()?;
    let (user, pass) = value.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn header_true_requests_debug() {
        let req = TestRequest::get().insert_header((DEBUG_HEADER_NAME, "true")).to_http_request();
        assert!(requested(&req));
    }

    #[test]
    fn no_marker_does_not_request_debug() {
        let req = TestRequest::get().to_http_request();
        assert!(!requested(&req));
    }

    #[test]
    fn query_param_requests_debug() {
        let req = TestRequest::get().uri("/widgets?debug=1").to_http_request();
        assert!(requested(&req));
    }

    #[test]
    fn no_configured_credentials_allows_debug() {
        let req = TestRequest::get().to_http_request();
        assert!(check_credentials(&req, None, None).is_ok());
    }

    #[test]
    fn dedicated_header_with_correct_credentials_passes() {
        let req = TestRequest::get()
            .insert_header((DEBUG_AUTH_HEADER_NAME, "alice:hunter2"))
            .to_http_request();
        assert!(check_credentials(&req, Some("alice"), Some("hunter2")).is_ok());
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        let req = TestRequest::get()
            .insert_header((DEBUG_AUTH_HEADER_NAME, "alice:wrong"))
            .to_http_request();
        assert!(check_credentials(&req, Some("alice"), Some("hunter2")).is_err());
    }

    #[test]
    fn missing_credentials_are_rejected_when_configured() {
        let req = TestRequest::get().to_http_request();
        assert!(check_credentials(&req, Some("alice"), Some("hunter2")).is_err());
    }
}
