use std::collections::HashSet;
use std::time::Duration;

use crate::multipart::{make_mfd, FieldValue, FilePart};
use crate::url::{make_qs, make_url, QueryValue};

/// The HTTP method of a Balanced Request. `idempotent` defaults from this and can only be
/// overridden to `false` for `Post` (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    fn default_idempotent(self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Put | Method::Delete)
    }
}

/// Body payload chosen at construction time based on method and inputs (§4.C).
#[derive(Debug, Clone)]
pub enum Body {
    None,
    Bytes(Vec<u8>),
    UrlEncoded(Vec<(String, QueryValue)>),
    Multipart(Vec<u8>),
}

/// A single outbound call, balanced against a named upstream (or a direct host when `upstream`
/// is `None`). Grounded on frontik's `BalancedHttpRequest`.
#[derive(Debug, Clone)]
pub struct BalancedRequest {
    pub uri: String,
    pub upstream: Option<String>,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub content_type: Option<String>,
    pub connect_timeout: Duration,
    /// The full per-attempt request timeout, before subtracting elapsed time across retries.
    pub request_timeout: Duration,
    pub follow_redirects: bool,
    pub idempotent: bool,
    /// If set, a final failed response should escalate to `PipelineError::FailFast` instead of
    /// resolving as an ordinary `RequestResult` (frontik's `fail_fast` kwarg, §4.D/§4.F).
    pub fail_fast: bool,

    pub tries_left: u32,
    pub time_budget_remaining: Duration,
    pub tried_indices: HashSet<usize>,
    /// Slot index borrowed from the pool for the attempt currently in flight, if any.
    pub current_index: Option<usize>,
    pub current_host: Option<String>,
}

pub struct BalancedRequestOptions<'a> {
    pub host: &'a str,
    pub upstream: Option<&'a str>,
    pub uri: &'a str,
    pub method: Method,
    pub query: Vec<(String, QueryValue)>,
    pub fields: Vec<(String, FieldValue)>,
    pub files: Vec<(String, Vec<FilePart>)>,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub idempotent_override: Option<bool>,
    pub fail_fast: bool,
    pub max_tries: u32,
    pub timeout_multiplier: f64,
    pub default_connect_timeout: Duration,
    pub default_request_timeout: Duration,
}

impl BalancedRequest {
    pub fn new(opts: BalancedRequestOptions<'_>) -> Self {
        let uri = if opts.uri.starts_with('/') {
            opts.uri.to_owned()
        } else {
            format!("/{}", opts.uri)
        };

        let connect_timeout = opts.connect_timeout.unwrap_or(opts.default_connect_timeout);
        let request_timeout = opts.request_timeout.unwrap_or(opts.default_request_timeout);
        let connect_timeout = connect_timeout.mul_f64(opts.timeout_multiplier);
        let request_timeout = request_timeout.mul_f64(opts.timeout_multiplier);

        let mut headers = opts.headers;
        let mut body = Body::None;
        let mut content_type = opts.content_type;
        let mut uri_final = uri;

        match opts.method {
            Method::Post => {
                if !opts.files.is_empty() {
                    let (bytes, mfd_content_type) = make_mfd(&opts.fields, &opts.files);
                    content_type = Some(mfd_content_type);
                    body = Body::Multipart(bytes);
                } else {
                    let qs = opts.query.clone();
                    body = Body::UrlEncoded(qs);
                }
                if content_type.is_none() {
                    content_type = header_value(&headers, "Content-Type")
                        .or_else(|| Some("application/x-www-form-urlencoded".to_owned()));
                }
                let len = match &body {
                    Body::Multipart(b) => b.len(),
                    Body::UrlEncoded(qs) => make_qs(qs).len(),
                    _ => 0,
                };
                set_header(&mut headers, "Content-Length", &len.to_string());
            }
            Method::Put => {
                body = Body::UrlEncoded(opts.query.clone());
            }
            Method::Get | Method::Head | Method::Delete => {
                uri_final = make_url(&uri_final, &opts.query);
            }
        }

        if let Some(ct) = &content_type {
            set_header(&mut headers, "Content-Type", ct);
        }

        let idempotent = match (opts.method, opts.idempotent_override) {
            (Method::Post, Some(v)) => v,
            (Method::Post, None) => false,
            _ => opts.method.default_idempotent(),
        };

        Self {
            uri: uri_final,
            upstream: opts.upstream.map(String::from),
            method: opts.method,
            headers,
            body,
            content_type,
            connect_timeout,
            request_timeout,
            follow_redirects: opts.follow_redirects,
            idempotent,
            fail_fast: opts.fail_fast,
            tries_left: opts.max_tries.max(1),
            time_budget_remaining: request_timeout,
            tried_indices: HashSet::new(),
            current_index: None,
            current_host: Some(opts.host.trim_end_matches('/').to_owned()),
        }
    }

    pub fn backend_available(&self) -> bool {
        self.current_host.is_some()
    }

    /// Timeout to use for the attempt about to be made: the per-attempt request timeout, capped
    /// by whatever budget remains after previous attempts (§4.D step 2).
    pub fn attempt_timeout(&self) -> Duration {
        self.request_timeout.min(self.time_budget_remaining)
    }

    /// Decide whether a response should be retried, mirroring `BalancedHttpRequest.check_retry`.
    /// `elapsed` is the wall time the just-completed attempt took. Returns `(should_retry,
    /// backend_failed)`; the caller is responsible for calling `pool.return_server(index,
    /// error=backend_failed)` regardless of the outcome, and for recording `current_index` into
    /// `tried_indices` when `should_retry` is true.
    pub fn check_retry(&mut self, status: u16, error_text: &str, elapsed: Duration) -> (bool, bool) {
        if self.upstream.is_none() {
            return (false, false);
        }

        self.time_budget_remaining = self.time_budget_remaining.saturating_sub(elapsed);
        self.tries_left = self.tries_left.saturating_sub(1);

        let connect_error = status == 599 && error_text.contains("Failed to connect");
        let backend_failed = crate::result::is_retryable_status(status);

        if self.tries_left == 0 || !backend_failed || self.time_budget_remaining.is_zero() {
            return (false, backend_failed);
        }

        let should_retry = connect_error || (self.idempotent && backend_failed);
        if should_retry {
            if let Some(index) = self.current_index {
                self.tried_indices.insert(index);
            }
        }
        (should_retry, backend_failed)
    }
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(entry) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        entry.1 = value.to_owned();
    } else {
        headers.push((name.to_owned(), value.to_owned()));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_opts(method: Method, upstream: Option<&str>) -> BalancedRequestOptions<'static> {
        BalancedRequestOptions {
            host: "example",
            upstream,
            uri: "path",
            method,
            query: vec![],
            fields: vec![],
            files: vec![],
            headers: vec![],
            content_type: None,
            connect_timeout: None,
            request_timeout: None,
            follow_redirects: true,
            idempotent_override: None,
            fail_fast: false,
            max_tries: 2,
            timeout_multiplier: 1.0,
            default_connect_timeout: Duration::from_millis(200),
            default_request_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn normalizes_uri_to_start_with_slash() {
        let req = BalancedRequest::new(base_opts(Method::Get, None));
        assert_eq!(req.uri, "/path");
    }

    #[test]
    fn get_merges_query_into_url() {
        let mut opts = base_opts(Method::Get, None);
        opts.query = vec![("a".to_owned(), QueryValue::from("1"))];
        let req = BalancedRequest::new(opts);
        assert_eq!(req.uri, "/path?a=1");
    }

    #[test]
    fn post_without_files_is_idempotent_false_by_default() {
        let req = BalancedRequest::new(base_opts(Method::Post, Some("up")));
        assert!(!req.idempotent);
        assert!(matches!(req.body, Body::UrlEncoded(_)));
    }

    #[test]
    fn post_can_opt_into_idempotent() {
        let mut opts = base_opts(Method::Post, Some("up"));
        opts.idempotent_override = Some(true);
        let req = BalancedRequest::new(opts);
        assert!(req.idempotent);
    }

    #[test]
    fn check_retry_direct_host_never_retries() {
        let mut req = BalancedRequest::new(base_opts(Method::Get, None));
        let (retry, failed) = req.check_retry(503, "", Duration::from_millis(10));
        assert!(!retry);
        assert!(!failed);
    }

    #[test]
    fn check_retry_post_retries_only_on_connect_error() {
        let mut req = BalancedRequest::new(base_opts(Method::Post, Some("up")));
        let (retry, failed) = req.check_retry(500, "backend said no", Duration::from_millis(10));
        assert!(!retry);
        assert!(!failed);

        let mut req = BalancedRequest::new(base_opts(Method::Post, Some("up")));
        let (retry, failed) = req.check_retry(599, "HTTP 599: Failed to connect", Duration::from_millis(10));
        assert!(retry);
        assert!(failed);
    }

    #[test]
    fn check_retry_idempotent_retries_on_backend_failure() {
        let mut req = BalancedRequest::new(base_opts(Method::Get, Some("up")));
        let (retry, failed) = req.check_retry(503, "", Duration::from_millis(10));
        assert!(retry);
        assert!(failed);
    }

    #[test]
    fn fail_fast_option_carries_onto_request() {
        let mut opts = base_opts(Method::Put, Some("up"));
        opts.fail_fast = true;
        let req = BalancedRequest::new(opts);
        assert!(req.fail_fast);
    }

    #[test]
    fn check_retry_stops_when_tries_exhausted() {
        let mut opts = base_opts(Method::Get, Some("up"));
        opts.max_tries = 1;
        let mut req = BalancedRequest::new(opts);
        let (retry, failed) = req.check_retry(503, "", Duration::from_millis(10));
        assert!(!retry);
        assert!(failed);
    }
}
