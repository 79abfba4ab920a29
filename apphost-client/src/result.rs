use std::sync::Arc;

/// Parsed response body, dispatched by `Content-Type` (§4.D).
#[derive(Debug, Clone)]
pub enum ParsedData {
    Json(serde_json::Value),
    Xml(String),
    Text(String),
    Bytes(bytes::Bytes),
}

/// A response outcome that the client failed to turn into usable data: either the transport
/// itself errored (connect failure, timeout), the backend returned an error status the caller
/// didn't ask to see parsed, or the body couldn't be parsed as the `Content-Type` promised
/// (frontik `FailedRequestException`/`ParseError`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("{reason}")]
    Transport { reason: String },
    #[error("backend returned {code}: {reason}")]
    BackendError { code: u16, reason: String },
    #[error("failed to parse {response_type} response: {reason}")]
    Parse {
        response_type: &'static str,
        reason: String,
    },
    #[error("no backend available for {upstream}")]
    NoBackendAvailable { upstream: String },
}

/// A minimal record of the HTTP response that produced a `RequestResult`, independent of the
/// transport's own response type so the result can outlive the connection.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub code: u16,
    pub effective_url: String,
    pub headers: Vec<(String, String)>,
    pub body: Arc<bytes::Bytes>,
    pub request_time: std::time::Duration,
}

impl RawResponse {
    pub fn is_error(&self) -> bool {
        self.code >= 400 || self.code == 599
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Shape `{data, raw_response, exception}` from §4.E. Immutable after construction; `failed()`
/// reflects `exception.is_some() || raw_response.code >= 400`.
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub data: Option<ParsedData>,
    pub raw_response: RawResponse,
    pub exception: Option<ClientError>,
}

impl RequestResult {
    pub fn new(raw_response: RawResponse, data: Option<ParsedData>, exception: Option<ClientError>) -> Self {
        Self {
            data,
            raw_response,
            exception,
        }
    }

    pub fn failed(&self) -> bool {
        self.exception.is_some() || self.raw_response.code >= 400
    }
}

/// Codes that `check_retry` treats as a retryable backend failure (§4.C): 503 (overloaded) and
/// 599 (the transport-level "connect failed" sentinel this client assigns itself, following the
/// source's own use of 599 for that case since there's no real HTTP status in that slot).
pub fn is_retryable_status(code: u16) -> bool {
    code == 503 || code == 599
}
