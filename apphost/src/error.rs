//! Top-level error type: the boundary where pipeline/client/upstream errors become an HTTP
//! response, a Sentry event, and/or a statsd counter. Grounded on `syncserver::error::ApiError`.
use std::fmt;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use apphost_common::{impl_fmt_display, InternalError, ReportableError};
use backtrace::Backtrace;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// The set of response status codes this server ever sends on purpose. Anything else (a
/// misbehaving upstream's exotic code, for instance) is normalized to 503 before reaching the
/// client (§7 "Status-code normalization").
const STANDARD_STATUS_CODES: &[u16] = &[
    200, 201, 202, 204, 301, 302, 303, 304, 307, 308, 400, 401, 403, 404, 405, 409, 410, 412, 413,
    415, 429, 500, 502, 503, 504,
];

pub fn normalize_status(code: u16) -> StatusCode {
    if STANDARD_STATUS_CODES.contains(&code) {
        StatusCode::from_u16(code).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Debug)]
pub struct ApiError {
    kind: ApiErrorKind,
    backtrace: Box<Backtrace>,
    status: StatusCode,
}

#[derive(Error, Debug)]
pub enum ApiErrorKind {
    #[error("active handler limit exceeded")]
    ActiveHandlerLimitExceeded,

    #[error("no backend available for upstream {0:?}")]
    NoBackendAvailable(String),

    #[error("upstream error: {0}")]
    Upstream(#[from] apphost_upstream::UpstreamError),

    #[error("outbound request failed: {0}")]
    Client(#[from] apphost_client::ClientError),

    #[error("fail-fast: {status}")]
    FailFast { status: StatusCode },

    #[error("debug mode requires authentication")]
    DebugUnauthorized,

    #[error("{0}")]
    Internal(String),
}

impl ApiErrorKind {
    fn default_status(&self) -> StatusCode {
        match self {
            ApiErrorKind::ActiveHandlerLimitExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorKind::NoBackendAvailable(_) => StatusCode::BAD_GATEWAY,
            ApiErrorKind::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::Client(_) => StatusCode::BAD_GATEWAY,
            ApiErrorKind::FailFast { status } => *status,
            ApiErrorKind::DebugUnauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn metric_label(&self) -> Option<String> {
        match self {
            ApiErrorKind::ActiveHandlerLimitExceeded => Some("request.error.overloaded".to_owned()),
            ApiErrorKind::NoBackendAvailable(_) => Some("request.error.no_backend".to_owned()),
            ApiErrorKind::Client(_) => Some("request.error.upstream".to_owned()),
            _ => None,
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn with_status(kind: ApiErrorKind, status: StatusCode) -> Self {
        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
            status,
        }
    }

    pub fn fail_fast(status: StatusCode) -> Self {
        Self::with_status(ApiErrorKind::FailFast { status }, status)
    }
}

impl From<ApiErrorKind> for ApiError {
    fn from(kind: ApiErrorKind) -> Self {
        let status = kind.default_status();
        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
            status,
        }
    }
}

impl InternalError for ApiError {
    fn internal_error(message: String) -> Self {
        ApiErrorKind::Internal(message).into()
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl_fmt_display!(ApiError, ApiErrorKind);

#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    reason: &'static str,
    error: String,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        normalize_status(self.status.as_u16())
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(ErrorBody {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or(""),
            error: self.kind.to_string(),
        })
    }
}

impl ReportableError for ApiError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        self.status.is_server_error() && self.kind.metric_label().is_none()
    }

    fn metric_label(&self) -> Option<String> {
        self.kind.metric_label()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        Some(&self.backtrace)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalizes_nonstandard_status_to_503() {
        assert_eq!(normalize_status(599), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(normalize_status(999), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn preserves_standard_status() {
        assert_eq!(normalize_status(404), StatusCode::NOT_FOUND);
    }

    #[test]
    fn active_handler_limit_is_503() {
        let err: ApiError = ApiErrorKind::ActiveHandlerLimitExceeded.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
