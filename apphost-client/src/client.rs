use std::sync::Arc;
use std::time::{Duration, Instant};

use apphost_upstream::UpstreamRegistry;
use bytes::Bytes;

use crate::balanced_request::{BalancedRequest, Body};
use crate::result::{ClientError, ParsedData, RawResponse, RequestResult};

/// How a response body should be parsed (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Always,
    OnSuccess,
    Never,
}

/// The process-wide outbound HTTP transport plus the upstream registry it balances against.
/// Grounded on frontik's `HttpClient`/`HttpClientFactory`, with `reqwest::Client` providing the
/// single connection pool per process (the same crate `syncserver` already depends on for its
/// own outbound calls).
pub struct HttpClientCore {
    http: reqwest::Client,
    /// A second client sharing the same connector but configured to never follow redirects, for
    /// requests with `follow_redirects = false` — `reqwest`'s redirect policy is fixed at client
    /// construction, not overridable per-request.
    http_no_redirect: reqwest::Client,
    upstreams: UpstreamRegistry,
}

impl HttpClientCore {
    pub fn new(http: reqwest::Client, http_no_redirect: reqwest::Client, upstreams: UpstreamRegistry) -> Self {
        Self {
            http,
            http_no_redirect,
            upstreams,
        }
    }

    pub fn upstreams(&self) -> &UpstreamRegistry {
        &self.upstreams
    }

    /// Run the fetch loop for a single Balanced Request: borrow, send, decide whether to retry,
    /// repeat until the call is settled (§4.D).
    pub async fn fetch(&self, mut request: BalancedRequest, parse_mode: ParseMode) -> RequestResult {
        loop {
            if let Some(upstream_name) = request.upstream.clone() {
                match self.upstreams.borrow(&upstream_name, &request.tried_indices).await {
                    Ok(Some((index, address))) => {
                        request.current_index = Some(index);
                        request.current_host = Some(address);
                    }
                    Ok(None) | Err(_) => {
                        return no_backend_result(&upstream_name);
                    }
                }
            }

            if !request.backend_available() {
                let name = request.upstream.clone().unwrap_or_default();
                return no_backend_result(&name);
            }

            let started = Instant::now();
            let send_result = self.send_once(&request).await;
            let elapsed = started.elapsed();

            let (status, error_text) = match &send_result {
                Ok(raw) => (raw.code, String::new()),
                Err(e) => (599, e.to_string()),
            };

            let (should_retry, backend_failed) = request.check_retry(status, &error_text, elapsed);

            if let (Some(name), Some(index)) = (request.upstream.clone(), request.current_index) {
                self.upstreams.return_server(&name, index, backend_failed).await;
            }

            if should_retry {
                continue;
            }

            return match send_result {
                Ok(raw) => parse_result(raw, parse_mode),
                Err(reason) => transport_error_result(request.current_host.clone(), reason),
            };
        }
    }

    async fn send_once(&self, request: &BalancedRequest) -> Result<RawResponse, String> {
        let host = request.current_host.as_deref().unwrap_or_default();
        let url = format!("{}{}", host, request.uri);

        let method = match request.method {
            crate::balanced_request::Method::Get => reqwest::Method::GET,
            crate::balanced_request::Method::Head => reqwest::Method::HEAD,
            crate::balanced_request::Method::Post => reqwest::Method::POST,
            crate::balanced_request::Method::Put => reqwest::Method::PUT,
            crate::balanced_request::Method::Delete => reqwest::Method::DELETE,
        };

        let client = if request.follow_redirects {
            &self.http
        } else {
            &self.http_no_redirect
        };
        let mut builder = client.request(method, &url).timeout(request.attempt_timeout());

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            Body::None => builder,
            Body::Bytes(b) => builder.body(b.clone()),
            Body::UrlEncoded(qs) => builder.body(crate::url::make_qs(qs)),
            Body::Multipart(bytes) => builder.body(bytes.clone()),
        };

        let started = Instant::now();
        let response = builder.send().await.map_err(describe_transport_error)?;

        let status = response.status().as_u16();
        let effective_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(describe_transport_error)?;

        Ok(RawResponse {
            code: status,
            effective_url,
            headers,
            body: Arc::new(body),
            request_time: started.elapsed(),
        })
    }
}

/// A connect-level failure is reported to `check_retry` as status 599 with a message containing
/// "Failed to connect", mirroring the source's own synthesized text for this case.
fn describe_transport_error(err: reqwest::Error) -> String {
    if err.is_connect() || err.is_timeout() {
        format!("HTTP 599: Failed to connect ({err})")
    } else {
        err.to_string()
    }
}

fn no_backend_result(upstream: &str) -> RequestResult {
    RequestResult::new(
        RawResponse {
            code: 502,
            effective_url: upstream.to_owned(),
            headers: vec![],
            body: Arc::new(Bytes::new()),
            request_time: Duration::ZERO,
        },
        None,
        Some(ClientError::NoBackendAvailable {
            upstream: upstream.to_owned(),
        }),
    )
}

fn transport_error_result(host: Option<String>, reason: String) -> RequestResult {
    RequestResult::new(
        RawResponse {
            code: 599,
            effective_url: host.unwrap_or_default(),
            headers: vec![],
            body: Arc::new(Bytes::new()),
            request_time: Duration::ZERO,
        },
        None,
        Some(ClientError::Transport { reason }),
    )
}

fn parse_result(raw: RawResponse, parse_mode: ParseMode) -> RequestResult {
    let is_error = raw.is_error();

    if is_error && parse_mode != ParseMode::Always {
        let reason = String::from_utf8_lossy(&raw.body).into_owned();
        return RequestResult::new(
            raw.clone(),
            None,
            Some(ClientError::BackendError {
                code: raw.code,
                reason,
            }),
        );
    }

    if parse_mode == ParseMode::Never || raw.code == 204 {
        return RequestResult::new(raw, None, None);
    }

    let content_type = raw.header("Content-Type").unwrap_or_default().to_ascii_lowercase();

    let (data, exception) = if content_type.contains("xml") {
        match parse_xml(&raw.body) {
            Ok(text) => (Some(ParsedData::Xml(text)), None),
            Err(reason) => (
                None,
                Some(ClientError::Parse {
                    response_type: "XML",
                    reason,
                }),
            ),
        }
    } else if content_type.contains("json") {
        match serde_json::from_slice::<serde_json::Value>(&raw.body) {
            Ok(v) => (Some(ParsedData::Json(v)), None),
            Err(e) => (
                None,
                Some(ClientError::Parse {
                    response_type: "JSON",
                    reason: e.to_string(),
                }),
            ),
        }
    } else if content_type.contains("text/plain") {
        (
            Some(ParsedData::Text(String::from_utf8_lossy(&raw.body).into_owned())),
            None,
        )
    } else {
        (Some(ParsedData::Bytes((*raw.body).clone())), None)
    };

    RequestResult::new(raw, data, exception)
}

fn parse_xml(body: &[u8]) -> Result<String, String> {
    let text = std::str::from_utf8(body).map_err(|e| e.to_string())?;
    roxmltree::Document::parse(text).map_err(|e| e.to_string())?;
    Ok(text.to_owned())
}
