//! The outbound HTTP client: balanced requests against named upstreams, a single
//! connection-pooled transport, and the multipart/URL builders they share — grounded on
//! frontik's `http_client` and `util` modules, re-expressed around `reqwest`.
#[macro_use]
extern crate slog_scope;

mod balanced_request;
mod client;
mod multipart;
mod result;
mod url;

pub use balanced_request::{BalancedRequest, BalancedRequestOptions, Body, Method};
pub use client::{HttpClientCore, ParseMode};
pub use multipart::{make_mfd, parse_mfd, FieldValue, FilePart};
pub use result::{ClientError, ParsedData, RawResponse, RequestResult};
pub use url::{make_qs, make_url, QueryParams, QueryValue};

use std::time::Duration;

use apphost_settings::Settings;
use apphost_upstream::UpstreamRegistry;

/// Build the shared transport plus upstream registry for a process, from settings (§5 "HTTP
/// transport connection pool: single instance per process, bounded by `max_http_clients` and
/// `max_http_clients_connects`").
pub async fn build_http_client_core(settings: &Settings) -> Result<HttpClientCore, reqwest::Error> {
    let upstreams = UpstreamRegistry::from_settings(
        &settings.upstreams,
        settings.http_client_default_max_tries,
        settings.http_client_default_max_fails,
        Duration::from_secs_f64(settings.http_client_default_fail_timeout_sec),
    )
    .await;

    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(settings.max_http_clients as usize)
        .connect_timeout(Duration::from_secs_f64(
            settings.http_client_default_connect_timeout_sec * settings.timeout_multiplier,
        ));

    if let Some(proxy_host) = &settings.http_proxy_host {
        let proxy_url = format!("http://{}:{}", proxy_host, settings.http_proxy_port);
        if let Ok(proxy) = reqwest::Proxy::all(&proxy_url) {
            builder = builder.proxy(proxy);
        } else {
            warn!("invalid http_proxy_host/http_proxy_port, ignoring proxy config");
        }
    }

    let http = builder.clone().build()?;
    let http_no_redirect = builder.redirect(reqwest::redirect::Policy::none()).build()?;

    Ok(HttpClientCore::new(http, http_no_redirect, upstreams))
}
