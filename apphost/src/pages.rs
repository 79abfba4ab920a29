//! Built-in `Page` implementations registered by default, demonstrating the admission path wired
//! in `apphost::server` end to end (limiter → debug check → `pipeline::execute` → renderer).
use std::sync::Arc;
use std::time::Duration;

use apphost_client::{BalancedRequest, BalancedRequestOptions, HttpClientCore, Method, ParseMode};
use async_trait::async_trait;

use crate::pipeline::{fetch_checked, HttpMethod, Page, PipelineError, PipelineState};

/// Mirrors spec §8 seed test 3: `PUT .../demo/fail-fast/` makes a `fail_fast=true` outbound call
/// against the named upstream; any error response (including "no backend configured") escalates
/// through `fetch_checked` to `PipelineError::FailFast`, which this page's `page_fail_fast`
/// override turns into a 403 with a `{"fail_fast": true}` body instead of the default passthrough.
pub struct FailFastDemoPage {
    client: Arc<HttpClientCore>,
    upstream: String,
}

impl FailFastDemoPage {
    pub fn new(client: Arc<HttpClientCore>, upstream: impl Into<String>) -> Self {
        Self {
            client,
            upstream: upstream.into(),
        }
    }
}

#[async_trait(?Send)]
impl Page for FailFastDemoPage {
    fn overridden_methods(&self) -> &'static [HttpMethod] {
        &[HttpMethod::Put]
    }

    async fn put_page(&mut self, _state: &mut PipelineState) -> Result<(), PipelineError> {
        let request = BalancedRequest::new(BalancedRequestOptions {
            host: "http://unused",
            upstream: Some(&self.upstream),
            uri: "/",
            method: Method::Put,
            query: vec![],
            fields: vec![],
            files: vec![],
            headers: vec![],
            content_type: None,
            connect_timeout: None,
            request_timeout: None,
            follow_redirects: true,
            idempotent_override: None,
            fail_fast: true,
            max_tries: 1,
            timeout_multiplier: 1.0,
            default_connect_timeout: Duration::from_millis(200),
            default_request_timeout: Duration::from_secs(2),
        });
        fetch_checked(&self.client, request, ParseMode::Never).await?;
        Ok(())
    }

    async fn page_fail_fast(
        &mut self,
        _method: HttpMethod,
        state: &mut PipelineState,
        _failed: &apphost_client::RequestResult,
    ) -> Option<Result<(), PipelineError>> {
        state.status = 403;
        state.set_json(serde_json::json!({"fail_fast": true}));
        Some(Ok(()))
    }
}
