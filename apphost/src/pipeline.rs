//! Handler Pipeline (§4.F), grounded on `frontik/handler.py`'s `PageHandler._execute_page` state
//! machine: `admitted → preprocessors → page → draining → postprocessors → rendering →
//! render_postprocessors → finished`, with a cancellation edge from every state.
//!
//! Pipeline futures are driven on the actix-web worker's local executor (`actix_web::rt::spawn`),
//! not `tokio::spawn`, so they are intentionally `!Send` — one inbound request never crosses
//! worker threads, unlike the upstream registry (see the generation-counter note in
//! `apphost-upstream::registry`), which genuinely is shared across workers.
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;
use futures_util::future::{join_all, LocalBoxFuture};
use serde_json::Value;

use apphost_client::{BalancedRequest, HttpClientCore, ParseMode, RequestResult};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::limiter::ActiveHandlerToken;
use crate::renderer::{RenderData, RenderedBody, RendererRegistry};

/// HTTP methods the pipeline dispatches a page method for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// HEAD maps to GET (§4.F).
    fn dispatch(self) -> DispatchMethod {
        match self {
            HttpMethod::Head | HttpMethod::Get => DispatchMethod::Get,
            HttpMethod::Post => DispatchMethod::Post,
            HttpMethod::Put => DispatchMethod::Put,
            HttpMethod::Delete => DispatchMethod::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// Error taxonomy (§7). `Signal` carries the three structured pipeline-control kinds from §4.F;
/// anything else propagates to the error path.
#[derive(Debug)]
pub enum PipelineError {
    Signal(PipelineSignal),
    /// An outbound call made with `fail_fast=true` whose final response was an error (§4.D, §4.F).
    FailFast(Box<RequestResult>),
    /// No page method overrides this HTTP method; carries the `Allow` header value.
    MethodNotAllowed(Vec<&'static str>),
    Other(ApiError),
}

#[derive(Debug)]
pub enum PipelineSignal {
    AbortPage,
    FinishWithPostprocessors,
    HttpErrorWithPostprocessors(u16),
}

impl From<ApiError> for PipelineError {
    fn from(e: ApiError) -> Self {
        PipelineError::Other(e)
    }
}

pub type BoxedOperation = LocalBoxFuture<'static, Result<(), PipelineError>>;

/// A mutable, shareable bag of not-yet-awaited futures (§4.F "drain phase"), modeled per the §9
/// redesign note as a snapshot-await-repeat drain loop rather than mutating a set while iterating
/// it.
#[derive(Clone, Default)]
struct OperationQueue(Rc<RefCell<Vec<BoxedOperation>>>);

impl OperationQueue {
    fn push(&self, fut: BoxedOperation) {
        self.0.borrow_mut().push(fut);
    }

    fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    fn take(&self) -> Vec<BoxedOperation> {
        self.0.borrow_mut().drain(..).collect()
    }
}

async fn drain(queue: &OperationQueue) -> Result<(), PipelineError> {
    loop {
        if queue.is_empty() {
            return Ok(());
        }
        for result in join_all(queue.take()).await {
            result?;
        }
    }
}

/// Mutable state threaded through one pipeline run: render inputs, finish/cancel flags, the
/// pending-operation queues, and the active-handler release token (dropped — and so released —
/// when the `PipelineState` itself is dropped, covering every termination path).
pub struct PipelineState {
    pub context: RequestContext,
    pub status: u16,
    pub render_data: RenderData,
    pending_operations: OperationQueue,
    pending_preprocessor_operations: OperationQueue,
    pending_operations_locked: Rc<Cell<bool>>,
    finished: Rc<Cell<bool>>,
    aborted: bool,
    exception_hooks: Vec<Rc<dyn Fn(&PipelineError)>>,
    _active_handler_token: Option<ActiveHandlerToken>,
}

impl PipelineState {
    pub fn new(context: RequestContext, active_handler_token: Option<ActiveHandlerToken>) -> Self {
        Self {
            context,
            status: 200,
            render_data: RenderData::default(),
            pending_operations: OperationQueue::default(),
            pending_preprocessor_operations: OperationQueue::default(),
            pending_operations_locked: Rc::new(Cell::new(false)),
            finished: Rc::new(Cell::new(false)),
            aborted: false,
            exception_hooks: Vec::new(),
            _active_handler_token: active_handler_token,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// Handler-level `finish()`: stop running further page/preprocessor work. Does not itself
    /// short-circuit to postprocessors — callers return `Err(PipelineSignal::...)` for that.
    pub fn finish(&mut self, status: Option<u16>, text: Option<String>) {
        self.finished.set(true);
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(text) = text {
            self.render_data.text = Some(text);
        }
    }

    pub fn set_json(&mut self, value: Value) {
        self.render_data.json = Some(value);
    }

    pub fn set_template(&mut self, name: impl Into<String>) {
        self.render_data.template = Some(name.into());
    }

    pub fn register_exception_hook(&mut self, hook: Rc<dyn Fn(&PipelineError)>) {
        self.exception_hooks.push(hook);
    }

    /// §4.J `add_preprocessor_future`: queue a future a preprocessor started, drained after the
    /// sequential preprocessor chain completes.
    pub fn add_preprocessor_future(&self, fut: BoxedOperation) {
        self.pending_preprocessor_operations.push(fut);
    }

    /// §4.J `wait_future` / §4.F "outbound calls from the handler": a waited call is tracked in
    /// `pending_operations` unless the set has already been locked (drain phase completed) or the
    /// handler already finished, in which case it resolves as an immediate `AbortPage` instead of
    /// actually running to completion inside the pipeline's accounting.
    pub fn wait_future(&self, fut: BoxedOperation) {
        if self.finished.get() || self.pending_operations_locked.get() {
            self.pending_operations.push(Box::pin(async { Err(PipelineError::Signal(PipelineSignal::AbortPage)) }));
            return;
        }
        self.pending_operations.push(fut);
    }

    fn lock_pending_operations(&self) {
        self.pending_operations_locked.set(true);
    }
}

/// Run a single outbound call and, if the caller built it with `fail_fast = true` and the final
/// response is an error, escalate to `PipelineError::FailFast` instead of resolving as an ordinary
/// `RequestResult` (§4.D "Fail-fast", §4.F "Fail-fast handling"; frontik's `fail_fast` kwarg, which
/// raises `FailedRequestException` directly into the handler rather than returning it). Page
/// methods should call this instead of `HttpClientCore::fetch` directly for any request that may
/// carry `fail_fast`.
pub async fn fetch_checked(
    client: &HttpClientCore,
    request: BalancedRequest,
    parse_mode: ParseMode,
) -> Result<RequestResult, PipelineError> {
    let fail_fast = request.fail_fast;
    let result = client.fetch(request, parse_mode).await;
    if fail_fast && result.failed() {
        Err(PipelineError::FailFast(Box::new(result)))
    } else {
        Ok(result)
    }
}

#[async_trait(?Send)]
pub trait Preprocessor {
    async fn run(&self, state: &mut PipelineState) -> Result<(), PipelineError>;
}

#[async_trait(?Send)]
pub trait Postprocessor {
    async fn run(&self, state: &mut PipelineState) -> Result<(), PipelineError>;
}

#[async_trait(?Send)]
pub trait RenderPostprocessor {
    async fn run(&self, state: &mut PipelineState, body: RenderedBody) -> Result<RenderedBody, PipelineError>;
}

/// A concrete handler implements this once per route. Per the §9 redesign note ("Dynamic dispatch
/// by HTTP method... re-architect as an explicit table... populated from an interface the
/// concrete handler type implements"), method dispatch is ordinary trait-method resolution
/// instead of a runtime `{method}_page` attribute lookup.
#[async_trait(?Send)]
pub trait Page {
    fn preprocessors(&self) -> Vec<Rc<dyn Preprocessor>> {
        Vec::new()
    }

    fn postprocessors(&self) -> Vec<Rc<dyn Postprocessor>> {
        Vec::new()
    }

    fn render_postprocessors(&self) -> Vec<Rc<dyn RenderPostprocessor>> {
        Vec::new()
    }

    fn registered_renderers(&self) -> RendererRegistry {
        RendererRegistry::with_defaults()
    }

    /// HTTP methods this page overrides, for the `Allow` header on an unhandled method.
    fn overridden_methods(&self) -> &'static [HttpMethod] {
        &[]
    }

    async fn get_page(&mut self, _state: &mut PipelineState) -> Result<(), PipelineError> {
        Err(method_not_allowed(self.overridden_methods()))
    }

    async fn post_page(&mut self, _state: &mut PipelineState) -> Result<(), PipelineError> {
        Err(method_not_allowed(self.overridden_methods()))
    }

    async fn put_page(&mut self, _state: &mut PipelineState) -> Result<(), PipelineError> {
        Err(method_not_allowed(self.overridden_methods()))
    }

    async fn delete_page(&mut self, _state: &mut PipelineState) -> Result<(), PipelineError> {
        Err(method_not_allowed(self.overridden_methods()))
    }

    /// `{method}_page_fail_fast` lookup, collapsed to a single match since Rust has no runtime
    /// method-name dispatch to preserve in the first place (§4.F "Fail-fast handling").
    async fn page_fail_fast(
        &mut self,
        _method: HttpMethod,
        _state: &mut PipelineState,
        _failed: &RequestResult,
    ) -> Option<Result<(), PipelineError>> {
        None
    }
}

fn method_not_allowed(overridden: &'static [HttpMethod]) -> PipelineError {
    PipelineError::MethodNotAllowed(overridden.iter().map(|m| m.as_str()).collect())
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl PipelineOutcome {
    fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn from_rendered(status: u16, rendered: RenderedBody) -> Self {
        Self {
            status,
            headers: rendered
                .content_type
                .map(|ct| vec![("Content-Type".to_owned(), ct)])
                .unwrap_or_default(),
            body: rendered.body,
        }
    }
}

/// Run the full state machine for one admitted request. The only externally visible states are
/// `admitted` (the caller holds a `PipelineState`) and the return of `PipelineOutcome`
/// (`finished`); `cancelled` is handled by the caller dropping this future, which drops
/// `PipelineState` along with it and releases the active-handler token.
pub async fn execute(page: &mut dyn Page, method: HttpMethod, mut state: PipelineState) -> PipelineOutcome {
    match run_stages(page, method, &mut state).await {
        Ok(outcome) => outcome,
        Err(PipelineError::FailFast(failed)) => match page.page_fail_fast(method, &mut state, &failed).await {
            Some(Ok(())) => PipelineOutcome::empty(state.status),
            Some(Err(e)) => send_error(&mut state, e),
            None => fail_fast_passthrough(&failed),
        },
        Err(other) => send_error(&mut state, other),
    }
}

async fn run_stages(page: &mut dyn Page, method: HttpMethod, state: &mut PipelineState) -> Result<PipelineOutcome, PipelineError> {
    for preprocessor in page.preprocessors() {
        if state.is_finished() {
            break;
        }
        if let Err(e) = preprocessor.run(state).await {
            apply_signal(state, e)?;
            break;
        }
    }

    if !state.aborted {
        drain(&state.pending_preprocessor_operations).await?;
    }

    if !state.is_finished() && !state.aborted {
        let result = match method.dispatch() {
            DispatchMethod::Get => page.get_page(state).await,
            DispatchMethod::Post => page.post_page(state).await,
            DispatchMethod::Put => page.put_page(state).await,
            DispatchMethod::Delete => page.delete_page(state).await,
        };
        match result {
            Ok(()) => {}
            Err(PipelineError::MethodNotAllowed(allowed)) => {
                return Ok(PipelineOutcome {
                    status: 405,
                    headers: vec![("Allow".to_owned(), allowed.join(", "))],
                    body: Vec::new(),
                });
            }
            Err(e) => {
                apply_signal(state, e)?;
            }
        }
    }

    if state.aborted {
        return Ok(PipelineOutcome::empty(state.status));
    }

    drain(&state.pending_operations).await?;
    state.lock_pending_operations();

    for postprocessor in page.postprocessors() {
        if state.is_finished() {
            break;
        }
        if let Err(e) = postprocessor.run(state).await {
            apply_signal(state, e)?;
            break;
        }
    }

    if state.aborted {
        return Ok(PipelineOutcome::empty(state.status));
    }

    let registry = page.registered_renderers();
    let mut rendered = registry
        .select(&state.render_data)
        .map(|r| r.render(&state.render_data))
        .unwrap_or(RenderedBody {
            content_type: None,
            body: Vec::new(),
        });

    for render_postprocessor in page.render_postprocessors() {
        if state.is_finished() {
            break;
        }
        rendered = render_postprocessor.run(state, rendered).await?;
    }

    Ok(PipelineOutcome::from_rendered(state.status, rendered))
}

/// Fold a `PipelineSignal` into `state`, or propagate anything else via `?` at the call site.
fn apply_signal(state: &mut PipelineState, err: PipelineError) -> Result<(), PipelineError> {
    match err {
        PipelineError::Signal(PipelineSignal::AbortPage) => {
            state.finished.set(true);
            state.aborted = true;
            Ok(())
        }
        PipelineError::Signal(PipelineSignal::FinishWithPostprocessors) => {
            state.finished.set(true);
            Ok(())
        }
        PipelineError::Signal(PipelineSignal::HttpErrorWithPostprocessors(code)) => {
            state.status = code;
            state.finished.set(true);
            Ok(())
        }
        other => Err(other),
    }
}

fn fail_fast_passthrough(failed: &RequestResult) -> PipelineOutcome {
    let code = failed.raw_response.code;
    let status = if (300..500).contains(&code) { code } else { 502 };
    PipelineOutcome::empty(status)
}

/// §7 error path: set status, run `exception_hooks`, write a minimal JSON error body.
fn send_error(state: &mut PipelineState, err: PipelineError) -> PipelineOutcome {
    let status = match &err {
        PipelineError::Other(api_err) => api_err.status().as_u16(),
        PipelineError::MethodNotAllowed(_) => 405,
        PipelineError::FailFast(_) => 502,
        PipelineError::Signal(_) => state.status,
    };

    for hook in &state.exception_hooks {
        hook(&err);
    }

    let reason = match &err {
        PipelineError::Other(api_err) => api_err.to_string(),
        PipelineError::MethodNotAllowed(allowed) => format!("method not allowed, allowed: {}", allowed.join(", ")),
        PipelineError::FailFast(_) => "fail-fast".to_owned(),
        PipelineError::Signal(_) => "unhandled pipeline signal".to_owned(),
    };

    PipelineOutcome {
        status,
        headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
        body: serde_json::json!({ "status": status, "error": reason }).to_string().into_bytes(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::{RequestContext, RequestSummary};

    fn test_context() -> RequestContext {
        RequestContext::new(
            "req-test".to_owned(),
            "test_page",
            RequestSummary {
                method: "GET".to_owned(),
                path: "/test".to_owned(),
            },
        )
    }

    struct PlainPage;

    #[async_trait(?Send)]
    impl Page for PlainPage {
        fn overridden_methods(&self) -> &'static [HttpMethod] {
            &[HttpMethod::Get]
        }

        async fn get_page(&mut self, state: &mut PipelineState) -> Result<(), PipelineError> {
            state.set_json(serde_json::json!({"ok": true}));
            Ok(())
        }
    }

    #[tokio::test]
    async fn renders_json_from_page_method() {
        let mut page = PlainPage;
        let state = PipelineState::new(test_context(), None);
        let outcome = execute(&mut page, HttpMethod::Get, state).await;
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, br#"{"ok":true}"#);
    }

    struct NotOverriddenPage;

    #[async_trait(?Send)]
    impl Page for NotOverriddenPage {
        fn overridden_methods(&self) -> &'static [HttpMethod] {
            &[HttpMethod::Post]
        }
    }

    #[tokio::test]
    async fn unoverridden_method_is_405_with_allow_header() {
        let mut page = NotOverriddenPage;
        let state = PipelineState::new(test_context(), None);
        let outcome = execute(&mut page, HttpMethod::Get, state).await;
        assert_eq!(outcome.status, 405);
        assert_eq!(outcome.headers, vec![("Allow".to_owned(), "POST".to_owned())]);
    }

    struct FinishInPreprocessorPage;

    struct FinishingPreprocessor;

    #[async_trait(?Send)]
    impl Preprocessor for FinishingPreprocessor {
        async fn run(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
            state.finish(Some(400), Some("DONE_IN_PP".to_owned()));
            Ok(())
        }
    }

    #[async_trait(?Send)]
    impl Page for FinishInPreprocessorPage {
        fn preprocessors(&self) -> Vec<Rc<dyn Preprocessor>> {
            vec![Rc::new(FinishingPreprocessor)]
        }

        async fn get_page(&mut self, _state: &mut PipelineState) -> Result<(), PipelineError> {
            panic!("page method must not run once the preprocessor has finished the handler");
        }
    }

    /// Seed test 4: a preprocessor finishes the handler; the page method never runs and no
    /// postprocessor runs since none was registered before `finish()`.
    #[tokio::test]
    async fn preprocessor_finish_skips_page_method() {
        let mut page = FinishInPreprocessorPage;
        let state = PipelineState::new(test_context(), None);
        let outcome = execute(&mut page, HttpMethod::Get, state).await;
        assert_eq!(outcome.status, 400);
        assert_eq!(outcome.body, b"DONE_IN_PP");
    }

    struct AbortingPage;

    struct AbortingPreprocessor;

    #[async_trait(?Send)]
    impl Preprocessor for AbortingPreprocessor {
        async fn run(&self, _state: &mut PipelineState) -> Result<(), PipelineError> {
            Err(PipelineError::Signal(PipelineSignal::AbortPage))
        }
    }

    #[async_trait(?Send)]
    impl Page for AbortingPage {
        fn preprocessors(&self) -> Vec<Rc<dyn Preprocessor>> {
            vec![Rc::new(AbortingPreprocessor)]
        }
    }

    #[tokio::test]
    async fn abort_page_yields_empty_body_no_error_hooks() {
        let mut page = AbortingPage;
        let mut state = PipelineState::new(test_context(), None);
        state.register_exception_hook(Rc::new(|_err: &PipelineError| {
            panic!("AbortPage must not invoke exception hooks");
        }));
        let outcome = execute(&mut page, HttpMethod::Get, state).await;
        assert!(outcome.body.is_empty());
    }

    fn fail_fast_request() -> BalancedRequest {
        BalancedRequest::new(apphost_client::BalancedRequestOptions {
            host: "http://example.invalid",
            upstream: Some("missing-upstream"),
            uri: "/",
            method: apphost_client::Method::Put,
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
            default_connect_timeout: std::time::Duration::from_millis(50),
            default_request_timeout: std::time::Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn fetch_checked_escalates_fail_fast_on_error_response() {
        let settings = apphost_settings::Settings::default();
        let client = apphost_client::build_http_client_core(&settings).await.unwrap();
        let err = fetch_checked(&client, fail_fast_request(), ParseMode::Never)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FailFast(_)));
    }

    struct FailFastPage {
        client: apphost_client::HttpClientCore,
    }

    #[async_trait(?Send)]
    impl Page for FailFastPage {
        fn overridden_methods(&self) -> &'static [HttpMethod] {
            &[HttpMethod::Put]
        }

        async fn put_page(&mut self, _state: &mut PipelineState) -> Result<(), PipelineError> {
            fetch_checked(&self.client, fail_fast_request(), ParseMode::Never).await?;
            Ok(())
        }

        async fn page_fail_fast(
            &mut self,
            _method: HttpMethod,
            state: &mut PipelineState,
            _failed: &RequestResult,
        ) -> Option<Result<(), PipelineError>> {
            state.status = 403;
            state.set_json(serde_json::json!({"fail_fast": true}));
            Some(Ok(()))
        }
    }

    /// Seed test 3: a PUT with `fail_fast=true` against a backend that errors out invokes
    /// `{method}_page_fail_fast`, which here sets 403 and finishes.
    #[tokio::test]
    async fn fail_fast_outbound_error_invokes_page_fail_fast() {
        let settings = apphost_settings::Settings::default();
        let client = apphost_client::build_http_client_core(&settings).await.unwrap();
        let mut page = FailFastPage { client };
        let state = PipelineState::new(test_context(), None);
        let outcome = execute(&mut page, HttpMethod::Put, state).await;
        assert_eq!(outcome.status, 403);
        assert_eq!(outcome.body, br#"{"fail_fast":true}"#);
    }
}
