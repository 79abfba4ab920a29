use std::{cell::RefCell, marker::PhantomData, rc::Rc, sync::Arc};

use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use cadence::StatsdClient;
use futures_util::future::{ok, LocalBoxFuture, Ready};
use sentry::protocol::Event;

use crate::ReportableError;

/// Wraps the actix-web service chain, reporting errors to Sentry (and, when an error isn't
/// Sentry-worthy, incrementing a statsd counter instead). Errors are recognized by downcasting
/// to `E`, the application's top-level error type.
#[derive(Clone)]
pub struct SentryWrapper<E> {
    metrics: Arc<StatsdClient>,
    phantom: PhantomData<E>,
}

impl<E> SentryWrapper<E> {
    pub fn new(metrics: Arc<StatsdClient>) -> Self {
        Self {
            metrics,
            phantom: PhantomData,
        }
    }
}

impl<S, B, E> Transform<S, ServiceRequest> for SentryWrapper<E>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    E: ReportableError + actix_web::ResponseError + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = SentryWrapperMiddleware<S, E>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(SentryWrapperMiddleware {
            service: Rc::new(RefCell::new(service)),
            metrics: self.metrics.clone(),
            phantom: PhantomData,
        })
    }
}

pub struct SentryWrapperMiddleware<S, E> {
    service: Rc<RefCell<S>>,
    metrics: Arc<StatsdClient>,
    phantom: PhantomData<E>,
}

impl<S, B, E> Service<ServiceRequest> for SentryWrapperMiddleware<S, E>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    E: ReportableError + actix_web::ResponseError + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_web::dev::forward_ready!(service);

    fn call(&self, sreq: ServiceRequest) -> Self::Future {
        let hub = sentry::Hub::new_from_top(sentry::Hub::main());
        let _guard = hub.push_scope();
        let sentry_request = sentry_request_from_http(&sreq);
        hub.configure_scope(|scope| {
            scope.add_event_processor(Box::new(move |event| process_event(event, &sentry_request)))
        });

        let metrics = self.metrics.clone();
        let fut = self.service.call(sreq);

        Box::pin(async move {
            let response: Self::Response = fut.await?;

            if let Some(error) = response.response().error() {
                if let Some(reportable_err) = error.as_error::<E>() {
                    if !reportable_err.is_sentry_event() {
                        maybe_emit_metric(&metrics, reportable_err);
                        return Ok(response);
                    }
                    let event = event_from_error(reportable_err);
                    let event_id = hub.capture_event(event);
                    trace!("event_id = {}", event_id);
                }
            }
            Ok(response)
        })
    }
}

fn maybe_emit_metric<E>(metrics: &StatsdClient, err: &E)
where
    E: ReportableError,
{
    let Some(label) = err.metric_label() else {
        return;
    };
    debug!("Sending error to metrics: {:?}", err);
    let mut builder = metrics.incr_with_tags(&label);
    for (key, val) in err.tags() {
        builder = builder.with_tag(key, &val);
    }
    let _ = builder.try_send();
}

fn sentry_request_from_http(request: &ServiceRequest) -> sentry::protocol::Request {
    sentry::protocol::Request {
        url: format!(
            "{}://{}{}",
            request.connection_info().scheme(),
            request.connection_info().host(),
            request.uri()
        )
        .parse()
        .ok(),
        method: Some(request.method().to_string()),
        headers: request
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
        ..Default::default()
    }
}

fn process_event(
    mut event: Event<'static>,
    request: &sentry::protocol::Request,
) -> Option<Event<'static>> {
    if event.request.is_none() {
        event.request = Some(request.clone());
    }
    Some(event)
}

/// Build a Sentry event from a `ReportableError`, walking `reportable_source()` to assemble the
/// exception chain (`std::error::Error::source` only downcasts to a concrete type, so we can't
/// walk a `dyn Error` chain the same way).
pub fn event_from_error(mut err: &dyn ReportableError) -> sentry::protocol::Event<'static> {
    let mut exceptions = vec![];
    let mut tags = std::collections::BTreeMap::new();
    let mut extra = std::collections::BTreeMap::new();

    loop {
        exceptions.push(exception_from_reportable_error(err));
        for (k, v) in err.tags() {
            tags.insert(k.to_owned(), v);
        }
        for (k, v) in err.extras() {
            extra.insert(k.to_owned(), serde_json::Value::from(v));
        }
        match err.reportable_source() {
            Some(next) => err = next,
            None => break,
        }
    }

    exceptions.reverse();
    sentry::protocol::Event {
        exception: exceptions.into(),
        level: sentry::protocol::Level::Error,
        tags,
        extra,
        ..Default::default()
    }
}

fn exception_from_reportable_error(err: &dyn ReportableError) -> sentry::protocol::Exception {
    let dbg = format!("{:?}", &err);
    sentry::protocol::Exception {
        ty: sentry::parse_type_from_debug(&dbg).to_owned(),
        value: Some(err.to_string()),
        stacktrace: err
            .backtrace()
            .map(sentry_backtrace::backtrace_to_stacktrace)
            .unwrap_or_default(),
        ..Default::default()
    }
}
