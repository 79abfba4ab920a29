//! Ambient stack shared by every other crate in the workspace: error-reporting traits, statsd
//! metrics, the Sentry middleware, and a blocking-threadpool helper.
#[macro_use]
extern crate slog_scope;

mod metrics;
pub mod middleware;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use actix_web::web;

pub use metrics::{metrics_from_opts, MetricError, Metrics};

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl fmt::Display for $error {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}

/// Implemented by every top-level error type that wants Sentry reporting and statsd error
/// metrics wired up for it by [`middleware::sentry::SentryWrapper`].
pub trait ReportableError: fmt::Debug + fmt::Display {
    fn error_backtrace(&self) -> String;
    fn is_sentry_event(&self) -> bool;
    fn metric_label(&self) -> Option<String>;
    fn tags(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
    fn extras(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
    fn reportable_source(&self) -> Option<&dyn ReportableError> {
        None
    }
    fn backtrace(&self) -> Option<&backtrace::Backtrace> {
        None
    }
}

/// Types that implement this trait can represent internal (bug-shaped, not client-caused) errors.
pub trait InternalError {
    fn internal_error(message: String) -> Self;
}

/// A threadpool on which callers can spawn non-CPU-bound tasks that block their thread (mostly
/// useful for running I/O or CPU-bound render work). Intentionally does not implement `Clone`:
/// a `BlockingThreadpool` should be instantiated once and shared via `Arc`.
#[derive(Debug, Default)]
pub struct BlockingThreadpool {
    spawned_tasks: AtomicU64,
}

impl BlockingThreadpool {
    pub async fn spawn<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Debug + Send + InternalError + 'static,
    {
        self.spawned_tasks.fetch_add(1, Ordering::Relaxed);

        let result = web::block(f).await.unwrap_or_else(|_| {
            Err(E::internal_error(
                "Blocking threadpool operation canceled".to_owned(),
            ))
        });

        self.spawned_tasks.fetch_sub(1, Ordering::Relaxed);

        result
    }

    pub fn active_tasks(&self) -> u64 {
        self.spawned_tasks.load(Ordering::Relaxed)
    }
}
