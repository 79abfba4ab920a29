//! Slow-task reporting (§5 "A task that exceeds a configurable 'slow task' threshold is reported
//! to the slow-task logger; exceeding a 'critical' threshold additionally raises an error-report
//! event"), grounded on frontik's `_log_request`/`AsyncGroup` timing warnings and re-expressed as
//! a future wrapper rather than the original's `IOLoop` timer callback.
use std::future::Future;
use std::time::{Duration, Instant};

use crate::integration::AppHooks;

/// Run `fut` to completion, logging a warning through `logger` if it runs past `threshold`, and
/// notifying the configured error reporter (§4.J `get_error_reporter`) if it runs past
/// `critical_threshold`.
pub async fn track<F, T>(
    label: &str,
    logger: &slog::Logger,
    hooks: &AppHooks,
    threshold: Duration,
    critical_threshold: Duration,
    fut: F,
) -> T
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let result = fut.await;
    let elapsed = started.elapsed();

    if elapsed >= critical_threshold {
        slog::warn!(logger, "critically slow task"; "label" => label, "elapsed_ms" => elapsed.as_millis() as u64);
        if let Some(reporter) = hooks.get_error_reporter() {
            reporter.report(&format!("task '{}' exceeded critical threshold ({:?})", label, elapsed));
        }
    } else if elapsed >= threshold {
        slog::warn!(logger, "slow task"; "label" => label, "elapsed_ms" => elapsed.as_millis() as u64);
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::integration::ErrorReporter;

    struct RecordingReporter(Arc<Mutex<Vec<String>>>);

    impl ErrorReporter for RecordingReporter {
        fn report(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_owned());
        }
    }

    #[tokio::test]
    async fn fast_task_reports_nothing() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let hooks = AppHooks::default();
        let value = track(
            "fast",
            &logger,
            &hooks,
            Duration::from_secs(10),
            Duration::from_secs(20),
            async { 42 },
        )
        .await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn critical_task_notifies_error_reporter() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let messages = Arc::new(Mutex::new(Vec::new()));
        let hooks = AppHooks::default().with_error_reporter(Arc::new(RecordingReporter(messages.clone())));
        let _ = track(
            "slow",
            &logger,
            &hooks,
            Duration::from_millis(0),
            Duration::from_millis(0),
            async { std::future::ready(()).await },
        )
        .await;
        assert_eq!(messages.lock().unwrap().len(), 1);
    }
}
