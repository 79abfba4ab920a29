//! Process-wide active-handler limiter (§4.H), grounded on frontik's `ActiveHandlersLimit`.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use apphost_common::Metrics;

/// A release token for one admitted request. Dropping it releases the slot exactly once, on
/// every handler termination path (success, error, cancellation via early drop).
pub struct ActiveHandlerToken {
    count: Arc<AtomicU32>,
}

impl Drop for ActiveHandlerToken {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ActiveHandlerLimiter {
    count: Arc<AtomicU32>,
    max_active_handlers: u32,
}

impl ActiveHandlerLimiter {
    pub fn new(max_active_handlers: u32) -> Self {
        Self {
            count: Arc::new(AtomicU32::new(0)),
            max_active_handlers,
        }
    }

    pub fn active(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Admit one request, returning a release token, or `None` if the limit is already
    /// exceeded (§4.H: "if `count > max_active_handlers`, reject with 503").
    pub fn try_admit(&self, metrics: &Metrics) -> Option<ActiveHandlerToken> {
        let previous = self.count.fetch_add(1, Ordering::SeqCst);
        if previous + 1 > self.max_active_handlers {
            self.count.fetch_sub(1, Ordering::SeqCst);
            metrics.gauge("request.active_handlers", self.active() as u64);
            return None;
        }
        metrics.gauge("request.active_handlers", self.active() as u64);
        Some(ActiveHandlerToken {
            count: self.count.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_once_over_capacity() {
        let limiter = ActiveHandlerLimiter::new(1);
        let metrics = Metrics::noop();
        let first = limiter.try_admit(&metrics);
        assert!(first.is_some());
        let second = limiter.try_admit(&metrics);
        assert!(second.is_none());
        assert_eq!(limiter.active(), 1);
    }

    #[test]
    fn releases_exactly_once_on_drop() {
        let limiter = ActiveHandlerLimiter::new(1);
        let metrics = Metrics::noop();
        {
            let _token = limiter.try_admit(&metrics).unwrap();
            assert_eq!(limiter.active(), 1);
        }
        assert_eq!(limiter.active(), 0);
    }
}
