//! Integration extension points (§4.J), grounded on `frontik/integrations/__init__.py`'s
//! `Integration` base class and `load_integrations`, re-architected per the §9 redesign note
//! ("Integration discovery... Model as an explicit registration list constructed at startup")
//! instead of the original's package scan.
use std::sync::Arc;

use apphost_common::Metrics;
use async_trait::async_trait;

use crate::error::ApiError;

/// An add-on offered two hooks: one at application startup (before the server accepts traffic)
/// and one per handler instance. Concrete integrations (Sentry, a Kafka producer, a service
/// discovery client) live outside this crate; only the extension point is specified here.
#[async_trait(?Send)]
pub trait Integration {
    fn name(&self) -> &'static str;

    /// Run once at application startup. Awaited before the server starts accepting connections;
    /// an error here is an initialization failure (§6 "non-zero on initialization failure").
    async fn initialize_app(&self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Run once per handler instance, synchronously, before the preprocessor chain starts.
    fn initialize_handler(&self, _handler_name: &str) {}
}

/// The explicit list of integrations constructed at startup, replacing the original's package
/// scan. `apphost::server` builds one of these from `Settings` and runs `initialize_app` on every
/// member before binding the listener.
#[derive(Default)]
pub struct IntegrationRegistry {
    integrations: Vec<Arc<dyn Integration>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, integration: Arc<dyn Integration>) {
        self.integrations.push(integration);
    }

    pub async fn initialize_all(&self) -> Result<(), ApiError> {
        for integration in &self.integrations {
            integration.initialize_app().await?;
        }
        Ok(())
    }

    pub fn initialize_handler(&self, handler_name: &str) {
        for integration in &self.integrations {
            integration.initialize_handler(handler_name);
        }
    }
}

/// Application-level extension hooks (§4.J), each returning `None` when the corresponding add-on
/// isn't configured. Held by `apphost::server::AppState` and exposed to handlers through their
/// `RequestContext`'s owning application reference.
#[derive(Default, Clone)]
pub struct AppHooks {
    metrics_client: Option<Arc<Metrics>>,
    error_reporter: Option<Arc<dyn ErrorReporter>>,
    discovery_client: Option<Arc<dyn DiscoveryClient>>,
}

/// A registered-or-not handle to a named message producer (e.g. a Kafka topic client).
pub trait MessageProducer: Send + Sync {
    fn name(&self) -> &str;
}

pub trait ErrorReporter: Send + Sync {
    fn report(&self, message: &str);
}

pub trait DiscoveryClient: Send + Sync {
    fn resolve(&self, service: &str) -> Option<String>;
}

impl AppHooks {
    pub fn with_metrics_client(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics_client = Some(metrics);
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = Some(reporter);
        self
    }

    pub fn with_discovery_client(mut self, client: Arc<dyn DiscoveryClient>) -> Self {
        self.discovery_client = Some(client);
        self
    }

    pub fn get_metrics_client(&self) -> Option<Arc<Metrics>> {
        self.metrics_client.clone()
    }

    pub fn get_error_reporter(&self) -> Option<Arc<dyn ErrorReporter>> {
        self.error_reporter.clone()
    }

    pub fn get_message_producer(&self, _name: &str) -> Option<Arc<dyn MessageProducer>> {
        // No producers are registered by default; concrete applications extend this by
        // constructing their own `AppHooks` with a populated lookup table.
        None
    }

    pub fn get_discovery_client(&self) -> Option<Arc<dyn DiscoveryClient>> {
        self.discovery_client.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Noop;

    #[async_trait(?Send)]
    impl Integration for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }
    }

    #[tokio::test]
    async fn empty_registry_initializes_cleanly() {
        let registry = IntegrationRegistry::new();
        assert!(registry.initialize_all().await.is_ok());
    }

    #[tokio::test]
    async fn registered_integration_runs() {
        let mut registry = IntegrationRegistry::new();
        registry.register(Arc::new(Noop));
        assert!(registry.initialize_all().await.is_ok());
        registry.initialize_handler("widgets");
    }

    #[test]
    fn unconfigured_hooks_are_none() {
        let hooks = AppHooks::default();
        assert!(hooks.get_metrics_client().is_none());
        assert!(hooks.get_error_reporter().is_none());
        assert!(hooks.get_message_producer("x").is_none());
        assert!(hooks.get_discovery_client().is_none());
    }
}
