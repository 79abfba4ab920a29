use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use apphost_settings::UpstreamSettings;
use tokio::sync::RwLock;

use crate::pool::{ReturnOutcome, ServerPool};
use crate::server::Server;

/// Error conditions for upstream registration (§4.B).
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream {0:?} is not registered")]
    Unknown(String),
    #[error("upstream {0:?} has no servers configured")]
    Empty(String),
}

/// Tracks every named upstream's `ServerPool`, guarded by a single `RwLock` since actix-web's
/// worker threads may call `borrow`/`return_server` concurrently — unlike the single-threaded
/// event loop this subsystem is modeled on, where no such lock was needed. Reconfiguration
/// (register/update/delete) and request-path lookups share the same lock; request-path
/// operations hold it only for the duration of the in-memory pool mutation, never across I/O.
#[derive(Clone)]
pub struct UpstreamRegistry {
    pools: Arc<RwLock<HashMap<String, ServerPool>>>,
}

impl Default for UpstreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register every upstream found in settings at startup.
    pub async fn from_settings(
        upstreams: &HashMap<String, UpstreamSettings>,
        default_tries: u32,
        default_max_fails: u32,
        default_fail_timeout: Duration,
    ) -> Self {
        let registry = Self::new();
        for (name, settings) in upstreams {
            if settings.servers.is_empty() {
                continue;
            }
            let servers = settings
                .servers
                .iter()
                .map(|s| Server::new(s.address.clone(), s.weight))
                .collect();
            let tries = settings.tries.unwrap_or(default_tries);
            let max_fails = settings.max_fails.unwrap_or(default_max_fails);
            let fail_timeout = settings
                .fail_timeout_sec
                .map(Duration::from_secs_f64)
                .unwrap_or(default_fail_timeout);
            registry
                .register(name.clone(), servers, tries, max_fails, fail_timeout)
                .await;
        }
        registry
    }

    /// Register (or fully replace) a named upstream's pool.
    pub async fn register(
        &self,
        name: String,
        servers: Vec<Server>,
        tries: u32,
        max_fails: u32,
        fail_timeout: Duration,
    ) {
        let pool = ServerPool::new(servers, tries, max_fails, fail_timeout);
        self.pools.write().await.insert(name, pool);
    }

    /// Reconfigure an existing upstream in place, delete it if `servers` is empty, or create it
    /// if it doesn't exist yet and `servers` is non-empty (§4.B: "if the pool does not exist and
    /// servers are provided, create it"; frontik `Upstream.update`/`_add_server`). `tries`,
    /// `max_fails`, and `fail_timeout` are only used on the create path, mirroring the defaults a
    /// freshly registered pool would get from `UpstreamSettings`.
    pub async fn update(
        &self,
        name: &str,
        servers: Vec<Server>,
        tries: u32,
        max_fails: u32,
        fail_timeout: Duration,
    ) -> Result<(), UpstreamError> {
        if servers.is_empty() {
            return self.delete(name).await;
        }
        let mut pools = self.pools.write().await;
        match pools.get_mut(name) {
            Some(pool) => {
                pool.reconfigure(servers);
                Ok(())
            }
            None => {
                pools.insert(name.to_owned(), ServerPool::new(servers, tries, max_fails, fail_timeout));
                Ok(())
            }
        }
    }

    pub async fn delete(&self, name: &str) -> Result<(), UpstreamError> {
        match self.pools.write().await.remove(name) {
            Some(_) => Ok(()),
            None => Err(UpstreamError::Unknown(name.to_owned())),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.pools.read().await.contains_key(name)
    }

    /// Borrow a server from the named upstream, excluding indices already tried on this request.
    pub async fn borrow(
        &self,
        name: &str,
        tried: &HashSet<usize>,
    ) -> Result<Option<(usize, String)>, UpstreamError> {
        let mut pools = self.pools.write().await;
        let pool = pools
            .get_mut(name)
            .ok_or_else(|| UpstreamError::Unknown(name.to_owned()))?;
        Ok(pool.borrow(tried))
    }

    pub async fn max_tries(&self, name: &str) -> Result<u32, UpstreamError> {
        let pools = self.pools.read().await;
        let pool = pools
            .get(name)
            .ok_or_else(|| UpstreamError::Unknown(name.to_owned()))?;
        Ok(pool.tries)
    }

    /// Return a server borrowed from the named upstream, scheduling a reactivation timer if this
    /// return deactivated it.
    pub async fn return_server(&self, name: &str, index: usize, error: bool) {
        let outcome = {
            let mut pools = self.pools.write().await;
            match pools.get_mut(name) {
                Some(pool) => pool.return_server(index, error),
                None => return,
            }
        };

        if let ReturnOutcome::Deactivated { index, generation } = outcome {
            self.schedule_reactivation(name.to_owned(), index, generation)
                .await;
        }
    }

    async fn schedule_reactivation(&self, name: String, index: usize, generation: u64) {
        let fail_timeout = {
            let pools = self.pools.read().await;
            match pools.get(&name) {
                Some(pool) => pool.fail_timeout,
                None => return,
            }
        };

        let pools = self.pools.clone();
        tokio::spawn(async move {
            tokio::time::sleep(fail_timeout).await;
            let mut pools = pools.write().await;
            if let Some(pool) = pools.get_mut(&name) {
                pool.reactivate(index, generation);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unknown_upstream_is_an_error() {
        let registry = UpstreamRegistry::new();
        let tried = HashSet::new();
        assert!(matches!(
            registry.borrow("nope", &tried).await,
            Err(UpstreamError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn register_then_borrow_and_return() {
        let registry = UpstreamRegistry::new();
        registry
            .register(
                "svc".into(),
                vec![Server::new("a", 1), Server::new("b", 1)],
                2,
                0,
                Duration::from_secs(1),
            )
            .await;

        let tried = HashSet::new();
        let (index, address) = registry.borrow("svc", &tried).await.unwrap().unwrap();
        assert!(address == "a" || address == "b");
        registry.return_server("svc", index, false).await;
    }

    #[tokio::test]
    async fn update_with_empty_servers_deletes_upstream() {
        let registry = UpstreamRegistry::new();
        registry
            .register("svc".into(), vec![Server::new("a", 1)], 2, 0, Duration::from_secs(1))
            .await;
        registry
            .update("svc", vec![], 2, 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!registry.contains("svc").await);
    }

    #[tokio::test]
    async fn update_creates_pool_when_absent() {
        let registry = UpstreamRegistry::new();
        registry
            .update("svc", vec![Server::new("a", 1)], 2, 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(registry.contains("svc").await);
        let tried = HashSet::new();
        assert!(registry.borrow("svc", &tried).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivated_server_reactivates_after_fail_timeout() {
        let registry = UpstreamRegistry::new();
        registry
            .register(
                "svc".into(),
                vec![Server::new("only", 1)],
                1,
                1,
                Duration::from_millis(100),
            )
            .await;

        let tried = HashSet::new();
        let (index, _) = registry.borrow("svc", &tried).await.unwrap().unwrap();
        registry.return_server("svc", index, true).await;
        assert!(registry.borrow("svc", &tried).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        assert!(registry.borrow("svc", &tried).await.unwrap().is_some());
    }
}
