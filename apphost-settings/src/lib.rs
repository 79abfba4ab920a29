//! Configuration loading for the application server: a single `Settings` struct covering every
//! option the server understands, loaded from an optional config file plus environment
//! overrides, the same way `syncserver_settings::Settings` does it.
#[macro_use]
extern crate slog_scope;

use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

static PREFIX: &str = "apphost";

/// One backend server inside an upstream's pool (§3 `Server`).
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServerSettings {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// One named upstream's static configuration (§3 `Server Pool`). `servers` is intentionally
/// allowed to be empty here even though §4.A forbids an empty *registered* pool: an empty list
/// in settings just means "don't register this upstream at startup", mirroring
/// `Upstream.update`'s treatment of an empty server list as a delete.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub servers: Vec<ServerSettings>,
    pub tries: Option<u32>,
    pub max_fails: Option<u32>,
    pub fail_timeout_sec: Option<f64>,
}

/// Every configuration option enumerated in §6, plus the ambient settings (logging,
/// metrics, CORS) that any complete build of this server carries regardless of declared
/// Non-goals.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub reuse_port: bool,

    pub max_active_handlers: u32,
    pub max_http_clients: u32,
    pub max_http_clients_connects: u32,

    pub timeout_multiplier: f64,
    pub http_client_default_connect_timeout_sec: f64,
    pub http_client_default_request_timeout_sec: f64,
    pub http_client_default_max_tries: u32,
    pub http_client_default_max_fails: u32,
    pub http_client_default_fail_timeout_sec: f64,

    pub http_proxy_host: Option<String>,
    pub http_proxy_port: u16,

    pub debug: bool,
    pub debug_login: Option<String>,
    pub debug_password: Option<String>,

    pub asyncio_task_threshold_sec: f64,
    pub asyncio_task_critical_threshold_sec: f64,

    pub stop_timeout: u64,

    /// Named upstreams, registered with the client's `UpstreamRegistry` at startup.
    pub upstreams: HashMap<String, UpstreamSettings>,

    // Ambient: logging / metrics / CORS.
    pub human_logs: bool,
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub cors_allowed_origin: Option<String>,
    pub cors_max_age: Option<usize>,
    pub cors_allowed_methods: Option<Vec<String>>,
    pub cors_allowed_headers: Option<Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            reuse_port: true,

            max_active_handlers: 100,
            max_http_clients: 100,
            max_http_clients_connects: 100,

            timeout_multiplier: 1.0,
            http_client_default_connect_timeout_sec: 0.2,
            http_client_default_request_timeout_sec: 2.0,
            http_client_default_max_tries: 2,
            http_client_default_max_fails: 0,
            http_client_default_fail_timeout_sec: 10.0,

            http_proxy_host: None,
            http_proxy_port: 3128,

            debug: false,
            debug_login: None,
            debug_password: None,

            asyncio_task_threshold_sec: 0.5,
            asyncio_task_critical_threshold_sec: 2.0,

            stop_timeout: 3,

            upstreams: HashMap::default(),

            human_logs: false,
            statsd_host: None,
            statsd_port: 8125,
            cors_allowed_origin: None,
            cors_allowed_methods: Some(
                ["DELETE", "GET", "HEAD", "POST", "PUT"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            cors_allowed_headers: None,
            cors_max_age: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional config file, then apply `APPHOST__*` environment
    /// overrides (double-underscore separated, e.g. `APPHOST__HTTP_PROXY_PORT=8888`).
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(config_filename) = filename {
            builder = builder.add_source(File::with_name(config_filename));
        }

        builder = builder.add_source(
            Environment::with_prefix(&PREFIX.to_uppercase())
                .separator("__")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(config) => config.try_deserialize(),
            Err(e) => {
                error!("Configuration error: {:?}", &e);
                Err(e)
            }
        }
    }

    pub fn banner(&self) -> String {
        format!(
            "http://{}:{} ({} upstream(s), debug={})",
            self.host,
            self.port,
            self.upstreams.len(),
            self.debug
        )
    }
}

#[cfg(test)]
mod test {
    use std::env;

    use super::*;

    #[test]
    fn test_environment_variable_prefix() {
        env::set_var("APPHOST__DEBUG", "true");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert!(settings.debug);
        env::remove_var("APPHOST__DEBUG");
    }

    #[test]
    fn test_defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.http_client_default_max_tries, 2);
        assert!(settings.upstreams.is_empty());
    }
}
