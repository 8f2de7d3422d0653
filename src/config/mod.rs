pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Upstream request timeout in seconds, applied to setup calls.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(default)]
    pub base_path: String,
}

fn default_port() -> u16 {
    5001
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize)]
struct ServerConfigWire {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    runtime_worker_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    runtime_max_blocking_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    base_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeThreadsSetting {
    Fixed(usize),
    Auto(()),
}

fn runtime_threads_or_default(
    setting: Option<&RuntimeThreadsSetting>,
    default: Option<usize>,
) -> Option<usize> {
    match setting {
        None => default,
        Some(RuntimeThreadsSetting::Fixed(threads)) => Some(*threads),
        Some(RuntimeThreadsSetting::Auto(())) => None,
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ServerConfigWire::deserialize(deserializer)?;
        Ok(Self {
            port: wire.port,
            host: wire.host,
            timeout: wire.timeout,
            runtime_worker_threads: runtime_threads_or_default(
                wire.runtime_worker_threads.as_ref(),
                None,
            ),
            runtime_max_blocking_threads: runtime_threads_or_default(
                wire.runtime_max_blocking_threads.as_ref(),
                Some(8),
            ),
            base_path: wire.base_path,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
            base_path: String::new(),
        }
    }
}

/// Client authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    pub allowed_keys: Vec<String>,
}

/// One upstream account. Either `email` or `mobile` identifies it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub token: String,
}

impl AccountConfig {
    /// Stable identifier: email when present, otherwise mobile.
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .or_else(|| self.mobile.as_deref().map(str::trim))
            .unwrap_or("")
    }
}

/// Upstream endpoints and retry budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    /// Service that turns a proof-of-work challenge into the response header.
    #[serde(default)]
    pub challenge_solver_url: Option<String>,
    #[serde(default = "default_retries")]
    pub session_retries: u32,
    #[serde(default = "default_retries")]
    pub challenge_retries: u32,
    #[serde(default = "default_retries")]
    pub completion_retries: u32,
}

fn default_upstream_base_url() -> String {
    "https://chat.deepseek.com".to_string()
}
fn default_retries() -> u32 {
    3
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            challenge_solver_url: None,
            session_retries: default_retries(),
            challenge_retries: default_retries(),
            completion_retries: default_retries(),
        }
    }
}

/// Client stream pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_keep_alive_without_content")]
    pub max_keep_alive_without_content: u32,
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,
}

fn default_keep_alive_interval_secs() -> u64 {
    5
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_max_keep_alive_without_content() -> u32 {
    10
}
fn default_max_capture_bytes() -> usize {
    512 * 1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_keep_alive_without_content: default_max_keep_alive_without_content(),
            max_capture_bytes: default_max_capture_bytes(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Run the live tool sieve when a request declares tools.
    #[serde(default = "default_true")]
    pub toolcall_feature_match: bool,
    /// Stream tool-call arguments before the call is complete.
    #[serde(default)]
    pub toolcall_early_emit: bool,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            toolcall_feature_match: true,
            toolcall_early_emit: false,
        }
    }
}

/// Held-account leases for split prepare/stream deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub internal_secret: Option<String>,
}

fn default_lease_ttl_secs() -> u64 {
    900
}

impl LeaseConfig {
    /// Explicit interval, or a quarter of the TTL clamped to 5..=60 seconds.
    #[must_use]
    pub fn effective_sweep_interval_secs(&self) -> u64 {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .unwrap_or_else(|| (self.ttl_secs / 4).clamp(5, 60))
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
            sweep_interval_secs: None,
            internal_secret: None,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub client_authentication: ClientAuthConfig,
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.expect("example config");
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[1].identifier(), "13800000000");
        assert_eq!(config.client_authentication.allowed_keys.len(), 2);
        assert!(config.features.toolcall_feature_match);
        assert_eq!(config.stream.idle_timeout_secs, 30);
    }

    #[test]
    fn test_server_config_runtime_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.runtime_worker_threads, None);
        assert_eq!(server.runtime_max_blocking_threads, Some(8));
    }

    #[test]
    fn test_runtime_threads_from_yaml() {
        let server: ServerConfig =
            serde_yaml::from_str("runtime_worker_threads: 4\n").expect("server yaml");
        assert_eq!(server.runtime_worker_threads, Some(4));
        let server: ServerConfig = serde_yaml::from_str("port: 9000\n").expect("server yaml");
        assert_eq!(server.port, 9000);
        assert_eq!(server.runtime_max_blocking_threads, Some(8));
    }

    #[test]
    fn test_lease_sweep_interval_is_clamped() {
        let mut lease = LeaseConfig::default();
        assert_eq!(lease.effective_sweep_interval_secs(), 60);
        lease.ttl_secs = 8;
        assert_eq!(lease.effective_sweep_interval_secs(), 5);
        lease.ttl_secs = 120;
        assert_eq!(lease.effective_sweep_interval_secs(), 30);
        lease.sweep_interval_secs = Some(7);
        assert_eq!(lease.effective_sweep_interval_secs(), 7);
    }

    #[test]
    fn test_account_identifier_prefers_email() {
        let account = AccountConfig {
            email: Some("a@example.com".into()),
            mobile: Some("1380".into()),
            token: "t".into(),
        };
        assert_eq!(account.identifier(), "a@example.com");
    }
}
