//! Configuration for the provider.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::Error;

/// Main configuration structure for the provider.
///
/// Built once at startup and shared read-only with every component.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Local status endpoint. Disabled when absent.
    #[serde(default)]
    pub status_api: Option<StatusApiConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Model name to publish.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub description: String,
    /// Advertised concurrency limit. Values below 1 are treated as 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Provider token from the hub dashboard.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub admission: AdmissionPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            description: String::new(),
            max_concurrent: default_max_concurrent(),
            token: String::new(),
            admission: AdmissionPolicy::default(),
        }
    }
}

impl ProviderConfig {
    pub fn effective_max_concurrent(&self) -> u32 {
        self.max_concurrent.max(1)
    }
}

/// What to do with requests beyond `max_concurrent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Accept everything; the gateway is trusted to respect the limit.
    #[default]
    Unbounded,
    /// Hold excess requests until a slot frees up.
    Queue,
    /// Answer excess requests with an error frame.
    Reject,
}

/// Supported local inference servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum BackendKind {
    #[default]
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "llama.cpp", alias = "llamacpp")]
    LlamaCpp,
    #[serde(rename = "vllm")]
    Vllm,
    #[serde(rename = "custom")]
    Custom,
}

impl BackendKind {
    /// Name used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::LlamaCpp => "llama.cpp",
            BackendKind::Vllm => "vllm",
            BackendKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default, rename = "type")]
    pub kind: BackendKind,
    /// Endpoint override. Required for the custom backend.
    #[serde(default)]
    pub url: Option<String>,
    /// Bearer token for backends that need auth.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Gateway WebSocket connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Bound on the startup backend health check.
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            handshake_timeout_secs: default_handshake_timeout(),
            write_timeout_secs: default_write_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            health_timeout_secs: default_health_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for StatusApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// Default values
fn default_max_concurrent() -> u32 {
    1
}
fn default_hub_url() -> String {
    "https://cllmhub.com".to_string()
}
fn default_handshake_timeout() -> u64 {
    15
}
fn default_write_timeout() -> u64 {
    10
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_health_timeout() -> u64 {
    10
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9090
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (LLMHUB__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("gateway.hub_url", default_hub_url())?
            .set_default("provider.max_concurrent", default_max_concurrent() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("LLMHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Check the settings needed to publish a model.
    ///
    /// Consumer commands only need `[gateway]`, so this is not part of `load`.
    pub fn validate_provider(&self) -> crate::error::Result<()> {
        if self.provider.model.trim().is_empty() {
            return Err(Error::Configuration("provider.model is required".to_string()));
        }
        if self.provider.token.trim().is_empty() {
            return Err(Error::Configuration(
                "provider.token is required (get one from the hub dashboard)".to_string(),
            ));
        }
        if self.backend.kind == BackendKind::Custom
            && self.backend.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::Configuration("custom backend requires a URL".to_string()));
        }
        if self.gateway.heartbeat_interval_secs == 0 {
            return Err(Error::Configuration(
                "gateway.heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.gateway.heartbeat_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.handshake_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.write_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.health_timeout_secs)
    }
}
