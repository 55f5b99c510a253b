// ============================================
// File: crates/fleet-server/src/config.rs
// ============================================
//! # Server Configuration
//!
//! ## Creation Reason
//! Provides configuration management for the fleet control plane,
//! supporting TOML files with per-section defaults.
//!
//! ## Main Functionality
//! - `ServerConfig`: Main configuration structure
//! - TOML file loading and parsing
//! - Configuration validation
//! - Vault key material resolution (inline or environment)
//!
//! ## Configuration Sections
//! - `store`: Record store backend and data directory
//! - `vault`: Credential key version and material
//! - `sessions`: Panel session lifetime and HTTP timeouts
//! - `engine`: Batch dispatch concurrency and per-node timeout
//! - `risk`: Confirmation threshold and token lifetime
//! - `jobs`: Job retention
//! - `aggregator`: Cluster status polling
//! - `realtime`: Subscriber tickets and channel size
//! - `logging`: Log level
//!
//! ## Example Configuration
//! ```toml
//! [store]
//! backend = "file"
//! path = "/var/lib/fleet"
//!
//! [vault]
//! key_version = 2
//! key_env = "FLEET_VAULT_KEY"
//!
//! [[vault.previous]]
//! version = 1
//! key_env = "FLEET_VAULT_KEY_V1"
//!
//! [engine]
//! concurrency = 8
//! node_timeout_secs = 60
//!
//! [risk]
//! cardinality_threshold = 3
//! token_ttl_secs = 300
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - All config changes require restart
//! - Key material is never serialized back by `to_toml`
//!
//! ## Last Modified
//! v0.1.0 - Initial configuration implementation

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroizing;

use fleet_transport::HttpTransportConfig;

use crate::error::{Result, ServerError};

// ============================================
// ServerConfig
// ============================================

/// Main server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Record store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Credential vault.
    #[serde(default)]
    pub vault: VaultConfig,

    /// Panel sessions.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Batch execution.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Risk confirmation.
    #[serde(default)]
    pub risk: RiskConfig,

    /// Job retention.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Cluster status polling.
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Realtime subscribers.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Loads configuration from a string (useful for testing).
    ///
    /// # Errors
    /// Returns error if the content cannot be parsed or validated.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ServerError::config_load("<string>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.vault.validate()?;
        self.sessions.validate()?;
        self.engine.validate()?;
        self.risk.validate()?;
        self.jobs.validate()?;
        self.aggregator.validate()?;
        self.realtime.validate()?;
        Ok(())
    }

    /// Serializes configuration to TOML string.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

// ============================================
// StoreConfig
// ============================================

/// Record store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process memory; lost on restart.
    Memory,
    /// One JSON file per record below `path`.
    File,
}

/// Record store section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend.
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Data directory for the file backend.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::File
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data")
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.backend == StoreBackend::File && self.path.as_os_str().is_empty() {
            return Err(ServerError::config_invalid(
                "store.path",
                "required for the file backend",
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

// ============================================
// VaultConfig
// ============================================

/// A decrypt-only key kept for blobs sealed before a rotation.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreviousKey {
    /// Key version.
    pub version: u32,
    /// Inline base64 key material.
    #[serde(default, skip_serializing)]
    pub key_material: Option<String>,
    /// Environment variable holding base64 key material.
    #[serde(default)]
    pub key_env: Option<String>,
}

impl std::fmt::Debug for PreviousKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviousKey")
            .field("version", &self.version)
            .field("key_env", &self.key_env)
            .finish_non_exhaustive()
    }
}

/// Credential vault section.
#[derive(Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Version of the current key.
    #[serde(default = "default_key_version")]
    pub key_version: u32,

    /// Inline base64 key material; prefer `key_env` outside of tests.
    #[serde(default, skip_serializing)]
    pub key_material: Option<String>,

    /// Environment variable holding base64 key material.
    #[serde(default = "default_key_env")]
    pub key_env: String,

    /// Decrypt-only keys from earlier rotations.
    #[serde(default)]
    pub previous: Vec<PreviousKey>,
}

fn default_key_version() -> u32 {
    1
}

fn default_key_env() -> String {
    "FLEET_VAULT_KEY".to_string()
}

impl VaultConfig {
    fn validate(&self) -> Result<()> {
        if self.key_version == 0 {
            return Err(ServerError::config_invalid(
                "vault.key_version",
                "must be greater than 0",
            ));
        }
        for prev in &self.previous {
            if prev.version >= self.key_version {
                return Err(ServerError::config_invalid(
                    "vault.previous",
                    format!("version {} is not older than key_version", prev.version),
                ));
            }
            if prev.key_material.is_none() && prev.key_env.is_none() {
                return Err(ServerError::config_invalid(
                    "vault.previous",
                    format!("version {} has no key_material or key_env", prev.version),
                ));
            }
        }
        Ok(())
    }

    /// Resolves the current key material.
    ///
    /// # Errors
    /// `ConfigMissing` if neither inline material nor the environment
    /// variable is set; `ConfigInvalid` if it isn't base64.
    pub fn current_material(&self) -> Result<Zeroizing<Vec<u8>>> {
        resolve_material("vault.key_material", self.key_material.as_deref(), Some(&self.key_env))
    }

    /// Resolves the material of every previous key.
    ///
    /// # Errors
    /// Same as [`Self::current_material`].
    pub fn previous_materials(&self) -> Result<Vec<(u32, Zeroizing<Vec<u8>>)>> {
        self.previous
            .iter()
            .map(|prev| {
                let field = format!("vault.previous[{}]", prev.version);
                resolve_material(&field, prev.key_material.as_deref(), prev.key_env.as_deref())
                    .map(|m| (prev.version, m))
            })
            .collect()
    }
}

/// Decodes base64 key material from inline config or an environment variable.
pub fn resolve_material(
    field: &str,
    inline: Option<&str>,
    env: Option<&str>,
) -> Result<Zeroizing<Vec<u8>>> {
    let encoded = match (inline, env) {
        (Some(inline), _) => Zeroizing::new(inline.to_string()),
        (None, Some(var)) => Zeroizing::new(std::env::var(var).map_err(|_| ServerError::ConfigMissing {
            field: format!("{field} (environment variable {var})"),
        })?),
        (None, None) => {
            return Err(ServerError::ConfigMissing {
                field: field.to_string(),
            })
        }
    };

    BASE64
        .decode(encoded.trim())
        .map(Zeroizing::new)
        .map_err(|_| ServerError::config_invalid(field, "key material must be base64"))
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("key_version", &self.key_version)
            .field("key_env", &self.key_env)
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_version: default_key_version(),
            key_material: None,
            key_env: default_key_env(),
            previous: Vec::new(),
        }
    }
}

// ============================================
// SessionsConfig
// ============================================

/// Panel session section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Assumed lifetime of a panel session before re-login.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// HTTP request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// HTTP connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Accept self-signed panel certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_session_ttl() -> u64 {
    1800
}

fn default_request_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    5
}

impl SessionsConfig {
    fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(ServerError::config_invalid("sessions.ttl_secs", "must be greater than 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ServerError::config_invalid(
                "sessions.request_timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Session lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Builds the HTTP transport settings.
    #[must_use]
    pub fn http(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            accept_invalid_certs: self.accept_invalid_certs,
            ..HttpTransportConfig::default()
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            accept_invalid_certs: false,
        }
    }
}

// ============================================
// EngineConfig
// ============================================

/// Batch execution section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node tasks in flight per batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Budget for all steps on one node.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
}

fn default_concurrency() -> usize {
    8
}

fn default_node_timeout() -> u64 {
    60
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ServerError::config_invalid("engine.concurrency", "must be greater than 0"));
        }
        if self.node_timeout_secs == 0 {
            return Err(ServerError::config_invalid(
                "engine.node_timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Per-node timeout.
    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            node_timeout_secs: default_node_timeout(),
        }
    }
}

// ============================================
// RiskConfig
// ============================================

/// Risk confirmation section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Destructive batches on more nodes than this need confirmation.
    #[serde(default = "default_cardinality_threshold")]
    pub cardinality_threshold: usize,

    /// Lifetime of a confirmation token.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Maximum explicit targets a token may be scoped to.
    #[serde(default = "default_max_scope_targets")]
    pub max_scope_targets: usize,
}

fn default_cardinality_threshold() -> usize {
    3
}

fn default_token_ttl() -> u64 {
    300
}

fn default_max_scope_targets() -> usize {
    256
}

impl RiskConfig {
    fn validate(&self) -> Result<()> {
        if self.token_ttl_secs == 0 {
            return Err(ServerError::config_invalid("risk.token_ttl_secs", "must be greater than 0"));
        }
        if self.max_scope_targets == 0 {
            return Err(ServerError::config_invalid(
                "risk.max_scope_targets",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            cardinality_threshold: default_cardinality_threshold(),
            token_ttl_secs: default_token_ttl(),
            max_scope_targets: default_max_scope_targets(),
        }
    }
}

// ============================================
// JobsConfig
// ============================================

/// Job retention section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Maximum stored jobs; oldest are evicted first.
    #[serde(default = "default_max_jobs")]
    pub max_count: usize,

    /// Maximum job age.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

fn default_max_jobs() -> usize {
    500
}

fn default_max_age_days() -> u64 {
    30
}

impl JobsConfig {
    fn validate(&self) -> Result<()> {
        if self.max_count == 0 {
            return Err(ServerError::config_invalid("jobs.max_count", "must be greater than 0"));
        }
        Ok(())
    }

    /// Maximum job age in seconds, `None` when unlimited.
    #[must_use]
    pub fn max_age_secs(&self) -> Option<u64> {
        (self.max_age_days > 0).then(|| self.max_age_days * 86_400)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_jobs(),
            max_age_days: default_max_age_days(),
        }
    }
}

// ============================================
// AggregatorConfig
// ============================================

/// Cluster status polling section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Run the polling loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Poll interval.
    #[serde(default = "default_aggregator_interval")]
    pub interval_secs: u64,

    /// Nodes polled concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Budget for one node's poll; a slower node is reported offline.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_aggregator_interval() -> u64 {
    10
}

fn default_poll_timeout() -> u64 {
    8
}

impl AggregatorConfig {
    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(ServerError::config_invalid(
                "aggregator.interval_secs",
                "must be greater than 0",
            ));
        }
        if self.concurrency == 0 {
            return Err(ServerError::config_invalid(
                "aggregator.concurrency",
                "must be greater than 0",
            ));
        }
        if self.poll_timeout_secs == 0 {
            return Err(ServerError::config_invalid(
                "aggregator.poll_timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Per-node poll budget.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_aggregator_interval(),
            concurrency: default_concurrency(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

// ============================================
// RealtimeConfig
// ============================================

/// Realtime subscriber section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Lifetime of an unredeemed subscriber ticket.
    #[serde(default = "default_ticket_ttl")]
    pub ticket_ttl_secs: u64,

    /// Snapshots buffered per subscriber.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_ticket_ttl() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    16
}

impl RealtimeConfig {
    fn validate(&self) -> Result<()> {
        if self.ticket_ttl_secs == 0 {
            return Err(ServerError::config_invalid(
                "realtime.ticket_ttl_secs",
                "must be greater than 0",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ServerError::config_invalid(
                "realtime.channel_capacity",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ticket_ttl_secs: default_ticket_ttl(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

// ============================================
// LoggingConfig
// ============================================

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================
// Tests
// ============================================
