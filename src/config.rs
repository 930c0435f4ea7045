//! Core configuration
//!
//! All tunables in one serde struct with sensible defaults, loadable from a
//! config file (feature `config-file`) with `SOLMESH_*` environment
//! overrides. Malformed configuration is a hard error so CLI wrappers can
//! exit with a distinct code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive for tracing-subscriber
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Relay engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Solana RPC endpoint; without one the node is relay-only
    pub rpc_url: Option<String>,
    pub enable_logging: bool,
    pub log_level: LogLevel,
    /// Snapshot directory; without one nothing persists
    pub storage_directory: Option<PathBuf>,
    pub autosave_debounce_ms: u64,
    pub reassembly_ttl_ms: u64,
    pub worker_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_ceiling_ms: u64,
    /// How long a retry item may sit in the queue before it is written off
    /// to the permanent-failure log, independent of `dedup_ttl_ms`
    pub retry_retention_ms: u64,
    pub max_attempts: u32,
    pub dedup_ttl_ms: u64,
    pub max_incomplete_sets: usize,
    /// Payloads above this size are LZ4-compressed before fragmentation
    pub compression_threshold: usize,
    /// Fragment payload budget; fragments must fit the negotiated BLE MTU
    pub max_payload: usize,
    pub max_outbound: usize,
    pub max_confirmations: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            enable_logging: true,
            log_level: LogLevel::Info,
            storage_directory: None,
            autosave_debounce_ms: 5_000,
            reassembly_ttl_ms: 60_000,
            worker_timeout_ms: 30_000,
            retry_base_ms: 30_000,
            retry_ceiling_ms: 3_600_000,
            retry_retention_ms: 86_400_000,
            max_attempts: 10,
            dedup_ttl_ms: 86_400_000,
            max_incomplete_sets: 128,
            compression_threshold: 100,
            max_payload: crate::codec::MAX_PAYLOAD,
            max_outbound: 1_000,
            max_confirmations: 500,
        }
    }
}

impl CoreConfig {
    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload == 0 || self.max_payload > crate::codec::MAX_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "max_payload must be in 1..={}, got {}",
                crate::codec::MAX_PAYLOAD,
                self.max_payload
            )));
        }
        if self.retry_base_ms == 0 {
            return Err(ConfigError::Invalid("retry_base_ms must be nonzero".into()));
        }
        if self.retry_ceiling_ms < self.retry_base_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_ceiling_ms ({}) below retry_base_ms ({})",
                self.retry_ceiling_ms, self.retry_base_ms
            )));
        }
        if self.retry_retention_ms < self.retry_ceiling_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_retention_ms ({}) below retry_ceiling_ms ({}): items would be written off before their scheduled retry",
                self.retry_retention_ms, self.retry_ceiling_ms
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be nonzero".into()));
        }
        if self.max_incomplete_sets == 0 {
            return Err(ConfigError::Invalid(
                "max_incomplete_sets must be nonzero".into(),
            ));
        }
        if self.worker_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker_timeout_ms must be nonzero".into(),
            ));
        }
        Ok(())
    }

    /// Load from an optional config file, then apply `SOLMESH_*` environment
    /// overrides (e.g. `SOLMESH_RPC_URL`, `SOLMESH_LOG_LEVEL`).
    #[cfg(feature = "config-file")]
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("SOLMESH").try_parsing(true));

        let loaded: CoreConfig = builder
            .build()
            .map_err(|e| ConfigError::Malformed(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Malformed(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
