//! Configuration management for Enclave.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "enclave.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "ENCLAVE";

/// Complete configuration for an Enclave node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Listener, worker and sender configuration
    pub network: NetworkConfig,
    /// Outbound connection pool configuration
    pub pool: PoolConfig,
    /// Key generation and replay protection configuration
    pub crypto: CryptoConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the listener to
    pub host: String,
    /// Port to listen on for incoming envelopes
    pub listen_port: u16,
    /// Maximum number of connections read concurrently
    pub connection_handlers: usize,
    /// Capacity of the inbound work queue
    pub queue_capacity: usize,
    /// Number of decrypt/verify workers
    pub processing_workers: usize,
    /// Connect and write timeout in seconds
    pub socket_timeout_secs: u64,
    /// Per-recipient deadline for fan-out sends in seconds
    pub fanout_timeout_secs: u64,
    /// Upper bound on concurrent fan-out sends
    pub max_fanout_concurrency: usize,
    /// How long shutdown waits for in-flight work in seconds
    pub shutdown_grace_secs: u64,
}

/// Outbound connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Reuse outbound connections
    pub enabled: bool,
    /// Idle connections kept per (host, port)
    pub max_per_peer: usize,
    /// Idle connections older than this are discarded, in seconds
    pub idle_timeout_secs: u64,
}

/// Cryptographic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// RSA modulus size for generated identities
    pub modulus_bits: usize,
    /// PBKDF2 iterations protecting the private key at rest
    pub kdf_iterations: u32,
    /// Number of recent message ids remembered for duplicate detection
    pub replay_window_capacity: usize,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the local identity and the `peers/` directory
    pub keys_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: crate::defaults::DEFAULT_HOST.to_string(),
            listen_port: crate::defaults::DEFAULT_PORT,
            connection_handlers: crate::defaults::DEFAULT_CONNECTION_HANDLERS,
            queue_capacity: crate::defaults::DEFAULT_QUEUE_CAPACITY,
            processing_workers: crate::defaults::DEFAULT_PROCESSING_WORKERS,
            socket_timeout_secs: crate::defaults::DEFAULT_SOCKET_TIMEOUT,
            fanout_timeout_secs: crate::defaults::DEFAULT_FANOUT_TIMEOUT,
            max_fanout_concurrency: crate::defaults::DEFAULT_MAX_FANOUT_CONCURRENCY,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_peer: crate::defaults::DEFAULT_POOL_MAX_PER_PEER,
            idle_timeout_secs: crate::defaults::DEFAULT_POOL_IDLE_TIMEOUT,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            modulus_bits: crate::crypto::DEFAULT_MODULUS_BITS,
            kdf_iterations: crate::crypto::DEFAULT_KDF_ITERATIONS,
            replay_window_capacity: crate::protocol::REPLAY_WINDOW_CAPACITY,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("enclave");

        Self {
            keys_dir: data_dir.join("keys"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Connect and write timeout
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    /// Per-recipient fan-out deadline
    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_secs(self.fanout_timeout_secs)
    }

    /// Grace period granted to in-flight work on shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl PoolConfig {
    /// Maximum idle age of a pooled connection
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl CryptoConfig {
    /// Key generation parameters derived from this configuration
    pub fn key_params(&self) -> crate::crypto::KeyParams {
        crate::crypto::KeyParams {
            modulus_bits: self.modulus_bits,
            kdf_iterations: self.kdf_iterations,
        }
    }
}

impl EnclaveConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// An explicit `config_file` must exist. Without one, `enclave.toml` in
    /// the working directory and then in the platform config directory are
    /// tried in order.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            Self::from_file(path)?
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("enclave")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            match default_locations.iter().find(|location| location.exists()) {
                Some(location) => Self::from_file(location)?,
                None => Self::default(),
            }
        };

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Apply `ENCLAVE_*` environment overrides
    fn merge_from_env(mut self) -> Result<Self> {
        let port_var = format!("{ENV_PREFIX}_NETWORK_LISTEN_PORT");
        if let Ok(port) = std::env::var(&port_var) {
            self.network.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: port_var.clone(),
                value: port,
            })?;
        }

        if let Ok(host) = std::env::var(format!("{ENV_PREFIX}_NETWORK_HOST")) {
            self.network.host = host;
        }

        if let Ok(keys_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_KEYS_DIR")) {
            self.storage.keys_dir = PathBuf::from(keys_dir);
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("network.connection_handlers", self.network.connection_handlers as u64),
            ("network.queue_capacity", self.network.queue_capacity as u64),
            ("network.processing_workers", self.network.processing_workers as u64),
            ("network.socket_timeout_secs", self.network.socket_timeout_secs),
            ("network.fanout_timeout_secs", self.network.fanout_timeout_secs),
            ("network.max_fanout_concurrency", self.network.max_fanout_concurrency as u64),
            ("pool.max_per_peer", self.pool.max_per_peer as u64),
            ("pool.idle_timeout_secs", self.pool.idle_timeout_secs),
            ("crypto.kdf_iterations", u64::from(self.crypto.kdf_iterations)),
            ("crypto.replay_window_capacity", self.crypto.replay_window_capacity as u64),
        ];

        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidValue {
                field: (*field).to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.crypto.modulus_bits < 1024 || self.crypto.modulus_bits % 8 != 0 {
            return Err(ConfigError::InvalidValue {
                field: "crypto.modulus_bits".to_string(),
                value: self.crypto.modulus_bits.to_string(),
            }
            .into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: self.logging.level.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Ensure the keys and peers directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs_to_create = [
            self.storage.keys_dir.clone(),
            self.storage.keys_dir.join(crate::keystore::PEERS_DIR),
        ];

        for dir in &dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
