//! Kernel configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! is a valid configuration:
//!
//! ```toml
//! [kernel]
//! device = "/dev/db"
//! degraded_reads = false
//! event_capacity = 256
//! lock_owner = "grimoire"
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 50
//! max_delay_ms = 2000
//! backoff = "exponential"
//!
//! [store]
//! path = "grimoire.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::{Backoff, RetryPolicy};

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub kernel: KernelSection,
    pub retry: RetryConfig,
    pub store: StoreConfig,
}

/// `[kernel]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSection {
    /// Device path the default capability is mounted at.
    pub device: String,
    /// Serve placeholder records when every real tier fails.
    pub degraded_reads: bool,
    /// Buffer size for broadcast event subscribers.
    pub event_capacity: usize,
    /// Prefix of lock owner tokens.
    pub lock_owner: String,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            device: "/dev/db".to_string(),
            degraded_reads: false,
            event_capacity: 256,
            lock_owner: "grimoire".to_string(),
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff: policy.backoff,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff: self.backoff,
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl KernelConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.kernel.device.starts_with("/dev/") {
            return Err(ConfigError::Invalid(format!(
                "kernel.device must live under /dev, got {:?}",
                self.kernel.device
            )));
        }
        if self.kernel.event_capacity == 0 {
            return Err(ConfigError::Invalid("kernel.event_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Turn degraded reads on or off.
    pub fn with_degraded_reads(mut self, enabled: bool) -> Self {
        self.kernel.degraded_reads = enabled;
        self
    }

    /// Set the default device path.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.kernel.device = device.into();
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, policy: &RetryPolicy) -> Self {
        self.retry = RetryConfig {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff: policy.backoff,
        };
        self
    }

    /// Set the SQLite store path.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_default() {
        let config = KernelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.kernel.device, "/dev/db");
        assert!(!config.kernel.degraded_reads);
    }

    #[test]
    fn test_partial_sections() {
        let config = KernelConfig::from_toml_str(
            r#"
            [kernel]
            degraded_reads = true

            [retry]
            max_attempts = 7
            backoff = "linear"
            "#,
        )
        .unwrap();
        assert!(config.kernel.degraded_reads);
        assert_eq!(config.kernel.event_capacity, 256);

        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.backoff, Backoff::Linear);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_rejects_bad_device() {
        let err = KernelConfig::from_toml_str("[kernel]\ndevice = \"/proc/db\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(matches!(
            KernelConfig::from_toml_str("[kernel]\ndevice = 3\n").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grimoire.toml");
        std::fs::write(&path, "[store]\npath = \"/tmp/g.db\"\n").unwrap();
        let config = KernelConfig::load(&path).unwrap();
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/g.db")));

        assert!(matches!(
            KernelConfig::load(dir.path().join("missing.toml")).unwrap_err(),
            ConfigError::Read { .. }
        ));
    }

    #[test]
    fn test_builders() {
        let config = KernelConfig::default()
            .with_degraded_reads(true)
            .with_retry(&RetryPolicy::none())
            .with_store_path("x.db");
        assert!(config.kernel.degraded_reads);
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.validate().is_ok());
    }
}
