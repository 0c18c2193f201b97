//! Configuration of stream caching and buffering.
//!
//! Settings may be given in a TOML file. Every field has a default, so an empty file (or no file at
//! all) is a valid configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{cache::keyed::DEFAULT_LOCK_SHARDS, stream::BufferOptions};

/// Keyed cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Number of generation locks shared by all keys of one cache.
    pub lock_shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_shards: DEFAULT_LOCK_SHARDS,
        }
    }
}

/// Buffering of streamed content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StreamConfig {
    /// Capacity reserved before the first read of a stream.
    pub initial_capacity: ByteSize,

    /// Capacity past which a buffer grows linearly instead of tripling.
    pub slow_growth: ByteSize,

    /// How long a stream may stay quiet before a waiting opener is released, in milliseconds.
    pub idle_confirm_ms: u64,

    /// Longest an opener waits for a stream to settle, in milliseconds.
    pub max_confirm_ms: u64,

    /// How long an opened stream stays shared, in seconds.
    pub ttl_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let options = BufferOptions::default();
        Self {
            initial_capacity: ByteSize::b(options.initial_capacity as u64),
            slow_growth: ByteSize::b(options.slow_growth as u64),
            idle_confirm_ms: 100,
            max_confirm_ms: 5_000,
            ttl_secs: 300,
        }
    }
}

impl StreamConfig {
    /// How long an opened stream stays in its cache.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Buffer options described by this section. Sizes beyond the address space saturate.
    #[must_use]
    pub fn buffer_options(&self) -> BufferOptions {
        BufferOptions {
            initial_capacity: usize::try_from(self.initial_capacity.as_u64()).unwrap_or(usize::MAX),
            slow_growth: usize::try_from(self.slow_growth.as_u64()).unwrap_or(usize::MAX),
            idle_confirm: Duration::from_millis(self.idle_confirm_ms),
            max_confirm: Duration::from_millis(self.max_confirm_ms),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Keyed cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Streaming buffer settings.
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Failures while loading or writing a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration parsed but is not usable.
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    /// The configuration could not be rendered as TOML.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    /// The file is not valid TOML for this structure.
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// The file could not be read.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// # Errors
    ///
    /// Every validation message at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cache.lock_shards == 0 {
            errors.push("cache.lock-shards must be at least 1.".to_owned());
        }
        if self.stream.initial_capacity.as_u64() == 0 {
            errors.push("stream.initial-capacity must be non-zero.".to_owned());
        }
        if self.stream.slow_growth.as_u64() == 0 {
            errors.push("stream.slow-growth must be non-zero.".to_owned());
        }
        if self.stream.idle_confirm_ms > self.stream.max_confirm_ms {
            errors.push(format!(
                "stream.idle-confirm-ms ({}) exceeds stream.max-confirm-ms ({}).",
                self.stream.idle_confirm_ms, self.stream.max_confirm_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("gatefs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("gatefs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/gatefs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Malformed TOML or a configuration that fails [`validate`](Self::validate).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Loads config from a single TOML file.
    ///
    /// # Errors
    ///
    /// The file cannot be read, or [`from_toml`](Self::from_toml) rejects it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads the external path if given, otherwise the first config file found, otherwise the
    /// defaults.
    ///
    /// # Errors
    ///
    /// A config file exists but cannot be loaded.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = external_config_path
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file);

        match path {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Serialization failed.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
