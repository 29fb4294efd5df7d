//! Channel and stream configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RPCWIRE_CONFIG or an explicit path)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default request timeout (30 seconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default cap on concurrently open streams per manager.
pub const DEFAULT_MAX_STREAMS: i64 = 1024;

/// Default stream inactivity timeout (30 seconds).
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 30_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-channel settings.
    pub channel: ChannelConfig,
    /// Binary stream settings.
    pub streams: StreamConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RPCWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.channel.apply_env_overrides();
        self.streams.apply_env_overrides();
    }
}

/// Per-channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Request timeout in milliseconds (0 = wait forever).
    pub timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Disables request timeouts.
    pub fn without_timeout(mut self) -> Self {
        self.timeout_ms = 0;
        self
    }

    /// Returns the request timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("RPCWIRE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.timeout_ms = ms;
            }
        }
    }
}

/// How many streams a manager may hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCapacity {
    /// Stream creation always fails with `cmd_not_impl`.
    Disabled,
    /// At most this many open streams.
    Limited(usize),
    Unlimited,
}

impl From<i64> for StreamCapacity {
    fn from(max_streams: i64) -> Self {
        match max_streams {
            0 => StreamCapacity::Disabled,
            n if n < 0 => StreamCapacity::Unlimited,
            n => StreamCapacity::Limited(n as usize),
        }
    }
}

/// Binary stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Maximum open streams: -1 unlimited, 0 disabled, N capped.
    pub max_streams: i64,
    /// Inactivity timeout in milliseconds (0 = none).
    pub timeout_ms: u64,
    /// Whether channels of this process share one stream manager.
    pub shared: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            timeout_ms: DEFAULT_STREAM_TIMEOUT_MS,
            shared: false,
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_streams(mut self, max_streams: i64) -> Self {
        self.max_streams = max_streams;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout_ms = 0;
        self
    }

    pub fn capacity(&self) -> StreamCapacity {
        StreamCapacity::from(self.max_streams)
    }

    /// Returns the inactivity timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("RPCWIRE_MAX_STREAMS") {
            if let Ok(n) = max.parse() {
                self.max_streams = n;
            }
        }

        if let Ok(timeout) = std::env::var("RPCWIRE_STREAM_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.timeout_ms = ms;
            }
        }

        if let Ok(shared) = std::env::var("RPCWIRE_SHARED_STREAMS") {
            self.shared = shared == "1" || shared.to_lowercase() == "true";
        }
    }
}
