//! Endpoint configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PARLEY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/parley/config.toml
//!   3. ~/.config/parley/config.toml

use crate::codec::{validate_chunk_size, MAX_BYTES_PER_CHUNK};
use crate::error::{ErrorKind, ParleyError};
use crate::wire::{DEFAULT_EVENT_KIND, DEFAULT_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Relay event kind used for the subscription and every publish.
    pub kind: u16,
    /// Upper bound on the sealed size of one published chunk.
    pub max_bytes_per_chunk: usize,
    /// Lifetime of requests and responses unless overridden per call.
    pub default_timeout_ms: u64,
    /// If false, every inbound chunk is treated as `unknown`.
    pub validate_authenticity: bool,
    /// If true, `send()` waits for the relay to acknowledge every chunk.
    pub wait_for_transport_ack: bool,
    /// Largest response payload advertised on outgoing requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_size: Option<u64>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_EVENT_KIND,
            max_bytes_per_chunk: MAX_BYTES_PER_CHUNK,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            validate_authenticity: false,
            wait_for_transport_ack: false,
            max_response_size: None,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("parley")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ParleyError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EndpointConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Reject out-of-range values. Nothing is clamped.
    pub fn validate(&self) -> Result<(), ParleyError> {
        validate_chunk_size(self.max_bytes_per_chunk)?;
        validate_max_response_size(self.max_response_size)?;
        Ok(())
    }

    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EndpointConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PARLEY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EndpointConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PARLEY_* env var overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("PARLEY_KIND") {
            self.kind = v;
        }
        if let Some(v) = env_parse("PARLEY_MAX_BYTES_PER_CHUNK") {
            self.max_bytes_per_chunk = v;
        }
        if let Some(v) = env_parse("PARLEY_DEFAULT_TIMEOUT_MS") {
            self.default_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("PARLEY_VALIDATE_AUTHENTICITY") {
            self.validate_authenticity = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("PARLEY_WAIT_FOR_TRANSPORT_ACK") {
            self.wait_for_transport_ack = v == "true" || v == "1";
        }
        if let Some(v) = env_parse("PARLEY_MAX_RESPONSE_SIZE") {
            self.max_response_size = Some(v);
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// An advertised response limit must be positive when present.
pub fn validate_max_response_size(size: Option<u64>) -> Result<(), ParleyError> {
    match size {
        Some(0) => Err(ParleyError::new(
            ErrorKind::InvalidMaxBytesPerRequest,
            "max response size must be greater than zero",
        )),
        _ => Ok(()),
    }
}
