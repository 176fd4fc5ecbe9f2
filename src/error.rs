//! Error types for the autofire engine.
//!
//! A single `thiserror` enum covers configuration, arming, emission and
//! shutdown failures so callers can match on the kind they care about.

use std::io;
use thiserror::Error;

use crate::config::SlotId;

/// Main error type for autofire operations.
#[derive(Error, Debug)]
pub enum AutofireError {
    /// A slot field failed validation.
    #[error("slot {slot}: invalid {field}: {reason}")]
    Config {
        slot: SlotId,
        field: &'static str,
        reason: String,
    },

    /// The specified key is not in the key table.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Error parsing a key chord such as `ctrl+alt+escape`.
    #[error("invalid key combination '{combo}': {reason}")]
    InvalidKeyCombination { combo: String, reason: String },

    /// Error reading or parsing a configuration file.
    #[error("failed to load config from '{path}': {reason}")]
    ConfigLoad { path: String, reason: String },

    /// Error writing a configuration file.
    #[error("failed to save config to '{path}': {reason}")]
    ConfigSave { path: String, reason: String },

    /// The engine could not be armed.
    #[error("engine error: {0}")]
    Engine(String),

    /// A single key emission failed.
    #[error("failed to emit key '{key}': {reason}")]
    Emission { key: String, reason: String },

    /// One or more loops did not reach idle before the stop timeout.
    #[error("slots {} did not stop within the timeout", join_ids(.slots))]
    Shutdown { slots: Vec<SlotId> },

    /// Platform-specific operation is not supported.
    #[error("operation not supported on this platform: {0}")]
    UnsupportedPlatform(String),

    /// Error registering or handling a global hotkey or keyboard hook.
    #[error("hotkey error: {0}")]
    Hotkey(String),

    /// The config file could not be watched for changes.
    #[error("config watch error: {0}")]
    Watch(#[from] notify::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for autofire operations.
pub type Result<T> = std::result::Result<T, AutofireError>;

fn join_ids(ids: &[SlotId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl AutofireError {
    /// Create a new Config error for one slot field.
    pub fn config(slot: SlotId, field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            slot,
            field,
            reason: reason.into(),
        }
    }

    /// Create a new InvalidKey error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a new InvalidKeyCombination error.
    pub fn invalid_key_combination(combo: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKeyCombination {
            combo: combo.into(),
            reason: reason.into(),
        }
    }

    /// Create a new ConfigLoad error.
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new ConfigSave error.
    pub fn config_save(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigSave {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Engine error.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Create a new Emission error.
    pub fn emission(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Emission {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Shutdown error.
    pub fn shutdown(slots: Vec<SlotId>) -> Self {
        Self::Shutdown { slots }
    }

    /// Create a new UnsupportedPlatform error.
    pub fn unsupported_platform(message: impl Into<String>) -> Self {
        Self::UnsupportedPlatform(message.into())
    }

    /// Create a new Hotkey error.
    pub fn hotkey(message: impl Into<String>) -> Self {
        Self::Hotkey(message.into())
    }
}
