//! Error types for the hostpipe host side
//!
//! Domain errors use thiserror, one enum per subsystem, with conversions
//! provided at the host boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level host error
#[derive(Debug, Error)]
pub enum HostError {
    /// Settings persistence errors
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Addon loading/lifecycle errors
    #[error("Addon error: {0}")]
    Addon(#[from] AddonError),

    /// Script evaluation errors
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Initialization errors
    #[error("Initialization failed: {0}")]
    Init(String),
}

/// Settings-store errors
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where the write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for settings operations
pub type SettingsResult<T> = std::result::Result<T, SettingsError>;

/// Addon loading and lifecycle errors
#[derive(Debug, Error)]
pub enum AddonError {
    /// Manifest file not found
    #[error("Addon manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    /// Manifest did not validate
    #[error("Invalid addon manifest: {0}")]
    InvalidManifest(String),

    /// Condition block names a gate with no registered factory
    #[error("Unknown condition gate '{0}'")]
    UnknownGate(String),

    /// Addon id is not loaded
    #[error("Addon '{0}' is not loaded")]
    UnknownAddon(String),

    /// Operation requires a tutorial addon
    #[error("Addon '{0}' is not a tutorial")]
    NotATutorial(String),

    /// Operation requires the addon's condition to be enabled
    #[error("Addon '{0}' is disabled")]
    Disabled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for addon operations
pub type AddonResult<T> = std::result::Result<T, AddonError>;

/// Failure raised by a condition or signal-handler script.
///
/// Script failures are isolated: the bus and the condition engine log them
/// and carry on; a failed condition evaluation leaves the content hidden.
#[derive(Debug, Clone, Error)]
#[error("script evaluation failed: {0}")]
pub struct ScriptError(pub String);

impl ScriptError {
    /// Build a script error from any displayable cause.
    pub fn new(detail: impl std::fmt::Display) -> Self {
        ScriptError(detail.to_string())
    }
}

/// Convenience result alias for script evaluation
pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Result type using HostError
pub type Result<T> = std::result::Result<T, HostError>;
