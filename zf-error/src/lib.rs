//! Unified error handling for Zonefan
//!
//! This crate provides the single error type shared by the control engine and
//! the daemon. Variants are grouped by how the daemon reacts to them: configuration
//! problems are fatal at construction, missing executables and privilege problems
//! are fatal immediately, protocol failures are transient, and temperature read
//! failures abort only the current poll.

use std::io;
use std::path::PathBuf;

/// Result type alias using ZonefanError
pub type Result<T> = std::result::Result<T, ZonefanError>;

/// Unified error type for all Zonefan operations
#[derive(thiserror::Error, Debug)]
pub enum ZonefanError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // External Command Errors
    // ============================================================================
    #[error("Command not found: {program}")]
    CommandNotFound {
        program: String,
    },

    #[error("Command '{command}' failed (exit code {exit_code:?}): {stderr}")]
    ProtocolExecution {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Privilege elevation failed for '{command}': {stderr}")]
    Elevation {
        command: String,
        stderr: String,
    },

    #[error("Unexpected response from '{command}': {output:?}")]
    ResponseParse {
        command: String,
        output: String,
    },

    // ============================================================================
    // Hardware Access Errors
    // ============================================================================
    #[error("Failed to read temperature from {source_name}: {reason}")]
    TemperatureRead {
        source_name: String,
        reason: String,
    },

    #[error("Failed to put {device} into standby: {reason}")]
    StandbyForce {
        device: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl ZonefanError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid configuration value error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a temperature read error
    pub fn temperature_read(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TemperatureRead {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Transient errors may succeed when the same operation is repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProtocolExecution { .. } | Self::ResponseParse { .. })
    }

    /// Fatal errors must stop the daemon whatever zone they came from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CommandNotFound { .. }
                | Self::Elevation { .. }
                | Self::Config(_)
                | Self::InvalidConfig { .. }
        )
    }
}

// Allow converting from String to ZonefanError
impl From<String> for ZonefanError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to ZonefanError
impl From<&str> for ZonefanError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
