//! Custom error types for Ralph.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the application.
//! Engine transport failures have their own type ([`EngineError`]) because
//! they are carried inside iteration outcomes rather than propagated.

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineError;

/// Main error type for Ralph operations
#[derive(Error, Debug)]
pub enum RalphError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Missing required file
    #[error("Missing required file: {path}")]
    MissingFile { path: PathBuf },

    // =========================================================================
    // Loop Execution Errors
    // =========================================================================
    /// A run was asked to start at an iteration outside its plan
    #[error("Cannot start at iteration {start} of a {total}-iteration plan")]
    InvalidResume { start: u32, total: u32 },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Loop state could not be read or written
    #[error("Loop state error: {message}")]
    State { message: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Agent engine failure surfaced outside an iteration
    #[error(transparent)]
    Engine(#[from] EngineError),

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RalphError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a state persistence error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Engine(EngineError::CliNotFound { .. }) | Self::MissingFile { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } | Self::InvalidResume { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for Ralph results
pub type Result<T> = std::result::Result<T, RalphError>;
