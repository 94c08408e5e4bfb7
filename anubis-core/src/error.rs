//! Error types for the Anubis supervisor core.
//!
//! Uses `thiserror` for public API error types with structured error variants,
//! one enum per domain.

use std::path::PathBuf;

/// Errors from the process supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service '{name}' not found")]
    NotFound { name: String },

    #[error("Service '{name}' failed to launch: {message}")]
    LaunchFailed { name: String, message: String },

    /// Graceful stop did not finish in time. Logged, never returned: the
    /// forced kill path absorbs it.
    #[error("Service '{name}' ignored termination for {grace_secs}s, escalating to kill")]
    TerminationTimeout { name: String, grace_secs: u64 },

    #[error("Failed to signal service '{name}' (PID {pid}): {message}")]
    Signal {
        name: String,
        pid: u32,
        message: String,
    },

    #[error("Failed to persist service state to {path}: {message}")]
    Persistence { path: PathBuf, message: String },
}

impl ServiceError {
    /// Service name the error refers to, if any.
    pub fn service_name(&self) -> Option<&str> {
        match self {
            ServiceError::NotFound { name }
            | ServiceError::LaunchFailed { name, .. }
            | ServiceError::TerminationTimeout { name, .. }
            | ServiceError::Signal { name, .. } => Some(name),
            ServiceError::Persistence { .. } => None,
        }
    }
}

/// Errors from the credential store.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("No credential stored for '{key}'")]
    NotFound { key: String },

    #[error("Failed to persist credentials to {path}: {message}")]
    Persistence { path: PathBuf, message: String },
}

/// Errors from the platform connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Connection handler for '{platform}' failed: {message}")]
    HandlerFailed { platform: String, message: String },

    #[error("Connection handler for '{platform}' timed out after {timeout_secs}s")]
    HandlerTimeout { platform: String, timeout_secs: u64 },

    #[error("Setup of '{platform}' aborted at {step}: {message}")]
    SetupAborted {
        platform: String,
        step: String,
        message: String,
    },

    #[error("Bootstrap command for '{platform}' references unknown credential '{{{{{placeholder}}}}}'")]
    UnresolvedPlaceholder {
        platform: String,
        placeholder: String,
    },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Could not determine a data directory")]
    NoDataDir,
}
