//! # Anubis Core
//!
//! Core library for the Anubis service supervisor.
//! Provides the credential store, the process supervisor with its crash
//! watchdog, the platform connector that composes them, configuration, and
//! the error taxonomy.

pub mod config;
pub mod connector;
pub mod credentials;
pub mod error;
pub mod persistence;
pub mod supervisor;

// Re-export commonly used types at the crate root.
pub use config::{AnubisConfig, ConnectorConfig, SupervisorConfig, WatchdogConfig, load_config};
pub use connector::{
    ConnectionHandler, PlatformConnector, PlatformStatus, ServiceHandler, SetupReport, SetupStep,
    SetupStepKind,
};
pub use credentials::{
    ApiKeyRecord, ApiKeySummary, Attributes, CredentialStore, Credentials, PlatformCredential,
};
pub use error::{ConfigError, ConnectorError, CredentialError, ServiceError};
pub use supervisor::{
    ProcessSupervisor, RecoveryAction, ServiceRecord, ServiceStatus, ServiceStatusReport,
    StartOutcome, StopOutcome, Watchdog,
};
