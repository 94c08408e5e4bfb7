//! Configuration system for Anubis.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! Configuration is loaded from `~/.config/anubis/config.toml` and/or `.anubis/config.toml`
//! in the workspace directory, plus an optional explicit file.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration for the Anubis supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnubisConfig {
    /// Root directory for sessions, services and logs. Falls back to the
    /// platform data directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

/// Process supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds to wait after SIGTERM before sending SIGKILL.
    pub grace_period_secs: u64,
    /// Pause between stop and start during a restart, in milliseconds.
    pub restart_pause_ms: u64,
    /// Crash restarts allowed per service before the watchdog gives up.
    pub max_restarts: u32,
    /// Default number of lines shown by log tailing.
    pub log_tail_lines: usize,
    /// Shell used to interpret service commands.
    pub shell: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
            restart_pause_ms: 1000,
            max_restarts: 5,
            log_tail_lines: 50,
            shell: "sh".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

/// Crash-recovery watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Whether the interactive console runs the watchdog in the background.
    pub enabled: bool,
    /// Seconds between crash checks.
    pub interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 10,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Platform connector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Upper bound on a single connection handler invocation.
    pub handler_timeout_secs: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 30,
        }
    }
}

impl ConnectorConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

impl AnubisConfig {
    /// Resolve the data directory: explicit setting first, then the
    /// platform-specific data directory.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        directories::ProjectDirs::from("dev", "anubis", "anubis")
            .map(|d| d.data_dir().to_path_buf())
            .ok_or(ConfigError::NoDataDir)
    }

    /// Directory holding credential snapshots.
    pub fn sessions_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("sessions"))
    }

    /// Directory holding the services snapshot and per-service logs.
    pub fn services_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("services"))
    }

    /// Validate values that would make the supervisor misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.shell.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "supervisor.shell must not be empty".into(),
            });
        }
        if self.connector.handler_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "connector.handler_timeout_secs must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `ANUBIS_`)
/// 2. Explicit config file (passed as argument)
/// 3. Workspace-local config (`.anubis/config.toml`)
/// 4. User config (`~/.config/anubis/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<AnubisConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(AnubisConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    // ANUBIS_SUPERVISOR__GRACE_PERIOD_SECS, ANUBIS_DATA_DIR, etc.
    figment = figment.merge(Env::prefixed("ANUBIS_").split("__"));

    figment.extract().map_err(Box::new)
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "anubis", "anubis")
        .map(|d| d.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".anubis").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnubisConfig::default();
        assert_eq!(config.supervisor.grace_period_secs, 5);
        assert_eq!(config.supervisor.restart_pause_ms, 1000);
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.supervisor.shell, "sh");
        assert!(!config.watchdog.enabled);
        assert_eq!(config.connector.handler_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AnubisConfig::default();
        config.data_dir = Some(PathBuf::from("/var/lib/anubis"));
        config.supervisor.grace_period_secs = 2;
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: AnubisConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.data_dir, config.data_dir);
        assert_eq!(deserialized.supervisor.grace_period_secs, 2);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let anubis_dir = dir.path().join(".anubis");
        std::fs::create_dir_all(&anubis_dir).unwrap();
        std::fs::write(
            anubis_dir.join("config.toml"),
            r#"
[supervisor]
grace_period_secs = 1
restart_pause_ms = 50
max_restarts = 2
log_tail_lines = 10
shell = "sh"

[watchdog]
enabled = true
interval_secs = 3
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.supervisor.grace_period_secs, 1);
        assert_eq!(config.supervisor.max_restarts, 2);
        assert!(config.watchdog.enabled);
        assert_eq!(config.watchdog.interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_explicit_file_overrides_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let anubis_dir = dir.path().join(".anubis");
        std::fs::create_dir_all(&anubis_dir).unwrap();
        std::fs::write(
            anubis_dir.join("config.toml"),
            "[connector]\nhandler_timeout_secs = 7\n",
        )
        .unwrap();
        let explicit = dir.path().join("override.toml");
        std::fs::write(&explicit, "[connector]\nhandler_timeout_secs = 9\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.connector.handler_timeout_secs, 9);
    }

    #[test]
    fn test_data_dir_layout() {
        let config = AnubisConfig {
            data_dir: Some(PathBuf::from("/tmp/anubis-test")),
            ..Default::default()
        };
        assert_eq!(
            config.sessions_dir().unwrap(),
            PathBuf::from("/tmp/anubis-test/sessions")
        );
        assert_eq!(
            config.services_dir().unwrap(),
            PathBuf::from("/tmp/anubis-test/services")
        );
    }

    #[test]
    fn test_validate_rejects_empty_shell() {
        let mut config = AnubisConfig::default();
        config.supervisor.shell = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
