//! Persisted service metadata and the structured results of lifecycle calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Lifecycle state of a supervised service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Running,
    Crashed,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Crashed => write!(f, "crashed"),
        }
    }
}

/// A registered service: the command to run plus lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    /// Platform the service belongs to. Informational only.
    #[serde(default)]
    pub platform: String,
    pub command: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub log_file: PathBuf,
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Exit code seen when the process was last found dead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
}

fn default_auto_restart() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    5
}

impl ServiceRecord {
    /// Strip state that cannot be trusted across supervisor restarts: a PID
    /// from an earlier run may belong to an unrelated process by now.
    pub(crate) fn normalized(mut self) -> Self {
        self.status = ServiceStatus::Stopped;
        self.pid = None;
        self
    }
}

/// On-disk shape of `services.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ServicesFile {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved: Option<DateTime<Utc>>,
}

/// Point-in-time view of a service, as returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatusReport {
    pub exists: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
}

impl ServiceStatusReport {
    pub(crate) fn missing(name: &str) -> Self {
        Self {
            exists: false,
            name: name.to_string(),
            platform: None,
            status: None,
            pid: None,
            started_at: None,
            restart_count: None,
            log_file: None,
            last_exit_code: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == Some(ServiceStatus::Running)
    }
}

impl From<&ServiceRecord> for ServiceStatusReport {
    fn from(record: &ServiceRecord) -> Self {
        Self {
            exists: true,
            name: record.name.clone(),
            platform: Some(record.platform.clone()),
            status: Some(record.status),
            pid: record.pid,
            started_at: record.started_at,
            restart_count: Some(record.restart_count),
            log_file: Some(record.log_file.clone()),
            last_exit_code: record.last_exit_code,
        }
    }
}

/// Result of a successful `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub name: String,
    pub pid: u32,
    /// True when the service was already running and nothing was spawned.
    pub already_running: bool,
}

impl std::fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.already_running {
            write!(f, "Service '{}' is already running (PID {})", self.name, self.pid)
        } else {
            write!(f, "Service '{}' started with PID {}", self.name, self.pid)
        }
    }
}

/// Result of a successful `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub name: String,
    /// PID of the process that was stopped, if one was tracked.
    pub pid: Option<u32>,
    pub was_running: bool,
    /// True when the grace period expired and SIGKILL was needed.
    pub forced: bool,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.was_running, self.pid) {
            (false, _) => write!(f, "Service '{}' was already stopped", self.name),
            (true, Some(pid)) if self.forced => {
                write!(f, "Service '{}' (PID {pid}) killed after grace period", self.name)
            }
            (true, Some(pid)) => write!(f, "Service '{}' (PID {pid}) stopped", self.name),
            (true, None) => write!(f, "Service '{}' stopped", self.name),
        }
    }
}

/// What the crash watchdog did for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Crashed service was started again.
    Restarted { pid: u32, attempt: u32 },
    /// The restart attempt itself failed; it will be retried next pass.
    Failed { attempt: u32, message: String },
    /// Restart budget exhausted; the service stays crashed.
    GaveUp { restart_count: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ServiceRecord {
        ServiceRecord {
            name: "telegram".into(),
            platform: "telegram".into(),
            command: "sleep 60".into(),
            pid: Some(4242),
            status: ServiceStatus::Running,
            started_at: Some(Utc::now()),
            log_file: PathBuf::from("/tmp/telegram.log"),
            auto_restart: true,
            restart_count: 2,
            max_restarts: 5,
            last_exit_code: None,
        }
    }

    #[test]
    fn test_status_display_and_serde() {
        assert_eq!(ServiceStatus::Crashed.to_string(), "crashed");
        assert_eq!(
            serde_json::to_string(&ServiceStatus::Running).unwrap(),
            "\"running\""
        );
    }

    #[test]
    fn test_normalized_clears_liveness() {
        let r = record().normalized();
        assert_eq!(r.status, ServiceStatus::Stopped);
        assert_eq!(r.pid, None);
        assert_eq!(r.restart_count, 2);
        assert!(r.started_at.is_some());
    }

    #[test]
    fn test_minimal_record_uses_defaults() {
        let json = r#"{"name":"bot","command":"run-bot","log_file":"/tmp/bot.log"}"#;
        let r: ServiceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.status, ServiceStatus::Stopped);
        assert!(r.auto_restart);
        assert_eq!(r.max_restarts, 5);
        assert_eq!(r.platform, "");
    }

    #[test]
    fn test_missing_report_serializes_compactly() {
        let json = serde_json::to_value(ServiceStatusReport::missing("ghost")).unwrap();
        assert_eq!(json, serde_json::json!({"exists": false, "name": "ghost"}));
    }

    #[test]
    fn test_outcome_display() {
        let started = StartOutcome {
            name: "bot".into(),
            pid: 10,
            already_running: false,
        };
        assert_eq!(started.to_string(), "Service 'bot' started with PID 10");

        let stopped = StopOutcome {
            name: "bot".into(),
            pid: Some(10),
            was_running: true,
            forced: true,
        };
        assert_eq!(
            stopped.to_string(),
            "Service 'bot' (PID 10) killed after grace period"
        );
    }

    #[test]
    fn test_recovery_action_tagging() {
        let json = serde_json::to_value(RecoveryAction::GaveUp { restart_count: 5 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "gave_up", "restart_count": 5})
        );
    }
}
