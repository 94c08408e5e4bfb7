//! Process supervisor for long-running background services.
//!
//! Registers named services (a shell command plus metadata), launches them as
//! detached children, and stops them graceful-then-forced. Metadata is
//! persisted to `services.json`; liveness is not. A PID read back from disk
//! may belong to an unrelated process by now, so every service loads as
//! `stopped` and only the in-memory child handle held by this instance is
//! trusted to say whether a service is running.
//!
//! Lifecycle calls on the same service name are serialized by a per-name
//! async mutex. The shared maps sit behind a std mutex that is never held
//! across an await point.

mod process;
mod record;
pub mod watchdog;

pub use process::process_exists;
pub use record::{
    RecoveryAction, ServiceRecord, ServiceStatus, ServiceStatusReport, StartOutcome, StopOutcome,
};
pub use watchdog::Watchdog;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::ServiceError;
use crate::persistence::{atomic_write_json, load_json_or_default, read_tail};
use process::Termination;
use record::ServicesFile;

/// Why a service is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartReason {
    /// Operator request: resets the crash restart budget.
    Manual,
    /// Watchdog recovery of a crashed service.
    Recovery,
}

/// Result of polling a tracked child handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlePoll {
    Untracked,
    Alive,
    Exited,
}

#[derive(Default)]
struct SupervisorState {
    services: BTreeMap<String, ServiceRecord>,
    handles: HashMap<String, Child>,
    /// Services the watchdog already reported as out of restarts.
    exhausted: HashSet<String>,
}

impl SupervisorState {
    /// Poll the handle for `name` without blocking. An exited handle is
    /// released and the record marked crashed.
    fn poll_handle(&mut self, name: &str) -> HandlePoll {
        let Some(child) = self.handles.get_mut(name) else {
            return HandlePoll::Untracked;
        };
        let exit_code = match child.try_wait() {
            Ok(None) => return HandlePoll::Alive,
            Ok(Some(status)) => status.code(),
            Err(e) => {
                warn!(service = %name, error = %e, "Failed to poll service process");
                None
            }
        };
        self.handles.remove(name);
        if let Some(record) = self.services.get_mut(name) {
            warn!(
                service = %name,
                pid = ?record.pid,
                exit_code = ?exit_code,
                "Service process exited unexpectedly"
            );
            record.status = ServiceStatus::Crashed;
            record.pid = None;
            record.last_exit_code = exit_code;
        }
        HandlePoll::Exited
    }
}

/// Supervises named external processes backed by a durable services file.
pub struct ProcessSupervisor {
    services_file: PathBuf,
    work_dir: PathBuf,
    logs_dir: PathBuf,
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProcessSupervisor {
    /// Open the supervisor rooted at `services_dir`.
    ///
    /// Loads `services.json` if present (a missing or corrupt file yields an
    /// empty registry) and normalizes every record to `stopped`.
    pub fn open(services_dir: impl Into<PathBuf>, config: SupervisorConfig) -> Self {
        let dir = services_dir.into();
        let services_file = dir.join("services.json");
        let logs_dir = dir.join("logs");
        let work_dir = dir.parent().map(Path::to_path_buf).unwrap_or_else(|| dir.clone());

        let file: ServicesFile = load_json_or_default(&services_file, "services");
        let services: BTreeMap<String, ServiceRecord> = file
            .services
            .into_iter()
            .map(|(name, record)| (name, record.normalized()))
            .collect();
        debug!(count = services.len(), "Loaded service registry");

        Self {
            services_file,
            work_dir,
            logs_dir,
            config,
            state: Mutex::new(SupervisorState {
                services,
                ..Default::default()
            }),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Like `name_lock`, but never creates a lock for a name that was never
    /// registered.
    fn service_lock(&self, name: &str) -> Result<Arc<tokio::sync::Mutex<()>>, ServiceError> {
        if let Some(lock) = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(lock.clone());
        }
        if !self.state().services.contains_key(name) {
            return Err(Self::not_found(name));
        }
        Ok(self.name_lock(name))
    }

    fn persist(&self, state: &SupervisorState) -> Result<(), ServiceError> {
        let file = ServicesFile {
            services: state.services.clone(),
            last_saved: Some(Utc::now()),
        };
        atomic_write_json(&self.services_file, &file).map_err(|e| {
            error!(path = %self.services_file.display(), error = %e, "Failed to persist services");
            ServiceError::Persistence {
                path: self.services_file.clone(),
                message: e.to_string(),
            }
        })
    }

    fn not_found(name: &str) -> ServiceError {
        ServiceError::NotFound {
            name: name.to_string(),
        }
    }

    // ── Registration ───────────────────────────────────────────────────────

    /// Create or overwrite the metadata for `name`. Starts nothing.
    ///
    /// Re-registering a running service updates its command for the next
    /// start but leaves the live process tracked.
    pub async fn register(
        &self,
        name: &str,
        platform: &str,
        command: &str,
        auto_restart: bool,
    ) -> Result<ServiceRecord, ServiceError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let mut state = self.state();
        let live = state.poll_handle(name) == HandlePoll::Alive;
        let previous = state.services.get(name).cloned();

        let mut record = ServiceRecord {
            name: name.to_string(),
            platform: platform.to_string(),
            command: command.to_string(),
            pid: None,
            status: ServiceStatus::Stopped,
            started_at: None,
            log_file: self.logs_dir.join(format!("{name}.log")),
            auto_restart,
            restart_count: 0,
            max_restarts: self.config.max_restarts,
            last_exit_code: None,
        };
        if let Some(prev) = previous.filter(|_| live) {
            record.pid = prev.pid;
            record.status = prev.status;
            record.started_at = prev.started_at;
        }

        state.services.insert(name.to_string(), record.clone());
        state.exhausted.remove(name);
        self.persist(&state)?;
        info!(service = %name, platform, "Registered service");
        Ok(record)
    }

    /// Snapshot of a service's metadata.
    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.state().services.get(name).cloned()
    }

    /// Names of all registered services, sorted.
    pub fn names(&self) -> Vec<String> {
        self.state().services.keys().cloned().collect()
    }

    // ── Start ──────────────────────────────────────────────────────────────

    /// Start `name`. A service that is already running is left alone and
    /// reported with `already_running = true`.
    pub async fn start(&self, name: &str) -> Result<StartOutcome, ServiceError> {
        let lock = self.service_lock(name)?;
        let _guard = lock.lock().await;
        self.start_locked(name, StartReason::Manual)
    }

    fn start_locked(&self, name: &str, reason: StartReason) -> Result<StartOutcome, ServiceError> {
        let (command, log_file) = {
            let mut state = self.state();
            let poll = state.poll_handle(name);
            let record = state.services.get(name).ok_or_else(|| Self::not_found(name))?;
            if poll == HandlePoll::Alive {
                let pid = record.pid.unwrap_or_default();
                debug!(service = %name, pid, "Start requested for running service");
                return Ok(StartOutcome {
                    name: name.to_string(),
                    pid,
                    already_running: true,
                });
            }
            (record.command.clone(), record.log_file.clone())
        };

        let spawned = process::spawn_detached(
            name,
            &self.config.shell,
            &command,
            &self.work_dir,
            &log_file,
        )
            .and_then(|child| match child.id() {
                Some(pid) => Ok((child, pid)),
                None => Err(std::io::Error::other("process exited before its PID was read")),
            });

        let mut state = self.state();
        let Some(record) = state.services.get_mut(name) else {
            return Err(Self::not_found(name));
        };

        match spawned {
            Ok((child, pid)) => {
                record.pid = Some(pid);
                record.status = ServiceStatus::Running;
                record.started_at = Some(Utc::now());
                record.last_exit_code = None;
                if reason == StartReason::Manual {
                    record.restart_count = 0;
                }
                state.handles.insert(name.to_string(), child);
                if reason == StartReason::Manual {
                    state.exhausted.remove(name);
                }
                info!(service = %name, pid, "Service started");
                self.persist(&state)?;
                Ok(StartOutcome {
                    name: name.to_string(),
                    pid,
                    already_running: false,
                })
            }
            Err(e) => {
                record.status = ServiceStatus::Crashed;
                record.pid = None;
                error!(service = %name, command = %command, error = %e, "Service failed to launch");
                if let Err(persist_err) = self.persist(&state) {
                    warn!(service = %name, error = %persist_err, "Launch failure not persisted");
                }
                Err(ServiceError::LaunchFailed {
                    name: name.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    // ── Stop ───────────────────────────────────────────────────────────────

    /// Stop `name`: SIGTERM to its process group, then SIGKILL once the
    /// grace period runs out. Succeeds without doing anything when no live
    /// process is tracked.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome, ServiceError> {
        let lock = self.service_lock(name)?;
        let _guard = lock.lock().await;
        self.stop_locked(name).await
    }

    async fn stop_locked(&self, name: &str) -> Result<StopOutcome, ServiceError> {
        let tracked = {
            let mut state = self.state();
            if !state.services.contains_key(name) {
                return Err(Self::not_found(name));
            }
            state.handles.remove(name)
        };

        let Some(mut child) = tracked else {
            let mut state = self.state();
            let changed = match state.services.get_mut(name) {
                Some(record) if record.status != ServiceStatus::Stopped || record.pid.is_some() => {
                    record.status = ServiceStatus::Stopped;
                    record.pid = None;
                    true
                }
                _ => false,
            };
            if changed {
                self.persist(&state)?;
            }
            debug!(service = %name, "Stop requested for service that is not running");
            return Ok(StopOutcome {
                name: name.to_string(),
                pid: None,
                was_running: false,
                forced: false,
            });
        };

        let pid = child.id();
        let grace = self.config.grace_period();
        let mut was_running = true;
        let mut forced = false;

        if let Some(pid) = pid {
            info!(service = %name, pid, "Stopping service");
            match process::terminate(&mut child, pid, grace).await {
                Ok(Termination::Graceful) => {}
                Ok(Termination::AlreadyExited) => was_running = false,
                Ok(Termination::Forced) => {
                    forced = true;
                    let timeout = ServiceError::TerminationTimeout {
                        name: name.to_string(),
                        grace_secs: grace.as_secs(),
                    };
                    warn!(service = %name, pid, "{timeout}");
                }
                Err(e) => {
                    forced = true;
                    let failure = ServiceError::Signal {
                        name: name.to_string(),
                        pid,
                        message: e.to_string(),
                    };
                    error!(service = %name, pid, "{failure}");
                }
            }
        } else {
            was_running = false;
        }

        let mut state = self.state();
        if let Some(record) = state.services.get_mut(name) {
            record.status = ServiceStatus::Stopped;
            record.pid = None;
        }
        self.persist(&state)?;
        info!(service = %name, forced, "Service stopped");
        Ok(StopOutcome {
            name: name.to_string(),
            pid,
            was_running,
            forced,
        })
    }

    // ── Restart ────────────────────────────────────────────────────────────

    /// Stop, pause briefly, start. A stop failure is logged and the start is
    /// attempted anyway.
    pub async fn restart(&self, name: &str) -> Result<StartOutcome, ServiceError> {
        let lock = self.service_lock(name)?;
        let _guard = lock.lock().await;

        if let Err(e) = self.stop_locked(name).await {
            if matches!(e, ServiceError::NotFound { .. }) {
                return Err(e);
            }
            warn!(service = %name, error = %e, "Stop during restart failed, starting anyway");
        }
        tokio::time::sleep(self.config.restart_pause()).await;
        self.start_locked(name, StartReason::Manual)
    }

    // ── Queries ────────────────────────────────────────────────────────────

    /// Current status of `name`. Polls the live handle without blocking; a
    /// process that died since the last check is reported as crashed.
    pub fn status(&self, name: &str) -> ServiceStatusReport {
        let mut state = self.state();
        if state.poll_handle(name) == HandlePoll::Exited
            && let Err(e) = self.persist(&state)
        {
            warn!(service = %name, error = %e, "Crash state not persisted");
        }
        state
            .services
            .get(name)
            .map(ServiceStatusReport::from)
            .unwrap_or_else(|| ServiceStatusReport::missing(name))
    }

    /// Status of every registered service, sorted by name.
    pub fn list(&self) -> Vec<ServiceStatusReport> {
        self.names().iter().map(|name| self.status(name)).collect()
    }

    /// True when this supervisor holds a live handle for `name`.
    pub fn is_running(&self, name: &str) -> bool {
        self.status(name).is_running()
    }

    /// Last `lines` lines of the service's log file.
    pub fn tail_log(&self, name: &str, lines: usize) -> Result<String, ServiceError> {
        let log_file = self
            .get(name)
            .map(|r| r.log_file)
            .ok_or_else(|| Self::not_found(name))?;
        if !log_file.exists() {
            return Ok("No logs available".to_string());
        }
        read_tail(&log_file, lines).or_else(|e| Ok(format!("Error reading logs: {e}")))
    }

    // ── Batch operations ───────────────────────────────────────────────────

    /// Start every registered service. Failures are collected per service.
    pub async fn start_all(&self) -> BTreeMap<String, Result<StartOutcome, ServiceError>> {
        let mut results = BTreeMap::new();
        for name in self.names() {
            let result = self.start(&name).await;
            if let Err(e) = &result {
                warn!(service = %name, error = %e, "Batch start failed for service");
            }
            results.insert(name, result);
        }
        results
    }

    /// Stop every registered service. Failures are collected per service.
    pub async fn stop_all(&self) -> BTreeMap<String, Result<StopOutcome, ServiceError>> {
        let mut results = BTreeMap::new();
        for name in self.names() {
            let result = self.stop(&name).await;
            if let Err(e) = &result {
                warn!(service = %name, error = %e, "Batch stop failed for service");
            }
            results.insert(name, result);
        }
        results
    }

    // ── Deletion ───────────────────────────────────────────────────────────

    /// Stop `name` if it is running, then forget it.
    pub async fn delete(&self, name: &str) -> Result<ServiceRecord, ServiceError> {
        let lock = self.service_lock(name)?;
        let _guard = lock.lock().await;

        let tracked = self.state().handles.contains_key(name);
        if tracked && let Err(e) = self.stop_locked(name).await {
            warn!(service = %name, error = %e, "Stop before delete failed");
        }

        let mut state = self.state();
        let removed = state
            .services
            .remove(name)
            .ok_or_else(|| Self::not_found(name))?;
        state.handles.remove(name);
        state.exhausted.remove(name);
        self.persist(&state)?;
        drop(state);

        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        info!(service = %name, "Deleted service");
        Ok(removed)
    }

    // ── Crash recovery ─────────────────────────────────────────────────────

    /// One watchdog pass: restart crashed services that opted into
    /// auto-restart, up to their `max_restarts` budget.
    ///
    /// Only services that were acted on appear in the result. A service that
    /// ran out of restarts is reported once and then left crashed.
    pub async fn recover_crashed(&self) -> BTreeMap<String, RecoveryAction> {
        let mut actions = BTreeMap::new();
        for name in self.names() {
            let lock = self.name_lock(&name);
            let _guard = lock.lock().await;

            let attempt = {
                let mut state = self.state();
                if state.poll_handle(&name) == HandlePoll::Exited
                    && let Err(e) = self.persist(&state)
                {
                    warn!(service = %name, error = %e, "Crash state not persisted");
                }
                let Some(record) = state.services.get(&name) else {
                    continue;
                };
                if record.status != ServiceStatus::Crashed || !record.auto_restart {
                    continue;
                }
                if record.restart_count >= record.max_restarts {
                    let restart_count = record.restart_count;
                    if state.exhausted.insert(name.clone()) {
                        error!(
                            service = %name,
                            restart_count,
                            "Service exceeded its restart budget, giving up"
                        );
                        actions.insert(name.clone(), RecoveryAction::GaveUp { restart_count });
                    }
                    continue;
                }
                let Some(record) = state.services.get_mut(&name) else {
                    continue;
                };
                record.restart_count += 1;
                record.restart_count
            };

            let action = match self.start_locked(&name, StartReason::Recovery) {
                Ok(outcome) => {
                    info!(service = %name, pid = outcome.pid, attempt, "Restarted crashed service");
                    RecoveryAction::Restarted {
                        pid: outcome.pid,
                        attempt,
                    }
                }
                Err(e) => RecoveryAction::Failed {
                    attempt,
                    message: e.to_string(),
                },
            };
            actions.insert(name, action);
        }
        actions
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            grace_period_secs: 1,
            restart_pause_ms: 50,
            max_restarts: 2,
            ..Default::default()
        }
    }

    fn supervisor(dir: &TempDir) -> ProcessSupervisor {
        ProcessSupervisor::open(dir.path().join("services"), fast_config())
    }

    #[tokio::test]
    async fn test_register_does_not_start() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let record = sup.register("bot", "telegram", "sleep 30", true).await.unwrap();
        assert_eq!(record.status, ServiceStatus::Stopped);
        assert_eq!(record.max_restarts, 2);
        assert!(record.log_file.ends_with("logs/bot.log"));
        assert!(!sup.is_running("bot"));
        assert!(dir.path().join("services/services.json").exists());
    }

    #[tokio::test]
    async fn test_unknown_service_errors() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        assert!(matches!(
            sup.start("ghost").await,
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(
            sup.stop("ghost").await,
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(
            sup.restart("ghost").await,
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(
            sup.delete("ghost").await,
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(
            sup.tail_log("ghost", 10),
            Err(ServiceError::NotFound { .. })
        ));
        assert!(!sup.status("ghost").exists);
        // Lookups of unknown names leave no per-service lock behind.
        assert!(sup.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("bot", "telegram", "exec sleep 30", true).await.unwrap();

        let started = sup.start("bot").await.unwrap();
        assert!(!started.already_running);
        let report = sup.status("bot");
        assert_eq!(report.status, Some(ServiceStatus::Running));
        assert_eq!(report.pid, Some(started.pid));
        assert!(report.started_at.is_some());

        let stopped = sup.stop("bot").await.unwrap();
        assert!(stopped.was_running);
        assert!(!stopped.forced);
        assert_eq!(stopped.pid, Some(started.pid));
        let report = sup.status("bot");
        assert_eq!(report.status, Some(ServiceStatus::Stopped));
        assert_eq!(report.pid, None);
        assert!(!process_exists(started.pid));
    }

    #[tokio::test]
    async fn test_launch_failure_marks_crashed() {
        let dir = TempDir::new().unwrap();
        let config = SupervisorConfig {
            shell: "/definitely/not/a/shell".into(),
            ..fast_config()
        };
        let sup = ProcessSupervisor::open(dir.path().join("services"), config);
        sup.register("bot", "telegram", "sleep 30", true).await.unwrap();

        let err = sup.start("bot").await.unwrap_err();
        assert!(matches!(err, ServiceError::LaunchFailed { .. }));
        assert_eq!(sup.status("bot").status, Some(ServiceStatus::Crashed));
    }

    #[tokio::test]
    async fn test_exited_process_reported_as_crashed() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("flaky", "discord", "exit 3", true).await.unwrap();

        sup.start("flaky").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = sup.status("flaky");
        assert_eq!(report.status, Some(ServiceStatus::Crashed));
        assert_eq!(report.last_exit_code, Some(3));
        assert_eq!(report.pid, None);

        // Stopping a crashed service is a no-op that normalizes the record.
        let stopped = sup.stop("flaky").await.unwrap();
        assert!(!stopped.was_running);
        assert_eq!(sup.status("flaky").status, Some(ServiceStatus::Stopped));
    }

    #[tokio::test]
    async fn test_tail_log() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("echo", "test", "printf 'a\\nb\\nc\\n'", false)
            .await
            .unwrap();
        assert_eq!(sup.tail_log("echo", 5).unwrap(), "No logs available");

        sup.start("echo").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.tail_log("echo", 2).unwrap(), "b\nc\n");
    }

    #[tokio::test]
    async fn test_reregister_keeps_live_handle() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("bot", "telegram", "sleep 30", true).await.unwrap();
        let started = sup.start("bot").await.unwrap();

        let record = sup.register("bot", "telegram", "sleep 40", true).await.unwrap();
        assert_eq!(record.status, ServiceStatus::Running);
        assert_eq!(record.pid, Some(started.pid));
        assert_eq!(record.command, "sleep 40");

        sup.stop("bot").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_stops_running_service() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("bot", "telegram", "sleep 30", true).await.unwrap();
        let started = sup.start("bot").await.unwrap();

        let removed = sup.delete("bot").await.unwrap();
        assert_eq!(removed.name, "bot");
        assert!(sup.get("bot").is_none());
        assert!(!process_exists(started.pid));
        assert!(matches!(
            sup.delete("bot").await,
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_crashed_is_bounded() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("flaky", "discord", "exit 1", true).await.unwrap();
        sup.register("steady", "telegram", "exit 1", false).await.unwrap();
        sup.start("flaky").await.unwrap();
        sup.start("steady").await.unwrap();

        let mut restarts = 0;
        let mut gave_up = false;
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let actions = sup.recover_crashed().await;
            assert!(!actions.contains_key("steady"));
            match actions.get("flaky") {
                Some(RecoveryAction::Restarted { attempt, .. }) => {
                    restarts += 1;
                    assert_eq!(*attempt, restarts);
                }
                Some(RecoveryAction::GaveUp { restart_count }) => {
                    assert_eq!(*restart_count, 2);
                    assert!(!gave_up, "give-up must be reported once");
                    gave_up = true;
                }
                Some(other) => panic!("unexpected action {other:?}"),
                None => {}
            }
        }
        assert_eq!(restarts, 2);
        assert!(gave_up);
        assert_eq!(sup.status("flaky").status, Some(ServiceStatus::Crashed));

        // A manual start resets the budget.
        sup.start("flaky").await.unwrap();
        assert_eq!(sup.get("flaky").unwrap().restart_count, 0);
    }
}
