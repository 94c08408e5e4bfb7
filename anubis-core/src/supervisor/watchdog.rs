//! Background crash watchdog.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ProcessSupervisor, RecoveryAction};

/// Periodically runs [`ProcessSupervisor::recover_crashed`] until cancelled.
pub struct Watchdog {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Spawn the watchdog loop on the current Tokio runtime.
    ///
    /// The first pass runs one `interval` after spawning.
    pub fn spawn(
        supervisor: Arc<ProcessSupervisor>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Crash watchdog started");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Crash watchdog cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let actions = supervisor.recover_crashed().await;
                        for (name, action) in &actions {
                            match action {
                                RecoveryAction::Restarted { pid, attempt } => {
                                    info!(service = %name, pid, attempt, "Watchdog restarted service");
                                }
                                RecoveryAction::Failed { attempt, message } => {
                                    warn!(service = %name, attempt, error = %message, "Watchdog restart failed");
                                }
                                RecoveryAction::GaveUp { restart_count } => {
                                    warn!(service = %name, restart_count, "Watchdog gave up on service");
                                }
                            }
                        }
                    }
                }
            }
            info!("Crash watchdog stopped");
        });

        Self { cancel, handle }
    }

    /// Signal the loop to stop and wait for it to finish its current pass.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Crash watchdog task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
