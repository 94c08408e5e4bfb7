//! Platform connector: composes the credential store and the process
//! supervisor into per-platform operations.
//!
//! A platform is set up by saving its credentials, registering a service
//! named after it, and starting that service. Connection handlers supplied by
//! the surrounding application are awaited one platform at a time by
//! [`PlatformConnector::auto_connect_all`].

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::credentials::{CredentialStore, Credentials};
use crate::error::ConnectorError;
use crate::supervisor::{ProcessSupervisor, ServiceStatus, ServiceStatusReport};

/// Connects a platform using its stored credentials.
///
/// `Ok(true)` means connected, `Ok(false)` means the attempt failed cleanly.
/// Errors and panics are both treated as a failed attempt by the connector.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn connect(&self, platform: &str, credentials: &Credentials) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Credentials) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn connect(&self, _platform: &str, credentials: &Credentials) -> anyhow::Result<bool> {
        (self)(credentials.clone()).await
    }
}

/// Handler that (re)starts the service registered under the platform's name.
pub struct ServiceHandler {
    supervisor: Arc<ProcessSupervisor>,
}

impl ServiceHandler {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl ConnectionHandler for ServiceHandler {
    async fn connect(&self, platform: &str, _credentials: &Credentials) -> anyhow::Result<bool> {
        if self.supervisor.get(platform).is_none() {
            debug!(platform, "No service registered for platform");
            return Ok(false);
        }
        self.supervisor.start(platform).await?;
        Ok(true)
    }
}

/// One step of [`PlatformConnector::setup_platform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStepKind {
    SaveCredentials,
    RegisterService,
    StartService,
}

impl std::fmt::Display for SetupStepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupStepKind::SaveCredentials => write!(f, "save credentials"),
            SetupStepKind::RegisterService => write!(f, "register service"),
            SetupStepKind::StartService => write!(f, "start service"),
        }
    }
}

/// Outcome of a single setup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupStep {
    pub step: SetupStepKind,
    pub ok: bool,
    pub detail: String,
}

/// Step-by-step result of setting up a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupReport {
    pub platform: String,
    pub steps: Vec<SetupStep>,
    /// Credentials are saved and the service is registered.
    pub configured: bool,
    /// The service process was started (or already running).
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Combined view of a platform's credentials and its service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformStatus {
    pub platform: String,
    pub has_credentials: bool,
    pub active: bool,
    pub service: ServiceStatusReport,
}

/// Composition root over the credential store and process supervisor.
pub struct PlatformConnector {
    credentials: Arc<CredentialStore>,
    supervisor: Arc<ProcessSupervisor>,
    handlers: BTreeMap<String, Arc<dyn ConnectionHandler>>,
    config: ConnectorConfig,
}

impl PlatformConnector {
    pub fn new(
        credentials: Arc<CredentialStore>,
        supervisor: Arc<ProcessSupervisor>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            credentials,
            supervisor,
            handlers: BTreeMap::new(),
            config,
        }
    }

    /// Register (or replace) the connection handler for `platform`.
    pub fn register_handler(
        &mut self,
        platform: impl Into<String>,
        handler: impl ConnectionHandler + 'static,
    ) {
        let platform = platform.into();
        debug!(platform = %platform, "Registered connection handler");
        self.handlers.insert(platform, Arc::new(handler));
    }

    /// Save credentials, register the platform's service and start it.
    ///
    /// `{{key}}` placeholders in `bootstrap_command` are replaced with the
    /// matching credential values; a command without placeholders is used
    /// verbatim. A failure to save, bind or register aborts with an error.
    /// A start failure is reported in the returned steps and leaves the
    /// platform configured but not running.
    pub async fn setup_platform(
        &self,
        platform: &str,
        credentials: Credentials,
        bootstrap_command: &str,
    ) -> Result<SetupReport, ConnectorError> {
        let mut steps = Vec::with_capacity(3);

        let saved = self
            .credentials
            .save_credential(platform, credentials, None, None)
            .map_err(|e| ConnectorError::SetupAborted {
                platform: platform.to_string(),
                step: SetupStepKind::SaveCredentials.to_string(),
                message: e.to_string(),
            })?;
        steps.push(SetupStep {
            step: SetupStepKind::SaveCredentials,
            ok: true,
            detail: format!("{} credential(s) saved", saved.credentials.len()),
        });

        let command = bind_command(platform, bootstrap_command, &saved.credentials)?;
        self.supervisor
            .register(platform, platform, &command, true)
            .await
            .map_err(|e| ConnectorError::SetupAborted {
                platform: platform.to_string(),
                step: SetupStepKind::RegisterService.to_string(),
                message: e.to_string(),
            })?;
        steps.push(SetupStep {
            step: SetupStepKind::RegisterService,
            ok: true,
            detail: format!("service '{platform}' registered"),
        });

        let (running, pid) = match self.supervisor.start(platform).await {
            Ok(outcome) => {
                steps.push(SetupStep {
                    step: SetupStepKind::StartService,
                    ok: true,
                    detail: outcome.to_string(),
                });
                (true, Some(outcome.pid))
            }
            Err(e) => {
                warn!(platform, error = %e, "Platform configured but service did not start");
                steps.push(SetupStep {
                    step: SetupStepKind::StartService,
                    ok: false,
                    detail: e.to_string(),
                });
                (false, None)
            }
        };

        info!(platform, running, "Platform setup finished");
        Ok(SetupReport {
            platform: platform.to_string(),
            steps,
            configured: true,
            running,
            pid,
        })
    }

    /// Display listing of active platforms and whether their service runs.
    pub fn connection_summary(&self) -> String {
        let platforms = self.credentials.list_active_platforms();
        if platforms.is_empty() {
            return "No platforms connected.".to_string();
        }

        let mut lines = vec![format!("Connected platforms ({}):", platforms.len())];
        for platform in platforms {
            let report = self.supervisor.status(&platform);
            let marker = match report.status {
                Some(ServiceStatus::Running) => match report.pid {
                    Some(pid) => format!("running (PID {pid})"),
                    None => "running".to_string(),
                },
                Some(ServiceStatus::Crashed) => "crashed".to_string(),
                Some(ServiceStatus::Stopped) => "stopped".to_string(),
                None => "no service".to_string(),
            };
            lines.push(format!("  - {platform}: {marker}"));
        }
        lines.join("\n")
    }

    /// Await each active platform's handler in turn.
    ///
    /// Platforms without a handler are skipped. A handler that errors,
    /// panics or exceeds the configured timeout is reported as `false`.
    pub async fn auto_connect_all(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        let active = self.credentials.active_credentials();
        info!(count = active.len(), "Auto-connecting platforms");

        for (platform, credentials) in active {
            let Some(handler) = self.handlers.get(&platform).cloned() else {
                debug!(platform = %platform, "No connection handler registered, skipping");
                continue;
            };
            let connected = match self.invoke(&platform, handler.as_ref(), &credentials).await {
                Ok(connected) => {
                    if connected {
                        info!(platform = %platform, "Platform connected");
                    } else {
                        warn!(platform = %platform, "Platform connection failed");
                    }
                    connected
                }
                Err(e) => {
                    warn!(platform = %platform, "{e}");
                    false
                }
            };
            results.insert(platform, connected);
        }
        results
    }

    async fn invoke(
        &self,
        platform: &str,
        handler: &dyn ConnectionHandler,
        credentials: &Credentials,
    ) -> Result<bool, ConnectorError> {
        let timeout = self.config.handler_timeout();
        let attempt = AssertUnwindSafe(handler.connect(platform, credentials)).catch_unwind();

        match tokio::time::timeout(timeout, attempt).await {
            Err(_) => Err(ConnectorError::HandlerTimeout {
                platform: platform.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
            Ok(Err(panic)) => Err(ConnectorError::HandlerFailed {
                platform: platform.to_string(),
                message: format!("handler panicked: {}", panic_message(panic.as_ref())),
            }),
            Ok(Ok(Err(e))) => Err(ConnectorError::HandlerFailed {
                platform: platform.to_string(),
                message: format!("{e:#}"),
            }),
            Ok(Ok(Ok(connected))) => Ok(connected),
        }
    }

    /// Credential presence plus service status for one platform.
    pub fn platform_status(&self, platform: &str) -> PlatformStatus {
        let record = self.credentials.get_credential(platform);
        PlatformStatus {
            platform: platform.to_string(),
            has_credentials: record.is_some(),
            active: record.is_some_and(|r| r.active),
            service: self.supervisor.status(platform),
        }
    }
}

/// Expand `{{key}}` placeholders in `template` from `credentials`.
pub fn bind_command(
    platform: &str,
    template: &str,
    credentials: &Credentials,
) -> Result<String, ConnectorError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + 2 + len].trim();
        let value = credentials
            .get(key)
            .ok_or_else(|| ConnectorError::UnresolvedPlaceholder {
                platform: platform.to_string(),
                placeholder: key.to_string(),
            })?;
        out.push_str(&rest[..start]);
        out.push_str(value);
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn creds(pairs: &[(&str, &str)]) -> Credentials {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bind_command_expands_placeholders() {
        let c = creds(&[("token", "123:abc"), ("chat_id", "42")]);
        let bound = bind_command("telegram", "run-bot --token {{token}} --chat {{ chat_id }}", &c)
            .unwrap();
        assert_eq!(bound, "run-bot --token 123:abc --chat 42");
    }

    #[test]
    fn test_bind_command_verbatim_without_placeholders() {
        let bound = bind_command("telegram", "python bot.py {not-a-placeholder}", &Credentials::new())
            .unwrap();
        assert_eq!(bound, "python bot.py {not-a-placeholder}");
    }

    #[test]
    fn test_bind_command_unresolved_placeholder() {
        let err = bind_command("discord", "bot {{secret}}", &creds(&[("token", "t")])).unwrap_err();
        match err {
            ConnectorError::UnresolvedPlaceholder {
                platform,
                placeholder,
            } => {
                assert_eq!(platform, "discord");
                assert_eq!(placeholder, "secret");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_bind_command_unterminated_is_verbatim() {
        let bound = bind_command("x", "echo {{oops", &Credentials::new()).unwrap();
        assert_eq!(bound, "echo {{oops");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
