//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, KeyAction, PlatformAction};
use anubis_core::{
    AnubisConfig, CredentialStore, Credentials, PlatformConnector, ProcessSupervisor,
    ServiceError, ServiceHandler, ServiceStatusReport, Watchdog,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a command needs: configuration plus the shared stores.
pub struct App {
    pub config: AnubisConfig,
    pub workspace: PathBuf,
    pub json: bool,
    pub credentials: Arc<CredentialStore>,
    pub supervisor: Arc<ProcessSupervisor>,
}

impl App {
    pub fn open(config: AnubisConfig, workspace: PathBuf, json: bool) -> anyhow::Result<Self> {
        let credentials = Arc::new(CredentialStore::open(config.sessions_dir()?));
        let supervisor = Arc::new(ProcessSupervisor::open(
            config.services_dir()?,
            config.supervisor.clone(),
        ));
        Ok(Self {
            config,
            workspace,
            json,
            credentials,
            supervisor,
        })
    }

    /// A connector with a [`ServiceHandler`] for every active platform that
    /// has a registered service.
    pub fn connector(&self) -> PlatformConnector {
        let mut connector = PlatformConnector::new(
            self.credentials.clone(),
            self.supervisor.clone(),
            self.config.connector.clone(),
        );
        for platform in self.credentials.list_active_platforms() {
            if self.supervisor.get(&platform).is_some() {
                connector.register_handler(platform, ServiceHandler::new(self.supervisor.clone()));
            }
        }
        connector
    }

    /// Print `fields` as `{"success": ..., ...}` in JSON mode, or run
    /// `human` otherwise.
    fn emit(&self, success: bool, fields: Value, human: impl FnOnce()) {
        if self.json {
            println!("{}", with_success(success, fields));
        } else {
            human();
        }
    }
}

fn with_success(success: bool, fields: Value) -> Value {
    let mut out = serde_json::Map::new();
    out.insert("success".into(), Value::Bool(success));
    match fields {
        Value::Object(map) => out.extend(map),
        Value::Null => {}
        other => {
            out.insert("result".into(), other);
        }
    }
    Value::Object(out)
}

/// Print a failed command as a JSON object.
pub fn print_error(error: &anyhow::Error) {
    println!("{}", error_payload(error));
}

fn error_payload(error: &anyhow::Error) -> Value {
    let mut fields = json!({ "error": format!("{error:#}") });
    if let Some(service) = error
        .downcast_ref::<ServiceError>()
        .and_then(ServiceError::service_name)
    {
        fields["service"] = json!(service);
    }
    with_success(false, fields)
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, app: &App) -> anyhow::Result<()> {
    match command {
        Commands::Setup {
            platform,
            credentials,
            command,
        } => handle_setup(app, &platform, credentials.into_iter().collect(), &command).await,
        Commands::Register {
            name,
            command,
            platform,
            no_auto_restart,
        } => {
            let platform = platform.unwrap_or_else(|| name.clone());
            let record = app
                .supervisor
                .register(&name, &platform, &command, !no_auto_restart)
                .await?;
            app.emit(true, json!({ "service": record }), || {
                println!("Registered service '{}' ({})", record.name, record.command);
                println!("  Log file: {}", record.log_file.display());
            });
            Ok(())
        }
        Commands::Start { name } => {
            let outcome = app.supervisor.start(&name).await?;
            app.emit(true, json!(outcome), || println!("{outcome}"));
            Ok(())
        }
        Commands::Stop { name } => {
            let outcome = app.supervisor.stop(&name).await?;
            app.emit(true, json!(outcome), || println!("{outcome}"));
            Ok(())
        }
        Commands::Restart { name } => {
            let outcome = app.supervisor.restart(&name).await?;
            app.emit(true, json!(outcome), || {
                println!("Service '{}' restarted with PID {}", outcome.name, outcome.pid)
            });
            Ok(())
        }
        Commands::Delete { name } => {
            let removed = app.supervisor.delete(&name).await?;
            app.emit(true, json!({ "deleted": removed.name }), || {
                println!("Deleted service '{}'", removed.name)
            });
            Ok(())
        }
        Commands::StartAll => {
            let results = app.supervisor.start_all().await;
            report_batch(app, "started", results);
            Ok(())
        }
        Commands::StopAll => {
            let results = app.supervisor.stop_all().await;
            report_batch(app, "stopped", results);
            Ok(())
        }
        Commands::Status { name: Some(name) } => {
            let report = app.supervisor.status(&name);
            if !report.exists {
                return Err(ServiceError::NotFound { name }.into());
            }
            app.emit(true, json!(report), || print_status(&report));
            Ok(())
        }
        Commands::Status { name: None } => {
            let reports = app.supervisor.list();
            app.emit(true, json!({ "services": reports }), || {
                if reports.is_empty() {
                    println!("No services registered.");
                } else {
                    println!("Services ({}):", reports.len());
                    for report in &reports {
                        println!("  {}", status_line(report));
                    }
                }
            });
            Ok(())
        }
        Commands::Logs { name, lines } => {
            let lines = lines.unwrap_or(app.config.supervisor.log_tail_lines);
            let logs = app.supervisor.tail_log(&name, lines)?;
            app.emit(true, json!({ "name": name, "logs": logs }), || {
                print!("{logs}");
                if !logs.ends_with('\n') {
                    println!();
                }
            });
            Ok(())
        }
        Commands::Platform { action } => handle_platform(action, app),
        Commands::Key { action } => handle_key(action, app),
        Commands::Summary => {
            let summary = app.connector().connection_summary();
            let context = app.credentials.connection_context();
            app.emit(
                true,
                json!({ "summary": summary, "context": context }),
                || println!("{summary}"),
            );
            Ok(())
        }
        Commands::Connect => {
            let results = app.connector().auto_connect_all().await;
            let all_ok = results.values().all(|ok| *ok);
            app.emit(all_ok, json!({ "results": results }), || {
                if results.is_empty() {
                    println!("No active platforms with a registered service.");
                }
                for (platform, ok) in &results {
                    let mark = if *ok { "connected" } else { "failed" };
                    println!("  {platform}: {mark}");
                }
            });
            Ok(())
        }
        Commands::Watch => run_watch(app).await,
        Commands::Config { action } => handle_config(action, app),
    }
}

async fn handle_setup(
    app: &App,
    platform: &str,
    credentials: Credentials,
    command: &str,
) -> anyhow::Result<()> {
    let report = app
        .connector()
        .setup_platform(platform, credentials, command)
        .await?;
    app.emit(report.running, json!(report), || {
        println!("Setting up {}:", report.platform);
        for step in &report.steps {
            let mark = if step.ok { "ok" } else { "FAILED" };
            println!("  [{mark}] {}: {}", step.step, step.detail);
        }
        if report.running {
            println!("{} is configured and running.", report.platform);
        } else {
            println!(
                "{} is configured but not running. Check `anubis logs {}`.",
                report.platform, report.platform
            );
        }
    });
    Ok(())
}

fn handle_platform(action: PlatformAction, app: &App) -> anyhow::Result<()> {
    match action {
        PlatformAction::List => {
            let platforms = app.credentials.list_active_platforms();
            app.emit(true, json!({ "platforms": platforms }), || {
                if platforms.is_empty() {
                    println!("No platforms are currently set up.");
                } else {
                    println!("Active platforms ({}):", platforms.len());
                    for platform in &platforms {
                        println!("  {platform}");
                    }
                }
            });
            Ok(())
        }
        PlatformAction::Show { platform } => {
            let status = app.connector().platform_status(&platform);
            app.emit(status.has_credentials, json!(status), || {
                println!("Platform: {}", status.platform);
                println!(
                    "  Credentials: {}",
                    match (status.has_credentials, status.active) {
                        (true, true) => "active",
                        (true, false) => "inactive",
                        (false, _) => "none",
                    }
                );
                if status.service.exists {
                    println!("  Service: {}", status_line(&status.service));
                } else {
                    println!("  Service: not registered");
                }
            });
            Ok(())
        }
        PlatformAction::Deactivate { platform } => {
            app.credentials.deactivate(&platform)?;
            app.emit(true, json!({ "platform": platform, "active": false }), || {
                println!("Deactivated {platform} (credentials kept)")
            });
            Ok(())
        }
        PlatformAction::Delete { platform } => {
            app.credentials.delete(&platform)?;
            app.emit(true, json!({ "deleted": platform }), || {
                println!("Deleted credentials for {platform}")
            });
            Ok(())
        }
    }
}

fn handle_key(action: KeyAction, app: &App) -> anyhow::Result<()> {
    match action {
        KeyAction::Set { provider, key } => {
            app.credentials.save_api_key(&provider, &key)?;
            app.emit(true, json!({ "provider": provider }), || {
                println!("Saved API key for {provider}")
            });
            Ok(())
        }
        KeyAction::List => {
            let keys = app.credentials.list_api_keys();
            app.emit(true, json!({ "keys": keys }), || {
                if keys.is_empty() {
                    println!("No API keys stored.");
                    return;
                }
                println!("API keys ({}):", keys.len());
                for key in &keys {
                    let remaining = if key.tokens_remaining < 0 {
                        "unknown".to_string()
                    } else {
                        key.tokens_remaining.to_string()
                    };
                    println!(
                        "  {} [{}] used: {} remaining: {}",
                        key.provider,
                        if key.active { "active" } else { "inactive" },
                        key.tokens_used,
                        remaining
                    );
                }
            });
            Ok(())
        }
        KeyAction::Usage {
            provider,
            tokens_used,
            remaining,
        } => {
            app.credentials
                .record_usage(&provider, tokens_used, remaining)?;
            app.emit(
                true,
                json!({ "provider": provider, "tokens_used": tokens_used, "tokens_remaining": remaining }),
                || println!("Recorded {tokens_used} tokens for {provider}"),
            );
            Ok(())
        }
        KeyAction::Deactivate { provider } => {
            app.credentials.deactivate_api_key(&provider)?;
            app.emit(true, json!({ "provider": provider, "active": false }), || {
                println!("Deactivated API key for {provider}")
            });
            Ok(())
        }
        KeyAction::Delete { provider } => {
            app.credentials.delete_api_key(&provider)?;
            app.emit(true, json!({ "deleted": provider }), || {
                println!("Deleted API key for {provider}")
            });
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, app: &App) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = anubis_core::config::workspace_config_path(&app.workspace);
            if config_path.exists() {
                app.emit(false, json!({ "path": config_path, "created": false }), || {
                    println!(
                        "Configuration file already exists at: {}",
                        config_path.display()
                    )
                });
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let toml_str = toml::to_string_pretty(&AnubisConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            app.emit(true, json!({ "path": config_path, "created": true }), || {
                println!(
                    "Created default configuration at: {}",
                    config_path.display()
                )
            });
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&app.config)?;
            app.emit(true, json!({ "config": app.config }), || {
                println!("{toml_str}")
            });
            Ok(())
        }
    }
}

/// Start every auto-restart service, supervise until Ctrl-C, then stop them.
pub async fn run_watch(app: &App) -> anyhow::Result<()> {
    let mut started = Vec::new();
    for name in app.supervisor.names() {
        let auto_restart = app
            .supervisor
            .get(&name)
            .is_some_and(|record| record.auto_restart);
        if !auto_restart {
            continue;
        }
        match app.supervisor.start(&name).await {
            Ok(outcome) => {
                if !app.json {
                    println!("{outcome}");
                }
                started.push(name);
            }
            Err(e) => {
                tracing::warn!(service = %name, error = %e, "Failed to start service for watch");
                if !app.json {
                    println!("  {name}: {e}");
                }
            }
        }
    }

    let cancel = CancellationToken::new();
    let watchdog = Watchdog::spawn(
        app.supervisor.clone(),
        app.config.watchdog.interval(),
        cancel.clone(),
    );
    if !app.json {
        println!(
            "Watching {} service(s) every {}s. Press Ctrl-C to stop.",
            started.len(),
            app.config.watchdog.interval().as_secs()
        );
    }

    tokio::signal::ctrl_c().await?;
    watchdog.shutdown().await;

    let results = app.supervisor.stop_all().await;
    report_batch(app, "stopped", results);
    Ok(())
}

fn report_batch<T: serde::Serialize + std::fmt::Display>(
    app: &App,
    verb: &str,
    results: BTreeMap<String, Result<T, anubis_core::ServiceError>>,
) {
    let all_ok = results.values().all(Result::is_ok);
    let fields: BTreeMap<&String, Value> = results
        .iter()
        .map(|(name, result)| {
            let value = match result {
                Ok(outcome) => with_success(true, json!(outcome)),
                Err(e) => with_success(false, json!({ "error": e.to_string() })),
            };
            (name, value)
        })
        .collect();
    app.emit(all_ok, json!({ "results": fields }), || {
        if results.is_empty() {
            println!("No services registered.");
            return;
        }
        let ok = results.values().filter(|r| r.is_ok()).count();
        println!("{ok}/{} service(s) {verb}", results.len());
        for (name, result) in &results {
            match result {
                Ok(outcome) => println!("  {outcome}"),
                Err(e) => println!("  {name}: {e}"),
            }
        }
    });
}

fn status_line(report: &ServiceStatusReport) -> String {
    let status = report
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let mut line = format!("{} [{status}]", report.name);
    if let Some(pid) = report.pid {
        line.push_str(&format!(" PID {pid}"));
    }
    if let Some(started) = report.started_at {
        line.push_str(&format!(" since {}", started.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    if let Some(count) = report.restart_count.filter(|c| *c > 0) {
        line.push_str(&format!(" restarts: {count}"));
    }
    if let Some(code) = report.last_exit_code {
        line.push_str(&format!(" last exit: {code}"));
    }
    line
}

fn print_status(report: &ServiceStatusReport) {
    println!("{}", status_line(report));
    if let Some(log_file) = &report.log_file {
        println!("  Log file: {}", log_file.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anubis_core::ServiceStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_with_success_merges_object() {
        let v = with_success(true, json!({ "pid": 7 }));
        assert_eq!(v, json!({ "success": true, "pid": 7 }));
    }

    #[test]
    fn test_with_success_wraps_scalars() {
        assert_eq!(
            with_success(false, json!("boom")),
            json!({ "success": false, "result": "boom" })
        );
        assert_eq!(with_success(true, Value::Null), json!({ "success": true }));
    }

    #[test]
    fn test_error_payload_names_service() {
        let err: anyhow::Error = ServiceError::NotFound {
            name: "ghost".into(),
        }
        .into();
        assert_eq!(
            error_payload(&err),
            json!({
                "success": false,
                "error": "Service 'ghost' not found",
                "service": "ghost",
            })
        );

        let err = anyhow::anyhow!("disk full");
        assert_eq!(
            error_payload(&err),
            json!({ "success": false, "error": "disk full" })
        );
    }

    #[tokio::test]
    async fn test_status_of_unknown_service_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AnubisConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let app = App::open(config, dir.path().to_path_buf(), true).unwrap();

        let err = handle_command(
            Commands::Status {
                name: Some("ghost".into()),
            },
            &app,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServiceError>(),
            Some(ServiceError::NotFound { name }) if name == "ghost"
        ));
    }

    #[test]
    fn test_status_line() {
        let report = ServiceStatusReport {
            exists: true,
            name: "telegram".into(),
            platform: Some("telegram".into()),
            status: Some(ServiceStatus::Crashed),
            pid: None,
            started_at: None,
            restart_count: Some(2),
            log_file: None,
            last_exit_code: Some(1),
        };
        assert_eq!(
            status_line(&report),
            "telegram [crashed] restarts: 2 last exit: 1"
        );
    }

    #[tokio::test]
    async fn test_app_open_creates_nothing_until_used() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnubisConfig {
            data_dir: Some(dir.path().join("data")),
            ..Default::default()
        };
        let app = App::open(config, dir.path().to_path_buf(), true).unwrap();
        assert!(app.supervisor.names().is_empty());
        assert!(!dir.path().join("data/services/services.json").exists());

        handle_command(
            Commands::Register {
                name: "bot".into(),
                command: "sleep 1".into(),
                platform: None,
                no_auto_restart: false,
            },
            &app,
        )
        .await
        .unwrap();
        assert_eq!(app.supervisor.get("bot").unwrap().platform, "bot");
        assert!(dir.path().join("data/services/services.json").exists());
    }
}
