//! Anubis CLI: terminal interface for the Anubis service supervisor.
//!
//! Provides one-shot subcommands and an interactive console that keeps a
//! single supervisor (and its live process handles) alive across commands.

mod commands;
mod console;

use anubis_core::ConfigError;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Anubis: supervise the bots and credentials of your personal agent
#[derive(Parser, Debug)]
#[command(name = "anubis", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Data directory for sessions, services and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Workspace directory (for `.anubis/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand (starts the interactive console if omitted)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Save platform credentials, register its service and start it
    Setup {
        /// Platform name (also used as the service name)
        platform: String,
        /// Credential as key=value (repeatable)
        #[arg(long = "cred", value_parser = parse_key_val, required = true)]
        credentials: Vec<(String, String)>,
        /// Bootstrap command; `{{key}}` expands to a credential value
        #[arg(long)]
        command: String,
    },
    /// Register (or update) a service without starting it
    Register {
        name: String,
        /// Shell command to run
        #[arg(long)]
        command: String,
        /// Platform the service belongs to (defaults to the service name)
        #[arg(long)]
        platform: Option<String>,
        /// Do not restart the service automatically after a crash
        #[arg(long)]
        no_auto_restart: bool,
    },
    /// Start a service
    Start { name: String },
    /// Stop a service
    Stop { name: String },
    /// Restart a service
    Restart { name: String },
    /// Stop (if running) and remove a service
    Delete { name: String },
    /// Start every registered service
    StartAll,
    /// Stop every registered service
    StopAll,
    /// Show the status of one service, or all of them
    Status { name: Option<String> },
    /// Show the tail of a service's log
    Logs {
        name: String,
        /// Number of lines (defaults to `supervisor.log_tail_lines`)
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
    /// Manage stored platform credentials
    Platform {
        #[command(subcommand)]
        action: PlatformAction,
    },
    /// Manage LLM provider API keys
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Summarize connected platforms and their services
    Summary,
    /// Start the services of every active platform
    Connect,
    /// Supervise auto-restart services in the foreground until Ctrl-C
    Watch,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum PlatformAction {
    /// List platforms with stored credentials
    List,
    /// Show credentials status and service status for a platform
    Show { platform: String },
    /// Mark a platform inactive, keeping its data
    Deactivate { platform: String },
    /// Remove a platform's credentials
    Delete { platform: String },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum KeyAction {
    /// Store an API key for a provider
    Set { provider: String, key: String },
    /// List providers with stored keys (key material is never printed)
    List,
    /// Record token usage for a provider
    Usage {
        provider: String,
        tokens_used: u64,
        /// Tokens remaining (-1 for unknown)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        remaining: i64,
    },
    /// Mark a provider's key inactive
    Deactivate { provider: String },
    /// Remove a provider's key
    Delete { provider: String },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the effective configuration
    Show,
}

/// Parse a `key=value` credential argument.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid credential '{s}': expected key=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid credential '{s}': empty key"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Resolve workspace
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if let Some(path) = &cli.config
        && !path.exists()
    {
        return Err(ConfigError::FileNotFound { path: path.clone() }.into());
    }
    let mut config = anubis_core::load_config(Some(&workspace), cli.config.as_deref())
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    config.validate()?;
    let data_dir = config.data_dir()?;

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet || cli.json => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = data_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "anubis.log");
    let (non_blocking, log_guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    tracing::debug!(data_dir = %data_dir.display(), "Starting anubis");
    let json = cli.json;
    let app = commands::App::open(config, workspace, json)?;

    match cli.command {
        Some(command) => {
            if let Err(e) = commands::handle_command(command, &app).await {
                if json {
                    commands::print_error(&e);
                    drop(log_guard);
                    std::process::exit(1);
                }
                return Err(e);
            }
            Ok(())
        }
        None => console::run(app).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("token=123:abc=").unwrap(),
            ("token".to_string(), "123:abc=".to_string())
        );
        assert!(parse_key_val("no-equals").is_err());
        assert!(parse_key_val("=value").is_err());
    }

    #[test]
    fn test_parse_setup_command() {
        let cli = Cli::try_parse_from([
            "anubis",
            "--json",
            "setup",
            "telegram",
            "--cred",
            "token=t",
            "--command",
            "run-bot {{token}}",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Some(Commands::Setup {
                platform,
                credentials,
                command,
            }) => {
                assert_eq!(platform, "telegram");
                assert_eq!(credentials, vec![("token".to_string(), "t".to_string())]);
                assert_eq!(command, "run-bot {{token}}");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_key_usage_negative_remaining() {
        let cli = Cli::try_parse_from([
            "anubis", "key", "usage", "openai", "120", "--remaining", "-1",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Key {
                action:
                    KeyAction::Usage {
                        provider,
                        tokens_used,
                        remaining,
                    },
            }) => {
                assert_eq!(provider, "openai");
                assert_eq!(tokens_used, 120);
                assert_eq!(remaining, -1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
