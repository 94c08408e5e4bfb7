//! Interactive console.
//!
//! One-shot commands cannot stop a service started by an earlier invocation:
//! liveness is only known through the process handle held in memory. The
//! console keeps a single supervisor alive, so services started here can be
//! stopped, restarted and watched from here.

use crate::Commands;
use crate::commands::{self, App};
use anubis_core::Watchdog;
use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// A console line is any CLI subcommand without the binary name.
#[derive(Parser, Debug)]
#[command(name = "anubis", no_binary_name = true, disable_version_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: Commands,
}

/// Run the console until `quit` or end of input.
pub async fn run(app: App) -> anyhow::Result<()> {
    println!("  Anubis service console | data: {}", display_data_dir(&app));
    println!("  Type `help` for commands, `quit` to exit\n");

    let cancel = CancellationToken::new();
    let mut watchdog = if app.config.watchdog.enabled {
        Some(spawn_watchdog(&app, &cancel))
    } else {
        None
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\x1b[1;34manubis> \x1b[0m");
        std::io::stdout().flush()?;

        let Some(input) = lines.next_line().await? else {
            break;
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "quit" | "exit" | "q") {
            break;
        }

        let tokens = match split_line(input) {
            Ok(tokens) => tokens,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        let command = match ConsoleLine::try_parse_from(tokens) {
            Ok(line) => line.command,
            Err(e) => {
                let _ = e.print();
                continue;
            }
        };

        if let Commands::Watch = command {
            match watchdog.take() {
                Some(running) => {
                    running.shutdown().await;
                    println!("Watchdog disabled");
                }
                None => {
                    watchdog = Some(spawn_watchdog(&app, &cancel));
                    println!(
                        "Watchdog enabled (every {}s)",
                        app.config.watchdog.interval().as_secs()
                    );
                }
            }
            continue;
        }

        if let Err(e) = commands::handle_command(command, &app).await {
            if app.json {
                commands::print_error(&e);
            } else {
                println!("Error: {e:#}");
            }
        }
    }

    if let Some(running) = watchdog.take() {
        running.shutdown().await;
    }
    let running = app
        .supervisor
        .list()
        .iter()
        .filter(|report| report.is_running())
        .count();
    if running > 0 {
        println!("{running} service(s) left running in the background.");
    }
    println!("Goodbye!");
    Ok(())
}

fn spawn_watchdog(app: &App, cancel: &CancellationToken) -> Watchdog {
    Watchdog::spawn(
        app.supervisor.clone(),
        app.config.watchdog.interval(),
        cancel.child_token(),
    )
}

fn display_data_dir(app: &App) -> String {
    app.config
        .data_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Split a console line into words, honouring single and double quotes and
/// backslash escapes outside single quotes.
fn split_line(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('\''), c) => current.push(c),
            (_, '\\') => match chars.next() {
                Some(next) => {
                    current.push(next);
                    in_word = true;
                }
                None => return Err("trailing backslash".to_string()),
            },
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {q} quote"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
