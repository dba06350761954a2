mod auth;
mod backup;
mod cor;
mod db;
mod grading;
mod ipc;
mod workflow;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Senior High School registrar service", long_about = None)]
struct Cli {
    /// Workspace directory holding registrar.sqlite3
    #[arg(long, global = true, env = "REGISTRARD_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace, or a tracing directive)
    #[arg(long, global = true, env = "REGISTRARD_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer JSON-lines requests on stdin (default)
    Serve,
    /// Deactivate school years whose end date has passed, then exit
    DeactivateExpired {
        /// Treat this date (YYYY-MM-DD) as today
        #[arg(long)]
        today: Option<NaiveDate>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.workspace),
        Command::DeactivateExpired { today } => {
            let workspace = cli
                .workspace
                .context("--workspace (or REGISTRARD_WORKSPACE) is required")?;
            deactivate_expired(&workspace, today.unwrap_or_else(|| Local::now().date_naive()))
        }
    }
}

fn deactivate_expired(workspace: &std::path::Path, today: NaiveDate) -> anyhow::Result<()> {
    let conn = db::open_db(workspace)
        .with_context(|| format!("failed to open workspace {}", workspace.display()))?;
    let ids = db::deactivate_expired_school_years(&conn, today)?;
    tracing::info!(count = ids.len(), %today, "expired school years deactivated");
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

fn serve(workspace: Option<PathBuf>) -> anyhow::Result<()> {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };
    if let Some(path) = workspace {
        let conn = db::open_db(&path)
            .with_context(|| format!("failed to open workspace {}", path.display()))?;
        tracing::info!(workspace = %path.display(), "workspace opened");
        state.workspace = Some(path);
        state.db = Some(conn);
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "registrard ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                // Echo the id back when the line was JSON with an id but a bad shape.
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
                    .unwrap_or_default();
                serde_json::json!({
                    "id": id,
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    Ok(())
}
