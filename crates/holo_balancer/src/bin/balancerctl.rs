//! Offline admin tool for a balancer command log directory.
//!
//! Run it only while no scheduler has the directory open.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_balancer::{CommandLog, FjallCommandLog, RequestId};

#[derive(Parser)]
#[command(name = "balancerctl")]
#[command(about = "Inspect and repair the persisted balancer command log", long_about = None)]
struct Args {
    /// Directory holding the command log keyspace.
    #[arg(long, env = "HOLO_BALANCER_DATA_DIR")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every persisted command.
    List {
        /// Emit one JSON document per line instead of a summary table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Delete one persisted command so it is not re-issued on the next start.
    Remove {
        #[arg(long)]
        request_id: RequestId,
    },
    /// Delete every persisted command, including unreadable entries.
    Purge,
}

fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let log = FjallCommandLog::open_dir(&args.data_dir)
        .with_context(|| format!("open command log at {}", args.data_dir.display()))?;

    match args.command {
        Command::List { json } => {
            let records = log.list_all()?;
            if json {
                for record in &records {
                    println!("{}", serde_json::to_string(record)?);
                }
                return Ok(());
            }
            println!(
                "{:<36}  {:<16}  {:<24}  {:<12}  lock",
                "request_id", "command", "nss", "target"
            );
            for record in &records {
                let kind = match record.decode_command() {
                    Ok(command) => command.kind().as_str().to_string(),
                    Err(_) => "<unreadable>".to_string(),
                };
                println!(
                    "{:<36}  {:<16}  {:<24}  {:<12}  {}",
                    record.request_id,
                    kind,
                    record.nss,
                    record.target,
                    record.requires_distributed_lock
                );
            }
            println!("{} persisted command(s)", records.len());
        }
        Command::Remove { request_id } => {
            let known = log
                .list_all()?
                .iter()
                .any(|record| record.request_id == request_id);
            if !known {
                anyhow::bail!("no persisted command with id {request_id}");
            }
            log.remove(request_id)?;
            tracing::info!(request_id = %request_id, "removed persisted balancer command");
        }
        Command::Purge => {
            let removed = log.purge()?;
            tracing::info!(removed, "purged balancer command log");
        }
    }
    Ok(())
}
