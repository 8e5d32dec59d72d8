use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use pharmapp_sync::{config::SyncConfig, diagnostics, storage, sync, Connectivity, SyncState};

#[derive(Parser)]
#[command(name = "pharmapp-sync")]
#[command(about = "Replay PharmApp actions that were captured while offline")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background sync engine until Ctrl+C
    Run,

    /// Show queue size, dead letters and last sync time
    Status,

    /// Replay every pending action once and print the report
    Drain,

    /// Queue an action for later replay
    Enqueue {
        /// HTTP method (POST, PUT, PATCH, DELETE)
        #[arg(short, long, default_value = "POST")]
        method: String,
        /// Absolute URL or path relative to the base URL
        url: String,
        /// JSON object body
        payload: String,
    },

    /// Send an action now; queue it if the server cannot take it yet
    Submit {
        /// HTTP method (POST, PUT, PATCH, DELETE)
        #[arg(short, long, default_value = "POST")]
        method: String,
        /// Absolute URL or path relative to the base URL
        url: String,
        /// JSON object body
        payload: String,
    },

    /// List queued actions, oldest first
    List,

    /// Drop a queued action without replaying it
    Remove { id: i64 },

    /// Inspect or recover abandoned actions
    #[command(subcommand)]
    DeadLetters(DeadLetterCommands),

    /// Store the anti-forgery token in the OS keyring
    SetToken { token: String },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    List,
    /// Put a dead letter back on the queue with a fresh retry budget
    Requeue { id: i64 },
    /// Delete all dead letters
    Purge,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().map_err(anyhow::Error::msg)?;
    let _guard = pharmapp_sync::init_logging(&config)?;

    match cli.command {
        Commands::Run => pharmapp_sync::run(config).await?,
        Commands::Status => {
            let queue = pharmapp_sync::open_queue(&config)?;
            let connectivity = Connectivity::new(false);
            let probe = reqwest::Client::new();
            connectivity.set_online(
                pharmapp_sync::api::check_network_status(&probe, &config.probe_url()).await,
            );
            let status = sync::get_sync_status(&queue, &SyncState::new(), &connectivity)?;
            print_json(&serde_json::json!({
                "about": diagnostics::get_about_info(),
                "database": queue.db().db_path.display().to_string(),
                "status": status,
            }))?;
        }
        Commands::Drain => {
            let queue = pharmapp_sync::open_queue(&config)?;
            let report = sync::force_sync(&queue, &SyncState::new()).await?;
            print_json(&report)?;
        }
        Commands::Enqueue {
            method,
            url,
            payload,
        } => {
            let queue = pharmapp_sync::open_queue(&config)?;
            let payload: Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let id = queue.enqueue(&url, &method, payload)?;
            print_json(&serde_json::json!({ "id": id }))?;
        }
        Commands::Submit {
            method,
            url,
            payload,
        } => {
            let queue = pharmapp_sync::open_queue(&config)?;
            let payload: Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let outcome = queue.submit(&url, &method, payload).await?;
            print_json(&outcome)?;
        }
        Commands::List => {
            let queue = pharmapp_sync::open_queue(&config)?;
            print_json(&queue.list()?)?;
        }
        Commands::Remove { id } => {
            let queue = pharmapp_sync::open_queue(&config)?;
            queue.remove(id)?;
        }
        Commands::DeadLetters(cmd) => {
            let queue = pharmapp_sync::open_queue(&config)?;
            match cmd {
                DeadLetterCommands::List => print_json(&queue.dead_letters()?)?,
                DeadLetterCommands::Requeue { id } => {
                    let entry_id = queue.requeue_dead_letter(id)?;
                    print_json(&serde_json::json!({ "id": entry_id }))?;
                }
                DeadLetterCommands::Purge => {
                    let removed = queue.purge_dead_letters()?;
                    print_json(&serde_json::json!({ "removed": removed }))?;
                }
            }
        }
        Commands::SetToken { token } => {
            storage::set_credential(config.keyring_key(), token.trim())
                .map_err(anyhow::Error::msg)?;
            println!("Token stored");
        }
    }

    Ok(())
}
