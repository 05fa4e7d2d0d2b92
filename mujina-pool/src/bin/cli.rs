//! Command-line interface for mujina-pool.
//!
//! Talks to a running daemon over its HTTP API.

use anyhow::Result;
use clap::{Parser, Subcommand};

use mujina_pool::api_client;

#[derive(Debug, Parser)]
#[command(name = "mujina-pool-cli", version, about = "Inspect a running mujina-pool")]
struct Args {
    /// API base URL
    #[arg(long, env = "MUJINA_API_URL", default_value = "http://127.0.0.1:7785")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show pool totals and the current job
    Status,
    /// List connected sessions
    Sessions,
    /// Forget the cached coinbase tag for an identity
    InvalidateTag { identity: String },
    /// Raw API call (e.g. "api pool")
    Api { endpoint: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = api_client::Client::with_base_url(args.url);

    match args.command {
        Command::Status => cmd_status(&client).await,
        Command::Sessions => cmd_sessions(&client).await,
        Command::InvalidateTag { identity } => {
            let result = client.invalidate_tag(&identity).await?;
            if result.invalidated {
                println!("Invalidated tag for {}", result.identity);
            } else {
                println!("No cached tag for {}", result.identity);
            }
            Ok(())
        }
        Command::Api { endpoint } => cmd_api(&client, &endpoint).await,
    }
}

/// Make a raw API call and pretty-print the JSON response.
async fn cmd_api(client: &api_client::Client, endpoint: &str) -> Result<()> {
    let body = client.get_raw(endpoint).await?;

    // Try to pretty-print as JSON; fall back to raw text
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => print!("{}", body),
    }

    Ok(())
}

/// Print a summary of the pool state.
async fn cmd_status(client: &api_client::Client) -> Result<()> {
    let state = client.get_pool().await?;

    println!("Instance: {}", state.instance);
    println!("Uptime:   {} s", state.uptime_secs);
    println!("Sessions: {} ({} since start)", state.sessions, state.sessions_total);
    println!(
        "Shares:   {} accepted, {} rejected",
        state.shares_accepted, state.shares_rejected
    );
    println!("Blocks:   {}", state.blocks_found);
    if state.events_dropped > 0 {
        println!("Events dropped: {}", state.events_dropped);
    }

    match &state.job {
        Some(job) => {
            println!("Job:");
            println!("  generation {} at height {}", job.generation, job.height);
            println!("  prev {}", job.prev_hash);
            println!(
                "  {} txs, {} sat fees, {} sat reward",
                job.tx_count, job.fee_total, job.coinbase_value
            );
        }
        None => println!("Job: (none yet)"),
    }

    Ok(())
}

async fn cmd_sessions(client: &api_client::Client) -> Result<()> {
    let sessions = client.get_sessions().await?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<9}  {:<21}  {:<8}  {:>14}  {:>8}  {:>8}  identity",
        "id", "protocol", "peer", "en1", "difficulty", "accepted", "rejected"
    );
    for s in &sessions {
        println!(
            "{:>6}  {:<9}  {:<21}  {:<8}  {:>14.3}  {:>8}  {:>8}  {}",
            s.id,
            s.protocol,
            s.peer,
            s.extranonce1,
            s.difficulty,
            s.accepted,
            s.rejected,
            s.identity.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}
