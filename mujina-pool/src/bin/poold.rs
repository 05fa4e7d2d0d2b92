//! The mujina-pool daemon.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mujina_pool::config::Config;
use mujina_pool::daemon::Daemon;
use mujina_pool::tracing::{self, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "mujina-poold", version, about = "Solo Bitcoin mining pool")]
struct Args {
    /// Configuration file (default: /etc/mujina/pool.toml if present)
    #[arg(short, long, env = "MUJINA_POOL_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mujina-poold: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if args.check_config {
        println!("Configuration OK.");
        return ExitCode::SUCCESS;
    }

    tracing::init_journald_or_stdout(tracing::parse_level(&config.daemon.log_level));

    match Daemon::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
