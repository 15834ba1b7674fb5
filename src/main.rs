/// Handle List Sync - Main entry point
///
/// Adds accounts whose handles match the configured patterns to a Bluesky
/// list as their identity events appear on Jetstream
use anyhow::Context;
use clap::Parser;
use handle_list_sync::client::shutdown_signal;
use handle_list_sync::config::{DEFAULT_AUTH_FILE, DEFAULT_CONFIG_FILE, DEFAULT_DATA_FILE};
use handle_list_sync::SyncClient;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "list-sync")]
#[command(about = "Adds accounts with matching handles to a Bluesky list")]
struct Args {
    /// Config file (default: config/config.yml)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Credentials file, updated with session tokens (default: config/auth.yml)
    #[arg(long, default_value = DEFAULT_AUTH_FILE)]
    auth: PathBuf,

    /// State file with cursor and list members (default: data/data.json)
    #[arg(long, default_value = DEFAULT_DATA_FILE)]
    data: PathBuf,

    /// Enable verbose logging (DEBUG level)
    #[arg(short, long)]
    verbose: bool,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut client = SyncClient::new(&args.config, &args.auth, &args.data)
        .context("Invalid configuration")?;

    client
        .initialize()
        .await
        .context("Failed to initialize")?;

    client.run(shutdown_signal()).await.context("Sync stopped")?;

    info!("Stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logger with appropriate level based on verbose flag
    let log_level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    info!("Starting list sync");
    info!("Config: {}", args.config.display());
    info!("State: {}", args.data.display());

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
