//! CLI entry point for the local AI supervisor.

use anyhow::Result;
use clap::Parser;
use local_ai_core::{ModelFetcher, ServiceManager, Settings};
use tracing::info;

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::from_env()?;

    match args.command {
        Command::Start {
            hash,
            port,
            host,
            context_length,
        } => {
            let manager = ServiceManager::new(settings);
            manager.start(&hash, port, &host, context_length).await?;
            info!(%hash, port, "service started");
        }
        Command::Stop => {
            let manager = ServiceManager::new(settings);
            if manager.stop().await? {
                info!("service stopped");
            } else {
                info!("nothing to stop");
            }
        }
        Command::Restart => {
            let manager = ServiceManager::new(settings);
            if manager.restart().await? {
                info!("service restarted");
            } else {
                info!("no running service to restart");
            }
        }
        Command::Status => {
            let manager = ServiceManager::new(settings);
            match manager.get_running_model().await {
                Some(hash) => println!("{hash}"),
                None => println!("no running service"),
            }
        }
        Command::Download { hash } => {
            let fetcher = ModelFetcher::new(settings);
            let path = fetcher.fetch(&hash).await?;
            info!(%hash, path = %path.display(), "model ready");
            println!("{}", path.display());
        }
    }

    Ok(())
}
