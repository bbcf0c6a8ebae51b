//! CLI argument definitions.

use clap::{Parser, Subcommand};

/// Supervise a local LLM inference service backed by content-addressed
/// model packages.
#[derive(Debug, Parser)]
#[command(name = "local-ai", version, about)]
pub struct Args {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download the model if needed, then start the backend/API pair
    Start {
        /// Content address of the model package
        hash: String,

        /// Port for the front-end API
        #[arg(long, default_value_t = local_ai_core::service::DEFAULT_APP_PORT)]
        port: u16,

        /// Bind host for both services
        #[arg(long, default_value = local_ai_core::service::DEFAULT_HOST)]
        host: String,

        /// Context length requested from the backend
        #[arg(long, default_value_t = local_ai_core::service::DEFAULT_CONTEXT_LENGTH)]
        context_length: u32,
    },

    /// Stop the running service pair
    Stop,

    /// Restart the recorded service with its original parameters
    Restart,

    /// Print the hash of the running model, if any
    Status,

    /// Download a model package without starting anything
    Download {
        /// Content address of the model package
        hash: String,
    },
}
