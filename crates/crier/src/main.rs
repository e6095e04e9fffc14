//! Crier: scheduled multi-target publishing
//!
//! Main binary with subcommands:
//! - `worker`: Run the durable engine (publish workflows, watchdogs)
//! - `post create`: Import a draft post from JSON
//! - `schedule` / `reschedule` / `unschedule` / `delete`: Manage a post's schedule
//! - `status`: Show a post with its per-target results and jobs
//! - `bind` / `unbind` / `prefs`: Manage target bindings and notification preferences

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod post_file;
mod worker;

const MAX_GRACE_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_RETRIES: i64 = 16;
const MAX_RETRY_BASE_SECS: u64 = 24 * 60 * 60;
const MAX_GATEWAY_TIMEOUT_SECS: u64 = 10 * 60;

#[derive(Parser)]
#[command(name = "crier")]
#[command(about = "Scheduled multi-target publishing", long_about = None)]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, env = "CRIER_DATABASE", default_value = "crier.db")]
    database: PathBuf,

    /// Seconds after the scheduled time before the watchdog fails a stuck post
    #[arg(
        long,
        global = true,
        env = "CRIER_GRACE_PERIOD_SECS",
        default_value = "300",
        value_parser = clap::value_parser!(u64).range(1..=MAX_GRACE_PERIOD_SECS)
    )]
    grace_period_secs: u64,

    /// Retries after the first attempt of a failing publish run
    #[arg(
        long,
        global = true,
        env = "CRIER_MAX_RETRIES",
        default_value = "3",
        value_parser = clap::value_parser!(u32).range(0..=MAX_RETRIES)
    )]
    max_retries: u32,

    /// Initial retry delay in seconds, doubled per retry
    #[arg(
        long,
        global = true,
        env = "CRIER_RETRY_BASE_SECS",
        default_value = "30",
        value_parser = clap::value_parser!(u64).range(1..=MAX_RETRY_BASE_SECS)
    )]
    retry_base_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Worker {
        /// Publishing API base URL
        #[arg(long, env = "CRIER_GATEWAY_URL")]
        gateway_url: String,

        /// Publishing API key
        #[arg(long, env = "CRIER_GATEWAY_API_KEY")]
        gateway_api_key: String,

        /// Per-request timeout for the publishing API in seconds
        #[arg(
            long,
            env = "CRIER_GATEWAY_TIMEOUT_SECS",
            default_value = "30",
            value_parser = clap::value_parser!(u64).range(1..=MAX_GATEWAY_TIMEOUT_SECS)
        )]
        gateway_timeout_secs: u64,

        /// Webhook receiving failure notifications. Notifications are only logged when unset.
        #[arg(long, env = "CRIER_NOTIFY_WEBHOOK_URL")]
        notify_webhook_url: Option<String>,

        /// Jobs executing at the same time
        #[arg(long, env = "CRIER_MAX_CONCURRENT_JOBS", default_value = "16")]
        max_concurrent_jobs: usize,

        /// Targets of one post published at the same time
        #[arg(long, env = "CRIER_TARGET_CONCURRENCY", default_value = "4")]
        target_concurrency: usize,
    },

    /// Manage posts
    Post {
        #[command(subcommand)]
        command: PostCommands,
    },

    /// Schedule a post for publishing
    Schedule {
        #[arg(long)]
        post_id: String,

        /// RFC 3339 time, e.g. 2026-11-01T09:00:00Z
        #[arg(long)]
        at: DateTime<Utc>,
    },

    /// Move a scheduled post to a new time
    Reschedule {
        #[arg(long)]
        post_id: String,

        #[arg(long)]
        at: DateTime<Utc>,
    },

    /// Return a scheduled post to draft
    Unschedule {
        #[arg(long)]
        post_id: String,
    },

    /// Delete a draft or scheduled post
    Delete {
        #[arg(long)]
        post_id: String,
    },

    /// Print a post with its per-target results and jobs as JSON
    Status {
        #[arg(long)]
        post_id: String,
    },

    /// Connect a target account for a user
    Bind {
        #[arg(long)]
        user_id: String,

        #[arg(long)]
        target: String,

        /// Account reference understood by the publishing API
        #[arg(long)]
        binding_ref: String,
    },

    /// Disconnect a target account
    Unbind {
        #[arg(long)]
        user_id: String,

        #[arg(long)]
        target: String,
    },

    /// Set a user's notification preference
    Prefs {
        #[arg(long)]
        user_id: String,

        /// Send a notification when a post fails. Accepts yes/no, true/false,
        /// on/off or 1/0 from the environment.
        #[arg(
            long,
            env = "CRIER_NOTIFY_ON_FAILURE",
            value_parser = clap::builder::BoolishValueParser::new(),
            default_value = "false"
        )]
        notify_on_failure: bool,
    },
}

#[derive(Subcommand)]
enum PostCommands {
    /// Create a draft post from a JSON file
    Create {
        #[arg(long)]
        file: PathBuf,
    },
}

/// Settings shared by every subcommand that touches the engine.
pub struct EngineSettings {
    pub database: PathBuf,
    pub grace_period_secs: u64,
    pub max_retries: u32,
    pub retry_base_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "crier=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = EngineSettings {
        database: cli.database,
        grace_period_secs: cli.grace_period_secs,
        max_retries: cli.max_retries,
        retry_base_secs: cli.retry_base_secs,
    };
    commands::validate(&settings)?;

    match cli.command {
        Commands::Worker {
            gateway_url,
            gateway_api_key,
            gateway_timeout_secs,
            notify_webhook_url,
            max_concurrent_jobs,
            target_concurrency,
        } => {
            worker::run(
                &settings,
                worker::WorkerOptions {
                    gateway_url,
                    gateway_api_key,
                    gateway_timeout_secs,
                    notify_webhook_url,
                    max_concurrent_jobs,
                    target_concurrency,
                },
            )
            .await
        }

        Commands::Post {
            command: PostCommands::Create { file },
        } => commands::create_post(&settings, &file).map(|_| ()),

        Commands::Schedule { post_id, at } => commands::schedule(&settings, &post_id, at),

        Commands::Reschedule { post_id, at } => commands::reschedule(&settings, &post_id, at),

        Commands::Unschedule { post_id } => commands::unschedule(&settings, &post_id),

        Commands::Delete { post_id } => commands::delete(&settings, &post_id),

        Commands::Status { post_id } => commands::status(&settings, &post_id),

        Commands::Bind {
            user_id,
            target,
            binding_ref,
        } => commands::bind(&settings, &user_id, &target, &binding_ref),

        Commands::Unbind { user_id, target } => commands::unbind(&settings, &user_id, &target),

        Commands::Prefs {
            user_id,
            notify_on_failure,
        } => commands::prefs(&settings, &user_id, notify_on_failure),
    }
}
