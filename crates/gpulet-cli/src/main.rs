//! gpulet CLI
//!
//! Command-line interface for interacting with the gpulet daemon.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// gpulet - single-node GPU scheduler for shell and Python scripts
#[derive(Parser, Debug)]
#[command(name = "gpulet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a script for execution
    Submit {
        /// Path to the script
        script: String,

        /// GPUs to reserve (overridden by devices named in the script)
        #[arg(long)]
        gpus: Option<u32>,

        /// Wall-clock budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Get task status
    Status {
        /// Task ID
        task: Uuid,
    },

    /// List all tasks
    Ps {
        /// Only show tasks with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Cancel a task
    Cancel {
        /// Task ID
        task: Uuid,
    },

    /// Show GPU inventory
    Gpus,

    /// Show system status
    Top,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Submit {
            script,
            gpus,
            timeout,
        } => {
            commands::submit(&client, script, gpus, timeout).await?;
        }
        Commands::Status { task } => {
            commands::status(&client, task).await?;
        }
        Commands::Ps { status } => {
            commands::ps(&client, status).await?;
        }
        Commands::Cancel { task } => {
            commands::cancel(&client, task).await?;
        }
        Commands::Gpus => {
            commands::gpus(&client).await?;
        }
        Commands::Top => {
            commands::top(&client).await?;
        }
    }

    Ok(())
}
