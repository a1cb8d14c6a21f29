//! Creditline broker - credit-based message broker over a Unix socket.

mod app;

use std::path::PathBuf;

use broker_config_and_utils::{Config, Paths};
use clap::{Parser, Subcommand};

/// Creditline broker command-line interface.
#[derive(Parser)]
#[command(name = "creditline-broker")]
#[command(about = "Credit-based message broker with at-least-once delivery")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (socket, logs, config). Defaults to ~/.creditline
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker
    Start {
        /// Also accept TCP connections on this address
        #[arg(long, env = "CREDITLINE_LISTEN")]
        listen: Option<String>,

        /// Mirror logs to stderr
        #[arg(short, long)]
        foreground: bool,
    },
    /// Check broker status
    Status,
    /// Print a snapshot of every stream as JSON
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
        config.validate()?;
    }

    match cli.command {
        Some(Commands::Start { listen, foreground }) => {
            if listen.is_some() {
                config.listen_addr = listen;
            }
            app::run_broker(config, paths, foreground).await?;
        }
        None => {
            // Default to start in foreground if no command given
            app::run_broker(config, paths, true).await?;
        }
        Some(Commands::Status) => {
            app::check_status(&paths).await?;
        }
        Some(Commands::Snapshot) => {
            app::print_snapshot(&paths).await?;
        }
    }

    Ok(())
}
