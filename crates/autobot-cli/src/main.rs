//! autobot CLI
//!
//! Command-line interface for the autobot daemon. `available` prints a
//! single `node:idx,idx` line on stdout; everything else goes to stderr.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// autobot - reserve GPUs on the cluster
#[derive(Parser, Debug)]
#[command(name = "autobot")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(
        long,
        env = "AUTOBOT_API",
        default_value = "http://localhost:9190",
        global = true
    )]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reserve GPUs of one model on a single node
    Available {
        /// GPU model (e.g., RTX_2080_Ti, rtx3090)
        model: String,

        /// Number of GPUs
        count: u32,

        /// Print only `node:idx,idx`
        #[arg(short, long)]
        quiet: bool,

        /// Lease lifetime (60s, 5m, 2h, manual); daemon default when omitted
        #[arg(long)]
        ttl: Option<String>,

        /// Lease owner (defaults to $USER@hostname)
        #[arg(long)]
        requester: Option<String>,
    },

    /// Release a lease
    Release {
        /// Lease ID
        lease_id: String,
    },

    /// Renew a lease
    Renew {
        /// Lease ID
        lease_id: String,

        /// New lifetime; the lease's own when omitted
        #[arg(long)]
        ttl: Option<String>,
    },

    /// List active leases
    Leases {
        /// Include released and expired leases
        #[arg(long)]
        all: bool,
    },

    /// List nodes and their free GPUs
    Nodes,

    /// Stop allocating on a node
    Drain {
        /// Node ID
        node: String,
    },

    /// Resume allocating on a node
    Undrain {
        /// Node ID
        node: String,
    },

    /// Show cluster status
    Status,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Available {
            model,
            count,
            quiet,
            ttl,
            requester,
        } => {
            let requester = requester.unwrap_or_else(commands::default_requester);
            commands::available(&client, &model, count, quiet, ttl.as_deref(), &requester)
                .await?;
        }
        Commands::Release { lease_id } => {
            commands::release(&client, &lease_id).await?;
        }
        Commands::Renew { lease_id, ttl } => {
            commands::renew(&client, &lease_id, ttl.as_deref()).await?;
        }
        Commands::Leases { all } => {
            commands::leases(&client, all).await?;
        }
        Commands::Nodes => {
            commands::nodes(&client).await?;
        }
        Commands::Drain { node } => {
            commands::drain(&client, &node).await?;
        }
        Commands::Undrain { node } => {
            commands::undrain(&client, &node).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays parseable
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(commands::exit_code(&e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_available() {
        let cli = Cli::parse_from([
            "autobot",
            "--api",
            "http://login:9190",
            "available",
            "RTX_2080_Ti",
            "4",
            "--quiet",
            "--ttl",
            "2h",
        ]);
        assert_eq!(cli.api, "http://login:9190");
        match cli.command {
            Commands::Available {
                model,
                count,
                quiet,
                ttl,
                requester,
            } => {
                assert_eq!(model, "RTX_2080_Ti");
                assert_eq!(count, 4);
                assert!(quiet);
                assert_eq!(ttl.as_deref(), Some("2h"));
                assert!(requester.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_negative_count_rejected() {
        let result = Cli::try_parse_from(["autobot", "available", "rtx3090", "-1"]);
        assert!(result.is_err());
    }
}
