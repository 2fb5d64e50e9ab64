use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::Result;
use tracing::debug;
use xfs_bridge_core::BridgeConfig;
use xfs_bridge_pcsc::PcscResourceManager;

mod commands;
mod display;

use commands::{Session, list_readers};

#[derive(Parser)]
#[command(version, about = "Host for the PC/SC backed CEN/XFS card reader service")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "xfs-bridge.toml")]
    config: PathBuf,

    /// Debug level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    List,

    /// Show the device status of a logical service
    Status {
        /// Logical service name
        logical: String,
    },

    /// Wait for a card and print its ATR
    WaitCard {
        /// Logical service name
        logical: String,

        /// Timeout in milliseconds, 0 waits indefinitely
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u32,
    },

    /// Print service events
    Watch {
        /// Logical service name
        logical: String,

        /// How long to watch
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose);

    if let Commands::List = cli.command {
        let resources = PcscResourceManager::new()?;
        return list_readers(&resources);
    }

    let config = BridgeConfig::load(&cli.config)?;
    debug!(path = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Commands::List => unreachable!(), // Already handled above
        Commands::Status { logical } => Session::open(config, &logical)?.status()?,
        Commands::WaitCard {
            logical,
            timeout_ms,
        } => Session::open(config, &logical)?.wait_card(timeout_ms)?,
        Commands::Watch { logical, seconds } => {
            Session::open(config, &logical)?.watch(Duration::from_secs(seconds))?
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
}
