use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

use commands::RunArgs;

#[derive(Parser)]
#[command(name = "comet-keeper")]
#[command(about = "Rebalancing and redemption keeper for a pooled comet position", long_about = None)]
struct Cli {
    /// Optional log file path (logs to file instead of stderr)
    #[arg(long, global = true, env = "KEEPER_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop against the configured ledger
    Run(RunArgs),
    /// Load and validate configuration, then exit
    CheckConfig {
        /// Config file path
        #[arg(short, long, default_value = "config/Keeper.toml")]
        config: PathBuf,
        /// Profile overlay (loads Keeper.<profile>.toml on top)
        #[arg(short, long)]
        profile: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if let Some(path) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Run(args) => commands::run(args).await?,
        Commands::CheckConfig { config, profile } => {
            commands::check_config(&config, profile.as_deref())?;
        }
    }

    Ok(())
}
