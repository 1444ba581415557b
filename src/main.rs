//! DCA + OTT trading engine - main entry point
//!
//! This binary provides two subcommands:
//! - run: trade configured strategies (paper or live)
//! - audit: check persisted state against trade history, optionally rebuild

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "dca-ott")]
#[command(about = "DCA + OTT automated trading engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run configured strategies against the exchange
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/strategies.json")]
        config: String,

        /// Paper trading: real market data, simulated execution
        #[arg(long)]
        paper: bool,

        /// Live trading with real orders
        #[arg(long)]
        live: bool,
    },

    /// Audit persisted cycle state against trade history
    Audit {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/strategies.json")]
        config: String,

        /// Only audit this strategy id
        #[arg(short, long)]
        strategy: Option<String>,

        /// Rebuild inconsistent state from the trade history
        #[arg(long)]
        rebuild: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Audit { .. } => "audit",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            paper,
            live,
        } => commands::run::run(config, paper, live),

        Commands::Audit {
            config,
            strategy,
            rebuild,
        } => commands::audit::run(config, strategy, rebuild),
    }
}
