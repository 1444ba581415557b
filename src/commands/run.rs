//! Trading run command
//!
//! Boots the engine in paper or live mode and trades until ctrl-c. Paper mode
//! uses real market data with simulated order execution, so the entire order
//! lifecycle code path is exercised either way.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use dca_ott::config::Config;
use dca_ott::engine::Engine;
use dca_ott::exchange::{BinanceClient, Exchange, PaperExchange};
use dca_ott::notify::NotifyService;

pub fn run(config_path: String, paper: bool, live: bool) -> Result<()> {
    if !paper && !live {
        anyhow::bail!("Must specify either --paper or --live mode");
    }

    if live {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 5 seconds to abort...");
        std::thread::sleep(Duration::from_secs(5));
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(config_path, paper))
}

async fn run_async(config_path: String, paper: bool) -> Result<()> {
    let config = Config::from_file(&config_path).context("Failed to load configuration")?;
    if !paper {
        config.require_exchange_credentials()?;
    }

    let mode = if paper { "PAPER" } else { "LIVE" };
    info!("Mode: {} trading", mode);
    info!(
        "Strategies: {:?}",
        config.strategies.iter().map(|s| &s.id).collect::<Vec<_>>()
    );
    info!("Tick interval: {}s", config.engine.tick_interval_secs);

    let binance = BinanceClient::new(
        config.exchange.api_key.clone().unwrap_or_default(),
        config.exchange.api_secret.clone().unwrap_or_default(),
        config.exchange.base_url.clone(),
    );
    let exchange: Arc<dyn Exchange> = if paper {
        Arc::new(PaperExchange::new(binance))
    } else {
        Arc::new(binance)
    };

    let notify = Arc::new(NotifyService::from_config(&config.notifier));

    let engine = Engine::start(&config, exchange, notify).context("Failed to start engine")?;
    info!("Engine running with {} strategy task(s)", engine.handles().len());

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    warn!("Ctrl+C received - initiating graceful shutdown");

    engine.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
