//! Headless trading engine entry point: loads configuration, wires the
//! concrete exchange/state/notification adapters, and runs the main
//! rebalance cycle and fast exit monitor forever. No UI, no HTTP server —
//! metrics are pushed as JSON log lines, mirroring the teacher's server
//! binary.

use std::sync::Arc;

use chrono::Utc;
use tracing::{Level, info, warn};
use tracing_subscriber::prelude::*;

use xsmom::application::exit_monitor::FastExitMonitor;
use xsmom::application::trading_engine::TradingEngine;
use xsmom::config::Config;
use xsmom::domain::ports::{AlwaysKeep, NullNotifier};
use xsmom::infrastructure::exchange::BybitAdapter;
use xsmom::infrastructure::metrics::Metrics;
use xsmom::infrastructure::notifications::DiscordNotifier;
use xsmom::infrastructure::ohlcv_cache::OhlcvCache;
use xsmom::infrastructure::reporter::MetricsReporter;
use xsmom::infrastructure::state_store::JsonFileStateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("xsmom engine {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!(timeframe = %config.exchange.timeframe, base_url = %config.exchange.base_url, "configuration loaded");

    let exchange = Arc::new(BybitAdapter::new(
        config.exchange.base_url.clone(),
        config.exchange_api_key(),
        config.exchange_api_secret(),
    ));
    let cache = OhlcvCache::new(config.data.cache.dir.clone());
    let state_store = Arc::new(JsonFileStateStore::new(config.paths.state_path.clone()));
    let notifier: Arc<dyn xsmom::domain::ports::Notifier> = match config.discord_webhook() {
        Some(webhook) => Arc::new(DiscordNotifier::new(webhook)),
        None => {
            warn!("no discord webhook configured; notifications are a no-op");
            Arc::new(NullNotifier)
        }
    };

    let metrics = match Metrics::new() {
        Ok(m) => Some(Arc::new(m)),
        Err(e) => {
            warn!(error = %e, "failed to initialize metrics registry");
            None
        }
    };

    let engine = TradingEngine::new(
        exchange.clone(),
        cache.clone(),
        state_store.clone(),
        notifier.clone(),
        Arc::new(AlwaysKeep),
        metrics.clone(),
    );

    let poll_seconds = config.execution.poll_seconds;
    let engine_config = config.clone();
    let cycle_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(poll_seconds.max(1)));
        loop {
            interval.tick().await;
            match engine.run_cycle(&engine_config, Utc::now()).await {
                Ok(summary) => info!(?summary, "trading cycle complete"),
                Err(e) => warn!(error = %e, "trading cycle failed"),
            }
        }
    });

    let fast_exit_monitor = FastExitMonitor {
        exchange,
        cache,
        state_store: state_store.clone(),
        notifier: notifier.clone(),
    };
    let fast_exit_poll_seconds = (config.execution.poll_seconds / 4).max(5);
    let fast_exit_config = config.clone();
    let exit_handle = tokio::spawn(async move {
        fast_exit_monitor.run_forever(fast_exit_config, fast_exit_poll_seconds).await;
    });

    if let Some(metrics) = metrics {
        let interval = std::env::var("OBSERVABILITY_INTERVAL")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<u64>()
            .unwrap_or(60);
        let reporter = MetricsReporter::new(state_store, metrics, interval);
        tokio::spawn(async move { reporter.run().await });
        info!(interval, "metrics reporter started");
    }

    info!("engine running. press ctrl+c to shut down.");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting.");
    cycle_handle.abort();
    exit_handle.abort();
    Ok(())
}
