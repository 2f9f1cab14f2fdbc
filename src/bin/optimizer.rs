//! Walk-forward / Bayesian / Monte-Carlo parameter optimizer CLI.
//!
//! Runs standalone, outside the trading engine process, and only ever
//! communicates with it through versioned config files under
//! `paths.config_versions_dir`. Exit code is 0 whether or not a run deploys
//! a new version; a non-zero exit means the run itself could not complete.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

use xsmom::application::optimizer;
use xsmom::application::optimizer::versioning;
use xsmom::application::trading_engine::parse_timeframe;
use xsmom::config::Config;
use xsmom::domain::market::Bar;
use xsmom::domain::ports::ExchangeAdapter;
use xsmom::infrastructure::exchange::BybitAdapter;
use xsmom::infrastructure::persistence::optimizer_db::OptimizerDb;

#[derive(Parser)]
#[command(author, version, about = "Walk-forward parameter optimizer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch history for the configured symbols and run one full
    /// walk-forward / Bayesian search / Monte-Carlo optimizer pass.
    Run,
    /// Roll the live config pointer back to a prior version (or the backup
    /// named by the currently-live version's metadata, if none is given).
    Rollback {
        #[arg(long)]
        version: Option<String>,
    },
    /// List every recorded config version, most recent first.
    ListVersions,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::fmt().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Run => run(&config).await,
        Commands::Rollback { version } => {
            let restored = versioning::rollback(&config.paths, version.as_deref()).await?;
            info!(version = %restored, "rolled back live config pointer");
            Ok(())
        }
        Commands::ListVersions => {
            let versions = versioning::list_versions(&config.paths).await?;
            if versions.is_empty() {
                println!("no config versions recorded yet");
            }
            for v in versions {
                println!(
                    "{}  deployed={}  baseline_sharpe={:.3}  candidate_sharpe={:.3}  created_at={}",
                    v.version_id, v.deployed, v.baseline_oos_sharpe, v.candidate_oos_sharpe, v.created_at
                );
            }
            Ok(())
        }
    }
}

async fn run(config: &Config) -> Result<()> {
    let exchange = BybitAdapter::new(
        config.exchange.base_url.clone(),
        config.exchange_api_key(),
        config.exchange_api_secret(),
    );
    let timeframe = parse_timeframe(&config.exchange.timeframe);
    let instruments = exchange
        .list_instruments()
        .await
        .map_err(|e| anyhow::anyhow!("failed to list instruments: {e}"))?;

    let mut bars_by_symbol: HashMap<String, Vec<Bar>> = HashMap::new();
    for symbol in &config.optimizer.symbols {
        let Some(instrument) = instruments.iter().find(|i| &i.symbol == symbol) else {
            info!(symbol, "configured optimizer symbol not found in exchange universe, skipping");
            continue;
        };
        // Single request capped at the exchange's page size; the optimizer's
        // walk-forward windows must fit within that budget since the
        // exchange adapter exposes no historical pagination cursor.
        let bars = exchange
            .fetch_bars(instrument, timeframe, 1000)
            .await
            .map_err(|e| anyhow::anyhow!("failed to fetch bars for {symbol}: {e}"))?;
        info!(symbol, bars = bars.len(), "fetched optimizer history");
        bars_by_symbol.insert(symbol.clone(), bars);
    }
    anyhow::ensure!(!bars_by_symbol.is_empty(), "no optimizer symbols resolved to exchange instruments");

    let db = OptimizerDb::connect(&config.paths.optimizer_db)
        .await
        .context("failed to open optimizer database")?;

    let outcome = optimizer::run(config, &bars_by_symbol, &db).await?;
    info!(
        run_id = %outcome.run_id,
        deployed = outcome.deployed,
        baseline_oos_sharpe = outcome.baseline_oos_sharpe,
        candidate_oos_sharpe = outcome.candidate_oos_sharpe,
        candidate_annualized_return = outcome.candidate_annualized_return,
        version_id = ?outcome.version_id,
        "optimizer run finished"
    );
    Ok(())
}
