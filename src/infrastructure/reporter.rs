//! Push-based metrics reporter. Periodically dumps a JSON snapshot of engine
//! state to stdout; no inbound HTTP server, only outbound logging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::ports::StateStore;
use crate::infrastructure::metrics::Metrics;

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub equity_usd: f64,
    pub open_positions: usize,
    pub heartbeat_age_seconds: Option<i64>,
}

pub struct MetricsReporter {
    state_store: Arc<dyn StateStore>,
    metrics: Arc<Metrics>,
    start_time: Instant,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(state_store: Arc<dyn StateStore>, metrics: Arc<Metrics>, interval_seconds: u64) -> Self {
        Self {
            state_store,
            metrics,
            start_time: Instant::now(),
            interval: Duration::from_secs(interval_seconds),
        }
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "starting push-based metrics reporter");
        loop {
            tokio::time::sleep(self.interval).await;
            match self.collect_snapshot().await {
                Ok(snapshot) => match serde_json::to_string(&snapshot) {
                    Ok(json) => println!("METRICS_JSON:{json}"),
                    Err(e) => warn!(error = %e, "failed to serialize metrics snapshot"),
                },
                Err(e) => warn!(error = %e, "failed to collect metrics snapshot"),
            }
        }
    }

    async fn collect_snapshot(&self) -> anyhow::Result<MetricsSnapshot> {
        let doc = self.state_store.load().await;
        let uptime = self.start_time.elapsed().as_secs();
        let equity = doc.equity_history.last().map(|p| p.equity).unwrap_or_default();
        let equity_f64 = equity.to_f64().unwrap_or(0.0);

        self.metrics.set_equity(equity);
        self.metrics.set_open_positions(doc.positions.len());

        let heartbeat_age_seconds = doc.heartbeat.map(|hb| (chrono::Utc::now() - hb).num_seconds());

        Ok(MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: uptime,
            version: env!("CARGO_PKG_VERSION").to_string(),
            equity_usd: equity_f64,
            open_positions: doc.positions.len(),
            heartbeat_age_seconds,
        })
    }
}
