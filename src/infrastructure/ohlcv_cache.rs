//! In-memory OHLCV cache with optional newline-delimited-JSON write-through,
//! plus the bar validator (OHLC sanity, gap, spike checks).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::errors::DataQualityError;
use crate::domain::market::{Bar, Timeframe};

#[derive(Default)]
struct SeriesCache {
    bars: BTreeMap<i64, Bar>,
}

pub struct OhlcvCache {
    dir: PathBuf,
    series: Mutex<HashMap<(String, i64), SeriesCache>>,
}

impl OhlcvCache {
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            series: Mutex::new(HashMap::new()),
        })
    }

    fn file_path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.dir.join(format!("{symbol}_{}.ndjson", timeframe.millis()))
    }

    /// Loads any write-through file for (symbol, timeframe) into memory.
    /// Corrupt trailing lines are logged and discarded; absence is not an
    /// error.
    pub async fn warm_from_disk(&self, symbol: &str, timeframe: Timeframe) {
        let path = self.file_path(symbol, timeframe);
        let Ok(raw) = fs::read_to_string(&path).await else {
            return;
        };
        let mut cache = self.series.lock().await;
        let entry = cache.entry((symbol.to_string(), timeframe.millis())).or_default();
        for line in raw.lines() {
            match serde_json::from_str::<Bar>(line) {
                Ok(bar) => {
                    entry.bars.insert(bar.timestamp_ms, bar);
                }
                Err(e) => {
                    warn!(%symbol, path = %path.display(), error = %e, "discarding corrupt cache line");
                }
            }
        }
    }

    /// Returns the subset of `[start_ms, end_ms]` already cached, and the
    /// list of missing timestamps the caller must fetch.
    pub async fn missing_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> (Vec<Bar>, Vec<i64>) {
        let cache = self.series.lock().await;
        let mut present = Vec::new();
        let mut missing = Vec::new();
        let Some(series) = cache.get(&(symbol.to_string(), timeframe.millis())) else {
            let mut ts = start_ms;
            while ts <= end_ms {
                missing.push(ts);
                ts += timeframe.millis();
            }
            return (present, missing);
        };
        let mut ts = start_ms;
        while ts <= end_ms {
            match series.bars.get(&ts) {
                Some(bar) => present.push(*bar),
                None => missing.push(ts),
            }
            ts += timeframe.millis();
        }
        (present, missing)
    }

    /// Appends freshly fetched bars to the in-memory series and flushes the
    /// write-through file. Flushing is append-only; a crash mid-write leaves
    /// the prior content intact because writes happen at EOF.
    pub async fn ingest(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> std::io::Result<()> {
        if bars.is_empty() {
            return Ok(());
        }
        {
            let mut cache = self.series.lock().await;
            let entry = cache.entry((symbol.to_string(), timeframe.millis())).or_default();
            for bar in bars {
                entry.bars.insert(bar.timestamp_ms, *bar);
            }
        }
        self.flush_append(symbol, timeframe, bars).await
    }

    async fn flush_append(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> std::io::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
        }
        let path = self.file_path(symbol, timeframe);
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        let mut buf = String::new();
        for bar in bars {
            buf.push_str(&serde_json::to_string(bar).unwrap_or_default());
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await
    }

    pub async fn series(&self, symbol: &str, timeframe: Timeframe) -> Vec<Bar> {
        let cache = self.series.lock().await;
        cache
            .get(&(symbol.to_string(), timeframe.millis()))
            .map(|s| s.bars.values().copied().collect())
            .unwrap_or_default()
    }
}

/// Runs the three-stage validator over a contiguous, ascending bar series and
/// returns every finding (non-fatal: callers decide whether to exclude the
/// instrument for the cycle).
pub fn validate_bars(
    symbol: &str,
    timeframe: Timeframe,
    bars: &[Bar],
    spike_zscore_threshold: f64,
    spike_lookback: usize,
) -> Vec<DataQualityError> {
    let mut findings = Vec::new();

    for bar in bars {
        if !bar.is_sane() {
            findings.push(DataQualityError::OhlcSanity {
                symbol: symbol.to_string(),
                ts: bar.timestamp_ms,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
            });
        }
    }

    for window in bars.windows(2) {
        let gap_bars = (window[1].timestamp_ms - window[0].timestamp_ms) / timeframe.millis() - 1;
        if gap_bars > 0 {
            findings.push(DataQualityError::Gap {
                symbol: symbol.to_string(),
                ts: window[1].timestamp_ms,
                missing_bars: gap_bars,
            });
        }
    }

    let closes: Vec<f64> = bars.iter().map(|b| to_f64(b.close)).collect();
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    for (i, window) in returns.windows(spike_lookback.max(2)).enumerate() {
        let (history, latest) = window.split_at(window.len() - 1);
        let mean = history.iter().sum::<f64>() / history.len() as f64;
        let var = history.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / history.len() as f64;
        let std = var.sqrt().max(1e-9);
        let z = (latest[0] - mean) / std;
        if z.abs() > spike_zscore_threshold {
            let bar_index = i + spike_lookback.max(2);
            if let Some(bar) = bars.get(bar_index) {
                findings.push(DataQualityError::ReturnSpike {
                    symbol: symbol.to_string(),
                    ts: bar.timestamp_ms,
                    zscore: z,
                    threshold: spike_zscore_threshold,
                });
            }
        }
    }

    findings
}

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

pub fn cache_dir_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            timestamp_ms: ts,
            open: Decimal::try_from(close).unwrap(),
            high: Decimal::try_from(close * 1.001).unwrap(),
            low: Decimal::try_from(close * 0.999).unwrap(),
            close: Decimal::try_from(close).unwrap(),
            volume: dec!(100),
        }
    }

    #[tokio::test]
    async fn missing_range_reports_all_when_empty() {
        let cache = OhlcvCache::new(std::env::temp_dir().join("xsmom_test_cache"));
        let tf = Timeframe::ONE_HOUR;
        let (present, missing) = cache.missing_range("BTCUSDT", tf, 0, tf.millis() * 2).await;
        assert!(present.is_empty());
        assert_eq!(missing.len(), 3);
    }

    #[tokio::test]
    async fn ingest_then_missing_range_finds_nothing_missing() {
        let dir = std::env::temp_dir().join(format!("xsmom_test_cache_{}", uuid::Uuid::new_v4()));
        let cache = OhlcvCache::new(dir);
        let tf = Timeframe::ONE_HOUR;
        let bars = vec![bar(0, 100.0), bar(tf.millis(), 101.0)];
        cache.ingest("BTCUSDT", tf, &bars).await.unwrap();
        let (present, missing) = cache.missing_range("BTCUSDT", tf, 0, tf.millis()).await;
        assert_eq!(present.len(), 2);
        assert!(missing.is_empty());
    }

    #[test]
    fn validator_flags_ohlc_sanity_violation() {
        let mut bars = vec![bar(0, 100.0)];
        bars[0].high = dec!(50);
        let findings = validate_bars("BTCUSDT", Timeframe::ONE_HOUR, &bars, 8.0, 5);
        assert!(findings.iter().any(|f| matches!(f, DataQualityError::OhlcSanity { .. })));
    }

    #[test]
    fn validator_flags_gap() {
        let tf = Timeframe::ONE_HOUR;
        let bars = vec![bar(0, 100.0), bar(tf.millis() * 3, 101.0)];
        let findings = validate_bars("BTCUSDT", tf, &bars, 8.0, 5);
        assert!(findings.iter().any(|f| matches!(f, DataQualityError::Gap { .. })));
    }
}
