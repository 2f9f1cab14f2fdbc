//! Cross-sectional signal generation: weighted multi-lookback returns,
//! z-scoring, nonlinear amplification, and the filter stack.

use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use ta::Next;
use ta::indicators::AverageTrueRange;

use crate::config::{FiltersSection, SignalsSection};
use crate::domain::market::Bar;
use crate::domain::trading::SymbolStats;

#[derive(Debug, Clone)]
pub struct SignalRow {
    pub symbol: String,
    pub raw_return: f64,
    pub zscore: f64,
    pub amplified: f64,
    pub volatility: f64,
    pub atr: f64,
    pub passes_filters: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SignalOutput {
    pub rows: Vec<SignalRow>,
    pub breadth_fraction: f64,
}

fn weighted_return(closes: &[f64], lookbacks: &[(usize, f64)]) -> Option<f64> {
    if closes.is_empty() {
        return None;
    }
    let last = *closes.last()?;
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for (lookback, weight) in lookbacks {
        if closes.len() <= *lookback {
            continue;
        }
        let past = closes[closes.len() - 1 - lookback];
        if past == 0.0 {
            continue;
        }
        total += weight * (last / past - 1.0);
        weight_sum += weight;
    }
    if weight_sum <= 0.0 {
        None
    } else {
        Some(total / weight_sum)
    }
}

fn realized_vol(closes: &[f64], lookback: usize) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }
    let start = closes.len().saturating_sub(lookback + 1);
    let window = &closes[start..];
    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    var.sqrt()
}

fn atr_series(closes: &[f64], period: usize) -> f64 {
    let mut atr = match AverageTrueRange::new(period) {
        Ok(a) => a,
        Err(_) => return 0.0,
    };
    let mut last = 0.0;
    for &c in closes {
        last = atr.next(c);
    }
    last
}

fn ema_slope_bps_per_day(closes: &[f64], ema_len: usize, bars_per_day: f64) -> f64 {
    if closes.len() < ema_len + 2 {
        return 0.0;
    }
    let alpha = 2.0 / (ema_len as f64 + 1.0);
    let mut ema = closes[0];
    let mut emas = Vec::with_capacity(closes.len());
    emas.push(ema);
    for &c in &closes[1..] {
        ema = alpha * c + (1.0 - alpha) * ema;
        emas.push(ema);
    }
    let back = (bars_per_day as usize).max(1).min(emas.len() - 1);
    let prev = emas[emas.len() - 1 - back];
    if prev == 0.0 {
        return 0.0;
    }
    (emas[emas.len() - 1] / prev - 1.0) * 10_000.0
}

pub struct SignalEngine<'a> {
    pub signals: &'a SignalsSection,
    pub filters: &'a FiltersSection,
    pub bars_per_day: f64,
}

impl<'a> SignalEngine<'a> {
    pub fn new(signals: &'a SignalsSection, filters: &'a FiltersSection, bars_per_day: f64) -> Self {
        Self {
            signals,
            filters,
            bars_per_day,
        }
    }

    pub fn compute(
        &self,
        bars_by_symbol: &HashMap<String, Vec<Bar>>,
        stats: &HashMap<String, SymbolStats>,
        now: DateTime<Utc>,
    ) -> SignalOutput {
        if self.filters.blackout_hours_utc.contains(&(now.hour() as u8)) {
            return SignalOutput {
                rows: bars_by_symbol
                    .keys()
                    .map(|s| blocked_row(s.clone()))
                    .collect(),
                breadth_fraction: 0.0,
            };
        }

        let mut raw_returns: HashMap<String, f64> = HashMap::new();
        let mut vols: HashMap<String, f64> = HashMap::new();
        let mut atrs: HashMap<String, f64> = HashMap::new();
        let mut eligible: HashMap<String, bool> = HashMap::new();

        for (symbol, bars) in bars_by_symbol {
            let closes: Vec<f64> = bars
                .iter()
                .map(|b| b.close.to_string().parse::<f64>().unwrap_or(0.0))
                .collect();
            let Some(r) = weighted_return(&closes, &self.signals.lookbacks) else {
                continue;
            };
            raw_returns.insert(symbol.clone(), r);
            vols.insert(symbol.clone(), realized_vol(&closes, self.signals.vol_lookback));
            atrs.insert(symbol.clone(), atr_series(&closes, 14));
            eligible.insert(symbol.clone(), self.passes_filters(symbol, &closes, stats, now));
        }

        if raw_returns.is_empty() {
            return SignalOutput::default();
        }

        let values: Vec<f64> = raw_returns.values().copied().collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let std = variance.sqrt().max(1e-9);

        let mut rows: Vec<SignalRow> = raw_returns
            .into_iter()
            .map(|(symbol, raw_return)| {
                let zscore = (raw_return - mean) / std;
                let amplified = zscore.signum() * zscore.abs().powf(self.signals.signal_power);
                let passes = *eligible.get(&symbol).unwrap_or(&false)
                    && zscore.abs() >= self.signals.entry_zscore_min;
                SignalRow {
                    symbol: symbol.clone(),
                    raw_return,
                    zscore,
                    amplified,
                    volatility: *vols.get(&symbol).unwrap_or(&0.0),
                    atr: *atrs.get(&symbol).unwrap_or(&0.0),
                    passes_filters: passes,
                }
            })
            .collect();

        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let breadth_fraction = rows.iter().filter(|r| r.passes_filters).count() as f64 / rows.len() as f64;
        if breadth_fraction < self.signals.min_breadth_fraction {
            for row in &mut rows {
                row.passes_filters = false;
            }
        }

        SignalOutput {
            rows,
            breadth_fraction,
        }
    }

    fn passes_filters(
        &self,
        symbol: &str,
        closes: &[f64],
        stats: &HashMap<String, SymbolStats>,
        _now: DateTime<Utc>,
    ) -> bool {
        if self.filters.regime_filter.enabled {
            let slope = ema_slope_bps_per_day(closes, self.filters.regime_filter.ema_len, self.bars_per_day);
            if slope.abs() < self.filters.regime_filter.slope_min_bps_per_day {
                return false;
            }
        }

        if self.filters.volatility_entry.enabled {
            let atr = atr_series(closes, self.filters.volatility_entry.atr_lookback);
            let baseline = closes
                .iter()
                .rev()
                .take(self.filters.volatility_entry.atr_lookback * 3)
                .copied()
                .collect::<Vec<_>>();
            let baseline_atr = atr_series(&baseline, self.filters.volatility_entry.atr_lookback);
            if baseline_atr > 0.0 && atr < baseline_atr * self.filters.volatility_entry.expansion_mult {
                return false;
            }
        }

        if self.filters.symbol_filter.enabled
            && let Some(s) = stats.get(symbol)
            && s.ema_win_rate < self.filters.symbol_filter.min_win_rate
            && s.trade_count >= 5
        {
            return false;
        }

        true
    }
}

fn blocked_row(symbol: String) -> SignalRow {
    SignalRow {
        symbol,
        raw_return: 0.0,
        zscore: 0.0,
        amplified: 0.0,
        volatility: 0.0,
        atr: 0.0,
        passes_filters: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Bar;
    use rust_decimal_macros::dec;

    fn bars_with_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp_ms: i as i64 * 3_600_000,
                open: rust_decimal::Decimal::try_from(c).unwrap_or(dec!(0)),
                high: rust_decimal::Decimal::try_from(c * 1.001).unwrap_or(dec!(0)),
                low: rust_decimal::Decimal::try_from(c * 0.999).unwrap_or(dec!(0)),
                close: rust_decimal::Decimal::try_from(c).unwrap_or(dec!(0)),
                volume: dec!(1000),
            })
            .collect()
    }

    #[test]
    fn two_symbol_toy_universe_opposite_signs() {
        let signals = SignalsSection {
            lookbacks: vec![(10, 1.0)],
            signal_power: 1.0,
            vol_lookback: 10,
            k_min: 1,
            k_max: 1,
            market_neutral: true,
            entry_zscore_min: 0.0,
            min_breadth_fraction: 0.0,
        };
        let filters = FiltersSection::default();

        let mut up = vec![100.0; 11];
        *up.last_mut().unwrap() = 102.0;
        let mut down = vec![100.0; 11];
        *down.last_mut().unwrap() = 98.0;

        let mut bars = HashMap::new();
        bars.insert("A".to_string(), bars_with_closes(&up));
        bars.insert("B".to_string(), bars_with_closes(&down));

        let engine = SignalEngine::new(&signals, &filters, 24.0);
        let output = engine.compute(&bars, &HashMap::new(), Utc::now());

        let a = output.rows.iter().find(|r| r.symbol == "A").unwrap();
        let b = output.rows.iter().find(|r| r.symbol == "B").unwrap();
        assert!(a.zscore > 0.0);
        assert!(b.zscore < 0.0);
        assert!((a.zscore + b.zscore).abs() < 1e-9);
    }

    #[test]
    fn blackout_hour_zeroes_all_rows() {
        let signals = SignalsSection {
            lookbacks: vec![(1, 1.0)],
            signal_power: 1.0,
            vol_lookback: 5,
            k_min: 1,
            k_max: 1,
            market_neutral: true,
            entry_zscore_min: 0.0,
            min_breadth_fraction: 0.0,
        };
        let mut filters = FiltersSection::default();
        let now = Utc::now();
        filters.blackout_hours_utc = vec![now.hour() as u8];

        let mut bars = HashMap::new();
        bars.insert("A".to_string(), bars_with_closes(&[100.0, 101.0]));

        let engine = SignalEngine::new(&signals, &filters, 24.0);
        let output = engine.compute(&bars, &HashMap::new(), now);
        assert!(output.rows.iter().all(|r| !r.passes_filters));
    }
}
