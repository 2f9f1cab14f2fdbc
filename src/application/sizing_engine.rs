//! Sizing engine: top-K selection, inverse-vol / fixed-risk raw weights,
//! market-neutral centering, leverage/cap normalization, vol targeting,
//! Kelly scaling, volatility-regime scaling and the correlation limiter.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::config::{LiquiditySection, RiskSection, SignalsSection, SizingMode, SizingSection};
use crate::domain::trading::SymbolStats;

use super::signal_engine::SignalRow;

pub type TargetWeightMap = BTreeMap<String, Decimal>;

#[derive(Debug, Clone)]
pub struct SizingInputs<'a> {
    pub equity: Decimal,
    pub rows: &'a [SignalRow],
    pub symbol_stats: &'a HashMap<String, SymbolStats>,
    pub adv_usd: &'a HashMap<String, f64>,
    pub correlations: &'a HashMap<(String, String), f64>,
    pub proxy_atr_ratio: f64,
}

fn dynamic_k(rows: &[SignalRow], k_min: usize, k_max: usize) -> usize {
    if k_min >= k_max || rows.is_empty() {
        return k_min.max(1);
    }
    let mut abs_z: Vec<f64> = rows.iter().map(|r| r.zscore.abs()).collect();
    abs_z.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = abs_z[abs_z.len() / 2];
    // Map dispersion in [0, 2] linearly onto [k_min, k_max].
    let t = (median / 2.0).clamp(0.0, 1.0);
    let k = k_min as f64 + t * (k_max - k_min) as f64;
    (k.round() as usize).clamp(k_min, k_max)
}

fn correlation_of(correlations: &HashMap<(String, String), f64>, a: &str, b: &str) -> f64 {
    correlations
        .get(&(a.to_string(), b.to_string()))
        .or_else(|| correlations.get(&(b.to_string(), a.to_string())))
        .copied()
        .unwrap_or(0.0)
}

/// Computes the target weight map for one cycle. Returns an empty map when
/// there is nothing eligible to trade.
pub fn compute_target_weights(
    signals: &SignalsSection,
    sizing: &SizingSection,
    risk: &RiskSection,
    liquidity: &LiquiditySection,
    inputs: &SizingInputs,
) -> TargetWeightMap {
    let eligible: Vec<&SignalRow> = inputs.rows.iter().filter(|r| r.passes_filters).collect();
    if eligible.is_empty() {
        return TargetWeightMap::new();
    }

    let k = dynamic_k(inputs.rows, signals.k_min, signals.k_max);

    let mut longs: Vec<&SignalRow> = eligible.iter().filter(|r| r.amplified > 0.0).copied().collect();
    let mut shorts: Vec<&SignalRow> = eligible.iter().filter(|r| r.amplified < 0.0).copied().collect();
    longs.sort_by(|a, b| b.amplified.partial_cmp(&a.amplified).unwrap());
    shorts.sort_by(|a, b| a.amplified.partial_cmp(&b.amplified).unwrap());
    longs.truncate(k);
    shorts.truncate(k);

    let mut raw: HashMap<String, f64> = HashMap::new();
    for row in longs.iter().chain(shorts.iter()) {
        let w = match risk.sizing_mode {
            SizingMode::InverseVolatility => {
                let vol = row.volatility.max(1e-6);
                row.amplified.signum() / vol
            }
            SizingMode::FixedRisk => {
                let stop_distance = risk.atr_mult_sl * row.atr.max(1e-9);
                if stop_distance <= 0.0 {
                    0.0
                } else {
                    row.amplified.signum() * (risk.risk_per_trade_pct / stop_distance)
                }
            }
        };
        raw.insert(row.symbol.clone(), w);
    }

    if signals.market_neutral {
        let mean = raw.values().sum::<f64>() / raw.len().max(1) as f64;
        for w in raw.values_mut() {
            *w -= mean;
        }
    }

    let gross: f64 = raw.values().map(|w| w.abs()).sum();
    if gross > 1e-12 {
        let scale = sizing.gross_leverage / gross;
        for w in raw.values_mut() {
            *w *= scale;
        }
    }

    let equity_f64 = inputs.equity.to_f64().unwrap_or(0.0);
    for (symbol, w) in raw.iter_mut() {
        let mut cap = sizing.max_weight_per_asset;
        if equity_f64 > 0.0 {
            cap = cap.min(sizing.notional_cap_usdt / equity_f64);
            if let Some(adv) = inputs.adv_usd.get(symbol) {
                cap = cap.min((adv * liquidity.adv_pct_cap) / equity_f64);
            }
        }
        *w = w.clamp(-cap, cap);
    }

    if sizing.vol_target.enabled {
        let realized = portfolio_realized_vol(&raw, inputs.rows);
        if realized > 1e-9 {
            let scale = (sizing.vol_target.target_ann_vol / realized)
                .clamp(sizing.vol_target.min_scale, sizing.vol_target.max_scale);
            for w in raw.values_mut() {
                *w *= scale;
            }
        }
    }

    if sizing.kelly.enabled {
        for (symbol, w) in raw.iter_mut() {
            if let Some(stats) = inputs.symbol_stats.get(symbol) {
                let p = stats.ema_win_rate.clamp(0.0, 1.0);
                let b = stats.ema_profit_factor.max(0.01);
                let kelly = (p - (1.0 - p) / b).max(0.0);
                *w *= 1.0 + sizing.kelly.fraction * kelly;
            }
        }
    }

    if sizing.volatility_regime.enabled && inputs.proxy_atr_ratio >= sizing.volatility_regime.high_vol_mult {
        let excess = (inputs.proxy_atr_ratio - sizing.volatility_regime.high_vol_mult).max(0.0);
        let scale = (1.0 - excess * 0.25).clamp(sizing.volatility_regime.max_scale_down, 1.0);
        for w in raw.values_mut() {
            *w *= scale;
        }
    }

    if sizing.correlation.enabled {
        apply_correlation_limit(&mut raw, inputs.correlations, &sizing.correlation);
    }

    if raw.len() > sizing.max_open_positions_hard {
        let mut sorted: Vec<(String, f64)> = raw.into_iter().collect();
        sorted.sort_by(|a, b| b.1.abs().partial_cmp(&a.1.abs()).unwrap());
        sorted.truncate(sizing.max_open_positions_hard);
        raw = sorted.into_iter().collect();
    }

    raw.into_iter()
        .filter(|(_, w)| w.abs() > 1e-9)
        .map(|(symbol, w)| (symbol, Decimal::try_from(w).unwrap_or(Decimal::ZERO)))
        .collect()
}

fn apply_correlation_limit(
    raw: &mut HashMap<String, f64>,
    correlations: &HashMap<(String, String), f64>,
    corr: &crate::config::CorrelationSection,
) {
    let mut symbols: Vec<String> = raw.keys().cloned().collect();
    symbols.sort_by(|a, b| raw[b].abs().partial_cmp(&raw[a].abs()).unwrap());

    let mut kept: Vec<String> = Vec::new();
    let mut dropped: Vec<String> = Vec::new();
    for symbol in symbols {
        let high_corr_kept = kept
            .iter()
            .filter(|k| correlation_of(correlations, k, &symbol).abs() > corr.max_allowed_corr)
            .count();
        if high_corr_kept >= corr.max_high_corr_positions {
            dropped.push(symbol);
        } else {
            kept.push(symbol);
        }
    }
    for symbol in dropped {
        raw.remove(&symbol);
    }
}

fn portfolio_realized_vol(weights: &HashMap<String, f64>, rows: &[SignalRow]) -> f64 {
    let variance: f64 = weights
        .iter()
        .map(|(symbol, w)| {
            let vol = rows
                .iter()
                .find(|r| &r.symbol == symbol)
                .map(|r| r.volatility)
                .unwrap_or(0.0);
            (w * vol).powi(2)
        })
        .sum();
    variance.sqrt() * (24.0 * 365.0_f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CorrelationSection, KellySection, VolTargetSection, VolatilityRegimeSection};

    fn row(symbol: &str, amplified: f64, vol: f64) -> SignalRow {
        SignalRow {
            symbol: symbol.to_string(),
            raw_return: amplified,
            zscore: amplified,
            amplified,
            volatility: vol,
            atr: 1.0,
            passes_filters: true,
        }
    }

    fn base_signals(k_min: usize, k_max: usize, market_neutral: bool) -> SignalsSection {
        SignalsSection {
            lookbacks: vec![(1, 1.0)],
            signal_power: 1.0,
            vol_lookback: 10,
            k_min,
            k_max,
            market_neutral,
            entry_zscore_min: 0.0,
            min_breadth_fraction: 0.0,
        }
    }

    fn base_sizing() -> SizingSection {
        SizingSection {
            gross_leverage: 1.0,
            max_weight_per_asset: 1.0,
            notional_cap_usdt: 1_000_000.0,
            max_open_positions_hard: 16,
            vol_target: VolTargetSection::default(),
            kelly: KellySection::default(),
            correlation: CorrelationSection::default(),
            volatility_regime: VolatilityRegimeSection {
                enabled: false,
                ..Default::default()
            },
            carry_budget_frac: 0.0,
        }
    }

    fn base_risk() -> RiskSection {
        let mut r = RiskSection::default();
        r.sizing_mode = crate::config::SizingMode::InverseVolatility;
        r
    }

    #[test]
    fn market_neutral_two_symbol_equal_vol() {
        let rows = vec![row("A", 1.0, 1.0), row("B", -1.0, 1.0)];
        let signals = base_signals(1, 1, true);
        let sizing = base_sizing();
        let risk = base_risk();
        let liquidity = LiquiditySection::default();
        let inputs = SizingInputs {
            equity: rust_decimal_macros::dec!(10000),
            rows: &rows,
            symbol_stats: &HashMap::new(),
            adv_usd: &HashMap::new(),
            correlations: &HashMap::new(),
            proxy_atr_ratio: 1.0,
        };
        let weights = compute_target_weights(&signals, &sizing, &risk, &liquidity, &inputs);
        assert_eq!(weights.len(), 2);
        let a = weights["A"];
        let b = weights["B"];
        assert!(a > Decimal::ZERO);
        assert!(b < Decimal::ZERO);
        assert!((a + b).abs() < rust_decimal_macros::dec!(0.0001));
        assert_eq!(a, rust_decimal_macros::dec!(0.5));
        assert_eq!(b, rust_decimal_macros::dec!(-0.5));
    }

    #[test]
    fn inverse_vol_ratio_before_normalization() {
        let rows = vec![row("A", 1.0, 1.0), row("B", -1.0, 2.0)];
        let signals = base_signals(1, 1, false);
        let sizing = base_sizing();
        let risk = base_risk();
        let liquidity = LiquiditySection::default();
        let inputs = SizingInputs {
            equity: rust_decimal_macros::dec!(10000),
            rows: &rows,
            symbol_stats: &HashMap::new(),
            adv_usd: &HashMap::new(),
            correlations: &HashMap::new(),
            proxy_atr_ratio: 1.0,
        };
        let weights = compute_target_weights(&signals, &sizing, &risk, &liquidity, &inputs);
        let a = weights["A"].to_f64().unwrap();
        let b = weights["B"].to_f64().unwrap();
        assert!((a.abs() / b.abs() - 2.0).abs() < 0.05);
        let gross = a.abs() + b.abs();
        assert!((gross - 1.0).abs() < 0.01);
    }

    #[test]
    fn gross_leverage_is_respected() {
        let rows = vec![row("A", 2.0, 1.0), row("B", -2.0, 1.0)];
        let signals = base_signals(1, 1, true);
        let sizing = base_sizing();
        let risk = base_risk();
        let liquidity = LiquiditySection::default();
        let inputs = SizingInputs {
            equity: rust_decimal_macros::dec!(10000),
            rows: &rows,
            symbol_stats: &HashMap::new(),
            adv_usd: &HashMap::new(),
            correlations: &HashMap::new(),
            proxy_atr_ratio: 1.0,
        };
        let weights = compute_target_weights(&signals, &sizing, &risk, &liquidity, &inputs);
        let gross: f64 = weights.values().map(|w| w.to_f64().unwrap().abs()).sum();
        assert!((gross - sizing.gross_leverage).abs() < 1e-6);
    }
}
