//! Fast, single-process backtest evaluator used by the optimizer's search and
//! OOS stages. Runs the same signal and sizing stack the live trading engine
//! uses (`application::signal_engine`, `application::sizing_engine`) over a
//! historical bar window bar-by-bar, without order placement, stop
//! simulation, or state persistence — the optimizer only needs the resulting
//! equity curve and period returns to score a parameter set.

use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::application::signal_engine::SignalEngine;
use crate::application::sizing_engine::{self, SizingInputs};
use crate::config::Config;
use crate::domain::config_version::ParameterSet;
use crate::domain::market::Bar;
use crate::domain::trading::SymbolStats;

/// Applies the optimizer's tunable parameter map onto a config clone. Only
/// the frozen-range fields named in the parameter space are touched; safety
/// limits under `risk.{max_daily_loss_pct,max_portfolio_drawdown_pct}` are
/// never part of `ParameterSet` and so are structurally unreachable here.
pub fn apply_parameter_set(base: &Config, params: &ParameterSet) -> Config {
    let mut config = base.clone();
    if let Some(v) = params.get("signal_power") {
        config.signals.signal_power = v;
    }
    if let Some(v) = params.get("vol_lookback") {
        config.signals.vol_lookback = v.round().max(2.0) as usize;
    }
    if let Some(v) = params.get("k_min") {
        config.signals.k_min = v.round().max(1.0) as usize;
    }
    if let Some(v) = params.get("k_max") {
        config.signals.k_max = v.round().max(config.signals.k_min as f64) as usize;
    }
    if let Some(v) = params.get("entry_zscore_min") {
        config.signals.entry_zscore_min = v;
    }
    if let Some(v) = params.get("min_breadth_fraction") {
        config.signals.min_breadth_fraction = v;
    }
    if let Some(v) = params.get("gross_leverage") {
        config.sizing.gross_leverage = v;
    }
    if let Some(v) = params.get("max_weight_per_asset") {
        config.sizing.max_weight_per_asset = v;
    }
    if let Some(v) = params.get("atr_mult_sl") {
        config.risk.atr_mult_sl = v;
    }
    if let Some(v) = params.get("trail_atr_mult") {
        config.risk.trail_atr_mult = v;
    }
    if let Some(v) = params.get("target_ann_vol") {
        config.sizing.vol_target.target_ann_vol = v;
    }
    config
}

#[derive(Debug, Clone, Default)]
pub struct BacktestResult {
    /// Per-rebalance-period net returns on equity, after transaction costs.
    pub period_returns: Vec<f64>,
    /// Same periods before transaction/funding costs were subtracted, kept
    /// so Monte-Carlo stress can resample raw market exposure and reapply a
    /// perturbed cost model rather than perturbing an already-net number.
    pub gross_period_returns: Vec<f64>,
    pub equity_curve: Vec<f64>,
    pub turnover_per_period: Vec<f64>,
}

impl BacktestResult {
    pub fn sharpe(&self, periods_per_year: f64) -> f64 {
        if self.period_returns.len() < 2 {
            return 0.0;
        }
        let mean = self.period_returns.iter().sum::<f64>() / self.period_returns.len() as f64;
        let var = self
            .period_returns
            .iter()
            .map(|r| (r - mean).powi(2))
            .sum::<f64>()
            / (self.period_returns.len() - 1) as f64;
        let std = var.sqrt();
        if std < 1e-12 {
            return 0.0;
        }
        mean / std * periods_per_year.sqrt()
    }

    pub fn annualized_return(&self, periods_per_year: f64) -> f64 {
        let Some(&first) = self.equity_curve.first() else {
            return 0.0;
        };
        let Some(&last) = self.equity_curve.last() else {
            return 0.0;
        };
        if first <= 0.0 || self.equity_curve.len() < 2 {
            return 0.0;
        }
        let periods = (self.equity_curve.len() - 1) as f64;
        (last / first).powf(periods_per_year / periods) - 1.0
    }

    pub fn max_drawdown(&self) -> f64 {
        let mut peak = f64::MIN;
        let mut max_dd: f64 = 0.0;
        for &equity in &self.equity_curve {
            peak = peak.max(equity);
            if peak > 0.0 {
                let dd = (peak - equity) / peak;
                max_dd = max_dd.max(dd);
            }
        }
        max_dd
    }

    pub fn calmar(&self, periods_per_year: f64) -> f64 {
        let dd = self.max_drawdown();
        if dd < 1e-9 {
            return 0.0;
        }
        self.annualized_return(periods_per_year) / dd
    }

    pub fn average_turnover(&self) -> f64 {
        if self.turnover_per_period.is_empty() {
            return 0.0;
        }
        self.turnover_per_period.iter().sum::<f64>() / self.turnover_per_period.len() as f64
    }
}

pub struct CostModel {
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub funding_bps_per_period: f64,
}

/// Runs the signal/sizing pipeline bar-by-bar over `bars_by_symbol`, assuming
/// every symbol shares the same timestamps and is already truncated to the
/// window under test. `warmup` is the number of leading bars consumed before
/// the first rebalance so lookbacks have enough history.
pub fn run_backtest(config: &Config, bars_by_symbol: &HashMap<String, Vec<Bar>>, cost: &CostModel, warmup: usize) -> BacktestResult {
    let mut result = BacktestResult::default();
    let Some(n_bars) = bars_by_symbol.values().map(|b| b.len()).min() else {
        return result;
    };
    if n_bars <= warmup + 1 {
        return result;
    }

    let bars_per_day = walk_forward_bars_per_day(bars_by_symbol);
    let signal_engine = SignalEngine::new(&config.signals, &config.filters, bars_per_day);
    let stats: HashMap<String, SymbolStats> = HashMap::new();

    let mut equity = 1.0_f64;
    result.equity_curve.push(equity);
    let mut prev_weights: HashMap<String, f64> = HashMap::new();

    for t in warmup..n_bars - 1 {
        let window: HashMap<String, Vec<Bar>> = bars_by_symbol
            .iter()
            .map(|(symbol, bars)| (symbol.clone(), bars[..=t].to_vec()))
            .collect();

        let signal_output = signal_engine.compute(&window, &stats, Utc::now());
        let equity_decimal = Decimal::try_from(equity).unwrap_or(Decimal::ONE);
        let adv_usd: HashMap<String, f64> = HashMap::new();
        let correlations: HashMap<(String, String), f64> = HashMap::new();
        let inputs = SizingInputs {
            equity: equity_decimal,
            rows: &signal_output.rows,
            symbol_stats: &stats,
            adv_usd: &adv_usd,
            correlations: &correlations,
            proxy_atr_ratio: 1.0,
        };
        let target_weights = sizing_engine::compute_target_weights(
            &config.signals,
            &config.sizing,
            &config.risk,
            &config.liquidity,
            &inputs,
        );

        let weights: HashMap<String, f64> = target_weights
            .into_iter()
            .map(|(symbol, w)| (symbol, w.to_f64().unwrap_or(0.0)))
            .collect();

        let mut turnover = 0.0;
        for (symbol, w) in &weights {
            turnover += (w - prev_weights.get(symbol).copied().unwrap_or(0.0)).abs();
        }
        for (symbol, prev_w) in &prev_weights {
            if !weights.contains_key(symbol) {
                turnover += prev_w.abs();
            }
        }

        let mut period_return = 0.0;
        for (symbol, &w) in &prev_weights {
            let Some(bars) = bars_by_symbol.get(symbol) else { continue };
            let close_t = to_f64(bars[t].close);
            let close_prev = to_f64(bars[t - 1].close);
            if close_prev.abs() < 1e-12 {
                continue;
            }
            period_return += w * (close_t / close_prev - 1.0);
        }

        let cost_bps = cost.fee_bps + cost.slippage_bps;
        let transaction_cost = turnover * cost_bps / 10_000.0;
        let funding_cost = prev_weights.values().map(|w| w.abs()).sum::<f64>() * cost.funding_bps_per_period / 10_000.0;
        let net_return = period_return - transaction_cost - funding_cost;

        equity *= 1.0 + net_return;
        result.period_returns.push(net_return);
        result.gross_period_returns.push(period_return);
        result.equity_curve.push(equity);
        result.turnover_per_period.push(turnover);

        prev_weights = weights;
    }

    result
}

fn walk_forward_bars_per_day(bars_by_symbol: &HashMap<String, Vec<Bar>>) -> f64 {
    let Some(bars) = bars_by_symbol.values().find(|b| b.len() >= 2) else {
        return 24.0;
    };
    let span = (bars[1].timestamp_ms - bars[0].timestamp_ms).max(1);
    (86_400_000.0 / span as f64).max(1.0)
}

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn trending_bars(n: usize, drift: f64) -> Vec<Bar> {
        let mut price = 100.0;
        (0..n)
            .map(|i| {
                price *= 1.0 + drift;
                Bar {
                    timestamp_ms: i as i64 * 3_600_000,
                    open: Decimal::try_from(price).unwrap(),
                    high: Decimal::try_from(price * 1.001).unwrap(),
                    low: Decimal::try_from(price * 0.999).unwrap(),
                    close: Decimal::try_from(price).unwrap(),
                    volume: dec!(1000),
                }
            })
            .collect()
    }

    #[test]
    fn apply_parameter_set_overrides_tunable_fields_only() {
        let base = Config::default();
        let mut values = BTreeMap::new();
        values.insert("signal_power".to_string(), 1.3);
        values.insert("gross_leverage".to_string(), 0.9);
        let params = ParameterSet { values };
        let config = apply_parameter_set(&base, &params);
        assert_eq!(config.signals.signal_power, 1.3);
        assert_eq!(config.sizing.gross_leverage, 0.9);
        assert_eq!(config.risk.max_daily_loss_pct, base.risk.max_daily_loss_pct);
    }

    #[test]
    fn diverging_trend_produces_nonzero_returns() {
        let mut config = Config::default();
        config.signals.k_min = 1;
        config.signals.k_max = 1;
        config.signals.entry_zscore_min = 0.0;
        config.signals.min_breadth_fraction = 0.0;
        config.filters.regime_filter.enabled = false;
        config.filters.symbol_filter.enabled = false;

        let mut bars_by_symbol = HashMap::new();
        bars_by_symbol.insert("A".to_string(), trending_bars(60, 0.01));
        bars_by_symbol.insert("B".to_string(), trending_bars(60, -0.01));

        let cost = CostModel {
            fee_bps: 2.0,
            slippage_bps: 1.0,
            funding_bps_per_period: 0.0,
        };
        let result = run_backtest(&config, &bars_by_symbol, &cost, 30);
        assert!(!result.period_returns.is_empty());
        assert!(result.equity_curve.last().copied().unwrap_or(0.0) > 0.0);
    }
}
