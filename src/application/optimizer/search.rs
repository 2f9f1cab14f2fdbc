//! TPE-style Bayesian search over the frozen parameter space. Early trials
//! are drawn uniformly at random to seed the estimate; once enough trials
//! have landed, new candidates are drawn by perturbing the best-scoring
//! quartile ("good" trials) with a shrinking Gaussian bandwidth, which is the
//! same good/bad split a tree-structured Parzen estimator uses without
//! pulling in a dedicated optimization crate.

use std::collections::HashMap;

use rand::Rng;
use rayon::prelude::*;

use super::backtest::{self, CostModel};
use crate::config::{Config, OptimizerSection, ParameterRangeSection};
use crate::domain::config_version::ParameterSet;
use crate::domain::market::Bar;

#[derive(Debug, Clone)]
pub struct Trial {
    pub params: ParameterSet,
    pub score: f64,
    pub sharpe: f64,
    pub annualized_return: f64,
    pub calmar: f64,
    pub turnover: f64,
}

struct ParamSpec {
    name: &'static str,
    low: f64,
    high: f64,
    integer: bool,
}

fn param_space(ranges: &ParameterRangeSection) -> Vec<ParamSpec> {
    vec![
        ParamSpec { name: "signal_power", low: ranges.signal_power.0, high: ranges.signal_power.1, integer: false },
        ParamSpec { name: "vol_lookback", low: ranges.vol_lookback.0 as f64, high: ranges.vol_lookback.1 as f64, integer: true },
        ParamSpec { name: "k_min", low: ranges.k_min.0 as f64, high: ranges.k_min.1 as f64, integer: true },
        ParamSpec { name: "k_max", low: ranges.k_max.0 as f64, high: ranges.k_max.1 as f64, integer: true },
        ParamSpec { name: "entry_zscore_min", low: ranges.entry_zscore_min.0, high: ranges.entry_zscore_min.1, integer: false },
        ParamSpec { name: "min_breadth_fraction", low: ranges.min_breadth_fraction.0, high: ranges.min_breadth_fraction.1, integer: false },
        ParamSpec { name: "gross_leverage", low: ranges.gross_leverage.0, high: ranges.gross_leverage.1, integer: false },
        ParamSpec { name: "max_weight_per_asset", low: ranges.max_weight_per_asset.0, high: ranges.max_weight_per_asset.1, integer: false },
        ParamSpec { name: "atr_mult_sl", low: ranges.atr_mult_sl.0, high: ranges.atr_mult_sl.1, integer: false },
        ParamSpec { name: "trail_atr_mult", low: ranges.trail_atr_mult.0, high: ranges.trail_atr_mult.1, integer: false },
        ParamSpec { name: "target_ann_vol", low: ranges.target_ann_vol.0, high: ranges.target_ann_vol.1, integer: false },
    ]
}

fn random_candidate(rng: &mut impl Rng, specs: &[ParamSpec]) -> ParameterSet {
    let mut values = std::collections::BTreeMap::new();
    for spec in specs {
        let raw = rng.random_range(spec.low..=spec.high);
        let v = if spec.integer { raw.round() } else { raw };
        values.insert(spec.name.to_string(), v);
    }
    clamp_k(&mut values, specs);
    ParameterSet { values }
}

fn clamp_k(values: &mut std::collections::BTreeMap<String, f64>, specs: &[ParamSpec]) {
    let k_min = values.get("k_min").copied().unwrap_or(1.0);
    let k_max = values.get("k_max").copied().unwrap_or(k_min);
    if k_max < k_min {
        let k_max_spec = specs.iter().find(|s| s.name == "k_max");
        let hi = k_max_spec.map(|s| s.high).unwrap_or(k_min);
        values.insert("k_max".to_string(), k_min.max(k_max).min(hi).max(k_min));
    }
}

/// Samples one standard-normal value via Box-Muller, avoiding a dependency on
/// a distributions crate for a single call site.
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.random_range(1e-12..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Perturbs a "good" trial's parameters with Gaussian noise scaled by a
/// fraction of each parameter's configured range, clamped back into range.
fn perturbed_candidate(rng: &mut impl Rng, base: &ParameterSet, specs: &[ParamSpec], bandwidth: f64) -> ParameterSet {
    let mut values = std::collections::BTreeMap::new();
    for spec in specs {
        let center = base.get(spec.name).unwrap_or((spec.low + spec.high) / 2.0);
        let sigma = ((spec.high - spec.low) * bandwidth).max(1e-6);
        let raw = (center + standard_normal(rng) * sigma).clamp(spec.low, spec.high);
        let v = if spec.integer { raw.round() } else { raw };
        values.insert(spec.name.to_string(), v);
    }
    clamp_k(&mut values, specs);
    ParameterSet { values }
}

fn objective_score(result: &backtest::BacktestResult, weights: &crate::config::ObjectiveWeightsSection, periods_per_year: f64) -> (f64, f64, f64, f64, f64) {
    let sharpe = result.sharpe(periods_per_year);
    let ann_return = result.annualized_return(periods_per_year);
    let calmar = result.calmar(periods_per_year);
    let turnover = result.average_turnover();
    let score = weights.w_sharpe * sharpe + weights.w_cagr * ann_return + weights.w_calmar * calmar
        - weights.lambda_turnover * turnover;
    (score, sharpe, ann_return, calmar, turnover)
}

/// Runs `optimizer.trials_per_segment` trials against the training window,
/// parallelized across CPU cores via rayon since each trial is an
/// independent backtest. Returns trials sorted best-score-first.
pub fn search_training_window(
    base_config: &Config,
    train_bars: &HashMap<String, Vec<Bar>>,
    optimizer: &OptimizerSection,
    periods_per_year: f64,
    skip_bad_combo: impl Fn(&str) -> bool + Sync,
) -> Vec<Trial> {
    let specs = param_space(&optimizer.ranges);
    let n_random = ((optimizer.trials_per_segment as f64) * optimizer.random_trial_fraction).ceil() as usize;
    let n_random = n_random.max(1).min(optimizer.trials_per_segment);

    let mut rng = rand::rng();
    let mut candidates: Vec<ParameterSet> = (0..n_random).map(|_| random_candidate(&mut rng, &specs)).collect();

    let mut all_trials: Vec<Trial> = Vec::new();
    let mut remaining = optimizer.trials_per_segment.saturating_sub(n_random);

    loop {
        let cost = CostModel {
            fee_bps: (optimizer.fee_bps_range.0 + optimizer.fee_bps_range.1) / 2.0,
            slippage_bps: (optimizer.slippage_bps_range.0 + optimizer.slippage_bps_range.1) / 2.0,
            funding_bps_per_period: 0.0,
        };
        let batch: Vec<Trial> = candidates
            .into_par_iter()
            .filter(|params| !skip_bad_combo(&params.stable_key()))
            .map(|params| {
                let config = backtest::apply_parameter_set(base_config, &params);
                let result = backtest::run_backtest(&config, train_bars, &cost, 30);
                let (score, sharpe, annualized_return, calmar, turnover) =
                    objective_score(&result, &optimizer.objective, periods_per_year);
                Trial {
                    params,
                    score,
                    sharpe,
                    annualized_return,
                    calmar,
                    turnover,
                }
            })
            .collect();
        all_trials.extend(batch);

        if remaining == 0 || all_trials.is_empty() {
            break;
        }

        let batch_size = remaining.min(optimizer.trials_per_segment.max(1));
        let mut sorted: Vec<&Trial> = all_trials.iter().collect();
        sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        let good_cutoff = (sorted.len() / 4).max(1);
        let good: Vec<&ParameterSet> = sorted.iter().take(good_cutoff).map(|t| &t.params).collect();

        let mut rng = rand::rng();
        let bandwidth = 0.2;
        candidates = (0..batch_size)
            .map(|_| {
                let base = good[rng.random_range(0..good.len())];
                perturbed_candidate(&mut rng, base, &specs, bandwidth)
            })
            .collect();
        remaining = remaining.saturating_sub(batch_size);
    }

    all_trials.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
    all_trials
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trending_bars(n: usize, drift: f64) -> Vec<Bar> {
        use rust_decimal::Decimal;
        use rust_decimal_macros::dec;
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
    fn search_returns_trials_sorted_by_score() {
        let config = Config::default();
        let mut optimizer = OptimizerSection::default();
        optimizer.trials_per_segment = 8;
        optimizer.random_trial_fraction = 0.5;

        let mut bars = HashMap::new();
        bars.insert("A".to_string(), trending_bars(120, 0.01));
        bars.insert("B".to_string(), trending_bars(120, -0.01));

        let trials = search_training_window(&config, &bars, &optimizer, 24.0 * 365.0, |_| false);
        assert!(!trials.is_empty());
        for pair in trials.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn bad_combo_predicate_skips_candidates() {
        let config = Config::default();
        let mut optimizer = OptimizerSection::default();
        optimizer.trials_per_segment = 4;
        optimizer.random_trial_fraction = 1.0;

        let mut bars = HashMap::new();
        bars.insert("A".to_string(), trending_bars(120, 0.005));
        bars.insert("B".to_string(), trending_bars(120, -0.005));

        let trials = search_training_window(&config, &bars, &optimizer, 24.0 * 365.0, |_| true);
        assert!(trials.is_empty());
    }
}
