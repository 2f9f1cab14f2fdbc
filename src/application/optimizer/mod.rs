//! Offline walk-forward / Bayesian / Monte-Carlo parameter optimizer.
//!
//! Runs single-shot, outside the trading engine's address space, driven by
//! `bin/optimizer.rs`. Communicates with the engine only through versioned
//! config files (`versioning`) and the OHLCV cache it is handed by the
//! caller; see `application::optimizer::run` for the nine-step pipeline.

pub mod backtest;
pub mod monte_carlo;
pub mod search;
pub mod versioning;
pub mod walk_forward;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::domain::config_version::{ConfigVersionMetadata, ParameterSet, SegmentMetrics};
use crate::domain::errors::OptimizerError;
use crate::domain::market::Bar;
use crate::infrastructure::persistence::optimizer_db::{BadComboRecord, OptimizerDb, RunRecord, SegmentResultRecord};

use backtest::{BacktestResult, CostModel};

#[derive(Debug, Clone)]
pub struct OptimizerRunOutcome {
    pub run_id: Uuid,
    pub deployed: bool,
    pub baseline_oos_sharpe: f64,
    pub candidate_oos_sharpe: f64,
    pub candidate_annualized_return: f64,
    pub version_id: Option<String>,
    pub segment_metrics: Vec<SegmentMetrics>,
}

fn mid_cost(optimizer: &crate::config::OptimizerSection) -> CostModel {
    CostModel {
        fee_bps: (optimizer.fee_bps_range.0 + optimizer.fee_bps_range.1) / 2.0,
        slippage_bps: (optimizer.slippage_bps_range.0 + optimizer.slippage_bps_range.1) / 2.0,
        funding_bps_per_period: 0.0,
    }
}

fn window_for(bars_by_symbol: &HashMap<String, Vec<Bar>>, start: usize, end: usize) -> HashMap<String, Vec<Bar>> {
    bars_by_symbol
        .iter()
        .map(|(symbol, bars)| (symbol.clone(), walk_forward::slice(bars, start, end).to_vec()))
        .collect()
}

fn concat_results(parts: &[BacktestResult]) -> BacktestResult {
    let mut combined = BacktestResult::default();
    let mut equity = 1.0_f64;
    combined.equity_curve.push(equity);
    for part in parts {
        for (i, &ret) in part.period_returns.iter().enumerate() {
            equity *= 1.0 + ret;
            combined.period_returns.push(ret);
            combined.gross_period_returns.push(part.gross_period_returns.get(i).copied().unwrap_or(ret));
            combined.turnover_per_period.push(part.turnover_per_period.get(i).copied().unwrap_or(0.0));
            combined.equity_curve.push(equity);
        }
    }
    combined
}

struct CandidateEvaluation {
    params: ParameterSet,
    per_segment: Vec<SegmentMetrics>,
    combined_oos: BacktestResult,
}

fn evaluate_candidate(
    config: &Config,
    params: &ParameterSet,
    bars_by_symbol: &HashMap<String, Vec<Bar>>,
    segments: &[walk_forward::Segment],
    optimizer: &crate::config::OptimizerSection,
    periods_per_year: f64,
) -> CandidateEvaluation {
    let candidate_config = backtest::apply_parameter_set(config, params);
    let cost = mid_cost(optimizer);
    let mut per_segment = Vec::with_capacity(segments.len());
    let mut oos_parts = Vec::with_capacity(segments.len());

    for segment in segments {
        let train_window = window_for(bars_by_symbol, segment.train_start, segment.train_end);
        let oos_window = window_for(bars_by_symbol, segment.oos_start, segment.oos_end);
        let train_result = backtest::run_backtest(&candidate_config, &train_window, &cost, 30);
        let oos_result = backtest::run_backtest(&candidate_config, &oos_window, &cost, 0);

        per_segment.push(SegmentMetrics {
            train_sharpe: train_result.sharpe(periods_per_year),
            oos_sharpe: oos_result.sharpe(periods_per_year),
            oos_annualized_return: oos_result.annualized_return(periods_per_year),
            oos_max_drawdown: oos_result.max_drawdown(),
            oos_calmar: oos_result.calmar(periods_per_year),
            mc_p95_drawdown: 0.0,
            mc_p99_drawdown: 0.0,
        });
        oos_parts.push(oos_result);
    }

    CandidateEvaluation {
        params: params.clone(),
        per_segment,
        combined_oos: concat_results(&oos_parts),
    }
}

fn mean(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Runs the full nine-step pipeline: segmentation, per-segment Bayesian
/// search, pooled OOS evaluation, Monte-Carlo stress, aggregation, candidate
/// selection, the deployment gate, and (if the gate passes) versioning.
/// `bars_by_symbol` must already cover enough history for
/// `optimizer.{train_days,oos_days,embargo_days} * segments`; callers are
/// responsible for fetching and validating it first (§4.1/§4.2).
pub async fn run(config: &Config, bars_by_symbol: &HashMap<String, Vec<Bar>>, db: &OptimizerDb) -> Result<OptimizerRunOutcome, OptimizerError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let optimizer = &config.optimizer;

    let timeframe_millis = parse_timeframe_millis(&config.exchange.timeframe);
    let periods_per_year = walk_forward::bars_per_day(timeframe_millis) as f64 * 365.0;

    let min_bars = bars_by_symbol.values().map(|b| b.len()).min().unwrap_or(0);
    let needed = (optimizer.train_days + optimizer.oos_days + optimizer.embargo_days) as usize
        * walk_forward::bars_per_day(timeframe_millis)
        * optimizer.segments.max(1);
    if min_bars < needed {
        return Err(OptimizerError::InsufficientHistory {
            symbol: bars_by_symbol.keys().next().cloned().unwrap_or_default(),
            needed,
            have: min_bars,
        });
    }

    let segments = walk_forward::build_segments(
        min_bars,
        timeframe_millis,
        optimizer.train_days,
        optimizer.oos_days,
        optimizer.embargo_days,
        optimizer.segments,
    );
    if segments.is_empty() {
        return Err(OptimizerError::NoSegments);
    }

    // Step 3: per-segment Bayesian search, skipping remembered bad combos.
    let bad_combos: HashSet<String> = db.list_bad_combo_hashes().await?.into_iter().collect();
    let mut pooled: HashMap<String, ParameterSet> = HashMap::new();
    let mut all_trial_scores: Vec<(ParameterSet, f64)> = Vec::new();
    for segment in &segments {
        let train_window = window_for(bars_by_symbol, segment.train_start, segment.train_end);
        let trials =
            search::search_training_window(config, &train_window, optimizer, periods_per_year, |key| bad_combos.contains(key));
        for trial in trials.iter().take(optimizer.top_k_oos) {
            pooled.entry(trial.params.stable_key()).or_insert_with(|| trial.params.clone());
        }
        for trial in &trials {
            all_trial_scores.push((trial.params.clone(), trial.score));
        }
    }
    if pooled.is_empty() {
        return Err(OptimizerError::NoViableCandidates);
    }

    // Step 4 + 6: OOS-evaluate every pooled candidate across every segment,
    // then fold per-segment metrics into a mean/stability aggregate.
    let baseline_params = baseline_parameter_set(config);
    let baseline_eval = evaluate_candidate(config, &baseline_params, bars_by_symbol, &segments, optimizer, periods_per_year);
    let baseline_mc = monte_carlo::stress(&baseline_eval.combined_oos, optimizer);
    let baseline_sharpe = baseline_eval.combined_oos.sharpe(periods_per_year);
    let baseline_ann_return = baseline_eval.combined_oos.annualized_return(periods_per_year);

    let evaluations: Vec<CandidateEvaluation> = pooled
        .into_values()
        .map(|params| evaluate_candidate(config, &params, bars_by_symbol, &segments, optimizer, periods_per_year))
        .collect();

    // Step 5 + 7: Monte-Carlo stress each candidate, then rank and reject.
    let mut scored: Vec<(CandidateEvaluation, monte_carlo::MonteCarloStats, f64, f64)> = evaluations
        .into_iter()
        .map(|eval| {
            let mc = monte_carlo::stress(&eval.combined_oos, optimizer);
            let sharpe = eval.combined_oos.sharpe(periods_per_year);
            let ann_return = eval.combined_oos.annualized_return(periods_per_year);
            (eval, mc, sharpe, ann_return)
        })
        .filter(|(_, mc, _, _)| mc.tail_drawdown <= optimizer.tail_dd_limit)
        .filter(|(_, mc, _, _)| mc.p99_drawdown <= baseline_mc.p99_drawdown + optimizer.max_dd_increase)
        .collect();
    scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap());

    info!(
        segment_count = segments.len(),
        baseline_mean_segment_sharpe = mean(baseline_eval.per_segment.iter().map(|s| s.oos_sharpe)),
        candidate_pool_size = scored.len(),
        "aggregated walk-forward segments"
    );

    let finished_at = Utc::now();
    let best = scored.into_iter().next();

    let (deployed, candidate_sharpe, candidate_ann_return, version_id, segment_metrics) = match best {
        Some((eval, _mc, sharpe, ann_return))
            if sharpe - baseline_sharpe >= optimizer.min_improve_sharpe
                && ann_return - baseline_ann_return >= optimizer.min_improve_annualized =>
        {
            let version_id = versioning::new_version_id();
            let backup_of = versioning::current_live_version(&config.paths).await;
            let candidate_config = backtest::apply_parameter_set(config, &eval.params);
            let metadata = ConfigVersionMetadata {
                version_id: version_id.clone(),
                created_at: finished_at,
                parameters: eval.params.clone(),
                baseline_oos_sharpe: baseline_sharpe,
                candidate_oos_sharpe: sharpe,
                segment_metrics: eval.per_segment.clone(),
                deployed: true,
                backup_of,
            };
            versioning::deploy(&config.paths, &candidate_config, &metadata).await?;
            (true, sharpe, ann_return, Some(version_id), eval.per_segment)
        }
        Some((eval, _, sharpe, ann_return)) => (false, sharpe, ann_return, None, eval.per_segment),
        None => (false, baseline_sharpe, baseline_ann_return, None, baseline_eval.per_segment.clone()),
    };

    record_ledger(db, run_id, started_at, finished_at, deployed, baseline_sharpe, candidate_sharpe, &segment_metrics).await?;
    record_bad_combos(db, &all_trial_scores, optimizer.bad_combo_decile, finished_at).await?;

    info!(
        run_id = %run_id,
        deployed,
        baseline_sharpe,
        candidate_sharpe,
        "optimizer run complete"
    );

    Ok(OptimizerRunOutcome {
        run_id,
        deployed,
        baseline_oos_sharpe: baseline_sharpe,
        candidate_oos_sharpe: candidate_sharpe,
        candidate_annualized_return: candidate_ann_return,
        version_id,
        segment_metrics,
    })
}

fn baseline_parameter_set(config: &Config) -> ParameterSet {
    let mut values = std::collections::BTreeMap::new();
    values.insert("signal_power".to_string(), config.signals.signal_power);
    values.insert("vol_lookback".to_string(), config.signals.vol_lookback as f64);
    values.insert("k_min".to_string(), config.signals.k_min as f64);
    values.insert("k_max".to_string(), config.signals.k_max as f64);
    values.insert("entry_zscore_min".to_string(), config.signals.entry_zscore_min);
    values.insert("min_breadth_fraction".to_string(), config.signals.min_breadth_fraction);
    values.insert("gross_leverage".to_string(), config.sizing.gross_leverage);
    values.insert("max_weight_per_asset".to_string(), config.sizing.max_weight_per_asset);
    values.insert("atr_mult_sl".to_string(), config.risk.atr_mult_sl);
    values.insert("trail_atr_mult".to_string(), config.risk.trail_atr_mult);
    values.insert("target_ann_vol".to_string(), config.sizing.vol_target.target_ann_vol);
    ParameterSet { values }
}

fn parse_timeframe_millis(raw: &str) -> i64 {
    let raw = raw.trim();
    let (num, unit) = raw.split_at(raw.len().saturating_sub(1));
    let value: i64 = num.parse().unwrap_or(1);
    match unit {
        "m" => value * 60_000,
        "h" => value * 3_600_000,
        "d" => value * 86_400_000,
        _ => 3_600_000,
    }
}

async fn record_ledger(
    db: &OptimizerDb,
    run_id: Uuid,
    started_at: chrono::DateTime<Utc>,
    finished_at: chrono::DateTime<Utc>,
    deployed: bool,
    baseline_sharpe: f64,
    candidate_sharpe: f64,
    segment_metrics: &[SegmentMetrics],
) -> Result<(), OptimizerError> {
    db.record_run(&RunRecord {
        run_id,
        started_at,
        finished_at,
        deployed,
        baseline_oos_sharpe: baseline_sharpe,
        candidate_oos_sharpe: candidate_sharpe,
    })
    .await?;
    for (index, metrics) in segment_metrics.iter().enumerate() {
        db.record_segment(&SegmentResultRecord {
            run_id,
            segment_index: index as i64,
            train_sharpe: metrics.train_sharpe,
            oos_sharpe: metrics.oos_sharpe,
            oos_max_drawdown: metrics.oos_max_drawdown,
        })
        .await?;
    }
    Ok(())
}

async fn record_bad_combos(
    db: &OptimizerDb,
    trials: &[(ParameterSet, f64)],
    decile: f64,
    now: chrono::DateTime<Utc>,
) -> Result<(), OptimizerError> {
    if trials.is_empty() {
        return Ok(());
    }
    let mut ranked: Vec<&(ParameterSet, f64)> = trials.iter().collect();
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
    let cutoff = ((ranked.len() as f64) * decile).ceil() as usize;
    let mut seen = HashSet::new();
    for (rank, (params, _score)) in ranked.into_iter().take(cutoff.max(1)).enumerate() {
        let key = params.stable_key();
        if !seen.insert(key.clone()) {
            continue;
        }
        let percentile = rank as f64 / trials.len().max(1) as f64;
        db.record_bad_combo(
            &BadComboRecord {
                parameter_hash: key,
                score_percentile: percentile,
            },
            now,
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

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

    #[tokio::test]
    async fn insufficient_history_is_reported_before_any_search() {
        let mut config = Config::default();
        config.optimizer.segments = 1;
        config.optimizer.train_days = 30;
        config.optimizer.oos_days = 10;
        config.optimizer.embargo_days = 1;

        let mut bars = HashMap::new();
        bars.insert("A".to_string(), trending_bars(50, 0.001));

        let path = std::env::temp_dir().join(format!("xsmom_opt_test_{}.sqlite", Uuid::new_v4()));
        let db = OptimizerDb::connect(&path).await.expect("connect");
        let result = run(&config, &bars, &db).await;
        assert!(matches!(result, Err(OptimizerError::InsufficientHistory { .. })));
        let _ = std::fs::remove_file(&path);
    }

    fn flat_bars(n: usize, price: f64) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar {
                timestamp_ms: i as i64 * 3_600_000,
                open: Decimal::try_from(price).unwrap(),
                high: Decimal::try_from(price).unwrap(),
                low: Decimal::try_from(price).unwrap(),
                close: Decimal::try_from(price).unwrap(),
                volume: dec!(1000),
            })
            .collect()
    }

    /// Flat, zero-variance price series carry no cross-sectional momentum
    /// signal, so every candidate's OOS Sharpe collapses to the same value
    /// as the training Sharpe (both zero) and the deployment gate must
    /// reject every candidate since `min_improve_sharpe` is strictly
    /// positive by default.
    #[tokio::test]
    async fn constant_data_yields_no_deployment() {
        let mut config = Config::default();
        config.optimizer.segments = 1;
        config.optimizer.train_days = 2;
        config.optimizer.oos_days = 1;
        config.optimizer.embargo_days = 0;
        config.optimizer.trials_per_segment = 5;
        config.optimizer.top_k_oos = 2;
        config.optimizer.mc_iterations = 10;

        let mut bars = HashMap::new();
        bars.insert("A".to_string(), flat_bars(200, 100.0));
        bars.insert("B".to_string(), flat_bars(200, 50.0));
        bars.insert("C".to_string(), flat_bars(200, 10.0));

        let path = std::env::temp_dir().join(format!("xsmom_opt_test_{}.sqlite", Uuid::new_v4()));
        let db = OptimizerDb::connect(&path).await.expect("connect");
        let outcome = run(&config, &bars, &db).await.expect("run should complete");
        assert!(!outcome.deployed);
        assert!((outcome.baseline_oos_sharpe - outcome.candidate_oos_sharpe).abs() < 1e-6);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn parses_common_timeframe_suffixes() {
        assert_eq!(parse_timeframe_millis("1h"), 3_600_000);
        assert_eq!(parse_timeframe_millis("5m"), 300_000);
        assert_eq!(parse_timeframe_millis("1d"), 86_400_000);
    }

    #[test]
    fn mean_of_empty_iterator_is_zero() {
        assert_eq!(mean(std::iter::empty()), 0.0);
    }
}
