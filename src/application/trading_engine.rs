//! Main trading cycle: the §4.6 orchestration of risk gates, signal/sizing,
//! order reconciliation and state persistence. One `run_cycle` call is one
//! tick of the wall-clock schedule anchored to `execution.rebalance_minute`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::errors::EngineError;
use crate::domain::market::{Bar, Timeframe, UniverseSnapshot};
use crate::domain::ports::{ExchangeAdapter, MetaLabeler, Notifier, StateStore};
use crate::domain::trading::{CooldownReason, EquityPoint, OrderSide, Position, ProfitRung};
use crate::infrastructure::metrics::Metrics;
use crate::infrastructure::ohlcv_cache::{validate_bars, OhlcvCache};

use super::risk_controller::{self, RiskControllerInputs, RiskDecision};
use super::signal_engine::SignalEngine;
use super::sizing_engine::{self, SizingInputs, TargetWeightMap};
use super::state::StateDocument;

/// Long enough to cover the 365-day long-term drawdown check with margin.
const EQUITY_HISTORY_RETENTION_DAYS: i64 = 400;

pub struct TradingEngine {
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub cache: Arc<OhlcvCache>,
    pub state_store: Arc<dyn StateStore>,
    pub notifier: Arc<dyn Notifier>,
    pub meta_labeler: Arc<dyn MetaLabeler>,
    pub metrics: Option<Arc<Metrics>>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub decision: Option<String>,
    pub orders_placed: usize,
    pub orders_cancelled: usize,
    pub gates_fired: usize,
}

impl TradingEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        cache: Arc<OhlcvCache>,
        state_store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        meta_labeler: Arc<dyn MetaLabeler>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            exchange,
            cache,
            state_store,
            notifier,
            meta_labeler,
            metrics,
        }
    }

    pub async fn run_cycle(&self, config: &Config, now: DateTime<Utc>) -> Result<CycleSummary, EngineError> {
        let mut doc = self.state_store.load().await;
        doc.prune_cooldowns(now);
        let mut risk_state = doc
            .risk_state
            .clone()
            .unwrap_or_else(|| crate::domain::risk::RiskState::new(now, Decimal::ZERO));

        let account = match self.exchange.fetch_account_state().await {
            Ok(a) => {
                risk_controller::record_api_success(&config.risk, &mut doc.circuit_breaker, now);
                Some(a)
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch account state");
                risk_controller::record_api_failure(&config.risk, &mut doc.circuit_breaker, now);
                None
            }
        };
        let equity = account.map(|a| a.equity).unwrap_or(risk_state.day_start_equity);
        let margin_ratio = account.map(|a| a.margin_ratio()).unwrap_or(0.0);

        let exchange_positions = self.exchange.fetch_positions().await;
        let reconciliation_ok = exchange_positions.is_ok();
        if let Err(ref e) = exchange_positions {
            warn!(error = %e, "failed to fetch positions for reconciliation");
            risk_controller::record_api_failure(&config.risk, &mut doc.circuit_breaker, now);
        }

        let emergency_stop_present = emergency_stop_path(config).exists();

        let inputs = RiskControllerInputs {
            now,
            equity,
            margin_ratio,
            reconciliation_ok,
            emergency_stop_present,
            equity_history: &doc.equity_history,
        };
        let (decision, gates) = risk_controller::evaluate(
            &config.risk,
            &mut risk_state,
            &mut doc.circuit_breaker,
            &inputs,
        );
        for gate in &gates {
            warn!(%gate, "risk gate fired");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_equity(equity);
            metrics.set_margin_ratio(margin_ratio);
            metrics.set_gates_fired(gates.len());
        }

        if let RiskDecision::LiquidateAll = decision {
            warn!("liquidating all open positions per margin hard limit");
            self.liquidate_all(config, &mut doc).await;
            self.notifier.notify("risk: liquidating all positions (margin hard limit)").await;
        }

        if !matches!(decision, RiskDecision::Proceed) {
            doc.risk_state = Some(risk_state);
            doc.heartbeat = Some(now);
            self.persist(&doc).await?;
            return Ok(CycleSummary {
                decision: Some(format!("{decision:?}")),
                gates_fired: gates.len(),
                ..Default::default()
            });
        }

        let instruments = self
            .exchange
            .list_instruments()
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("failed to list instruments: {e}")))?;
        let universe = UniverseSnapshot { instruments };

        let timeframe = parse_timeframe(&config.exchange.timeframe);
        let bars_per_day = 86_400_000.0 / timeframe.millis() as f64;
        let mut bars_by_symbol: HashMap<String, Vec<Bar>> = HashMap::new();
        for instrument in &universe.instruments {
            match self
                .exchange
                .fetch_bars(instrument, timeframe, config.exchange.candles_limit)
                .await
            {
                Ok(bars) => {
                    let findings = validate_bars(
                        &instrument.symbol,
                        timeframe,
                        &bars,
                        config.data.validation.spike_zscore_threshold,
                        config.data.validation.spike_lookback,
                    );
                    for finding in &findings {
                        warn!(%finding, "data quality finding");
                    }
                    if let Err(e) = self.cache.ingest(&instrument.symbol, timeframe, &bars).await {
                        warn!(symbol = %instrument.symbol, error = %e, "failed to write through bar cache");
                    }
                    bars_by_symbol.insert(instrument.symbol.clone(), bars);
                }
                Err(e) => warn!(symbol = %instrument.symbol, error = %e, "failed to fetch bars"),
            }
        }

        let signal_engine = SignalEngine::new(&config.signals, &config.filters, bars_per_day);
        let signal_output = signal_engine.compute(&bars_by_symbol, &doc.symbol_stats, now);
        if let Some(metrics) = &self.metrics {
            metrics.set_breadth_fraction(signal_output.breadth_fraction);
        }

        let adv_usd = average_dollar_volume(&bars_by_symbol);
        let correlations = pairwise_correlations(&bars_by_symbol, config.sizing.correlation.lookback_hours);
        let proxy_atr_ratio = proxy_volatility_ratio(&bars_by_symbol, &config.sizing.volatility_regime.proxy_symbol);

        let sizing_inputs = SizingInputs {
            equity,
            rows: &signal_output.rows,
            symbol_stats: &doc.symbol_stats,
            adv_usd: &adv_usd,
            correlations: &correlations,
            proxy_atr_ratio,
        };
        let momentum_weights = sizing_engine::compute_target_weights(
            &config.signals,
            &config.sizing,
            &config.risk,
            &config.liquidity,
            &sizing_inputs,
        );

        let momentum_weights: TargetWeightMap = momentum_weights
            .into_iter()
            .filter(|(symbol, _)| self.meta_labeler.keep(symbol, 0.0))
            .collect();

        let final_weights = if config.sizing.carry_budget_frac > 0.0 {
            let carry_weights = self.carry_target_weights(config, &universe).await;
            blend_weights(&momentum_weights, &carry_weights, config.sizing.carry_budget_frac)
        } else {
            momentum_weights
        };

        let mut orders_placed = 0usize;
        let mut orders_cancelled = 0usize;

        let open_orders = self.exchange.fetch_open_orders(None).await.unwrap_or_default();
        for order in &open_orders {
            let target = final_weights.get(&order.symbol).copied();
            let stale = order.age_seconds(now) > config.execution.stale_orders.max_age_sec;
            let off_target = match (&target, &universe.symbol(&order.symbol)) {
                (Some(w), Some(instrument)) => {
                    if let Ok(ticker) = self.exchange.fetch_ticker(&order.symbol).await {
                        let desired_price = desired_entry_price(config, &ticker, *w, instrument);
                        let deviation_bps = ((desired_price - order.price) / order.price.max(Decimal::new(1, 8)))
                            .abs()
                            * Decimal::from(10_000);
                        deviation_bps
                            > Decimal::try_from(config.execution.stale_orders.reprice_if_far_bps).unwrap_or(Decimal::ZERO)
                    } else {
                        false
                    }
                }
                _ => true,
            };
            if stale || off_target {
                if self.exchange.cancel(&order.order_id).await.is_ok() {
                    orders_cancelled += 1;
                }
            }
        }

        for (symbol, weight) in &final_weights {
            if doc.is_on_cooldown(symbol, now) {
                continue;
            }
            let Some(instrument) = universe.symbol(symbol) else {
                continue;
            };
            let Ok(ticker) = self.exchange.fetch_ticker(symbol).await else {
                continue;
            };
            let spread_bps = ticker.spread_bps();
            if spread_bps > Decimal::try_from(config.execution.spread_guard.max_spread_bps).unwrap_or(Decimal::MAX) {
                continue;
            }

            let desired_notional = equity * weight;
            let existing = doc.positions.get(symbol);
            let existing_notional = existing.map(|p| p.size * ticker.last).unwrap_or(Decimal::ZERO);
            let delta_notional = desired_notional - existing_notional;
            if equity.is_zero() {
                continue;
            }
            let delta_bps = (delta_notional / equity).abs() * Decimal::from(10_000);
            if delta_bps < Decimal::try_from(config.execution.min_rebalance_delta_bps).unwrap_or(Decimal::ZERO) {
                continue;
            }

            let side = if delta_notional > Decimal::ZERO { OrderSide::Buy } else { OrderSide::Sell };
            let reduce_only = existing.is_some()
                && ((existing.unwrap().is_long() && side == OrderSide::Sell)
                    || (!existing.unwrap().is_long() && side == OrderSide::Buy));

            let price = desired_entry_price(config, &ticker, *weight, instrument);
            let size = instrument.round_size((delta_notional / price).abs());
            if size.is_zero() || (size * price) < instrument.min_notional {
                continue;
            }

            match self
                .exchange
                .place_limit(symbol, side, price, size, config.execution.post_only, reduce_only)
                .await
            {
                Ok(_order_id) => {
                    orders_placed += 1;
                }
                Err(e) => warn!(%symbol, error = %e, "failed to place order"),
            }
        }

        if let Ok(exchange_positions) = self.exchange.fetch_positions().await {
            reconcile_fills(&mut doc, &exchange_positions, &bars_by_symbol, &config.risk, &config.filters, now);
        }

        doc.push_equity(EquityPoint { timestamp: now, equity }, EQUITY_HISTORY_RETENTION_DAYS);
        doc.risk_state = Some(risk_state);
        doc.heartbeat = Some(now);
        self.persist(&doc).await?;

        info!(orders_placed, orders_cancelled, "trading cycle complete");
        Ok(CycleSummary {
            decision: Some("Proceed".to_string()),
            orders_placed,
            orders_cancelled,
            gates_fired: gates.len(),
        })
    }

    async fn liquidate_all(&self, config: &Config, doc: &mut StateDocument) {
        let symbols: Vec<String> = doc.positions.keys().cloned().collect();
        for symbol in symbols {
            let Ok(ticker) = self.exchange.fetch_ticker(&symbol).await else {
                continue;
            };
            let Some(position) = doc.positions.get(&symbol).cloned() else {
                continue;
            };
            let side = if position.is_long() { OrderSide::Sell } else { OrderSide::Buy };
            let _ = self
                .exchange
                .place_limit(&symbol, side, ticker.last, position.size.abs(), false, true)
                .await;
            let realized_pnl = position.size * (ticker.last - position.entry_price);
            doc.close_position(&symbol, realized_pnl, &config.filters, Utc::now(), CooldownReason::PostStop);
        }
        doc.positions.clear();
    }

    /// Funding/basis carry sleeve: the perpetual's last-traded price relative
    /// to its own recent bar mean is used as a basis proxy, since the
    /// exchange surface exposes no separate funding-rate endpoint. Contango
    /// (last above recent mean) is weighted short; backwardation long.
    async fn carry_target_weights(&self, config: &Config, universe: &UniverseSnapshot) -> TargetWeightMap {
        let mut weights = TargetWeightMap::new();
        let mut raw: HashMap<String, f64> = HashMap::new();
        for instrument in &universe.instruments {
            let bars = self.cache.series(&instrument.symbol, parse_timeframe(&config.exchange.timeframe)).await;
            if bars.len() < 8 {
                continue;
            }
            let Ok(ticker) = self.exchange.fetch_ticker(&instrument.symbol).await else {
                continue;
            };
            let recent_mean: f64 = bars
                .iter()
                .rev()
                .take(24)
                .map(|b| b.close.to_f64().unwrap_or(0.0))
                .sum::<f64>()
                / bars.len().min(24) as f64;
            if recent_mean <= 0.0 {
                continue;
            }
            let last = ticker.last.to_f64().unwrap_or(recent_mean);
            let basis = (last - recent_mean) / recent_mean;
            raw.insert(instrument.symbol.clone(), -basis);
        }
        let gross: f64 = raw.values().map(|w| w.abs()).sum();
        if gross > 1e-9 {
            for (symbol, w) in raw {
                let scaled = w / gross;
                weights.insert(symbol, Decimal::try_from(scaled).unwrap_or(Decimal::ZERO));
            }
        }
        weights
    }

    async fn persist(&self, doc: &StateDocument) -> Result<(), EngineError> {
        self.state_store
            .save(doc)
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("state save failed: {e}")))
    }
}

fn emergency_stop_path(config: &Config) -> PathBuf {
    config
        .paths
        .state_path
        .parent()
        .map(|p| p.join("EMERGENCY_STOP"))
        .unwrap_or_else(|| PathBuf::from("EMERGENCY_STOP"))
}

pub fn parse_timeframe(raw: &str) -> Timeframe {
    match raw {
        "1m" => Timeframe::ONE_MINUTE,
        "5m" => Timeframe::FIVE_MINUTES,
        _ => Timeframe::ONE_HOUR,
    }
}

fn desired_entry_price(
    config: &Config,
    ticker: &crate::domain::ports::Ticker,
    weight: Decimal,
    instrument: &crate::domain::market::Instrument,
) -> Decimal {
    let spread_bps = ticker.spread_bps();
    let offset_bps = (Decimal::try_from(config.execution.dynamic_offset.base_bps).unwrap_or(Decimal::ONE)
        + Decimal::try_from(config.execution.dynamic_offset.per_spread_coeff).unwrap_or(Decimal::ZERO) * spread_bps)
        .min(Decimal::try_from(config.execution.dynamic_offset.max_offset_bps).unwrap_or(Decimal::from(10)));
    let offset_frac = offset_bps / Decimal::from(10_000);
    let raw_price = if weight > Decimal::ZERO {
        ticker.bid * (Decimal::ONE - offset_frac)
    } else {
        ticker.ask * (Decimal::ONE + offset_frac)
    };
    instrument.round_price(raw_price)
}

fn blend_weights(momentum: &TargetWeightMap, carry: &TargetWeightMap, carry_budget_frac: f64) -> TargetWeightMap {
    let momentum_frac = Decimal::try_from(1.0 - carry_budget_frac).unwrap_or(Decimal::ONE);
    let carry_frac = Decimal::try_from(carry_budget_frac).unwrap_or(Decimal::ZERO);
    let mut blended = TargetWeightMap::new();
    for (symbol, w) in momentum {
        blended.insert(symbol.clone(), *w * momentum_frac);
    }
    for (symbol, w) in carry {
        *blended.entry(symbol.clone()).or_insert(Decimal::ZERO) += *w * carry_frac;
    }
    blended
}

fn average_dollar_volume(bars_by_symbol: &HashMap<String, Vec<Bar>>) -> HashMap<String, f64> {
    bars_by_symbol
        .iter()
        .map(|(symbol, bars)| {
            let n = bars.len().min(24).max(1);
            let sum: f64 = bars
                .iter()
                .rev()
                .take(n)
                .map(|b| (b.close * b.volume).to_f64().unwrap_or(0.0))
                .sum();
            (symbol.clone(), sum / n as f64)
        })
        .collect()
}

fn pairwise_correlations(
    bars_by_symbol: &HashMap<String, Vec<Bar>>,
    lookback_hours: usize,
) -> HashMap<(String, String), f64> {
    let mut returns: HashMap<String, Vec<f64>> = HashMap::new();
    for (symbol, bars) in bars_by_symbol {
        let closes: Vec<f64> = bars
            .iter()
            .rev()
            .take(lookback_hours + 1)
            .map(|b| b.close.to_f64().unwrap_or(0.0))
            .collect();
        let rets: Vec<f64> = closes
            .windows(2)
            .filter(|w| w[1] != 0.0)
            .map(|w| (w[0] / w[1]).ln())
            .collect();
        returns.insert(symbol.clone(), rets);
    }
    let symbols: Vec<String> = returns.keys().cloned().collect();
    let mut out = HashMap::new();
    for i in 0..symbols.len() {
        for j in (i + 1)..symbols.len() {
            let a = &returns[&symbols[i]];
            let b = &returns[&symbols[j]];
            let n = a.len().min(b.len());
            if n < 4 {
                continue;
            }
            let corr = pearson(&a[..n], &b[..n]);
            out.insert((symbols[i].clone(), symbols[j].clone()), corr);
        }
    }
    out
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        cov / denom
    }
}

fn proxy_volatility_ratio(bars_by_symbol: &HashMap<String, Vec<Bar>>, proxy_symbol: &str) -> f64 {
    let Some(bars) = bars_by_symbol.get(proxy_symbol) else {
        return 1.0;
    };
    let closes: Vec<f64> = bars.iter().map(|b| b.close.to_f64().unwrap_or(0.0)).collect();
    if closes.len() < 48 {
        return 1.0;
    }
    let recent = realized_vol_slice(&closes[closes.len() - 24..]);
    let baseline = realized_vol_slice(&closes[closes.len() - 48..closes.len() - 24]);
    if baseline < 1e-9 {
        1.0
    } else {
        recent / baseline
    }
}

fn realized_vol_slice(closes: &[f64]) -> f64 {
    let returns: Vec<f64> = closes
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

/// Detects fills since the previous cycle by diffing exchange-reported
/// positions against state; mutates `doc.positions` accordingly (§4.6 step 10,
/// §4.8 startup reconciliation reuses the same adopt/clear logic).
fn reconcile_fills(
    doc: &mut StateDocument,
    exchange_positions: &[crate::domain::ports::ExchangePosition],
    bars_by_symbol: &HashMap<String, Vec<Bar>>,
    risk: &crate::config::RiskSection,
    filters: &crate::config::FiltersSection,
    now: DateTime<Utc>,
) {
    let by_symbol: HashMap<&str, &crate::domain::ports::ExchangePosition> =
        exchange_positions.iter().map(|p| (p.symbol.as_str(), p)).collect();

    let closed_symbols: Vec<String> = doc
        .positions
        .keys()
        .filter(|symbol| {
            by_symbol
                .get(symbol.as_str())
                .is_none_or(|p| p.size.is_zero())
        })
        .cloned()
        .collect();
    for symbol in closed_symbols {
        let Some(position) = doc.positions.remove(&symbol) else {
            continue;
        };
        let exit_mark = bars_by_symbol
            .get(&symbol)
            .and_then(|bars| bars.last())
            .map(|b| b.close)
            .unwrap_or(position.entry_price);
        let realized_pnl = position.size * (exit_mark - position.entry_price);
        doc.close_position(&symbol, realized_pnl, filters, now, CooldownReason::PostExit);
    }

    for exch_pos in exchange_positions {
        if exch_pos.size.is_zero() {
            continue;
        }
        doc.positions
            .entry(exch_pos.symbol.clone())
            .and_modify(|p| p.size = exch_pos.size)
            .or_insert_with(|| {
                let atr = bars_by_symbol
                    .get(&exch_pos.symbol)
                    .map(|bars| estimate_atr(bars))
                    .unwrap_or(Decimal::ZERO);
                let stop_distance = atr * Decimal::try_from(risk.atr_mult_sl).unwrap_or(Decimal::TWO);
                let stop_price = if exch_pos.size > Decimal::ZERO {
                    exch_pos.avg_entry_price - stop_distance
                } else {
                    exch_pos.avg_entry_price + stop_distance
                };
                Position {
                    symbol: exch_pos.symbol.clone(),
                    size: exch_pos.size,
                    entry_price: exch_pos.avg_entry_price,
                    entry_ts: now,
                    initial_stop_distance: stop_distance,
                    stop_price,
                    breakeven_moved: false,
                    extreme_price: exch_pos.avg_entry_price,
                    profit_rungs: risk
                        .profit_targets
                        .iter()
                        .map(|(r, pct)| ProfitRung {
                            r_multiple: Decimal::try_from(*r).unwrap_or(Decimal::ONE),
                            exit_pct: Decimal::try_from(*pct).unwrap_or(Decimal::ZERO),
                            taken: false,
                        })
                        .collect(),
                }
            });
    }
}

fn estimate_atr(bars: &[Bar]) -> Decimal {
    let closes: Vec<f64> = bars.iter().map(|b| b.close.to_f64().unwrap_or(0.0)).collect();
    let vol = realized_vol_slice(&closes);
    let last = closes.last().copied().unwrap_or(0.0);
    Decimal::try_from(vol * last).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn blend_weights_respects_budget_fraction() {
        let mut momentum = TargetWeightMap::new();
        momentum.insert("A".to_string(), dec!(0.5));
        let mut carry = TargetWeightMap::new();
        carry.insert("A".to_string(), dec!(-0.2));
        let blended = blend_weights(&momentum, &carry, 0.2);
        let expected = dec!(0.5) * dec!(0.8) + dec!(-0.2) * dec!(0.2);
        assert_eq!(blended["A"], expected);
    }

    #[test]
    fn parse_timeframe_recognizes_known_strings() {
        assert_eq!(parse_timeframe("5m"), Timeframe::FIVE_MINUTES);
        assert_eq!(parse_timeframe("1h"), Timeframe::ONE_HOUR);
    }

    #[test]
    fn pearson_is_one_for_identical_series() {
        let a = vec![0.01, -0.02, 0.03, 0.015];
        assert!((pearson(&a, &a) - 1.0).abs() < 1e-9);
    }
}
