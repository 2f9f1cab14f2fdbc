//! Fast exit monitor: evaluated independently of the main cycle against
//! fresher candles, in the step order catastrophic -> initial stop ->
//! trailing -> breakeven -> profit ladder -> time -> no-progress.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use ta::Next;
use ta::indicators::AverageTrueRange;
use tracing::{info, warn};

use crate::config::{Config, RiskSection};
use crate::domain::errors::EngineError;
use crate::domain::ports::{ExchangeAdapter, Notifier, StateStore};
use crate::domain::trading::{CooldownReason, OrderSide, Position};
use crate::infrastructure::ohlcv_cache::OhlcvCache;

use super::trading_engine::parse_timeframe;

#[derive(Debug, Clone, PartialEq)]
pub enum ExitAction {
    CloseAll { reason: CloseReason },
    ClosePartial { fraction: Decimal, reason: CloseReason },
    MoveStop { new_stop: Decimal },
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Catastrophic,
    InitialStop,
    TrailingStop,
    ProfitTarget,
    TimeExit,
    NoProgress,
}

pub struct ExitCheckInputs {
    pub now: DateTime<Utc>,
    pub low: Decimal,
    pub high: Decimal,
    pub mark: Decimal,
    pub atr: Decimal,
}

/// Evaluates one position against the freshest candle and returns the
/// highest-priority action. Multiple rungs of the profit ladder may require
/// successive calls as state updates between them.
pub fn evaluate(risk: &RiskSection, position: &mut Position, inputs: &ExitCheckInputs) -> ExitAction {
    let atr_mult_sl = Decimal::try_from(risk.atr_mult_sl).unwrap_or(Decimal::TWO);
    let catastrophic_mult = Decimal::try_from(risk.catastrophic_atr_mult).unwrap_or(Decimal::from(5));
    let trail_mult = Decimal::try_from(risk.trail_atr_mult).unwrap_or(Decimal::ONE);
    let breakeven_after_r = Decimal::try_from(risk.breakeven_after_r).unwrap_or(Decimal::ONE);

    let catastrophic_distance = catastrophic_mult * position.r_unit().max(inputs.atr * atr_mult_sl);
    let adverse = if position.is_long() {
        position.entry_price - inputs.low
    } else {
        inputs.high - position.entry_price
    };
    if adverse >= catastrophic_distance {
        return ExitAction::CloseAll {
            reason: CloseReason::Catastrophic,
        };
    }

    if position.stop_crossed(inputs.low, inputs.high) {
        let reason = if position.breakeven_moved || has_taken_any_rung(position) {
            CloseReason::TrailingStop
        } else {
            CloseReason::InitialStop
        };
        return ExitAction::CloseAll { reason };
    }

    if risk.trailing_enabled {
        position.update_extreme(inputs.mark);
        let trail_distance = trail_mult * inputs.atr;
        let candidate = if position.is_long() {
            position.extreme_price - trail_distance
        } else {
            position.extreme_price + trail_distance
        };
        let moves = if position.is_long() {
            candidate > position.stop_price
        } else {
            candidate < position.stop_price
        };
        if moves {
            position.tighten_stop(candidate);
            return ExitAction::MoveStop { new_stop: position.stop_price };
        }
    }

    if !position.breakeven_moved && position.r_multiple(inputs.mark) >= breakeven_after_r {
        position.breakeven_moved = true;
        position.tighten_stop(position.entry_price);
        return ExitAction::MoveStop {
            new_stop: position.stop_price,
        };
    }

    let r_now = position.r_multiple(inputs.mark);
    for rung in position.profit_rungs.iter_mut() {
        if !rung.taken && r_now >= rung.r_multiple {
            rung.taken = true;
            return ExitAction::ClosePartial {
                fraction: rung.exit_pct,
                reason: CloseReason::ProfitTarget,
            };
        }
    }

    let held_hours = (inputs.now - position.entry_ts).num_minutes() as f64 / 60.0;
    if held_hours > risk.max_hours_in_trade as f64 {
        return ExitAction::CloseAll {
            reason: CloseReason::TimeExit,
        };
    }

    if risk.no_progress_exit_enabled {
        let held_minutes = (inputs.now - position.entry_ts).num_minutes();
        if held_minutes > risk.min_hold_minutes && r_now.abs() < Decimal::try_from(risk.no_progress_r_threshold).unwrap_or(Decimal::ZERO) {
            return ExitAction::CloseAll {
                reason: CloseReason::NoProgress,
            };
        }
    }

    ExitAction::None
}

fn has_taken_any_rung(position: &Position) -> bool {
    position.profit_rungs.iter().any(|r| r.taken)
}

/// Close-price-only ATR proxy, same simplification `signal_engine` uses:
/// `ta::indicators::AverageTrueRange` is fed close as a stand-in for
/// high/low/close so the monitor doesn't need its own wick history.
fn close_only_atr(closes: &[f64], period: usize) -> Decimal {
    let Ok(mut atr) = AverageTrueRange::new(period) else {
        return Decimal::ZERO;
    };
    let mut last = 0.0;
    for &c in closes {
        last = atr.next(c);
    }
    Decimal::try_from(last).unwrap_or(Decimal::ZERO)
}

/// Runs `exit_monitor::evaluate` against every open position on a tighter
/// poll loop than the main rebalance cycle, independently fetching the
/// freshest ticker/cache state and routing actions straight to the exchange
/// and state store rather than waiting for the next full cycle.
pub struct FastExitMonitor {
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub cache: Arc<OhlcvCache>,
    pub state_store: Arc<dyn StateStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl FastExitMonitor {
    pub async fn run_forever(self, config: Config, poll_seconds: u64) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(poll_seconds.max(1)));
        loop {
            interval.tick().await;
            if let Err(e) = self.poll_once(&config).await {
                warn!(error = %e, "fast exit monitor poll failed");
            }
        }
    }

    async fn poll_once(&self, config: &Config) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut doc = self.state_store.load().await;
        if doc.positions.is_empty() {
            return Ok(());
        }

        let timeframe = parse_timeframe(&config.exchange.timeframe);
        let mut changed = false;
        let mut closed: Vec<(String, Decimal, CooldownReason)> = Vec::new();

        for (symbol, position) in doc.positions.iter_mut() {
            let ticker = match self.exchange.fetch_ticker(symbol).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "fast exit monitor: failed to fetch ticker");
                    continue;
                }
            };
            let series = self.cache.series(symbol, timeframe).await;
            if series.len() < 2 {
                continue;
            }
            let closes: Vec<f64> = series.iter().filter_map(|b| b.close.to_f64()).collect();
            let atr = close_only_atr(&closes, config.filters.volatility_entry.atr_lookback);
            let last = series.last().expect("checked len >= 2");

            let inputs = ExitCheckInputs {
                now,
                low: last.low,
                high: last.high,
                mark: ticker.last,
                atr,
            };
            let action = evaluate(&config.risk, position, &inputs);
            match action {
                ExitAction::None => {}
                ExitAction::MoveStop { .. } => changed = true,
                ExitAction::ClosePartial { fraction, reason } => {
                    changed = true;
                    let entry_price = position.entry_price;
                    let pre_close_size = position.size;
                    let size = (position.size.abs() * fraction).round_dp(8);
                    self.close(symbol, position, size, reason_str(reason)).await;
                    if position.size.is_zero() {
                        let realized_pnl = pre_close_size * (ticker.last - entry_price);
                        closed.push((symbol.clone(), realized_pnl, cooldown_reason_for(reason)));
                    }
                }
                ExitAction::CloseAll { reason } => {
                    changed = true;
                    let entry_price = position.entry_price;
                    let pre_close_size = position.size;
                    let size = position.size.abs();
                    self.close(symbol, position, size, reason_str(reason)).await;
                    if position.size.is_zero() {
                        let realized_pnl = pre_close_size * (ticker.last - entry_price);
                        closed.push((symbol.clone(), realized_pnl, cooldown_reason_for(reason)));
                    }
                }
            }
        }

        for (symbol, realized_pnl, reason) in closed {
            doc.close_position(&symbol, realized_pnl, &config.filters, now, reason);
        }

        if changed {
            doc.positions.retain(|_, p| !p.size.is_zero());
            doc.heartbeat = Some(now);
            self.state_store
                .save(&doc)
                .await
                .map_err(|e| EngineError::Other(anyhow::anyhow!("state save failed: {e}")))?;
        }
        Ok(())
    }

    async fn close(&self, symbol: &str, position: &mut Position, size: Decimal, reason: &str) {
        let side = if position.is_long() { OrderSide::Sell } else { OrderSide::Buy };
        match self
            .exchange
            .place_limit(symbol, side, position.entry_price, size, false, true)
            .await
        {
            Ok(order_id) => {
                info!(symbol = %symbol, %order_id, reason, %size, "fast exit monitor closed position");
                position.size -= if position.is_long() { size } else { -size };
                self.notifier.notify(&format!("exit: {symbol} {reason} size={size}")).await;
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "fast exit monitor: failed to place close order"),
        }
    }
}

fn cooldown_reason_for(reason: CloseReason) -> CooldownReason {
    match reason {
        CloseReason::Catastrophic | CloseReason::InitialStop | CloseReason::TrailingStop => CooldownReason::PostStop,
        CloseReason::ProfitTarget | CloseReason::TimeExit | CloseReason::NoProgress => CooldownReason::PostExit,
    }
}

fn reason_str(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::Catastrophic => "catastrophic",
        CloseReason::InitialStop => "initial_stop",
        CloseReason::TrailingStop => "trailing_stop",
        CloseReason::ProfitTarget => "profit_target",
        CloseReason::TimeExit => "time_exit",
        CloseReason::NoProgress => "no_progress",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::ProfitRung;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            size: dec!(1),
            entry_price: dec!(100),
            entry_ts: Utc::now(),
            initial_stop_distance: dec!(10),
            stop_price: dec!(95),
            breakeven_moved: false,
            extreme_price: dec!(100),
            profit_rungs: vec![],
        }
    }

    fn risk_with_trailing() -> RiskSection {
        let mut r = RiskSection::default();
        r.atr_mult_sl = 2.0;
        r.trail_atr_mult = 1.0;
        r.trailing_enabled = true;
        r.catastrophic_atr_mult = 5.0;
        r
    }

    #[test]
    fn trailing_stop_monotonic_progression() {
        let risk = risk_with_trailing();
        let mut pos = long_position();
        let atr = dec!(5);
        let now = Utc::now();

        let prices = [dec!(100), dec!(110), dec!(108), dec!(112), dec!(111)];
        let expected_stops = [dec!(95), dec!(105), dec!(105), dec!(107), dec!(107)];

        for (price, expected) in prices.iter().zip(expected_stops.iter()) {
            let inputs = ExitCheckInputs {
                now,
                low: *price - dec!(1),
                high: *price + dec!(1),
                mark: *price,
                atr,
            };
            let _ = evaluate(&risk, &mut pos, &inputs);
            assert_eq!(pos.stop_price, *expected, "stop at price {price} should be {expected}");
        }
    }

    #[test]
    fn catastrophic_exit_triggers_full_close() {
        let risk = risk_with_trailing();
        let mut pos = long_position();
        let inputs = ExitCheckInputs {
            now: Utc::now(),
            low: dec!(50),
            high: dec!(101),
            mark: dec!(60),
            atr: dec!(5),
        };
        let action = evaluate(&risk, &mut pos, &inputs);
        assert_eq!(
            action,
            ExitAction::CloseAll {
                reason: CloseReason::Catastrophic
            }
        );
    }

    #[test]
    fn initial_stop_triggers_full_close() {
        let risk = risk_with_trailing();
        let mut pos = long_position();
        let inputs = ExitCheckInputs {
            now: Utc::now(),
            low: dec!(89),
            high: dec!(99),
            mark: dec!(92),
            atr: dec!(5),
        };
        let action = evaluate(&risk, &mut pos, &inputs);
        assert_eq!(
            action,
            ExitAction::CloseAll {
                reason: CloseReason::InitialStop
            }
        );
    }

    #[test]
    fn breakeven_move_after_one_r() {
        let risk = risk_with_trailing();
        let mut pos = long_position();
        pos.stop_price = dec!(80); // set loose so trailing/breakeven path is reached
        let inputs = ExitCheckInputs {
            now: Utc::now(),
            low: dec!(109),
            high: dec!(111),
            mark: dec!(110),
            atr: dec!(1),
        };
        let _ = evaluate(&risk, &mut pos, &inputs);
        assert!(pos.breakeven_moved || pos.stop_price > dec!(80));
    }

    #[test]
    fn profit_rung_closes_partial_once() {
        let risk = risk_with_trailing();
        let mut pos = long_position();
        pos.stop_price = dec!(80);
        pos.profit_rungs.push(ProfitRung {
            r_multiple: dec!(1),
            exit_pct: dec!(0.33),
            taken: false,
        });
        let inputs = ExitCheckInputs {
            now: Utc::now(),
            low: dec!(109),
            high: dec!(111),
            mark: dec!(110),
            atr: dec!(5),
        };
        // Successive passes at an unchanged price let the trailing stop and
        // then the breakeven move stabilize before the ladder is reached.
        let _ = evaluate(&risk, &mut pos, &inputs);
        let _ = evaluate(&risk, &mut pos, &inputs);
        let action = evaluate(&risk, &mut pos, &inputs);
        match action {
            ExitAction::ClosePartial { fraction, reason } => {
                assert_eq!(fraction, dec!(0.33));
                assert_eq!(reason, CloseReason::ProfitTarget);
            }
            other => panic!("expected partial close, got {other:?}"),
        }
    }

    #[test]
    fn cooldown_reason_maps_stops_to_post_stop() {
        assert_eq!(cooldown_reason_for(CloseReason::Catastrophic), CooldownReason::PostStop);
        assert_eq!(cooldown_reason_for(CloseReason::InitialStop), CooldownReason::PostStop);
        assert_eq!(cooldown_reason_for(CloseReason::TrailingStop), CooldownReason::PostStop);
        assert_eq!(cooldown_reason_for(CloseReason::ProfitTarget), CooldownReason::PostExit);
        assert_eq!(cooldown_reason_for(CloseReason::TimeExit), CooldownReason::PostExit);
        assert_eq!(cooldown_reason_for(CloseReason::NoProgress), CooldownReason::PostExit);
    }

    #[test]
    fn time_exit_after_max_hours() {
        let risk = risk_with_trailing();
        let mut pos = long_position();
        pos.entry_ts = Utc::now() - chrono::Duration::hours(risk.max_hours_in_trade + 1);
        pos.stop_price = dec!(50);
        let inputs = ExitCheckInputs {
            now: Utc::now(),
            low: dec!(99),
            high: dec!(101),
            mark: dec!(100),
            atr: dec!(0.01),
        };
        let action = evaluate(&risk, &mut pos, &inputs);
        assert_eq!(
            action,
            ExitAction::CloseAll {
                reason: CloseReason::TimeExit
            }
        );
    }
}
