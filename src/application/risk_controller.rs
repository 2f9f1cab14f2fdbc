//! Risk gates evaluated once per cycle before any order is placed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::{MarginAction, RiskSection};
use crate::domain::errors::RiskGate;
use crate::domain::risk::{CircuitBreaker, RiskState};
use crate::domain::trading::EquityPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    /// Trading may proceed normally.
    Proceed,
    /// New entries are blocked; reduce-only exits, cancels and reconciliation
    /// still run.
    PauseNewEntries,
    /// Close everything immediately (margin hard-limit with liquidate action).
    LiquidateAll,
}

pub struct RiskControllerInputs<'a> {
    pub now: DateTime<Utc>,
    pub equity: Decimal,
    pub margin_ratio: f64,
    pub reconciliation_ok: bool,
    pub emergency_stop_present: bool,
    /// Full retained equity history (§4.8 keeps 400 days), used only for the
    /// long-term drawdown warning pass; the daily/portfolio-window gates above
    /// use `RiskState`'s own rolling highs instead.
    pub equity_history: &'a [EquityPoint],
}

/// Evaluates every gate in §4.5 order and returns the first/most severe
/// tripped outcome, alongside the list of gates that fired (for logging).
pub fn evaluate(
    risk: &RiskSection,
    state: &mut RiskState,
    breaker: &mut CircuitBreaker,
    inputs: &RiskControllerInputs,
) -> (RiskDecision, Vec<RiskGate>) {
    let mut fired = Vec::new();

    state.roll_day_if_needed(inputs.now, inputs.equity);
    state.update_equity(inputs.equity);

    if inputs.emergency_stop_present {
        fired.push(RiskGate::EmergencyStopFile);
    }

    if !inputs.reconciliation_ok {
        state.reconciliation_failed = true;
        fired.push(RiskGate::ReconciliationFailed);
    } else {
        state.reconciliation_failed = false;
    }

    let daily_floor = state.day_start_equity * Decimal::try_from(1.0 - risk.max_daily_loss_pct).unwrap_or(Decimal::ONE);
    if inputs.equity < daily_floor {
        state.disable_until_next_midnight(inputs.now);
        fired.push(RiskGate::DailyLossLimit {
            equity: inputs.equity,
            limit: daily_floor,
        });
    }
    if state.is_paused(inputs.now) {
        fired.push(RiskGate::DailyLossLimit {
            equity: inputs.equity,
            limit: daily_floor,
        });
    }

    state.push_equity_high(risk.portfolio_dd_window_days);
    let window_high = state.window_high();
    if window_high > Decimal::ZERO {
        let drawdown_pct: f64 = ((window_high - inputs.equity) / window_high)
            .try_into()
            .unwrap_or(0.0);
        if drawdown_pct > risk.max_portfolio_drawdown_pct {
            fired.push(RiskGate::PortfolioDrawdown {
                drawdown_pct,
                limit_pct: risk.max_portfolio_drawdown_pct,
            });
        }
    }

    let now_ms = inputs.now.timestamp_millis();
    if breaker.is_tripped(now_ms) {
        fired.push(RiskGate::CircuitBreakerOpen {
            cooldown_until_ms: breaker.tripped_until_ms.unwrap_or(now_ms),
        });
    }

    for (window_days, limit_pct) in [
        (90, risk.long_term_dd.warn_90d_pct),
        (180, risk.long_term_dd.warn_180d_pct),
        (365, risk.long_term_dd.warn_365d_pct),
    ] {
        let drawdown_pct = long_term_drawdown_pct(inputs.equity_history, inputs.now, window_days, inputs.equity);
        if drawdown_pct > limit_pct {
            fired.push(RiskGate::LongTermDrawdownWarning {
                window_days,
                drawdown_pct,
                limit_pct,
            });
        }
    }

    let mut liquidate = false;
    if inputs.margin_ratio >= risk.margin_hard_limit_pct {
        fired.push(RiskGate::MarginHardLimit {
            margin_ratio: inputs.margin_ratio,
            limit: risk.margin_hard_limit_pct,
        });
        liquidate = matches!(risk.margin_action, MarginAction::Liquidate);
    } else if inputs.margin_ratio >= risk.margin_soft_limit_pct {
        fired.push(RiskGate::MarginHardLimit {
            margin_ratio: inputs.margin_ratio,
            limit: risk.margin_soft_limit_pct,
        });
    }

    let decision = if liquidate {
        RiskDecision::LiquidateAll
    } else if fired
        .iter()
        .any(|g| !matches!(g, RiskGate::LongTermDrawdownWarning { .. }))
    {
        RiskDecision::PauseNewEntries
    } else {
        RiskDecision::Proceed
    };

    (decision, fired)
}

/// Drawdown from the historical peak within `window_days` of `now` to
/// `current_equity`. §4.5 warns on this but never gates on it.
fn long_term_drawdown_pct(
    equity_history: &[EquityPoint],
    now: DateTime<Utc>,
    window_days: i64,
    current_equity: Decimal,
) -> f64 {
    let cutoff = now - chrono::Duration::days(window_days);
    let peak = equity_history
        .iter()
        .filter(|p| p.timestamp >= cutoff)
        .map(|p| p.equity)
        .fold(current_equity, Decimal::max);
    if peak <= Decimal::ZERO {
        return 0.0;
    }
    ((peak - current_equity) / peak).try_into().unwrap_or(0.0)
}

pub fn record_api_failure(
    risk: &RiskSection,
    breaker: &mut CircuitBreaker,
    now: DateTime<Utc>,
) {
    breaker.record_failure(
        now.timestamp_millis(),
        risk.api_circuit_breaker.window_seconds * 1000,
        risk.api_circuit_breaker.max_errors,
        risk.api_circuit_breaker.cooldown_seconds * 1000,
    );
}

pub fn record_api_success(risk: &RiskSection, breaker: &mut CircuitBreaker, now: DateTime<Utc>) {
    breaker.record_success(now.timestamp_millis(), risk.api_circuit_breaker.window_seconds * 1000);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_inputs(now: DateTime<Utc>, equity: Decimal) -> RiskControllerInputs<'static> {
        RiskControllerInputs {
            now,
            equity,
            margin_ratio: 0.1,
            reconciliation_ok: true,
            emergency_stop_present: false,
            equity_history: &[],
        }
    }

    #[test]
    fn daily_loss_kill_pauses_until_midnight() {
        let risk = RiskSection::default();
        let now = Utc::now();
        let mut state = RiskState::new(now, dec!(10000));
        let mut breaker = CircuitBreaker::default();
        let inputs = base_inputs(now, dec!(9499));
        let (decision, fired) = evaluate(&risk, &mut state, &mut breaker, &inputs);
        assert_eq!(decision, RiskDecision::PauseNewEntries);
        assert!(fired.iter().any(|g| matches!(g, RiskGate::DailyLossLimit { .. })));
        assert!(state.disabled_until.is_some());
    }

    #[test]
    fn circuit_breaker_blocks_new_entries() {
        let risk = RiskSection::default();
        let now = Utc::now();
        let mut state = RiskState::new(now, dec!(10000));
        let mut breaker = CircuitBreaker::default();
        for i in 0..5 {
            record_api_failure(&risk, &mut breaker, now + chrono::Duration::seconds(i));
        }
        let inputs = base_inputs(now + chrono::Duration::seconds(6), dec!(10000));
        let (decision, fired) = evaluate(&risk, &mut state, &mut breaker, &inputs);
        assert_eq!(decision, RiskDecision::PauseNewEntries);
        assert!(fired.iter().any(|g| matches!(g, RiskGate::CircuitBreakerOpen { .. })));
    }

    #[test]
    fn emergency_stop_file_pauses_entries() {
        let risk = RiskSection::default();
        let now = Utc::now();
        let mut state = RiskState::new(now, dec!(10000));
        let mut breaker = CircuitBreaker::default();
        let mut inputs = base_inputs(now, dec!(10000));
        inputs.emergency_stop_present = true;
        let (decision, _) = evaluate(&risk, &mut state, &mut breaker, &inputs);
        assert_eq!(decision, RiskDecision::PauseNewEntries);
    }

    #[test]
    fn healthy_state_proceeds() {
        let risk = RiskSection::default();
        let now = Utc::now();
        let mut state = RiskState::new(now, dec!(10000));
        let mut breaker = CircuitBreaker::default();
        let inputs = base_inputs(now, dec!(10050));
        let (decision, fired) = evaluate(&risk, &mut state, &mut breaker, &inputs);
        assert_eq!(decision, RiskDecision::Proceed);
        assert!(fired.is_empty());
    }

    #[test]
    fn long_term_drawdown_warns_but_does_not_pause() {
        let mut risk = RiskSection::default();
        risk.long_term_dd.warn_90d_pct = 0.1;
        let now = Utc::now();
        // day_start_equity matches the current tick's equity so the daily-loss
        // and portfolio-drawdown gates (driven by RiskState's own tracking,
        // not `equity_history`) stay quiet and only the long-term check fires.
        let mut state = RiskState::new(now, dec!(8800));
        let mut breaker = CircuitBreaker::default();
        let history = vec![
            EquityPoint {
                timestamp: now - chrono::Duration::days(30),
                equity: dec!(10000),
            },
            EquityPoint {
                timestamp: now - chrono::Duration::days(10),
                equity: dec!(8800),
            },
        ];
        let mut inputs = base_inputs(now, dec!(8800));
        inputs.equity_history = &history;
        let (decision, fired) = evaluate(&risk, &mut state, &mut breaker, &inputs);
        assert_eq!(decision, RiskDecision::Proceed);
        assert!(fired
            .iter()
            .any(|g| matches!(g, RiskGate::LongTermDrawdownWarning { window_days: 90, .. })));
    }
}
