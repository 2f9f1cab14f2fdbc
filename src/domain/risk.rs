use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Persistent risk bookkeeping, reset at UTC midnight for the daily fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub day_start_equity: Decimal,
    pub day_high_equity: Decimal,
    pub current_date: NaiveDate,
    pub disabled_until: Option<DateTime<Utc>>,
    pub reconciliation_failed: bool,
    /// Rolling equity highs used for the portfolio drawdown window, one entry
    /// per day retained for `portfolio_dd_window_days`.
    pub equity_highs: VecDeque<(NaiveDate, Decimal)>,
}

impl RiskState {
    pub fn new(now: DateTime<Utc>, equity: Decimal) -> Self {
        Self {
            day_start_equity: equity,
            day_high_equity: equity,
            current_date: now.date_naive(),
            disabled_until: None,
            reconciliation_failed: false,
            equity_highs: VecDeque::new(),
        }
    }

    /// Resets the daily fields when UTC date has rolled over. Returns true if
    /// a reset occurred.
    pub fn roll_day_if_needed(&mut self, now: DateTime<Utc>, equity: Decimal) -> bool {
        let today = now.date_naive();
        if today != self.current_date {
            self.current_date = today;
            self.day_start_equity = equity;
            self.day_high_equity = equity;
            self.disabled_until = None;
            true
        } else {
            false
        }
    }

    pub fn update_equity(&mut self, equity: Decimal) {
        if equity > self.day_high_equity {
            self.day_high_equity = equity;
        }
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.disabled_until.is_some_and(|until| now < until)
    }

    pub fn disable_until_next_midnight(&mut self, now: DateTime<Utc>) {
        let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
        self.disabled_until = tomorrow.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    /// Pushes today's equity high into the rolling window, trimming entries
    /// older than `window_days`.
    pub fn push_equity_high(&mut self, window_days: i64) {
        self.equity_highs
            .push_back((self.current_date, self.day_high_equity));
        let cutoff = self.current_date - chrono::Duration::days(window_days);
        while matches!(self.equity_highs.front(), Some((d, _)) if *d < cutoff) {
            self.equity_highs.pop_front();
        }
    }

    pub fn window_high(&self) -> Decimal {
        self.equity_highs
            .iter()
            .map(|(_, e)| *e)
            .fold(self.day_high_equity, Decimal::max)
    }
}

/// A rolling window of exchange-adapter failure timestamps (ms) feeding a
/// trip/cooldown circuit breaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub failures_ms: VecDeque<i64>,
    pub tripped_until_ms: Option<i64>,
}

impl CircuitBreaker {
    pub fn record_failure(&mut self, now_ms: i64, window_ms: i64, max_errors: usize, cooldown_ms: i64) {
        self.failures_ms.push_back(now_ms);
        let cutoff = now_ms - window_ms;
        while matches!(self.failures_ms.front(), Some(t) if *t < cutoff) {
            self.failures_ms.pop_front();
        }
        if self.failures_ms.len() >= max_errors {
            self.tripped_until_ms = Some(now_ms + cooldown_ms);
        }
    }

    pub fn record_success(&mut self, now_ms: i64, window_ms: i64) {
        let cutoff = now_ms - window_ms;
        while matches!(self.failures_ms.front(), Some(t) if *t < cutoff) {
            self.failures_ms.pop_front();
        }
    }

    pub fn is_tripped(&self, now_ms: i64) -> bool {
        self.tripped_until_ms.is_some_and(|until| now_ms < until)
    }

    pub fn reset(&mut self) {
        self.failures_ms.clear();
        self.tripped_until_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn circuit_breaker_trips_after_threshold() {
        let mut cb = CircuitBreaker::default();
        for i in 0..5 {
            cb.record_failure(i * 1000, 300_000, 5, 600_000);
        }
        assert!(cb.is_tripped(4000));
    }

    #[test]
    fn circuit_breaker_resets_after_cooldown() {
        let mut cb = CircuitBreaker::default();
        for i in 0..5 {
            cb.record_failure(i * 1000, 300_000, 5, 600_000);
        }
        assert!(cb.is_tripped(4000));
        assert!(!cb.is_tripped(4000 + 600_001));
    }

    #[test]
    fn risk_state_rolls_day_and_resets_disable() {
        let now = Utc::now();
        let mut state = RiskState::new(now, dec!(10000));
        state.disable_until_next_midnight(now);
        assert!(state.is_paused(now));
        let tomorrow = now + chrono::Duration::days(1);
        state.roll_day_if_needed(tomorrow, dec!(9600));
        assert!(!state.is_paused(tomorrow));
        assert_eq!(state.day_start_equity, dec!(9600));
    }
}
