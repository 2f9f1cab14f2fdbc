use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::FiltersSection;
use crate::domain::risk::{CircuitBreaker, RiskState};
use crate::domain::trading::{CooldownEntry, CooldownReason, EquityPoint, Position, SymbolStats};

/// The single persisted document backing the trading engine's hot state.
/// Everything the engine needs to survive a restart without re-deriving from
/// the exchange lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub positions: HashMap<String, Position>,
    pub cooldowns: Vec<CooldownEntry>,
    pub symbol_stats: HashMap<String, SymbolStats>,
    pub equity_history: Vec<EquityPoint>,
    pub risk_state: Option<RiskState>,
    pub circuit_breaker: CircuitBreaker,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            positions: HashMap::new(),
            cooldowns: Vec::new(),
            symbol_stats: HashMap::new(),
            equity_history: Vec::new(),
            risk_state: None,
            circuit_breaker: CircuitBreaker::default(),
            heartbeat: None,
        }
    }
}

impl StateDocument {
    pub fn is_on_cooldown(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .iter()
            .any(|c| c.symbol == symbol && c.not_before > now)
    }

    pub fn prune_cooldowns(&mut self, now: DateTime<Utc>) {
        self.cooldowns.retain(|c| c.not_before > now);
    }

    pub fn push_equity(&mut self, point: EquityPoint, retain_days: i64) {
        self.equity_history.push(point);
        let cutoff = point.timestamp - chrono::Duration::days(retain_days);
        self.equity_history.retain(|p| p.timestamp >= cutoff);
    }

    pub fn symbol_stats_mut(&mut self, symbol: &str) -> &mut SymbolStats {
        self.symbol_stats
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolStats::new(symbol))
    }

    /// Records a position going flat: updates the symbol's trade stats and
    /// writes the cooldown(s) that follow from `reason`. A loss streak adds
    /// a second, independent `LossStreak` cooldown on top of the normal one.
    pub fn close_position(
        &mut self,
        symbol: &str,
        realized_pnl: Decimal,
        filters: &FiltersSection,
        now: DateTime<Utc>,
        reason: CooldownReason,
    ) {
        let stats = self.symbol_stats_mut(symbol);
        stats.record_trade(realized_pnl, filters.symbol_filter.ema_smoothing);
        let consecutive_losses = stats.consecutive_losses;

        let cooldown_minutes = match reason {
            CooldownReason::PostStop => filters.symbol_filter.post_stop_cooldown_minutes,
            _ => filters.symbol_filter.post_exit_cooldown_minutes,
        };
        self.cooldowns.push(CooldownEntry {
            symbol: symbol.to_string(),
            not_before: now + chrono::Duration::minutes(cooldown_minutes),
            reason,
        });

        if consecutive_losses >= filters.symbol_filter.streak_pause_after_losses {
            self.cooldowns.push(CooldownEntry {
                symbol: symbol.to_string(),
                not_before: now + chrono::Duration::minutes(filters.symbol_filter.streak_pause_minutes),
                reason: CooldownReason::LossStreak,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn round_trips_through_json() {
        let mut doc = StateDocument::default();
        doc.push_equity(
            EquityPoint {
                timestamp: Utc::now(),
                equity: dec!(10000),
            },
            365,
        );
        let json = serde_json::to_string(&doc).unwrap();
        let back: StateDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.equity_history.len(), 1);
    }

    #[test]
    fn cooldown_pruning_removes_expired() {
        let now = Utc::now();
        let mut doc = StateDocument::default();
        doc.cooldowns.push(CooldownEntry {
            symbol: "BTCUSDT".into(),
            not_before: now - Duration::minutes(1),
            reason: crate::domain::trading::CooldownReason::PostExit,
        });
        doc.prune_cooldowns(now);
        assert!(doc.cooldowns.is_empty());
    }

    #[test]
    fn equity_history_trims_to_retention_window() {
        let mut doc = StateDocument::default();
        let now = Utc::now();
        doc.push_equity(
            EquityPoint {
                timestamp: now - Duration::days(400),
                equity: dec!(9000),
            },
            365,
        );
        doc.push_equity(
            EquityPoint {
                timestamp: now,
                equity: dec!(10000),
            },
            365,
        );
        assert_eq!(doc.equity_history.len(), 1);
    }

    #[test]
    fn close_position_updates_stats_and_cooldown() {
        let mut doc = StateDocument::default();
        let filters = crate::config::FiltersSection::default();
        let now = Utc::now();
        doc.close_position("BTCUSDT", dec!(50), &filters, now, CooldownReason::PostExit);

        let stats = doc.symbol_stats.get("BTCUSDT").expect("stats recorded");
        assert_eq!(stats.trade_count, 1);
        assert_eq!(stats.wins, 1);

        let cooldown = doc
            .cooldowns
            .iter()
            .find(|c| c.symbol == "BTCUSDT")
            .expect("cooldown written");
        assert_eq!(cooldown.reason, CooldownReason::PostExit);
        assert!(cooldown.not_before > now);
    }

    #[test]
    fn close_position_on_loss_streak_adds_streak_cooldown() {
        let mut doc = StateDocument::default();
        let mut filters = crate::config::FiltersSection::default();
        filters.symbol_filter.streak_pause_after_losses = 2;
        let now = Utc::now();

        doc.close_position("ETHUSDT", dec!(-10), &filters, now, CooldownReason::PostStop);
        doc.close_position("ETHUSDT", dec!(-10), &filters, now, CooldownReason::PostStop);

        let streak_cooldowns = doc
            .cooldowns
            .iter()
            .filter(|c| c.symbol == "ETHUSDT" && c.reason == CooldownReason::LossStreak)
            .count();
        assert_eq!(streak_cooldowns, 1);
    }
}
