use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn sign(self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

/// An order the trading engine believes is live on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Decimal,
    pub size: Decimal,
    pub created_at: DateTime<Utc>,
    pub reduce_only: bool,
}

impl OpenOrder {
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}

/// One (r_multiple, exit_pct) profit-ladder rung, tracked per-position so each
/// rung fires at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitRung {
    pub r_multiple: Decimal,
    pub exit_pct: Decimal,
    pub taken: bool,
}

/// An open position, exclusively mutated by the trading engine (entries,
/// exits observed via reconciliation) and the fast exit monitor (stop,
/// high/low water, partials).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed size: positive for long, negative for short.
    pub size: Decimal,
    pub entry_price: Decimal,
    pub entry_ts: DateTime<Utc>,
    pub initial_stop_distance: Decimal,
    pub stop_price: Decimal,
    pub breakeven_moved: bool,
    /// High water for longs, low water for shorts (same field, directional).
    pub extreme_price: Decimal,
    pub profit_rungs: Vec<ProfitRung>,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.size > Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    /// Entry-to-stop distance expressed as R units, always positive.
    pub fn r_unit(&self) -> Decimal {
        self.initial_stop_distance.abs()
    }

    /// Current unrealized profit in R-multiples given a mark price.
    pub fn r_multiple(&self, mark: Decimal) -> Decimal {
        if self.r_unit().is_zero() {
            return Decimal::ZERO;
        }
        let raw = if self.is_long() {
            mark - self.entry_price
        } else {
            self.entry_price - mark
        };
        raw / self.r_unit()
    }

    pub fn update_extreme(&mut self, mark: Decimal) {
        if self.is_long() {
            if mark > self.extreme_price {
                self.extreme_price = mark;
            }
        } else if mark < self.extreme_price {
            self.extreme_price = mark;
        }
    }

    /// Raises (long) or lowers (short) the stop, never loosening it.
    pub fn tighten_stop(&mut self, candidate: Decimal) {
        if self.is_long() {
            if candidate > self.stop_price {
                self.stop_price = candidate;
            }
        } else if candidate < self.stop_price {
            self.stop_price = candidate;
        }
    }

    pub fn stop_crossed(&self, low: Decimal, high: Decimal) -> bool {
        if self.is_long() {
            low <= self.stop_price
        } else {
            high >= self.stop_price
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CooldownReason {
    PostExit,
    PostStop,
    LossStreak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub symbol: String,
    pub not_before: DateTime<Utc>,
    pub reason: CooldownReason,
}

/// Rolling performance counters per symbol, consumed by the symbol filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub trade_count: u32,
    pub wins: u32,
    pub losses: u32,
    pub pnl_sum: Decimal,
    pub ema_win_rate: f64,
    pub ema_profit_factor: f64,
    pub consecutive_losses: u32,
}

impl SymbolStats {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            trade_count: 0,
            wins: 0,
            losses: 0,
            pnl_sum: Decimal::ZERO,
            ema_win_rate: 0.5,
            ema_profit_factor: 1.0,
            consecutive_losses: 0,
        }
    }

    pub fn record_trade(&mut self, pnl: Decimal, smoothing: f64) {
        self.trade_count += 1;
        self.pnl_sum += pnl;
        let won = pnl > Decimal::ZERO;
        if won {
            self.wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.losses += 1;
            self.consecutive_losses += 1;
        }
        let outcome = if won { 1.0 } else { 0.0 };
        self.ema_win_rate = smoothing * outcome + (1.0 - smoothing) * self.ema_win_rate;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn tighten_stop_never_loosens_long() {
        let mut pos = long_position();
        pos.tighten_stop(dec!(105));
        assert_eq!(pos.stop_price, dec!(105));
        pos.tighten_stop(dec!(101));
        assert_eq!(pos.stop_price, dec!(105), "stop must never move backwards");
    }

    #[test]
    fn tighten_stop_never_loosens_short() {
        let mut pos = long_position();
        pos.size = dec!(-1);
        pos.stop_price = dec!(105);
        pos.tighten_stop(dec!(100));
        assert_eq!(pos.stop_price, dec!(100));
        pos.tighten_stop(dec!(103));
        assert_eq!(pos.stop_price, dec!(100));
    }

    #[test]
    fn r_multiple_computes_profit_in_r_units() {
        let pos = long_position();
        assert_eq!(pos.r_multiple(dec!(120)), dec!(2));
    }

    #[test]
    fn stop_crossed_detects_long_breach() {
        let pos = long_position();
        assert!(pos.stop_crossed(dec!(90), dec!(96)));
        assert!(!pos.stop_crossed(dec!(96), dec!(99)));
    }

    #[test]
    fn symbol_stats_tracks_streaks() {
        let mut stats = SymbolStats::new("ETHUSDT");
        stats.record_trade(dec!(-5), 0.2);
        stats.record_trade(dec!(-3), 0.2);
        assert_eq!(stats.consecutive_losses, 2);
        stats.record_trade(dec!(10), 0.2);
        assert_eq!(stats.consecutive_losses, 0);
        assert_eq!(stats.wins, 1);
    }
}
