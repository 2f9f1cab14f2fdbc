use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A tradable perpetual-futures instrument as filtered from exchange metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub quote_currency: String,
    pub price_increment: Decimal,
    pub size_increment: Decimal,
    pub min_notional: Decimal,
    pub is_perpetual: bool,
}

impl Instrument {
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_to_increment(price, self.price_increment)
    }

    pub fn round_size(&self, size: Decimal) -> Decimal {
        round_to_increment(size, self.size_increment)
    }
}

fn round_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment.is_zero() {
        return value;
    }
    (value / increment).round() * increment
}

/// A single OHLCV bar. Invariants are enforced by the validator
/// (`infrastructure::ohlcv_cache`), not by this type itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn is_sane(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= Decimal::ZERO
    }
}

/// A named candle timeframe expressed in milliseconds, e.g. "1h" or "5m".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe(pub i64);

impl Timeframe {
    pub const ONE_MINUTE: Timeframe = Timeframe(60_000);
    pub const FIVE_MINUTES: Timeframe = Timeframe(5 * 60_000);
    pub const ONE_HOUR: Timeframe = Timeframe(60 * 60_000);

    pub fn millis(self) -> i64 {
        self.0
    }

    pub fn align(self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.0)
    }
}

/// The ordered set of instruments eligible for trading this cycle.
#[derive(Debug, Clone, Default)]
pub struct UniverseSnapshot {
    pub instruments: Vec<Instrument>,
}

impl UniverseSnapshot {
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn symbol(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bar_sanity_detects_violation() {
        let bar = Bar {
            timestamp_ms: 0,
            open: dec!(100),
            high: dec!(99),
            low: dec!(98),
            close: dec!(100),
            volume: dec!(1),
        };
        assert!(!bar.is_sane());
    }

    #[test]
    fn bar_sanity_accepts_valid_bar() {
        let bar = Bar {
            timestamp_ms: 0,
            open: dec!(100),
            high: dec!(105),
            low: dec!(95),
            close: dec!(102),
            volume: dec!(10),
        };
        assert!(bar.is_sane());
    }

    #[test]
    fn timeframe_align_floors_to_bucket() {
        let tf = Timeframe::ONE_HOUR;
        assert_eq!(tf.align(3_700_000), 3_600_000);
    }

    #[test]
    fn round_to_increment_snaps_to_tick() {
        let instrument = Instrument {
            symbol: "BTCUSDT".into(),
            quote_currency: "USDT".into(),
            price_increment: dec!(0.5),
            size_increment: dec!(0.001),
            min_notional: dec!(5),
            is_perpetual: true,
        };
        assert_eq!(instrument.round_price(dec!(100.26)), dec!(100.5));
    }
}
