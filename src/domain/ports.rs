use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::errors::{ExchangeFatalError, ExchangeTransientError};
use crate::domain::market::{Bar, Instrument, Timeframe};
use crate::domain::trading::{OpenOrder, OrderSide};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transient(#[from] ExchangeTransientError),
    #[error(transparent)]
    Fatal(#[from] ExchangeFatalError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
}

impl Ticker {
    pub fn spread_bps(&self) -> Decimal {
        if self.bid.is_zero() {
            return Decimal::ZERO;
        }
        let mid = (self.bid + self.ask) / Decimal::TWO;
        if mid.is_zero() {
            return Decimal::ZERO;
        }
        (self.ask - self.bid) / mid * Decimal::from(10_000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: Decimal,
    pub used_margin: Decimal,
}

impl AccountState {
    pub fn margin_ratio(&self) -> f64 {
        if self.equity.is_zero() {
            return 0.0;
        }
        (self.used_margin / self.equity).try_into().unwrap_or(0.0)
    }
}

/// The uniform surface the rest of the system uses to talk to a perpetual-
/// futures exchange. Implementations own retry/backoff and must report every
/// failure through the `AdapterError` taxonomy so callers can route it to the
/// circuit breaker (transient) or a pause (fatal).
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn list_instruments(&self) -> Result<Vec<Instrument>, AdapterError>;

    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, AdapterError>;

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, AdapterError>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, AdapterError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError>;

    async fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<String, AdapterError>;

    async fn cancel(&self, order_id: &str) -> Result<(), AdapterError>;

    async fn fetch_account_state(&self) -> Result<AccountState, AdapterError>;
}

/// A pluggable scoring hook the sizing/filter stages may consult before
/// admitting an instrument. The default implementation always admits.
pub trait MetaLabeler: Send + Sync {
    fn keep(&self, symbol: &str, score: f64) -> bool;
}

pub struct AlwaysKeep;

impl MetaLabeler for AlwaysKeep {
    fn keep(&self, _symbol: &str, _score: f64) -> bool {
        true
    }
}

/// Fire-and-forget external notification sink (e.g. Discord webhook). Must
/// never block the trading loop; implementations should spawn and swallow
/// failures internally.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _message: &str) {}
}

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error(transparent)]
    Io(#[from] crate::domain::errors::StateIoError),
}

/// Persistence contract for the hot trading state document (§4.8). A single
/// writer (the trading engine) owns mutation; the fast exit monitor is
/// expected to route its deltas back through this same trait rather than
/// writing the file directly.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> crate::application::state::StateDocument;
    async fn save(&self, doc: &crate::application::state::StateDocument) -> Result<(), StateStoreError>;
    async fn touch_heartbeat(&self, now: DateTime<Utc>) -> Result<(), StateStoreError>;
}
