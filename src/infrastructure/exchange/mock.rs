//! In-memory [`ExchangeAdapter`] for tests. Holds instruments, bars, and
//! order/position state behind a single mutex and never makes a network
//! call, mirroring the teacher's `MockExecutionService`/`MockMarketDataService`
//! shape (state behind a lock, `execute`/`place_limit` mutate it directly).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::market::{Bar, Instrument, Timeframe};
use crate::domain::ports::{AccountState, AdapterError, ExchangeAdapter, ExchangePosition, Ticker};
use crate::domain::trading::{OpenOrder, OrderSide, OrderType};

#[derive(Default)]
struct MockState {
    instruments: Vec<Instrument>,
    bars: HashMap<String, Vec<Bar>>,
    tickers: HashMap<String, Ticker>,
    positions: Vec<ExchangePosition>,
    open_orders: Vec<OpenOrder>,
    account: AccountState,
    placed: Vec<(String, OrderSide, Decimal, Decimal, bool, bool)>,
}

/// Test double that never touches the network. Configure it with
/// `set_bars`/`set_ticker`/`set_positions` before handing it to a
/// [`crate::application::trading_engine::TradingEngine`].
pub struct MockExchangeAdapter {
    state: Mutex<MockState>,
}

impl MockExchangeAdapter {
    pub fn new(instruments: Vec<Instrument>, account: AccountState) -> Self {
        Self {
            state: Mutex::new(MockState {
                instruments,
                account,
                ..Default::default()
            }),
        }
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.state.lock().expect("mock state lock poisoned").bars.insert(symbol.to_string(), bars);
    }

    pub fn set_ticker(&self, symbol: &str, ticker: Ticker) {
        self.state.lock().expect("mock state lock poisoned").tickers.insert(symbol.to_string(), ticker);
    }

    pub fn set_positions(&self, positions: Vec<ExchangePosition>) {
        self.state.lock().expect("mock state lock poisoned").positions = positions;
    }

    pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
        self.state.lock().expect("mock state lock poisoned").open_orders = orders;
    }

    pub fn placed_orders(&self) -> Vec<(String, OrderSide, Decimal, Decimal, bool, bool)> {
        self.state.lock().expect("mock state lock poisoned").placed.clone()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchangeAdapter {
    async fn list_instruments(&self) -> Result<Vec<Instrument>, AdapterError> {
        Ok(self.state.lock().expect("mock state lock poisoned").instruments.clone())
    }

    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, AdapterError> {
        let state = self.state.lock().expect("mock state lock poisoned");
        let bars = state.bars.get(&instrument.symbol).cloned().unwrap_or_default();
        let start = bars.len().saturating_sub(limit);
        Ok(bars[start..].to_vec())
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, AdapterError> {
        Ok(self.state.lock().expect("mock state lock poisoned").positions.clone())
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, AdapterError> {
        let state = self.state.lock().expect("mock state lock poisoned");
        Ok(match symbol {
            Some(s) => state.open_orders.iter().filter(|o| o.symbol == s).cloned().collect(),
            None => state.open_orders.clone(),
        })
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError> {
        self.state
            .lock()
            .expect("mock state lock poisoned")
            .tickers
            .get(symbol)
            .copied()
            .ok_or_else(|| {
                AdapterError::Fatal(crate::domain::errors::ExchangeFatalError::InstrumentUnknown(symbol.to_string()))
            })
    }

    async fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<String, AdapterError> {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        let order_id = Uuid::new_v4().to_string();
        state.placed.push((symbol.to_string(), side, price, size, post_only, reduce_only));
        state.open_orders.push(OpenOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            price,
            size,
            created_at: Utc::now(),
            reduce_only,
        });
        Ok(order_id)
    }

    async fn cancel(&self, order_id: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.open_orders.retain(|o| o.order_id != order_id);
        Ok(())
    }

    async fn fetch_account_state(&self) -> Result<AccountState, AdapterError> {
        Ok(self.state.lock().expect("mock state lock poisoned").account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn instrument(symbol: &str) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            quote_currency: "USDT".to_string(),
            price_increment: dec!(0.1),
            size_increment: dec!(0.001),
            min_notional: dec!(5),
            is_perpetual: true,
        }
    }

    #[tokio::test]
    async fn place_limit_records_order_and_appears_in_open_orders() {
        let adapter = MockExchangeAdapter::new(
            vec![instrument("BTCUSDT")],
            AccountState {
                equity: dec!(10000),
                used_margin: dec!(0),
            },
        );
        let id = adapter
            .place_limit("BTCUSDT", OrderSide::Buy, dec!(50000), dec!(0.01), true, false)
            .await
            .expect("place");
        let open = adapter.fetch_open_orders(None).await.expect("open orders");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, id);
        assert_eq!(adapter.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn cancel_removes_from_open_orders() {
        let adapter = MockExchangeAdapter::new(
            vec![instrument("BTCUSDT")],
            AccountState {
                equity: dec!(10000),
                used_margin: dec!(0),
            },
        );
        let id = adapter
            .place_limit("BTCUSDT", OrderSide::Sell, dec!(50000), dec!(0.01), false, true)
            .await
            .expect("place");
        adapter.cancel(&id).await.expect("cancel");
        assert!(adapter.fetch_open_orders(None).await.expect("open orders").is_empty());
    }

    #[tokio::test]
    async fn fetch_bars_respects_limit_from_the_tail() {
        let adapter = MockExchangeAdapter::new(
            vec![instrument("BTCUSDT")],
            AccountState {
                equity: dec!(10000),
                used_margin: dec!(0),
            },
        );
        let bars: Vec<Bar> = (0..10)
            .map(|i| Bar {
                timestamp_ms: i * 3_600_000,
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100),
                volume: dec!(1),
            })
            .collect();
        adapter.set_bars("BTCUSDT", bars);
        let recent = adapter
            .fetch_bars(&instrument("BTCUSDT"), Timeframe::ONE_HOUR, 3)
            .await
            .expect("fetch");
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().timestamp_ms, 9 * 3_600_000);
    }
}
