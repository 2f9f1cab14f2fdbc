//! REST [`ExchangeAdapter`] implementation against Bybit's v5 unified-trading
//! API, scoped to USDT-margined linear perpetuals (`category=linear`).
//! Transient retries live in the HTTP client middleware (matching the
//! teacher's `HttpClientFactory`); this adapter's own job is classifying
//! every remaining failure into the `AdapterError` taxonomy so the risk
//! controller can tell "back off and retry" from "stop trading this symbol"
//! from "stop trading entirely".

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use crate::domain::errors::{ExchangeFatalError, ExchangeTransientError};
use crate::domain::market::{Bar, Instrument, Timeframe};
use crate::domain::ports::{AccountState, AdapterError, ExchangeAdapter, ExchangePosition, Ticker};
use crate::domain::trading::{OpenOrder, OrderSide, OrderType};

const RECV_WINDOW_MS: &str = "5000";

pub struct BybitAdapter {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BybitEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

impl BybitAdapter {
    pub fn new(base_url: String, api_key: Option<String>, api_secret: Option<String>) -> Self {
        let inner = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            client,
            base_url,
            api_key,
            api_secret,
        }
    }

    fn timestamp_ms() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string()
    }

    fn sign(secret: &str, payload: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn credentials(&self) -> Result<(&str, &str), AdapterError> {
        match (self.api_key.as_deref(), self.api_secret.as_deref()) {
            (Some(k), Some(s)) => Ok((k, s)),
            _ => Err(AdapterError::Fatal(ExchangeFatalError::Unauthorized(
                "no API credentials configured for signed endpoint".to_string(),
            ))),
        }
    }

    async fn signed_get<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        query: &str,
    ) -> Result<T, AdapterError> {
        let (api_key, api_secret) = self.credentials()?;
        let timestamp = Self::timestamp_ms();
        let payload = format!("{timestamp}{api_key}{RECV_WINDOW_MS}{query}");
        let signature = Self::sign(api_secret, &payload);
        let url = build_url(&self.base_url, endpoint, query);

        let response = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(|e| network_error(endpoint, e))?;

        parse_bybit_response(endpoint, response).await
    }

    async fn signed_post<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, AdapterError> {
        let (api_key, api_secret) = self.credentials()?;
        let timestamp = Self::timestamp_ms();
        let body_str = serde_json::to_string(body).unwrap_or_default();
        let payload = format!("{timestamp}{api_key}{RECV_WINDOW_MS}{body_str}");
        let signature = Self::sign(api_secret, &payload);
        let url = format!("{}{}", self.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| network_error(endpoint, e))?;

        parse_bybit_response(endpoint, response).await
    }

    async fn public_get<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        query: &str,
    ) -> Result<T, AdapterError> {
        let url = build_url(&self.base_url, endpoint, query);
        let response = self.client.get(&url).send().await.map_err(|e| network_error(endpoint, e))?;
        parse_bybit_response(endpoint, response).await
    }
}

fn build_url(base_url: &str, endpoint: &str, query: &str) -> String {
    if query.is_empty() {
        format!("{base_url}{endpoint}")
    } else {
        format!("{base_url}{endpoint}?{query}")
    }
}

fn network_error(endpoint: &str, source: reqwest::Error) -> AdapterError {
    if source.is_timeout() {
        AdapterError::Transient(ExchangeTransientError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_ms: 30_000,
        })
    } else {
        AdapterError::Transient(ExchangeTransientError::Network {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}

async fn parse_bybit_response<T: for<'de> Deserialize<'de>>(
    endpoint: &str,
    response: Response,
) -> Result<T, AdapterError> {
    let status = response.status();
    if status == 401 {
        return Err(AdapterError::Fatal(ExchangeFatalError::Unauthorized(endpoint.to_string())));
    }
    if status == 403 {
        return Err(AdapterError::Fatal(ExchangeFatalError::Forbidden(endpoint.to_string())));
    }
    if status == 429 {
        return Err(AdapterError::Transient(ExchangeTransientError::RateLimited {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        }));
    }
    if status.is_server_error() {
        return Err(AdapterError::Transient(ExchangeTransientError::ServerError {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        }));
    }

    let text = response.text().await.map_err(|e| network_error(endpoint, e))?;
    let envelope: BybitEnvelope<T> = serde_json::from_str(&text).map_err(|e| {
        AdapterError::Transient(ExchangeTransientError::ServerError {
            endpoint: format!("{endpoint} (malformed body: {e})"),
            status: status.as_u16(),
        })
    })?;

    match envelope.ret_code {
        0 => envelope.result.ok_or_else(|| {
            AdapterError::Transient(ExchangeTransientError::ServerError {
                endpoint: format!("{endpoint} (empty result)"),
                status: status.as_u16(),
            })
        }),
        10003 | 10004 | 10005 => Err(AdapterError::Fatal(ExchangeFatalError::Unauthorized(envelope.ret_msg))),
        10001 if envelope.ret_msg.to_lowercase().contains("not exist") => {
            Err(AdapterError::Fatal(ExchangeFatalError::InstrumentUnknown(envelope.ret_msg)))
        }
        10006 | 10018 => Err(AdapterError::Transient(ExchangeTransientError::RateLimited {
            endpoint: endpoint.to_string(),
            status: 429,
        })),
        _ => Err(AdapterError::Transient(ExchangeTransientError::ServerError {
            endpoint: format!("{endpoint} (retCode {}: {})", envelope.ret_code, envelope.ret_msg),
            status: status.as_u16(),
        })),
    }
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    symbol: String,
    status: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
    #[serde(rename = "priceFilter")]
    price_filter: PriceFilter,
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Deserialize)]
struct PriceFilter {
    #[serde(rename = "tickSize")]
    tick_size: String,
}

#[derive(Debug, Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "qtyStep")]
    qty_step: String,
    #[serde(rename = "minNotionalValue", default)]
    min_notional_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerInfo {
    symbol: String,
    #[serde(rename = "bid1Price")]
    bid1_price: String,
    #[serde(rename = "ask1Price")]
    ask1_price: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct PositionInfo {
    symbol: String,
    side: String,
    size: String,
    #[serde(rename = "avgPrice")]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct OpenOrderInfo {
    #[serde(rename = "orderId")]
    order_id: String,
    symbol: String,
    side: String,
    #[serde(rename = "orderType")]
    order_type: String,
    price: String,
    qty: String,
    #[serde(rename = "createdTime")]
    created_time: String,
    #[serde(rename = "reduceOnly")]
    reduce_only: bool,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct WalletBalanceInfo {
    #[serde(rename = "totalEquity")]
    total_equity: String,
    #[serde(rename = "totalInitialMargin", default)]
    total_initial_margin: String,
}

fn parse_decimal(raw: &str) -> Decimal {
    raw.parse().unwrap_or(Decimal::ZERO)
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    async fn list_instruments(&self) -> Result<Vec<Instrument>, AdapterError> {
        let result: ListResult<InstrumentInfo> = self
            .public_get("/v5/market/instruments-info", "category=linear")
            .await?;

        Ok(result
            .list
            .into_iter()
            .filter(|i| i.status == "Trading" && i.quote_coin == "USDT")
            .map(|i| Instrument {
                symbol: i.symbol,
                quote_currency: i.quote_coin,
                price_increment: parse_decimal(&i.price_filter.tick_size),
                size_increment: parse_decimal(&i.lot_size_filter.qty_step),
                min_notional: i
                    .lot_size_filter
                    .min_notional_value
                    .as_deref()
                    .map(parse_decimal)
                    .unwrap_or(Decimal::new(5, 0)),
                is_perpetual: true,
            })
            .collect())
    }

    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, AdapterError> {
        let interval = bybit_interval(timeframe);
        let query = format!(
            "category=linear&symbol={}&interval={}&limit={}",
            instrument.symbol,
            interval,
            limit.min(1000)
        );
        let result: ListResult<Vec<String>> = self.public_get("/v5/market/kline", &query).await?;

        let mut bars: Vec<Bar> = result
            .list
            .into_iter()
            .filter_map(|row| {
                if row.len() < 6 {
                    return None;
                }
                Some(Bar {
                    timestamp_ms: row[0].parse().ok()?,
                    open: parse_decimal(&row[1]),
                    high: parse_decimal(&row[2]),
                    low: parse_decimal(&row[3]),
                    close: parse_decimal(&row[4]),
                    volume: parse_decimal(&row[5]),
                })
            })
            .collect();

        // Bybit returns klines newest-first; the rest of the system expects
        // chronological order.
        bars.sort_by_key(|b| b.timestamp_ms);
        Ok(bars)
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, AdapterError> {
        let result: ListResult<PositionInfo> = self
            .signed_get("/v5/position/list", "category=linear&settleCoin=USDT")
            .await?;

        Ok(result
            .list
            .into_iter()
            .filter_map(|p| {
                let size = parse_decimal(&p.size);
                if size.is_zero() {
                    return None;
                }
                let signed_size = if p.side == "Sell" { -size } else { size };
                Some(ExchangePosition {
                    symbol: p.symbol,
                    size: signed_size,
                    avg_entry_price: parse_decimal(&p.avg_price),
                })
            })
            .collect())
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, AdapterError> {
        let query = match symbol {
            Some(s) => format!("category=linear&symbol={s}"),
            None => "category=linear&settleCoin=USDT".to_string(),
        };
        let result: ListResult<OpenOrderInfo> = self.signed_get("/v5/order/realtime", &query).await?;

        Ok(result
            .list
            .into_iter()
            .filter_map(|o| {
                let side = match o.side.as_str() {
                    "Buy" => OrderSide::Buy,
                    "Sell" => OrderSide::Sell,
                    _ => return None,
                };
                let order_type = match o.order_type.as_str() {
                    "Limit" => OrderType::Limit,
                    "Market" => OrderType::Market,
                    _ => return None,
                };
                let created_ms: i64 = o.created_time.parse().ok()?;
                Some(OpenOrder {
                    order_id: o.order_id,
                    symbol: o.symbol,
                    side,
                    order_type,
                    price: parse_decimal(&o.price),
                    size: parse_decimal(&o.qty),
                    created_at: millis_to_datetime(created_ms),
                    reduce_only: o.reduce_only,
                })
            })
            .collect())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError> {
        let query = format!("category=linear&symbol={symbol}");
        let result: ListResult<TickerInfo> = self.public_get("/v5/market/tickers", &query).await?;
        let info = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Fatal(ExchangeFatalError::InstrumentUnknown(symbol.to_string())))?;

        Ok(Ticker {
            bid: parse_decimal(&info.bid1_price),
            ask: parse_decimal(&info.ask1_price),
            last: parse_decimal(&info.last_price),
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
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": if side == OrderSide::Buy { "Buy" } else { "Sell" },
            "orderType": "Limit",
            "qty": size.to_string(),
            "price": price.to_string(),
            "timeInForce": if post_only { "PostOnly" } else { "GTC" },
            "reduceOnly": reduce_only,
        });

        let result: CreateOrderResult = self.signed_post("/v5/order/create", &body).await?;
        Ok(result.order_id)
    }

    async fn cancel(&self, order_id: &str) -> Result<(), AdapterError> {
        let body = serde_json::json!({
            "category": "linear",
            "orderId": order_id,
        });
        let _: serde_json::Value = self.signed_post("/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn fetch_account_state(&self) -> Result<AccountState, AdapterError> {
        let result: ListResult<WalletBalanceInfo> = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let info = result.list.into_iter().next().ok_or_else(|| {
            AdapterError::Transient(ExchangeTransientError::ServerError {
                endpoint: "/v5/account/wallet-balance (empty list)".to_string(),
                status: 200,
            })
        })?;

        Ok(AccountState {
            equity: parse_decimal(&info.total_equity),
            used_margin: parse_decimal(&info.total_initial_margin),
        })
    }
}

fn bybit_interval(timeframe: Timeframe) -> &'static str {
    match timeframe.millis() {
        60_000 => "1",
        300_000 => "5",
        900_000 => "15",
        3_600_000 => "60",
        14_400_000 => "240",
        86_400_000 => "D",
        _ => "60",
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bybit_interval_maps_known_timeframes() {
        assert_eq!(bybit_interval(Timeframe::ONE_HOUR), "60");
        assert_eq!(bybit_interval(Timeframe::FIVE_MINUTES), "5");
        assert_eq!(bybit_interval(Timeframe(14_400_000)), "240");
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let sig = BybitAdapter::sign("secret", "1700000000000apikey5000category=linear");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn build_url_appends_query_only_when_present() {
        assert_eq!(build_url("https://api.bybit.com", "/v5/market/tickers", ""), "https://api.bybit.com/v5/market/tickers");
        assert_eq!(
            build_url("https://api.bybit.com", "/v5/market/tickers", "symbol=BTCUSDT"),
            "https://api.bybit.com/v5/market/tickers?symbol=BTCUSDT"
        );
    }
}
