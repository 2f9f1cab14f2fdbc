use rust_decimal::Decimal;
use thiserror::Error;

/// Exchange-adapter failures that should be retried with backoff and counted
/// against the circuit breaker window, but never bubble past the adapter on
/// their own.
#[derive(Debug, Error)]
pub enum ExchangeTransientError {
    #[error("network error calling {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("rate limited on {endpoint} (status {status})")]
    RateLimited { endpoint: String, status: u16 },
    #[error("server error on {endpoint} (status {status})")]
    ServerError { endpoint: String, status: u16 },
    #[error("request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },
}

/// Exchange failures that are not worth retrying: either the whole account is
/// unusable, or a single instrument must be dropped for the cycle.
#[derive(Debug, Error)]
pub enum ExchangeFatalError {
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("permission denied for endpoint {0}")]
    Forbidden(String),
    #[error("instrument {0} is delisted or unknown to the exchange")]
    InstrumentUnknown(String),
}

/// Non-fatal data-quality findings from the OHLCV validator. Logged, and the
/// affected instrument may be excluded from the cycle, but the loop continues.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataQualityError {
    #[error("bar for {symbol} at {ts} fails OHLC sanity: open={open} high={high} low={low} close={close}")]
    OhlcSanity {
        symbol: String,
        ts: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    },
    #[error("gap detected for {symbol}: missing {missing_bars} bar(s) before {ts}")]
    Gap {
        symbol: String,
        ts: i64,
        missing_bars: i64,
    },
    #[error("return spike for {symbol} at {ts}: zscore={zscore:.2} exceeds threshold {threshold:.2}")]
    ReturnSpike {
        symbol: String,
        ts: i64,
        zscore: f64,
        threshold: f64,
    },
}

/// The outcome of a tripped risk gate. This is deliberately not an
/// [`std::error::Error`] impl consumer of `?` propagation paths that abort the
/// process — a risk pause is an expected, loggable-at-INFO control path, not a
/// failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskGate {
    DailyLossLimit { equity: Decimal, limit: Decimal },
    PortfolioDrawdown { drawdown_pct: f64, limit_pct: f64 },
    MarginHardLimit { margin_ratio: f64, limit: f64 },
    CircuitBreakerOpen { cooldown_until_ms: i64 },
    ReconciliationFailed,
    EmergencyStopFile,
    /// Informational only: 90/180/365-day drawdown over its configured
    /// threshold. Never contributes to `RiskDecision` — §4.5 warns, it does
    /// not pause.
    LongTermDrawdownWarning { window_days: i64, drawdown_pct: f64, limit_pct: f64 },
}

impl std::fmt::Display for RiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskGate::DailyLossLimit { equity, limit } => {
                write!(f, "daily loss limit: equity {equity} below floor {limit}")
            }
            RiskGate::PortfolioDrawdown {
                drawdown_pct,
                limit_pct,
            } => write!(
                f,
                "portfolio drawdown {drawdown_pct:.2}% exceeds limit {limit_pct:.2}%"
            ),
            RiskGate::MarginHardLimit {
                margin_ratio,
                limit,
            } => write!(f, "margin ratio {margin_ratio:.3} exceeds hard limit {limit:.3}"),
            RiskGate::CircuitBreakerOpen { cooldown_until_ms } => {
                write!(f, "circuit breaker open until {cooldown_until_ms}")
            }
            RiskGate::ReconciliationFailed => {
                write!(f, "position reconciliation with exchange failed")
            }
            RiskGate::EmergencyStopFile => write!(f, "emergency stop file present"),
            RiskGate::LongTermDrawdownWarning {
                window_days,
                drawdown_pct,
                limit_pct,
            } => write!(
                f,
                "{window_days}-day drawdown {drawdown_pct:.2}% exceeds warning threshold {limit_pct:.2}%"
            ),
        }
    }
}

/// Failures in the state store. These abort the current cycle's write (the
/// heartbeat is not advanced) but never crash the process.
#[derive(Debug, Error)]
pub enum StateIoError {
    #[error("failed to serialize state document: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write state file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rename temp state file onto {path}: {source}")]
    Rename {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A violated internal invariant. The cycle is aborted without sending any
/// orders and this is logged at ERROR, but the process keeps running.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("gross exposure {gross} exceeds configured leverage {limit} after normalization")]
    GrossLeverageExceeded { gross: Decimal, limit: Decimal },
    #[error("weight for {symbol} is {weight}, exceeds per-asset cap {cap}")]
    PerAssetCapExceeded {
        symbol: String,
        weight: Decimal,
        cap: Decimal,
    },
    #[error("market-neutral net exposure {net} exceeds tolerance")]
    NotMarketNeutral { net: Decimal },
    #[error("position {symbol} has no stop price while open")]
    PositionMissingStop { symbol: String },
}

/// Failures that abort a single optimizer invocation. The process exits
/// non-zero and no deployment occurs.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("insufficient history for {symbol}: need {needed} bars, have {have}")]
    InsufficientHistory {
        symbol: String,
        needed: usize,
        have: usize,
    },
    #[error("no walk-forward segments could be constructed from the available history")]
    NoSegments,
    #[error("candidate search produced no viable parameter sets")]
    NoViableCandidates,
    #[error("failed to persist optimizer run ledger: {0}")]
    Ledger(#[from] anyhow::Error),
    #[error("failed to write versioned config: {0}")]
    Versioning(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error for the trading-engine binary's outer boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    ExchangeFatal(#[from] ExchangeFatalError),
    #[error(transparent)]
    StateIo(#[from] StateIoError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_gate_messages_are_informative() {
        let gate = RiskGate::DailyLossLimit {
            equity: Decimal::new(9499, 0),
            limit: Decimal::new(9500, 0),
        };
        assert!(gate.to_string().contains("daily loss limit"));
    }

    #[test]
    fn data_quality_error_carries_symbol() {
        let err = DataQualityError::Gap {
            symbol: "BTCUSDT".into(),
            ts: 1_700_000_000_000,
            missing_bars: 3,
        };
        assert!(err.to_string().contains("BTCUSDT"));
        assert!(err.to_string().contains('3'));
    }
}
