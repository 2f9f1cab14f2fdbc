pub mod exchange;
pub mod metrics;
pub mod notifications;
pub mod ohlcv_cache;
pub mod persistence;
pub mod reporter;
pub mod state_store;
