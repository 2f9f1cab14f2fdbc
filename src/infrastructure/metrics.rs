//! Prometheus metrics for the trading engine.
//!
//! All metrics use the `xsmom_` prefix and are read-only from the rest of the
//! application's point of view; only the trading cycle and fast exit monitor
//! write to them.

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge, GenericGaugeVec},
};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub equity_usd: GenericGauge<AtomicF64>,
    pub margin_ratio: GenericGauge<AtomicF64>,
    pub gates_fired: GenericGauge<AtomicF64>,
    pub breadth_fraction: GenericGauge<AtomicF64>,
    pub open_positions: GenericGauge<AtomicF64>,
    pub position_weight: GenericGaugeVec<AtomicF64>,
    pub orders_total: CounterVec,
    pub exits_total: CounterVec,
    pub circuit_breaker_status: GenericGauge<AtomicF64>,
    pub exchange_latency_seconds: HistogramVec,
    pub cycle_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let equity_usd = Gauge::with_opts(Opts::new("xsmom_equity_usd", "Account equity in USD"))?;
        registry.register(Box::new(equity_usd.clone()))?;

        let margin_ratio = Gauge::with_opts(Opts::new("xsmom_margin_ratio", "Used margin over equity"))?;
        registry.register(Box::new(margin_ratio.clone()))?;

        let gates_fired = Gauge::with_opts(Opts::new(
            "xsmom_risk_gates_fired",
            "Number of risk gates that fired this cycle",
        ))?;
        registry.register(Box::new(gates_fired.clone()))?;

        let breadth_fraction = Gauge::with_opts(Opts::new(
            "xsmom_breadth_fraction",
            "Fraction of universe passing filters this cycle",
        ))?;
        registry.register(Box::new(breadth_fraction.clone()))?;

        let open_positions = Gauge::with_opts(Opts::new("xsmom_open_positions", "Number of open positions"))?;
        registry.register(Box::new(open_positions.clone()))?;

        let position_weight = GaugeVec::new(
            Opts::new("xsmom_position_weight", "Target weight per symbol"),
            &["symbol"],
        )?;
        registry.register(Box::new(position_weight.clone()))?;

        let orders_total = CounterVec::new(
            Opts::new("xsmom_orders_total", "Total orders placed by side and reason"),
            &["side", "reduce_only"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let exits_total = CounterVec::new(
            Opts::new("xsmom_exits_total", "Total position exits by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(exits_total.clone()))?;

        let circuit_breaker_status = Gauge::with_opts(Opts::new(
            "xsmom_circuit_breaker_status",
            "Circuit breaker status (0=closed, 1=tripped)",
        ))?;
        registry.register(Box::new(circuit_breaker_status.clone()))?;

        let exchange_latency_seconds = HistogramVec::new(
            HistogramOpts::new("xsmom_exchange_latency_seconds", "Exchange adapter call latency")
                .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["endpoint"],
        )?;
        registry.register(Box::new(exchange_latency_seconds.clone()))?;

        let cycle_duration_seconds = HistogramVec::new(
            HistogramOpts::new("xsmom_cycle_duration_seconds", "Trading cycle wall-clock duration")
                .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["kind"],
        )?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            equity_usd,
            margin_ratio,
            gates_fired,
            breadth_fraction,
            open_positions,
            position_weight,
            orders_total,
            exits_total,
            circuit_breaker_status,
            exchange_latency_seconds,
            cycle_duration_seconds,
        })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }

    pub fn set_equity(&self, equity: Decimal) {
        self.equity_usd.set(equity.to_f64().unwrap_or(0.0));
    }

    pub fn set_margin_ratio(&self, ratio: f64) {
        self.margin_ratio.set(ratio);
    }

    pub fn set_gates_fired(&self, count: usize) {
        self.gates_fired.set(count as f64);
    }

    pub fn set_breadth_fraction(&self, fraction: f64) {
        self.breadth_fraction.set(fraction);
    }

    pub fn set_open_positions(&self, count: usize) {
        self.open_positions.set(count as f64);
    }

    pub fn set_position_weight(&self, symbol: &str, weight: f64) {
        self.position_weight.with_label_values(&[symbol]).set(weight);
    }

    pub fn inc_orders(&self, side: &str, reduce_only: bool) {
        self.orders_total
            .with_label_values(&[side, if reduce_only { "true" } else { "false" }])
            .inc();
    }

    pub fn inc_exits(&self, reason: &str) {
        self.exits_total.with_label_values(&[reason]).inc();
    }

    pub fn set_circuit_breaker_status(&self, tripped: bool) {
        self.circuit_breaker_status.set(if tripped { 1.0 } else { 0.0 });
    }

    pub fn observe_exchange_latency(&self, endpoint: &str, seconds: f64) {
        self.exchange_latency_seconds.with_label_values(&[endpoint]).observe(seconds);
    }

    pub fn observe_cycle_duration(&self, kind: &str, seconds: f64) {
        self.cycle_duration_seconds.with_label_values(&[kind]).observe(seconds);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to construct default metrics registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn render_includes_domain_prefix() {
        let metrics = Metrics::new().expect("metrics construct");
        assert!(metrics.render().contains("xsmom_"));
    }

    #[test]
    fn equity_gauge_reflects_decimal_value() {
        let metrics = Metrics::new().expect("metrics construct");
        metrics.set_equity(dec!(10234.5));
        assert!(metrics.render().contains("xsmom_equity_usd 10234.5"));
    }

    #[test]
    fn per_symbol_weight_gauge_has_label() {
        let metrics = Metrics::new().expect("metrics construct");
        metrics.set_position_weight("BTCUSDT", 0.12);
        let output = metrics.render();
        assert!(output.contains("xsmom_position_weight"));
        assert!(output.contains("BTCUSDT"));
    }
}
