use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The frozen, tunable subset of strategy parameters the optimizer is
/// permitted to move. Safety limits (`max_daily_loss_pct`,
/// `max_portfolio_drawdown_pct`, ...) are never part of this map — see
/// `config::RiskSection` which the optimizer cannot touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub values: BTreeMap<String, f64>,
}

impl ParameterSet {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// A stable hash used as the bad-combo-memory key, independent of map
    /// iteration order.
    pub fn stable_key(&self) -> String {
        let mut parts: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect();
        parts.sort();
        parts.join("|")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMetrics {
    pub train_sharpe: f64,
    pub oos_sharpe: f64,
    pub oos_annualized_return: f64,
    pub oos_max_drawdown: f64,
    pub oos_calmar: f64,
    pub mc_p95_drawdown: f64,
    pub mc_p99_drawdown: f64,
}

/// Metadata sidecar written alongside a versioned YAML config, recording why
/// the optimizer chose it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVersionMetadata {
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    pub parameters: ParameterSet,
    pub baseline_oos_sharpe: f64,
    pub candidate_oos_sharpe: f64,
    pub segment_metrics: Vec<SegmentMetrics>,
    pub deployed: bool,
    pub backup_of: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_key_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), 1.0);
        a.insert("a".to_string(), 2.0);
        let ps = ParameterSet { values: a };
        assert_eq!(ps.stable_key(), "a=2.000000|b=1.000000");
    }
}
