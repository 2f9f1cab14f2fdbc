//! Sectioned, validated runtime configuration.
//!
//! [`Config::load`] reads a TOML file named by the `CONFIG_PATH` environment
//! variable (falling back to `config/xsmom.toml`) and layers exchange
//! credentials from the environment on top, exactly as an external config
//! loader is expected to hand the engine a single validated object. Unknown
//! or mistyped fields fail at load time rather than being silently ignored.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_timeframe() -> String {
    "1h".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSection {
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "defaults::max_symbols")]
    pub max_symbols: usize,
    #[serde(default = "defaults::min_usd_volume_24h")]
    pub min_usd_volume_24h: f64,
    #[serde(default = "defaults::min_price")]
    pub min_price: f64,
    #[serde(default = "defaults::candles_limit")]
    pub candles_limit: usize,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_secret_env: Option<String>,
    #[serde(default = "defaults::base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "defaults::cache_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSection {
    #[serde(default = "defaults::spike_zscore_threshold")]
    pub spike_zscore_threshold: f64,
    #[serde(default = "defaults::spike_lookback")]
    pub spike_lookback: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSection {
    #[serde(default = "defaults::max_candles_per_request")]
    pub max_candles_per_request: usize,
    #[serde(default = "defaults::max_candles_total")]
    pub max_candles_total: usize,
    #[serde(default = "defaults::api_throttle_sleep_ms")]
    pub api_throttle_sleep_ms: u64,
    #[serde(default = "defaults::max_pagination_requests")]
    pub max_pagination_requests: usize,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub validation: ValidationSection,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: defaults::cache_dir(),
        }
    }
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            spike_zscore_threshold: defaults::spike_zscore_threshold(),
            spike_lookback: defaults::spike_lookback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsSection {
    #[serde(default = "defaults::lookbacks")]
    pub lookbacks: Vec<(usize, f64)>,
    #[serde(default = "defaults::signal_power")]
    pub signal_power: f64,
    #[serde(default = "defaults::vol_lookback")]
    pub vol_lookback: usize,
    #[serde(default = "defaults::k_min")]
    pub k_min: usize,
    #[serde(default = "defaults::k_max")]
    pub k_max: usize,
    #[serde(default = "defaults::market_neutral")]
    pub market_neutral: bool,
    #[serde(default = "defaults::entry_zscore_min")]
    pub entry_zscore_min: f64,
    #[serde(default = "defaults::min_breadth_fraction")]
    pub min_breadth_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeFilterSection {
    #[serde(default = "defaults::enabled_true")]
    pub enabled: bool,
    #[serde(default = "defaults::ema_len")]
    pub ema_len: usize,
    #[serde(default = "defaults::slope_min_bps_per_day")]
    pub slope_min_bps_per_day: f64,
}

impl Default for RegimeFilterSection {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled_true(),
            ema_len: defaults::ema_len(),
            slope_min_bps_per_day: defaults::slope_min_bps_per_day(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdxFilterSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::min_adx")]
    pub min_adx: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFilterSection {
    #[serde(default = "defaults::enabled_true")]
    pub enabled: bool,
    #[serde(default = "defaults::min_win_rate")]
    pub min_win_rate: f64,
    #[serde(default = "defaults::streak_pause_after_losses")]
    pub streak_pause_after_losses: u32,
    #[serde(default = "defaults::streak_pause_minutes")]
    pub streak_pause_minutes: i64,
    /// Cooldown after a normal exit (profit target, time exit, no-progress).
    #[serde(default = "defaults::post_exit_cooldown_minutes")]
    pub post_exit_cooldown_minutes: i64,
    /// Longer cooldown after a stop-loss (initial, trailing, or catastrophic).
    #[serde(default = "defaults::post_stop_cooldown_minutes")]
    pub post_stop_cooldown_minutes: i64,
    /// EMA smoothing factor applied to `SymbolStats::record_trade`.
    #[serde(default = "defaults::symbol_stats_ema_smoothing")]
    pub ema_smoothing: f64,
}

impl Default for SymbolFilterSection {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled_true(),
            min_win_rate: defaults::min_win_rate(),
            streak_pause_after_losses: defaults::streak_pause_after_losses(),
            streak_pause_minutes: defaults::streak_pause_minutes(),
            post_exit_cooldown_minutes: defaults::post_exit_cooldown_minutes(),
            post_stop_cooldown_minutes: defaults::post_stop_cooldown_minutes(),
            ema_smoothing: defaults::symbol_stats_ema_smoothing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolatilityEntrySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::expansion_mult")]
    pub expansion_mult: f64,
    #[serde(default = "defaults::atr_lookback")]
    pub atr_lookback: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FiltersSection {
    #[serde(default)]
    pub regime_filter: RegimeFilterSection,
    #[serde(default)]
    pub adx_filter: AdxFilterSection,
    #[serde(default)]
    pub symbol_filter: SymbolFilterSection,
    #[serde(default)]
    pub volatility_entry: VolatilityEntrySection,
    #[serde(default)]
    pub blackout_hours_utc: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolTargetSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::target_ann_vol")]
    pub target_ann_vol: f64,
    #[serde(default = "defaults::min_scale")]
    pub min_scale: f64,
    #[serde(default = "defaults::max_scale")]
    pub max_scale: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KellySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::kelly_fraction")]
    pub fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorrelationSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::lookback_hours")]
    pub lookback_hours: usize,
    #[serde(default = "defaults::max_allowed_corr")]
    pub max_allowed_corr: f64,
    #[serde(default = "defaults::max_high_corr_positions")]
    pub max_high_corr_positions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityRegimeSection {
    #[serde(default = "defaults::enabled_true")]
    pub enabled: bool,
    #[serde(default = "defaults::high_vol_mult")]
    pub high_vol_mult: f64,
    #[serde(default = "defaults::max_scale_down")]
    pub max_scale_down: f64,
    #[serde(default = "defaults::proxy_symbol")]
    pub proxy_symbol: String,
}

impl Default for VolatilityRegimeSection {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled_true(),
            high_vol_mult: defaults::high_vol_mult(),
            max_scale_down: defaults::max_scale_down(),
            proxy_symbol: defaults::proxy_symbol(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingSection {
    #[serde(default = "defaults::gross_leverage")]
    pub gross_leverage: f64,
    #[serde(default = "defaults::max_weight_per_asset")]
    pub max_weight_per_asset: f64,
    #[serde(default = "defaults::notional_cap_usdt")]
    pub notional_cap_usdt: f64,
    #[serde(default = "defaults::max_open_positions_hard")]
    pub max_open_positions_hard: usize,
    #[serde(default)]
    pub vol_target: VolTargetSection,
    #[serde(default)]
    pub kelly: KellySection,
    #[serde(default)]
    pub correlation: CorrelationSection,
    #[serde(default)]
    pub volatility_regime: VolatilityRegimeSection,
    #[serde(default = "defaults::carry_budget_frac")]
    pub carry_budget_frac: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    InverseVolatility,
    FixedRisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginAction {
    Pause,
    Liquidate,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiCircuitBreakerSection {
    #[serde(default = "defaults::cb_window_seconds")]
    pub window_seconds: i64,
    #[serde(default = "defaults::cb_max_errors")]
    pub max_errors: usize,
    #[serde(default = "defaults::cb_cooldown_seconds")]
    pub cooldown_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LongTermDrawdownSection {
    #[serde(default = "defaults::warn_dd_90d")]
    pub warn_90d_pct: f64,
    #[serde(default = "defaults::warn_dd_180d")]
    pub warn_180d_pct: f64,
    #[serde(default = "defaults::warn_dd_365d")]
    pub warn_365d_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSection {
    #[serde(default = "defaults::max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "defaults::max_portfolio_drawdown_pct")]
    pub max_portfolio_drawdown_pct: f64,
    #[serde(default = "defaults::portfolio_dd_window_days")]
    pub portfolio_dd_window_days: i64,
    #[serde(default = "defaults::atr_mult_sl")]
    pub atr_mult_sl: f64,
    #[serde(default = "defaults::catastrophic_atr_mult")]
    pub catastrophic_atr_mult: f64,
    #[serde(default = "defaults::trailing_enabled")]
    pub trailing_enabled: bool,
    #[serde(default = "defaults::trail_atr_mult")]
    pub trail_atr_mult: f64,
    #[serde(default = "defaults::breakeven_after_r")]
    pub breakeven_after_r: f64,
    #[serde(default = "defaults::profit_targets")]
    pub profit_targets: Vec<(f64, f64)>,
    #[serde(default = "defaults::max_hours_in_trade")]
    pub max_hours_in_trade: i64,
    #[serde(default = "defaults::min_hold_minutes")]
    pub min_hold_minutes: i64,
    #[serde(default = "defaults::no_progress_enabled")]
    pub no_progress_exit_enabled: bool,
    #[serde(default = "defaults::no_progress_r_threshold")]
    pub no_progress_r_threshold: f64,
    #[serde(default = "defaults::sizing_mode")]
    pub sizing_mode: SizingMode,
    #[serde(default = "defaults::risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,
    #[serde(default)]
    pub api_circuit_breaker: ApiCircuitBreakerSection,
    #[serde(default = "defaults::margin_soft_limit_pct")]
    pub margin_soft_limit_pct: f64,
    #[serde(default = "defaults::margin_hard_limit_pct")]
    pub margin_hard_limit_pct: f64,
    #[serde(default = "defaults::margin_action")]
    pub margin_action: MarginAction,
    #[serde(default)]
    pub long_term_dd: LongTermDrawdownSection,
    #[serde(default = "defaults::stop_timeframe")]
    pub stop_timeframe: String,
    #[serde(default = "defaults::fast_check_seconds")]
    pub fast_check_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpreadGuardSection {
    #[serde(default = "defaults::max_spread_bps")]
    pub max_spread_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DynamicOffsetSection {
    #[serde(default = "defaults::base_bps")]
    pub base_bps: f64,
    #[serde(default = "defaults::per_spread_coeff")]
    pub per_spread_coeff: f64,
    #[serde(default = "defaults::max_offset_bps")]
    pub max_offset_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MicrostructureSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::min_obi")]
    pub min_obi: f64,
    #[serde(default = "defaults::min_top_of_book_depth_usd")]
    pub min_top_of_book_depth_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StaleOrdersSection {
    #[serde(default = "defaults::stale_order_max_age_sec")]
    pub max_age_sec: i64,
    #[serde(default = "defaults::reprice_if_far_bps")]
    pub reprice_if_far_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "defaults::rebalance_minute")]
    pub rebalance_minute: u32,
    #[serde(default = "defaults::poll_seconds")]
    pub poll_seconds: u64,
    #[serde(default = "defaults::post_only")]
    pub post_only: bool,
    #[serde(default = "defaults::min_notional_usdt")]
    pub min_notional_usdt: f64,
    #[serde(default = "defaults::min_rebalance_delta_bps")]
    pub min_rebalance_delta_bps: f64,
    #[serde(default)]
    pub spread_guard: SpreadGuardSection,
    #[serde(default)]
    pub dynamic_offset: DynamicOffsetSection,
    #[serde(default)]
    pub microstructure: MicrostructureSection,
    #[serde(default)]
    pub stale_orders: StaleOrdersSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LiquiditySection {
    #[serde(default = "defaults::adv_pct_cap")]
    pub adv_pct_cap: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationsSection {
    #[serde(default)]
    pub discord_webhook_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterRangeSection {
    #[serde(default = "defaults::range_signal_power")]
    pub signal_power: (f64, f64),
    #[serde(default = "defaults::range_vol_lookback")]
    pub vol_lookback: (usize, usize),
    #[serde(default = "defaults::range_k_min")]
    pub k_min: (usize, usize),
    #[serde(default = "defaults::range_k_max")]
    pub k_max: (usize, usize),
    #[serde(default = "defaults::range_entry_zscore_min")]
    pub entry_zscore_min: (f64, f64),
    #[serde(default = "defaults::range_min_breadth_fraction")]
    pub min_breadth_fraction: (f64, f64),
    #[serde(default = "defaults::range_gross_leverage")]
    pub gross_leverage: (f64, f64),
    #[serde(default = "defaults::range_max_weight_per_asset")]
    pub max_weight_per_asset: (f64, f64),
    #[serde(default = "defaults::range_atr_mult_sl")]
    pub atr_mult_sl: (f64, f64),
    #[serde(default = "defaults::range_trail_atr_mult")]
    pub trail_atr_mult: (f64, f64),
    #[serde(default = "defaults::range_target_ann_vol")]
    pub target_ann_vol: (f64, f64),
}

impl Default for ParameterRangeSection {
    fn default() -> Self {
        Self {
            signal_power: defaults::range_signal_power(),
            vol_lookback: defaults::range_vol_lookback(),
            k_min: defaults::range_k_min(),
            k_max: defaults::range_k_max(),
            entry_zscore_min: defaults::range_entry_zscore_min(),
            min_breadth_fraction: defaults::range_min_breadth_fraction(),
            gross_leverage: defaults::range_gross_leverage(),
            max_weight_per_asset: defaults::range_max_weight_per_asset(),
            atr_mult_sl: defaults::range_atr_mult_sl(),
            trail_atr_mult: defaults::range_trail_atr_mult(),
            target_ann_vol: defaults::range_target_ann_vol(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveWeightsSection {
    #[serde(default = "defaults::w_sharpe")]
    pub w_sharpe: f64,
    #[serde(default = "defaults::w_cagr")]
    pub w_cagr: f64,
    #[serde(default = "defaults::w_calmar")]
    pub w_calmar: f64,
    #[serde(default = "defaults::lambda_turnover")]
    pub lambda_turnover: f64,
}

impl Default for ObjectiveWeightsSection {
    fn default() -> Self {
        Self {
            w_sharpe: defaults::w_sharpe(),
            w_cagr: defaults::w_cagr(),
            w_calmar: defaults::w_calmar(),
            lambda_turnover: defaults::lambda_turnover(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSection {
    #[serde(default = "defaults::opt_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "defaults::opt_train_days")]
    pub train_days: i64,
    #[serde(default = "defaults::opt_oos_days")]
    pub oos_days: i64,
    #[serde(default = "defaults::opt_embargo_days")]
    pub embargo_days: i64,
    #[serde(default = "defaults::opt_segments")]
    pub segments: usize,
    #[serde(default = "defaults::opt_trials_per_segment")]
    pub trials_per_segment: usize,
    #[serde(default = "defaults::opt_random_trial_fraction")]
    pub random_trial_fraction: f64,
    #[serde(default = "defaults::opt_top_k_oos")]
    pub top_k_oos: usize,
    #[serde(default = "defaults::opt_mc_iterations")]
    pub mc_iterations: usize,
    #[serde(default = "defaults::opt_mc_block_size")]
    pub mc_block_size: usize,
    #[serde(default = "defaults::opt_fee_bps_range")]
    pub fee_bps_range: (f64, f64),
    #[serde(default = "defaults::opt_slippage_bps_range")]
    pub slippage_bps_range: (f64, f64),
    #[serde(default = "defaults::opt_funding_perturbation_pct")]
    pub funding_perturbation_pct: f64,
    #[serde(default = "defaults::opt_tail_dd_limit")]
    pub tail_dd_limit: f64,
    #[serde(default = "defaults::opt_max_dd_increase")]
    pub max_dd_increase: f64,
    #[serde(default = "defaults::opt_min_improve_sharpe")]
    pub min_improve_sharpe: f64,
    #[serde(default = "defaults::opt_min_improve_annualized")]
    pub min_improve_annualized: f64,
    #[serde(default = "defaults::opt_bad_combo_decile")]
    pub bad_combo_decile: f64,
    #[serde(default)]
    pub ranges: ParameterRangeSection,
    #[serde(default)]
    pub objective: ObjectiveWeightsSection,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            symbols: defaults::opt_symbols(),
            train_days: defaults::opt_train_days(),
            oos_days: defaults::opt_oos_days(),
            embargo_days: defaults::opt_embargo_days(),
            segments: defaults::opt_segments(),
            trials_per_segment: defaults::opt_trials_per_segment(),
            random_trial_fraction: defaults::opt_random_trial_fraction(),
            top_k_oos: defaults::opt_top_k_oos(),
            mc_iterations: defaults::opt_mc_iterations(),
            mc_block_size: defaults::opt_mc_block_size(),
            fee_bps_range: defaults::opt_fee_bps_range(),
            slippage_bps_range: defaults::opt_slippage_bps_range(),
            funding_perturbation_pct: defaults::opt_funding_perturbation_pct(),
            tail_dd_limit: defaults::opt_tail_dd_limit(),
            max_dd_increase: defaults::opt_max_dd_increase(),
            min_improve_sharpe: defaults::opt_min_improve_sharpe(),
            min_improve_annualized: defaults::opt_min_improve_annualized(),
            bad_combo_decile: defaults::opt_bad_combo_decile(),
            ranges: ParameterRangeSection::default(),
            objective: ObjectiveWeightsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default = "defaults::state_path")]
    pub state_path: PathBuf,
    #[serde(default = "defaults::logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "defaults::config_versions_dir")]
    pub config_versions_dir: PathBuf,
    #[serde(default = "defaults::optimizer_db")]
    pub optimizer_db: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub signals: SignalsSection,
    #[serde(default)]
    pub filters: FiltersSection,
    #[serde(default)]
    pub sizing: SizingSection,
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub liquidity: LiquiditySection,
    #[serde(default)]
    pub notifications: NotificationsSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub optimizer: OptimizerSection,
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            timeframe: default_timeframe(),
            max_symbols: defaults::max_symbols(),
            min_usd_volume_24h: defaults::min_usd_volume_24h(),
            min_price: defaults::min_price(),
            candles_limit: defaults::candles_limit(),
            api_key_env: None,
            api_secret_env: None,
            base_url: defaults::base_url(),
        }
    }
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            max_candles_per_request: defaults::max_candles_per_request(),
            max_candles_total: defaults::max_candles_total(),
            api_throttle_sleep_ms: defaults::api_throttle_sleep_ms(),
            max_pagination_requests: defaults::max_pagination_requests(),
            cache: CacheSection::default(),
            validation: ValidationSection::default(),
        }
    }
}

impl Default for SignalsSection {
    fn default() -> Self {
        Self {
            lookbacks: defaults::lookbacks(),
            signal_power: defaults::signal_power(),
            vol_lookback: defaults::vol_lookback(),
            k_min: defaults::k_min(),
            k_max: defaults::k_max(),
            market_neutral: defaults::market_neutral(),
            entry_zscore_min: defaults::entry_zscore_min(),
            min_breadth_fraction: defaults::min_breadth_fraction(),
        }
    }
}

impl Default for SizingSection {
    fn default() -> Self {
        Self {
            gross_leverage: defaults::gross_leverage(),
            max_weight_per_asset: defaults::max_weight_per_asset(),
            notional_cap_usdt: defaults::notional_cap_usdt(),
            max_open_positions_hard: defaults::max_open_positions_hard(),
            vol_target: VolTargetSection::default(),
            kelly: KellySection::default(),
            correlation: CorrelationSection::default(),
            volatility_regime: VolatilityRegimeSection::default(),
            carry_budget_frac: defaults::carry_budget_frac(),
        }
    }
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: defaults::max_daily_loss_pct(),
            max_portfolio_drawdown_pct: defaults::max_portfolio_drawdown_pct(),
            portfolio_dd_window_days: defaults::portfolio_dd_window_days(),
            atr_mult_sl: defaults::atr_mult_sl(),
            catastrophic_atr_mult: defaults::catastrophic_atr_mult(),
            trailing_enabled: defaults::trailing_enabled(),
            trail_atr_mult: defaults::trail_atr_mult(),
            breakeven_after_r: defaults::breakeven_after_r(),
            profit_targets: defaults::profit_targets(),
            max_hours_in_trade: defaults::max_hours_in_trade(),
            min_hold_minutes: defaults::min_hold_minutes(),
            no_progress_exit_enabled: defaults::no_progress_enabled(),
            no_progress_r_threshold: defaults::no_progress_r_threshold(),
            sizing_mode: defaults::sizing_mode(),
            risk_per_trade_pct: defaults::risk_per_trade_pct(),
            api_circuit_breaker: ApiCircuitBreakerSection::default(),
            margin_soft_limit_pct: defaults::margin_soft_limit_pct(),
            margin_hard_limit_pct: defaults::margin_hard_limit_pct(),
            margin_action: defaults::margin_action(),
            long_term_dd: LongTermDrawdownSection::default(),
            stop_timeframe: defaults::stop_timeframe(),
            fast_check_seconds: defaults::fast_check_seconds(),
        }
    }
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            rebalance_minute: defaults::rebalance_minute(),
            poll_seconds: defaults::poll_seconds(),
            post_only: defaults::post_only(),
            min_notional_usdt: defaults::min_notional_usdt(),
            min_rebalance_delta_bps: defaults::min_rebalance_delta_bps(),
            spread_guard: SpreadGuardSection::default(),
            dynamic_offset: DynamicOffsetSection::default(),
            microstructure: MicrostructureSection::default(),
            stale_orders: StaleOrdersSection::default(),
        }
    }
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            state_path: defaults::state_path(),
            logs_dir: defaults::logs_dir(),
            config_versions_dir: defaults::config_versions_dir(),
            optimizer_db: defaults::optimizer_db(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeSection::default(),
            data: DataSection::default(),
            signals: SignalsSection::default(),
            filters: FiltersSection::default(),
            sizing: SizingSection::default(),
            risk: RiskSection::default(),
            execution: ExecutionSection::default(),
            liquidity: LiquiditySection::default(),
            notifications: NotificationsSection::default(),
            paths: PathsSection::default(),
            optimizer: OptimizerSection::default(),
        }
    }
}

impl Config {
    /// Loads from `CONFIG_PATH` (default `config/xsmom.toml`) if present,
    /// otherwise starts from built-in defaults; either way, secrets are read
    /// from the environment, never from the file.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/xsmom.toml".to_string());
        let mut config = if std::path::Path::new(&path).exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file at {path}"))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("failed to parse config file at {path}"))?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        anyhow::ensure!(
            self.sizing.gross_leverage > 0.0,
            "sizing.gross_leverage must be positive"
        );
        anyhow::ensure!(
            self.signals.k_min >= 1 && self.signals.k_max >= self.signals.k_min,
            "signals.k_min/k_max are inconsistent"
        );
        anyhow::ensure!(
            self.risk.max_daily_loss_pct > 0.0 && self.risk.max_daily_loss_pct < 1.0,
            "risk.max_daily_loss_pct must be in (0, 1)"
        );
        anyhow::ensure!(
            self.risk.margin_soft_limit_pct <= self.risk.margin_hard_limit_pct,
            "risk.margin_soft_limit_pct must not exceed margin_hard_limit_pct"
        );
        Ok(())
    }

    pub fn exchange_api_key(&self) -> Option<String> {
        self.exchange
            .api_key_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    pub fn exchange_api_secret(&self) -> Option<String> {
        self.exchange
            .api_secret_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    pub fn discord_webhook(&self) -> Option<String> {
        self.notifications
            .discord_webhook_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

mod defaults {
    use super::{MarginAction, SizingMode};
    use std::path::PathBuf;

    pub fn max_symbols() -> usize {
        60
    }
    pub fn min_usd_volume_24h() -> f64 {
        5_000_000.0
    }
    pub fn min_price() -> f64 {
        0.001
    }
    pub fn candles_limit() -> usize {
        500
    }
    pub fn base_url() -> String {
        "https://api.bybit.com".to_string()
    }
    pub fn cache_dir() -> PathBuf {
        PathBuf::from("data/cache")
    }
    pub fn spike_zscore_threshold() -> f64 {
        8.0
    }
    pub fn spike_lookback() -> usize {
        100
    }
    pub fn max_candles_per_request() -> usize {
        1000
    }
    pub fn max_candles_total() -> usize {
        5000
    }
    pub fn api_throttle_sleep_ms() -> u64 {
        200
    }
    pub fn max_pagination_requests() -> usize {
        10
    }
    pub fn lookbacks() -> Vec<(usize, f64)> {
        vec![(24, 0.5), (72, 0.3), (168, 0.2)]
    }
    pub fn signal_power() -> f64 {
        1.2
    }
    pub fn vol_lookback() -> usize {
        72
    }
    pub fn k_min() -> usize {
        3
    }
    pub fn k_max() -> usize {
        8
    }
    pub fn market_neutral() -> bool {
        true
    }
    pub fn entry_zscore_min() -> f64 {
        0.5
    }
    pub fn min_breadth_fraction() -> f64 {
        0.1
    }
    pub fn enabled_true() -> bool {
        true
    }
    pub fn ema_len() -> usize {
        50
    }
    pub fn slope_min_bps_per_day() -> f64 {
        5.0
    }
    pub fn min_adx() -> f64 {
        20.0
    }
    pub fn min_win_rate() -> f64 {
        0.35
    }
    pub fn streak_pause_after_losses() -> u32 {
        3
    }
    pub fn streak_pause_minutes() -> i64 {
        240
    }
    pub fn post_exit_cooldown_minutes() -> i64 {
        15
    }
    pub fn post_stop_cooldown_minutes() -> i64 {
        60
    }
    pub fn symbol_stats_ema_smoothing() -> f64 {
        0.2
    }
    pub fn expansion_mult() -> f64 {
        1.5
    }
    pub fn atr_lookback() -> usize {
        20
    }
    pub fn target_ann_vol() -> f64 {
        0.25
    }
    pub fn min_scale() -> f64 {
        0.25
    }
    pub fn max_scale() -> f64 {
        1.5
    }
    pub fn kelly_fraction() -> f64 {
        0.25
    }
    pub fn lookback_hours() -> usize {
        168
    }
    pub fn max_allowed_corr() -> f64 {
        0.8
    }
    pub fn max_high_corr_positions() -> usize {
        2
    }
    pub fn high_vol_mult() -> f64 {
        2.0
    }
    pub fn max_scale_down() -> f64 {
        0.4
    }
    pub fn proxy_symbol() -> String {
        "BTCUSDT".to_string()
    }
    pub fn gross_leverage() -> f64 {
        1.0
    }
    pub fn max_weight_per_asset() -> f64 {
        0.25
    }
    pub fn notional_cap_usdt() -> f64 {
        50_000.0
    }
    pub fn max_open_positions_hard() -> usize {
        16
    }
    pub fn carry_budget_frac() -> f64 {
        0.0
    }
    pub fn max_daily_loss_pct() -> f64 {
        0.05
    }
    pub fn max_portfolio_drawdown_pct() -> f64 {
        0.20
    }
    pub fn portfolio_dd_window_days() -> i64 {
        30
    }
    pub fn atr_mult_sl() -> f64 {
        2.0
    }
    pub fn catastrophic_atr_mult() -> f64 {
        5.0
    }
    pub fn trailing_enabled() -> bool {
        true
    }
    pub fn trail_atr_mult() -> f64 {
        1.0
    }
    pub fn breakeven_after_r() -> f64 {
        1.0
    }
    pub fn profit_targets() -> Vec<(f64, f64)> {
        vec![(1.0, 0.33), (2.0, 0.33)]
    }
    pub fn max_hours_in_trade() -> i64 {
        168
    }
    pub fn min_hold_minutes() -> i64 {
        60
    }
    pub fn no_progress_enabled() -> bool {
        false
    }
    pub fn no_progress_r_threshold() -> f64 {
        0.1
    }
    pub fn sizing_mode() -> SizingMode {
        SizingMode::InverseVolatility
    }
    pub fn risk_per_trade_pct() -> f64 {
        0.01
    }
    pub fn cb_window_seconds() -> i64 {
        300
    }
    pub fn cb_max_errors() -> usize {
        5
    }
    pub fn cb_cooldown_seconds() -> i64 {
        600
    }
    pub fn margin_soft_limit_pct() -> f64 {
        0.5
    }
    pub fn margin_hard_limit_pct() -> f64 {
        0.8
    }
    pub fn margin_action() -> MarginAction {
        MarginAction::Pause
    }
    pub fn warn_dd_90d() -> f64 {
        0.25
    }
    pub fn warn_dd_180d() -> f64 {
        0.35
    }
    pub fn warn_dd_365d() -> f64 {
        0.45
    }
    pub fn stop_timeframe() -> String {
        "5m".to_string()
    }
    pub fn fast_check_seconds() -> u64 {
        2
    }
    pub fn max_spread_bps() -> f64 {
        15.0
    }
    pub fn base_bps() -> f64 {
        1.0
    }
    pub fn per_spread_coeff() -> f64 {
        0.3
    }
    pub fn max_offset_bps() -> f64 {
        10.0
    }
    pub fn min_obi() -> f64 {
        0.0
    }
    pub fn min_top_of_book_depth_usd() -> f64 {
        0.0
    }
    pub fn stale_order_max_age_sec() -> i64 {
        300
    }
    pub fn reprice_if_far_bps() -> f64 {
        20.0
    }
    pub fn rebalance_minute() -> u32 {
        1
    }
    pub fn poll_seconds() -> u64 {
        15
    }
    pub fn post_only() -> bool {
        true
    }
    pub fn min_notional_usdt() -> f64 {
        10.0
    }
    pub fn min_rebalance_delta_bps() -> f64 {
        25.0
    }
    pub fn adv_pct_cap() -> f64 {
        0.02
    }
    pub fn state_path() -> PathBuf {
        PathBuf::from("data/state.json")
    }
    pub fn logs_dir() -> PathBuf {
        PathBuf::from("logs")
    }
    pub fn config_versions_dir() -> PathBuf {
        PathBuf::from("config/optimized")
    }
    pub fn optimizer_db() -> PathBuf {
        PathBuf::from("data/optimizer_history.sqlite")
    }

    pub fn range_signal_power() -> (f64, f64) {
        (1.0, 1.5)
    }
    pub fn range_vol_lookback() -> (usize, usize) {
        (24, 168)
    }
    pub fn range_k_min() -> (usize, usize) {
        (1, 5)
    }
    pub fn range_k_max() -> (usize, usize) {
        (4, 12)
    }
    pub fn range_entry_zscore_min() -> (f64, f64) {
        (0.0, 1.5)
    }
    pub fn range_min_breadth_fraction() -> (f64, f64) {
        (0.0, 0.3)
    }
    pub fn range_gross_leverage() -> (f64, f64) {
        (0.75, 1.5)
    }
    pub fn range_max_weight_per_asset() -> (f64, f64) {
        (0.1, 0.4)
    }
    pub fn range_atr_mult_sl() -> (f64, f64) {
        (1.0, 4.0)
    }
    pub fn range_trail_atr_mult() -> (f64, f64) {
        (0.5, 3.0)
    }
    pub fn range_target_ann_vol() -> (f64, f64) {
        (0.15, 0.40)
    }
    pub fn w_sharpe() -> f64 {
        1.0
    }
    pub fn w_cagr() -> f64 {
        0.5
    }
    pub fn w_calmar() -> f64 {
        0.25
    }
    pub fn lambda_turnover() -> f64 {
        0.1
    }
    pub fn opt_symbols() -> Vec<String> {
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
    }
    pub fn opt_train_days() -> i64 {
        180
    }
    pub fn opt_oos_days() -> i64 {
        60
    }
    pub fn opt_embargo_days() -> i64 {
        3
    }
    pub fn opt_segments() -> usize {
        4
    }
    pub fn opt_trials_per_segment() -> usize {
        60
    }
    pub fn opt_random_trial_fraction() -> f64 {
        0.25
    }
    pub fn opt_top_k_oos() -> usize {
        5
    }
    pub fn opt_mc_iterations() -> usize {
        500
    }
    pub fn opt_mc_block_size() -> usize {
        10
    }
    pub fn opt_fee_bps_range() -> (f64, f64) {
        (2.0, 6.0)
    }
    pub fn opt_slippage_bps_range() -> (f64, f64) {
        (1.0, 5.0)
    }
    pub fn opt_funding_perturbation_pct() -> f64 {
        0.3
    }
    pub fn opt_tail_dd_limit() -> f64 {
        0.35
    }
    pub fn opt_max_dd_increase() -> f64 {
        0.10
    }
    pub fn opt_min_improve_sharpe() -> f64 {
        0.1
    }
    pub fn opt_min_improve_annualized() -> f64 {
        0.02
    }
    pub fn opt_bad_combo_decile() -> f64 {
        0.1
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let mut config = Config::default();
        config.validate().expect("default config must validate");
    }

    #[test]
    fn rejects_inverted_margin_limits() {
        let mut config = Config::default();
        config.risk.margin_soft_limit_pct = 0.9;
        config.risk.margin_hard_limit_pct = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_k_range() {
        let mut config = Config::default();
        config.signals.k_min = 5;
        config.signals.k_max = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml_override() {
        let raw = r#"
            [sizing]
            gross_leverage = 2.0
        "#;
        let config: Config = toml::from_str(raw).expect("minimal toml should parse with defaults");
        assert_eq!(config.sizing.gross_leverage, 2.0);
        assert_eq!(config.signals.k_min, 3);
    }
}
