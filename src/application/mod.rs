pub mod exit_monitor;
pub mod optimizer;
pub mod risk_controller;
pub mod signal_engine;
pub mod sizing_engine;
pub mod state;
pub mod trading_engine;
