//! quarterbot - automated trading engine for 15-minute binary up/down
//! markets.
//!
//! Exposes the full module tree for the binary and integration tests.

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod feeds;
pub mod models;
pub mod store;
pub mod window;

pub use errors::ExecError;
pub use models::{ExecutionResult, TradeMode, TradeSignal};
