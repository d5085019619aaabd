//! Durable state: orders, positions, window events, ticks, and the
//! write-ahead intent log. Persisted rows are the source of truth; in-memory
//! views are caches.

pub mod db;
pub mod wal;

pub use db::{
    OrderRecord, OrderUpdate, PaperTradeRecord, PositionLifecycle, PositionRecord, TradeStore,
    WindowEventRecord,
};
pub use wal::{IntentKind, IntentLog, IntentRecord, IntentState};
