use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Time-in-force / order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Gtc,
    Fok,
    Ioc,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Gtc => "GTC",
            OrderType::Fok => "FOK",
            OrderType::Ioc => "IOC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GTC" => Some(OrderType::Gtc),
            "FOK" => Some(OrderType::Fok),
            "IOC" => Some(OrderType::Ioc),
            _ => None,
        }
    }

    /// FOK/IOC either fill immediately or die; they never rest on the book.
    pub fn is_immediate(&self) -> bool {
        matches!(self, OrderType::Fok | OrderType::Ioc)
    }
}

/// Execution style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeMode {
    Live,
    Paper,
    DryRun,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeMode::Live => "LIVE",
            TradeMode::Paper => "PAPER",
            TradeMode::DryRun => "DRY_RUN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LIVE" => Some(TradeMode::Live),
            "PAPER" => Some(TradeMode::Paper),
            "DRY_RUN" | "DRYRUN" => Some(TradeMode::DryRun),
            _ => None,
        }
    }
}

/// Window resolution direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
        }
    }
}

/// Context a strategy attaches to a signal, persisted with the order for
/// forensics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalContext {
    pub symbol: Option<String>,
    pub strategy_id: Option<String>,
    /// Model probability of the bought outcome at decision time.
    pub model_prob: Option<f64>,
    /// Edge vs the book ask at decision time.
    pub edge: Option<f64>,
    /// "UP" or "DOWN" token the order trades.
    pub token_side: Option<String>,
}

/// A trade signal emitted by a strategy. `size` is dollars for buys, shares
/// for sells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub token_id: String,
    pub side: Side,
    pub size: f64,
    /// Limit price in [0.01, 0.99]; None means market (priced off the book).
    pub limit_price: Option<f64>,
    pub order_type: OrderType,
    pub window_id: String,
    pub market_id: String,
    #[serde(default)]
    pub context: SignalContext,
}

/// Best-of-book quote for one outcome token.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BestPrices {
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub mid: f64,
}

impl BestPrices {
    pub fn from_bid_ask(bid: f64, ask: f64) -> Self {
        Self {
            bid,
            ask,
            spread: (ask - bid).max(0.0),
            mid: (ask + bid) * 0.5,
        }
    }
}

/// Book snapshot captured at decision time, stored alongside the order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub ts: i64,
    pub up: BestPrices,
    pub down: BestPrices,
    pub up_bid_size: f64,
    pub up_ask_size: f64,
    pub down_bid_size: f64,
    pub down_ask_size: f64,
}

/// Normalized tick on the shared feed channel.
///
/// One per (source message, symbol); strategies see these in arrival order
/// within a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub ts: i64,
    pub symbol: String,
    /// Oracle-aligned spot from the Reference-Price Resolver.
    pub spot: f64,
    pub book: BookSnapshot,
    /// Implied probability of UP from the book mid, if a book is present.
    pub implied_up: Option<f64>,
    /// Seconds until the current window closes.
    pub secs_remaining: i64,
}

/// Uniform result of `OrderManager::execute` across all modes. Downstream
/// code branches only on `mode`, never on shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub order_id: String,
    pub status: String,
    pub fill_price: f64,
    pub filled_size: f64,
    pub fee_amount: f64,
    pub latency_ms: u64,
    pub intent_id: i64,
    pub mode: TradeMode,
    /// Some(true) = acked, Some(false) = never reached the exchange,
    /// None = ambiguous (confirmation polling took over).
    pub order_submitted_to_exchange: Option<bool>,
    pub db_write_failed: bool,
    pub submitted_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_book_snapshot: Option<BookSnapshot>,
}

/// Kill-switch escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSwitch {
    Off,
    /// No new orders.
    Pause,
    /// Cancel all open orders and close positions.
    Flatten,
    /// Hard stop.
    Emergency,
}

impl KillSwitch {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillSwitch::Off => "off",
            KillSwitch::Pause => "pause",
            KillSwitch::Flatten => "flatten",
            KillSwitch::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Some(KillSwitch::Off),
            "pause" => Some(KillSwitch::Pause),
            "flatten" => Some(KillSwitch::Flatten),
            "emergency" => Some(KillSwitch::Emergency),
            _ => None,
        }
    }

    pub fn blocks_new_orders(&self) -> bool {
        *self >= KillSwitch::Pause
    }
}

/// Events broadcast to dashboard WebSocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsServerEvent {
    Init {
        ts: i64,
        data: serde_json::Value,
    },
    State {
        ts: i64,
        data: serde_json::Value,
    },
    Event {
        event: WsEventKind,
        ts: i64,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WsEventKind {
    Signal,
    Order,
    Fill,
    Assertion,
    Window,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_switch_ordering() {
        assert!(KillSwitch::Off < KillSwitch::Pause);
        assert!(KillSwitch::Pause < KillSwitch::Flatten);
        assert!(KillSwitch::Flatten < KillSwitch::Emergency);
        assert!(!KillSwitch::Off.blocks_new_orders());
        assert!(KillSwitch::Pause.blocks_new_orders());
        assert!(KillSwitch::Emergency.blocks_new_orders());
    }

    #[test]
    fn order_type_immediacy() {
        assert!(OrderType::Fok.is_immediate());
        assert!(OrderType::Ioc.is_immediate());
        assert!(!OrderType::Gtc.is_immediate());
    }

    #[test]
    fn best_prices_mid_and_spread() {
        let bp = BestPrices::from_bid_ask(0.48, 0.52);
        assert!((bp.mid - 0.50).abs() < 1e-12);
        assert!((bp.spread - 0.04).abs() < 1e-12);
    }
}
