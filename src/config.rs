//! Process configuration.
//!
//! Everything is env-driven with safe defaults; booleans accept
//! 1/true/TRUE/on/ON. Relative data paths are anchored to the crate
//! directory so running from elsewhere never creates a stray database.

use std::path::PathBuf;
use std::time::Duration;

pub fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub listen_addr: String,
    /// Combined-stream endpoint for the exchange ticker driver.
    pub exchange_ws_url: String,
    pub exchange_rate_limit: u32,
    pub exchange_rate_refill_per_sec: f64,
    /// Starting cash for the session paper ledger.
    pub paper_cash_usd: f64,
    pub tick_retention_days: i64,
    /// How long shutdown waits for in-flight intents.
    pub shutdown_grace: Duration,
    /// Seconds of silence before a feed source is flagged degraded.
    pub feed_silence_secs: i64,
}

impl Config {
    pub fn from_env() -> Self {
        let db_path = resolve_data_path(
            std::env::var("DB_PATH")
                .or_else(|_| std::env::var("DATABASE_PATH"))
                .ok(),
            "quarterbot.db",
        );
        let listen_addr =
            std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let exchange_ws_url = std::env::var("EXCHANGE_WS_URL")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443/stream".to_string());

        let exchange_rate_limit = std::env::var("EXCHANGE_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &u32| v > 0)
            .unwrap_or(10);
        let exchange_rate_refill_per_sec = std::env::var("EXCHANGE_RATE_REFILL_PER_SEC")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &f64| v > 0.0)
            .unwrap_or(5.0);

        let paper_cash_usd = std::env::var("PAPER_CASH_USD")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &f64| v > 0.0)
            .unwrap_or(100.0);

        let tick_retention_days = std::env::var("TICK_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &i64| v > 0)
            .unwrap_or(14);

        let shutdown_grace = std::env::var("SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        let feed_silence_secs = std::env::var("FEED_SILENCE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &i64| v > 0)
            .unwrap_or(30);

        Self {
            db_path,
            listen_addr,
            exchange_ws_url,
            exchange_rate_limit,
            exchange_rate_refill_per_sec,
            paper_cash_usd,
            tick_retention_days,
            shutdown_grace,
            feed_silence_secs,
        }
    }
}
