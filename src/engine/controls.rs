//! Runtime-mutable operator controls.
//!
//! The control panel is the single switchboard the dashboard talks to:
//! kill-switch escalation, trading mode, strategy/instrument allowlists and
//! risk ceilings. Reads are cheap snapshots; writes go through `apply` which
//! validates key/value pairs and notifies watchers.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::models::{KillSwitch, TradeMode};

#[derive(Debug, Clone, Serialize)]
pub struct Controls {
    pub kill_switch: KillSwitch,
    pub trading_mode: TradeMode,
    pub active_strategy: Option<String>,
    pub max_position_usd: f64,
    pub max_session_loss: f64,
    /// Comma list of symbols, or `*`.
    pub allowed_instruments: String,
    /// Comma list of strategy ids, or `*`.
    pub allowed_strategies: String,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            kill_switch: KillSwitch::Off,
            trading_mode: TradeMode::Paper,
            active_strategy: None,
            max_position_usd: 5.0,
            max_session_loss: 25.0,
            allowed_instruments: "*".to_string(),
            allowed_strategies: "*".to_string(),
        }
    }
}

impl Controls {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Some(mode) = std::env::var("TRADING_MODE")
            .ok()
            .and_then(|v| TradeMode::parse(&v))
        {
            c.trading_mode = mode;
        }
        if let Ok(v) = std::env::var("MAX_POSITION_USD") {
            if let Ok(val) = v.parse::<f64>() {
                if val > 0.0 {
                    c.max_position_usd = val;
                }
            }
        }
        if let Ok(v) = std::env::var("MAX_SESSION_LOSS") {
            if let Ok(val) = v.parse::<f64>() {
                if val > 0.0 {
                    c.max_session_loss = val;
                }
            }
        }
        if let Ok(v) = std::env::var("ALLOWED_INSTRUMENTS") {
            if !v.trim().is_empty() {
                c.allowed_instruments = v;
            }
        }
        if let Ok(v) = std::env::var("ALLOWED_STRATEGIES") {
            if !v.trim().is_empty() {
                c.allowed_strategies = v;
            }
        }
        c
    }

    fn list_allows(list: &str, candidate: &str) -> bool {
        let list = list.trim();
        if list == "*" {
            return true;
        }
        list.split(',')
            .any(|item| item.trim().eq_ignore_ascii_case(candidate))
    }

    pub fn instrument_allowed(&self, symbol: &str) -> bool {
        Self::list_allows(&self.allowed_instruments, symbol)
    }

    pub fn strategy_allowed(&self, strategy_id: &str) -> bool {
        if !Self::list_allows(&self.allowed_strategies, strategy_id) {
            return false;
        }
        match &self.active_strategy {
            Some(active) => active.eq_ignore_ascii_case(strategy_id),
            None => true,
        }
    }
}

pub struct ControlPanel {
    inner: RwLock<Controls>,
    notify: watch::Sender<Controls>,
}

impl ControlPanel {
    pub fn new(initial: Controls) -> Self {
        let (notify, _) = watch::channel(initial.clone());
        Self {
            inner: RwLock::new(initial),
            notify,
        }
    }

    pub fn snapshot(&self) -> Controls {
        self.inner.read().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Controls> {
        self.notify.subscribe()
    }

    /// Escalate the kill switch from inside the engine (Fatal errors,
    /// session-loss breach). Never de-escalates.
    pub fn escalate(&self, to: KillSwitch, reason: &str) {
        let mut inner = self.inner.write();
        if inner.kill_switch >= to {
            return;
        }
        warn!(from = inner.kill_switch.as_str(), to = to.as_str(), reason, "kill switch escalated");
        inner.kill_switch = to;
        let _ = self.notify.send(inner.clone());
    }

    /// Apply one operator key/value update. Switching to LIVE requires the
    /// explicit confirmation value `LIVE_CONFIRMED`.
    pub fn apply(&self, key: &str, value: &str) -> Result<Controls, String> {
        let mut inner = self.inner.write();
        match key {
            "kill_switch" => {
                let next = KillSwitch::parse(value)
                    .ok_or_else(|| format!("invalid kill_switch value: {value}"))?;
                inner.kill_switch = next;
            }
            "trading_mode" => {
                if value.eq_ignore_ascii_case("LIVE") {
                    return Err(
                        "switching to LIVE requires the value LIVE_CONFIRMED".to_string()
                    );
                }
                if value == "LIVE_CONFIRMED" {
                    inner.trading_mode = TradeMode::Live;
                } else {
                    inner.trading_mode = TradeMode::parse(value)
                        .ok_or_else(|| format!("invalid trading_mode value: {value}"))?;
                }
            }
            "active_strategy" => {
                inner.active_strategy = if value.trim().is_empty() || value == "*" {
                    None
                } else {
                    Some(value.trim().to_string())
                };
            }
            "max_position_usd" => {
                let v: f64 = value
                    .parse()
                    .map_err(|_| format!("invalid max_position_usd: {value}"))?;
                if !(v > 0.0) {
                    return Err("max_position_usd must be positive".to_string());
                }
                inner.max_position_usd = v;
            }
            "max_session_loss" => {
                let v: f64 = value
                    .parse()
                    .map_err(|_| format!("invalid max_session_loss: {value}"))?;
                if !(v > 0.0) {
                    return Err("max_session_loss must be positive".to_string());
                }
                inner.max_session_loss = v;
            }
            "allowed_instruments" => {
                inner.allowed_instruments = value.trim().to_string();
            }
            "allowed_strategies" => {
                inner.allowed_strategies = value.trim().to_string();
            }
            other => return Err(format!("unknown control key: {other}")),
        }

        info!(key, value, "control updated");
        let snapshot = inner.clone();
        let _ = self.notify.send(snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlists() {
        let mut c = Controls::default();
        assert!(c.instrument_allowed("BTCUSDT"));
        c.allowed_instruments = "BTCUSDT, ETHUSDT".to_string();
        assert!(c.instrument_allowed("btcusdt"));
        assert!(!c.instrument_allowed("SOLUSDT"));

        c.allowed_strategies = "drift".to_string();
        assert!(c.strategy_allowed("drift"));
        assert!(!c.strategy_allowed("momo"));

        c.active_strategy = Some("drift".to_string());
        assert!(c.strategy_allowed("drift"));
        c.active_strategy = Some("other".to_string());
        assert!(!c.strategy_allowed("drift"));
    }

    #[test]
    fn live_requires_confirmation() {
        let panel = ControlPanel::new(Controls::default());
        assert!(panel.apply("trading_mode", "LIVE").is_err());
        assert!(panel.apply("trading_mode", "live").is_err());
        let c = panel.apply("trading_mode", "LIVE_CONFIRMED").unwrap();
        assert_eq!(c.trading_mode, TradeMode::Live);
        let c = panel.apply("trading_mode", "PAPER").unwrap();
        assert_eq!(c.trading_mode, TradeMode::Paper);
    }

    #[test]
    fn escalation_never_deescalates() {
        let panel = ControlPanel::new(Controls::default());
        panel.escalate(KillSwitch::Flatten, "test");
        assert_eq!(panel.snapshot().kill_switch, KillSwitch::Flatten);
        panel.escalate(KillSwitch::Pause, "test");
        assert_eq!(panel.snapshot().kill_switch, KillSwitch::Flatten);
        // operator can still reset explicitly
        panel.apply("kill_switch", "off").unwrap();
        assert_eq!(panel.snapshot().kill_switch, KillSwitch::Off);
    }

    #[test]
    fn watch_sees_updates() {
        let panel = ControlPanel::new(Controls::default());
        let rx = panel.watch();
        panel.apply("max_position_usd", "3.5").unwrap();
        assert!((rx.borrow().max_position_usd - 3.5).abs() < 1e-12);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        let panel = ControlPanel::new(Controls::default());
        assert!(panel.apply("no_such_key", "1").is_err());
        assert!(panel.apply("max_position_usd", "-2").is_err());
        assert!(panel.apply("kill_switch", "sideways").is_err());
    }
}
