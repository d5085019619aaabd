//! Window manager.
//!
//! Tracks the current epoch per symbol on the fixed 15-minute grid, locks
//! the strike at the first resolved price after open, resolves the direction
//! at close, and announces closes so position sweep and UI can react.
//!
//! The window manager is the only writer of `window_close_events`.

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::feeds::ReferencePriceResolver;
use crate::models::Direction;
use crate::store::{TradeStore, WindowEventRecord};

/// Seconds per window on the recurring grid.
pub const WINDOW_SECS: i64 = 900;

/// Cadence of the close check.
const CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub fn epoch_for(ts: i64) -> i64 {
    (ts / WINDOW_SECS) * WINDOW_SECS
}

/// Canonical window id, e.g. `btcusdt-15m-1700000100`.
pub fn window_id(symbol: &str, epoch: i64) -> String {
    format!("{}-15m-{}", symbol.to_ascii_lowercase(), epoch)
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowClosed {
    pub symbol: String,
    pub epoch: i64,
    pub window_id: String,
    pub strike: Option<f64>,
    pub final_price: Option<f64>,
    pub outcome: Option<Direction>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowSnapshot {
    pub epoch: i64,
    pub close_ts: i64,
    pub strike: Option<f64>,
}

#[derive(Debug, Clone)]
struct SymbolWindow {
    epoch: i64,
    strike: Option<f64>,
    strike_source: Option<&'static str>,
    /// Per-source opening prices captured at strike lock, for the
    /// oracle-vs-exchange agreement flag at close.
    oracle_open: Option<f64>,
    exchange_open: Option<f64>,
}

pub struct WindowManager {
    store: TradeStore,
    resolver: Arc<ReferencePriceResolver>,
    state: RwLock<HashMap<String, SymbolWindow>>,
    closed_tx: broadcast::Sender<WindowClosed>,
}

impl WindowManager {
    pub fn new(store: TradeStore, resolver: Arc<ReferencePriceResolver>) -> Self {
        let (closed_tx, _) = broadcast::channel(256);
        Self {
            store,
            resolver,
            state: RwLock::new(HashMap::new()),
            closed_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowClosed> {
        self.closed_tx.subscribe()
    }

    pub fn track_symbol(&self, symbol: &str, now: i64) {
        let mut state = self.state.write();
        state.entry(symbol.to_ascii_uppercase()).or_insert(SymbolWindow {
            epoch: epoch_for(now),
            strike: None,
            strike_source: None,
            oracle_open: None,
            exchange_open: None,
        });
    }

    pub fn current_window(&self, symbol: &str) -> Option<WindowSnapshot> {
        let state = self.state.read();
        let w = state.get(&symbol.to_ascii_uppercase())?;
        Some(WindowSnapshot {
            epoch: w.epoch,
            close_ts: w.epoch + WINDOW_SECS,
            strike: w.strike,
        })
    }

    /// Freeze the strike from the current reference price if the symbol's
    /// window does not have one yet. Called on every tick; the first tick
    /// after open wins and the value never changes afterwards.
    pub async fn maybe_freeze_strike(&self, symbol: &str, now: i64) -> Result<()> {
        let symbol = symbol.to_ascii_uppercase();
        let Some(resolved) = self.resolver.resolve(&symbol, now) else {
            return Ok(());
        };

        let oracle_open = self.resolver.fresh_oracle_price(&symbol, now);
        let exchange_open = self.resolver.fresh_exchange_median(&symbol, now);

        let (epoch, source) = {
            let mut state = self.state.write();
            let Some(w) = state.get_mut(&symbol) else {
                return Ok(());
            };
            if w.strike.is_some() {
                return Ok(());
            }
            w.strike = Some(resolved.price);
            w.strike_source = Some(resolved.source.as_str());
            w.oracle_open = oracle_open;
            w.exchange_open = exchange_open;
            (w.epoch, resolved.source.as_str())
        };

        info!(
            symbol = %symbol,
            epoch,
            strike = resolved.price,
            source,
            "strike locked"
        );

        self.store
            .upsert_window_event(&WindowEventRecord {
                symbol: symbol.clone(),
                epoch,
                open_ts: epoch,
                close_ts: epoch + WINDOW_SECS,
                strike: Some(resolved.price),
                strike_source: Some(source.to_string()),
                final_price: None,
                resolved: None,
                onchain_resolved: None,
                oracle_agreement: None,
                recorded_at: now,
            })
            .await?;
        Ok(())
    }

    /// Roll any symbol whose held epoch has passed: resolve the outcome,
    /// persist the close, announce it, and start the next window with a null
    /// strike.
    pub async fn close_expired_windows(&self, now: i64) -> Result<Vec<WindowClosed>> {
        let current_epoch = epoch_for(now);

        let expired: Vec<(String, SymbolWindow)> = {
            let state = self.state.read();
            state
                .iter()
                .filter(|(_, w)| w.epoch != current_epoch)
                .map(|(s, w)| (s.clone(), w.clone()))
                .collect()
        };

        let mut closed = Vec::with_capacity(expired.len());
        for (symbol, w) in expired {
            let final_price = self.resolver.resolve(&symbol, now).map(|r| r.price);
            let outcome = match (w.strike, final_price) {
                (Some(strike), Some(fin)) => Some(if fin >= strike {
                    Direction::Up
                } else {
                    Direction::Down
                }),
                _ => {
                    warn!(
                        symbol = %symbol,
                        epoch = w.epoch,
                        has_strike = w.strike.is_some(),
                        "window closed without full price data"
                    );
                    None
                }
            };

            // did the settlement oracle and the exchange consensus call the
            // same direction over this window?
            let oracle_close = self.resolver.fresh_oracle_price(&symbol, now);
            let exchange_close = self.resolver.fresh_exchange_median(&symbol, now);
            let oracle_agreement = match (w.oracle_open, oracle_close, w.exchange_open, exchange_close)
            {
                (Some(oo), Some(oc), Some(eo), Some(ec)) => Some((oc >= oo) == (ec >= eo)),
                _ => None,
            };
            if oracle_agreement == Some(false) {
                warn!(
                    symbol = %symbol,
                    epoch = w.epoch,
                    oracle_open = ?w.oracle_open,
                    oracle_close = ?oracle_close,
                    exchange_open = ?w.exchange_open,
                    exchange_close = ?exchange_close,
                    "oracle and exchange disagree on window outcome"
                );
            }

            let event = WindowClosed {
                symbol: symbol.clone(),
                epoch: w.epoch,
                window_id: window_id(&symbol, w.epoch),
                strike: w.strike,
                final_price,
                outcome,
            };

            self.store
                .upsert_window_event(&WindowEventRecord {
                    symbol: symbol.clone(),
                    epoch: w.epoch,
                    open_ts: w.epoch,
                    close_ts: w.epoch + WINDOW_SECS,
                    strike: w.strike,
                    strike_source: w.strike_source.map(|s| s.to_string()),
                    final_price,
                    resolved: outcome,
                    onchain_resolved: None,
                    oracle_agreement,
                    recorded_at: now,
                })
                .await?;

            info!(
                symbol = %symbol,
                epoch = w.epoch,
                outcome = ?outcome,
                strike = ?w.strike,
                final_price = ?final_price,
                oracle_agreement = ?oracle_agreement,
                "window closed"
            );

            {
                let mut state = self.state.write();
                if let Some(entry) = state.get_mut(&symbol) {
                    entry.epoch = current_epoch;
                    entry.strike = None;
                    entry.strike_source = None;
                    entry.oracle_open = None;
                    entry.exchange_open = None;
                }
            }

            let _ = self.closed_tx.send(event.clone());
            closed.push(event);
        }

        Ok(closed)
    }

    /// Record an on-chain resolution observed after the fact.
    pub async fn record_onchain_resolution(
        &self,
        symbol: &str,
        epoch: i64,
        direction: Direction,
    ) -> Result<()> {
        let symbol = symbol.to_ascii_uppercase();
        let Some(mut rec) = self.store.get_window_event(&symbol, epoch).await? else {
            warn!(symbol = %symbol, epoch, "on-chain resolution for unknown window");
            return Ok(());
        };
        if rec.resolved.is_some() && rec.resolved != Some(direction) {
            warn!(
                symbol = %symbol,
                epoch,
                local = ?rec.resolved,
                onchain = ?direction,
                "on-chain resolution disagrees with local outcome"
            );
        }
        rec.onchain_resolved = Some(direction);
        rec.recorded_at = Utc::now().timestamp();
        self.store.upsert_window_event(&rec).await
    }

    /// 10-second lifecycle loop: freeze missing strikes, close expired
    /// windows.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(CHECK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("window manager running ({}s windows)", WINDOW_SECS);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = Utc::now().timestamp();
                    let symbols: Vec<String> = {
                        let state = self.state.read();
                        state.keys().cloned().collect()
                    };
                    if let Err(e) = self.close_expired_windows(now).await {
                        warn!(error = %e, "window close sweep failed");
                    }
                    for symbol in symbols {
                        if let Err(e) = self.maybe_freeze_strike(&symbol, now).await {
                            warn!(symbol = %symbol, error = %e, "strike freeze failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("window manager shutting down");
                        return;
                    }
                }
            }
        }
    }
}
