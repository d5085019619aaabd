//! Feed aggregator.
//!
//! Owns one connection task per external price source, normalizes everything
//! into `SourceUpdate`s on a shared bounded channel, and fans the stream out
//! to the resolver and any broadcast subscribers.
//!
//! Backpressure is lossy: drivers `try_send` and count drops, so a slow
//! consumer sheds the oldest data instead of stalling ingestion.

use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use super::reference::ReferencePriceResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    PrimaryOracle,
    SecondaryOracle,
    Exchange,
}

/// Normalized price observation from any source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceUpdate {
    pub source: &'static str,
    pub kind: SourceKind,
    pub symbol: String,
    pub price: f64,
    pub ts: i64,
}

/// Liveness bookkeeping per source. A source that goes silent past the kill
/// threshold is flagged degraded until it speaks again.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source: &'static str,
    pub last_update_ts: i64,
    pub update_count: u64,
    pub degraded: bool,
}

#[derive(Debug)]
struct HealthState {
    last_update_ts: i64,
    update_count: u64,
    degraded: bool,
}

pub struct FeedAggregator {
    rx: mpsc::Receiver<SourceUpdate>,
    resolver: Arc<ReferencePriceResolver>,
    fanout: broadcast::Sender<SourceUpdate>,
    health: Arc<RwLock<HashMap<&'static str, HealthState>>>,
    /// Seconds of silence before a source is considered degraded.
    silence_threshold_secs: i64,
}

impl FeedAggregator {
    /// Channel capacity is deliberately small; drivers drop rather than
    /// queue stale prices.
    pub const CHANNEL_CAPACITY: usize = 512;

    pub fn new(
        resolver: Arc<ReferencePriceResolver>,
        silence_threshold_secs: i64,
    ) -> (Self, mpsc::Sender<SourceUpdate>) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        let (fanout, _) = broadcast::channel(1024);
        (
            Self {
                rx,
                resolver,
                fanout,
                health: Arc::new(RwLock::new(HashMap::new())),
                silence_threshold_secs,
            },
            tx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceUpdate> {
        self.fanout.subscribe()
    }

    pub fn health_handle(&self) -> FeedHealthHandle {
        FeedHealthHandle {
            health: self.health.clone(),
            silence_threshold_secs: self.silence_threshold_secs,
        }
    }

    /// Drain the source channel until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("feed aggregator running");
        loop {
            tokio::select! {
                update = self.rx.recv() => {
                    let Some(update) = update else {
                        warn!("all feed drivers dropped their senders; aggregator exiting");
                        return;
                    };
                    self.on_update(update);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("feed aggregator shutting down");
                        return;
                    }
                }
            }
        }
    }

    fn on_update(&self, update: SourceUpdate) {
        {
            let mut health = self.health.write();
            let entry = health.entry(update.source).or_insert(HealthState {
                last_update_ts: update.ts,
                update_count: 0,
                degraded: false,
            });
            if entry.degraded {
                info!(source = update.source, "feed source recovered");
            }
            entry.last_update_ts = update.ts;
            entry.update_count += 1;
            entry.degraded = false;
        }

        metrics::increment_counter!("feed_updates", "source" => update.source);
        self.resolver.record(&update);

        // lagging broadcast receivers shed on their own; nothing to do here
        let _ = self.fanout.send(update);
    }
}

/// Read-side view of feed health, shared with the API layer and the
/// periodic staleness sweep.
#[derive(Clone)]
pub struct FeedHealthHandle {
    health: Arc<RwLock<HashMap<&'static str, HealthState>>>,
    silence_threshold_secs: i64,
}

impl FeedHealthHandle {
    /// Flag sources that have gone silent. Returns the sources newly marked
    /// degraded, for logging by the caller.
    pub fn sweep(&self, now: i64) -> Vec<&'static str> {
        let mut newly_degraded = Vec::new();
        let mut health = self.health.write();
        for (source, st) in health.iter_mut() {
            if !st.degraded && now - st.last_update_ts > self.silence_threshold_secs {
                st.degraded = true;
                newly_degraded.push(*source);
            }
        }
        newly_degraded
    }

    pub fn snapshot(&self) -> Vec<SourceHealth> {
        self.health
            .read()
            .iter()
            .map(|(source, st)| SourceHealth {
                source,
                last_update_ts: st.last_update_ts,
                update_count: st.update_count,
                degraded: st.degraded,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::reference::{FreshnessConfig, ReferencePriceResolver};

    fn update(source: &'static str, symbol: &str, price: f64, ts: i64) -> SourceUpdate {
        SourceUpdate {
            source,
            kind: SourceKind::Exchange,
            symbol: symbol.to_string(),
            price,
            ts,
        }
    }

    #[tokio::test]
    async fn updates_flow_to_resolver_and_fanout() {
        let resolver = Arc::new(ReferencePriceResolver::new(FreshnessConfig::default()));
        let (agg, tx) = FeedAggregator::new(resolver.clone(), 30);
        let mut fan_rx = agg.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(agg.run(shutdown_rx));

        let now = chrono::Utc::now().timestamp();
        tx.send(update("binance", "BTCUSDT", 50_000.0, now))
            .await
            .unwrap();
        tx.send(update("kraken", "BTCUSDT", 50_100.0, now))
            .await
            .unwrap();

        let seen = fan_rx.recv().await.unwrap();
        assert_eq!(seen.symbol, "BTCUSDT");
        let _ = fan_rx.recv().await.unwrap();
        // two fresh exchange feeds resolve to their median
        let resolved = resolver.resolve("BTCUSDT", now).unwrap();
        assert!((resolved.price - 50_050.0).abs() < 1e-9);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn silence_sweep_flags_degraded_sources() {
        let resolver = Arc::new(ReferencePriceResolver::new(FreshnessConfig::default()));
        let (agg, tx) = FeedAggregator::new(resolver, 10);
        let health = agg.health_handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(agg.run(shutdown_rx));

        let t0 = 1_000_000;
        tx.send(update("binance", "BTCUSDT", 50_000.0, t0))
            .await
            .unwrap();
        // wait for the aggregator to drain
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(health.sweep(t0 + 5).is_empty());
        let flagged = health.sweep(t0 + 11);
        assert_eq!(flagged, vec!["binance"]);
        // already degraded: not re-flagged
        assert!(health.sweep(t0 + 12).is_empty());

        let snap = health.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap[0].degraded);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
