//! Exchange ticker WebSocket driver.
//!
//! One connection per exchange source, subscribed to the per-symbol ticker
//! streams. Messages are `{s, c}` (symbol, last price), optionally wrapped in
//! a combined-stream envelope. Reconnects with backoff forever; the feed
//! aggregator decides when a silent source counts as degraded.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::aggregator::{SourceKind, SourceUpdate};

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TickerMsg {
    s: String,
    c: String,
}

#[derive(Debug, Deserialize)]
struct CombinedStreamMsg {
    data: TickerMsg,
}

fn parse_ticker(text: &str) -> Option<TickerMsg> {
    if let Ok(wrapped) = serde_json::from_str::<CombinedStreamMsg>(text) {
        return Some(wrapped.data);
    }
    serde_json::from_str::<TickerMsg>(text).ok()
}

/// Run one exchange ticker connection until shutdown. Emits normalized
/// updates into the aggregator's channel; when the channel is full the
/// update is dropped and counted, never queued behind stale data.
pub async fn run_exchange_ticker(
    source: &'static str,
    ws_url: String,
    symbols: Vec<String>,
    tx: mpsc::Sender<SourceUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = RECONNECT_BASE_DELAY;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect_and_stream(source, &ws_url, &symbols, &tx, &mut shutdown).await {
            Ok(()) => return, // clean shutdown
            Err(e) => {
                warn!(source, error = %e, "ticker stream dropped; reconnecting");
                metrics::increment_counter!("feed_reconnects", "source" => source);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

async fn connect_and_stream(
    source: &'static str,
    ws_url: &str,
    symbols: &[String],
    tx: &mpsc::Sender<SourceUpdate>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (ws, _) = connect_async(ws_url).await.context("ws connect")?;
    let (mut sink, mut stream) = ws.split();

    // per-symbol miniTicker subscription
    let params: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@miniTicker", s.to_ascii_lowercase()))
        .collect();
    let sub = serde_json::json!({
        "method": "SUBSCRIBE",
        "params": params,
        "id": 1,
    });
    sink.send(Message::Text(sub.to_string()))
        .await
        .context("ws subscribe")?;

    info!(source, symbols = symbols.len(), "ticker stream connected");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    anyhow::bail!("stream ended");
                };
                match msg.context("ws read")? {
                    Message::Text(text) => {
                        let Some(ticker) = parse_ticker(&text) else {
                            debug!(source, "unparseable ticker message");
                            continue;
                        };
                        let Ok(price) = ticker.c.parse::<f64>() else {
                            continue;
                        };
                        if !(price.is_finite() && price > 0.0) {
                            continue;
                        }
                        let update = SourceUpdate {
                            source,
                            kind: SourceKind::Exchange,
                            symbol: ticker.s.to_ascii_uppercase(),
                            price,
                            ts: chrono::Utc::now().timestamp(),
                        };
                        if tx.try_send(update).is_err() {
                            // newest-preferred: the consumer is behind, count and move on
                            metrics::increment_counter!("feed_ticks_dropped", "source" => source);
                        }
                    }
                    Message::Ping(data) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => anyhow::bail!("server closed connection"),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_ticker() {
        let msg = parse_ticker(r#"{"s":"BTCUSDT","c":"50123.45"}"#).unwrap();
        assert_eq!(msg.s, "BTCUSDT");
        assert_eq!(msg.c, "50123.45");
    }

    #[test]
    fn parses_combined_stream_envelope() {
        let msg = parse_ticker(
            r#"{"stream":"btcusdt@miniTicker","data":{"s":"BTCUSDT","c":"50123.45","o":"49000"}}"#,
        )
        .unwrap();
        assert_eq!(msg.s, "BTCUSDT");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_ticker("not json").is_none());
        assert!(parse_ticker(r#"{"x":1}"#).is_none());
    }
}
