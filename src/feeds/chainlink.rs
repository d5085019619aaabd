//! Primary on-chain oracle feed.
//!
//! Polls a Chainlink-style aggregator over JSON-RPC `eth_call`, decoding
//! `latestRoundData()` -> (roundId, answer, startedAt, updatedAt,
//! answeredInRound). The oracle is the settlement source for window strikes,
//! so its price outranks every exchange feed while fresh.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::aggregator::{SourceKind, SourceUpdate};

/// `latestRoundData()` selector.
const LATEST_ROUND_DATA: &str = "0xfeaf968c";

/// USD aggregators report 8 decimals.
const ANSWER_DECIMALS: f64 = 1e8;

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct OracleRound {
    pub round_id: u128,
    pub price: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct ChainlinkConfig {
    pub rpc_url: String,
    /// symbol -> aggregator contract address
    pub feeds: HashMap<String, String>,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
}

impl ChainlinkConfig {
    pub fn from_env() -> Option<Self> {
        let rpc_url = std::env::var("ORACLE_RPC_URL").ok().filter(|v| !v.is_empty())?;

        // ORACLE_FEEDS="BTCUSDT=0xc907...,ETHUSDT=0xF968..."
        let feeds: HashMap<String, String> = std::env::var("ORACLE_FEEDS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let (sym, addr) = pair.split_once('=')?;
                let (sym, addr) = (sym.trim(), addr.trim());
                if sym.is_empty() || addr.is_empty() {
                    return None;
                }
                Some((sym.to_ascii_uppercase(), addr.to_string()))
            })
            .collect();
        if feeds.is_empty() {
            return None;
        }

        Some(Self {
            rpc_url,
            feeds,
            poll_interval: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(10),
        })
    }
}

pub struct ChainlinkFeed {
    client: Client,
    config: ChainlinkConfig,
}

impl ChainlinkFeed {
    pub fn new(config: ChainlinkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.rpc_timeout)
            .build()
            .context("build oracle HTTP client")?;
        Ok(Self { client, config })
    }

    pub async fn fetch_round(&self, feed_address: &str) -> Result<OracleRound> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{ "to": feed_address, "data": LATEST_ROUND_DATA }, "latest"],
            "id": 1
        });

        let response: JsonRpcResponse = self
            .client
            .post(&self.config.rpc_url)
            .json(&payload)
            .send()
            .await
            .context("RPC request failed")?
            .json()
            .await
            .context("parse RPC response")?;

        if let Some(err) = response.error {
            anyhow::bail!("RPC error: {err:?}");
        }
        let result = response.result.context("no result in RPC response")?;
        decode_round(&result)
    }

    /// Poll all configured feeds until shutdown, pushing fresh rounds into
    /// the aggregator channel.
    pub async fn run(
        self,
        tx: mpsc::Sender<SourceUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_round: HashMap<String, u128> = HashMap::new();

        loop {
            for (symbol, address) in &self.config.feeds {
                match self.fetch_round(address).await {
                    Ok(round) => {
                        // only emit when the round advances
                        if last_round.get(symbol) == Some(&round.round_id) {
                            continue;
                        }
                        last_round.insert(symbol.clone(), round.round_id);
                        debug!(
                            symbol,
                            price = round.price,
                            round_id = round.round_id,
                            "oracle round"
                        );
                        let update = SourceUpdate {
                            source: "oracle_primary",
                            kind: SourceKind::PrimaryOracle,
                            symbol: symbol.clone(),
                            price: round.price,
                            ts: round.updated_at,
                        };
                        if tx.try_send(update).is_err() {
                            metrics::increment_counter!("feed_ticks_dropped", "source" => "oracle_primary");
                        }
                    }
                    Err(e) => {
                        warn!(symbol, error = %e, "oracle fetch failed");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Decode the 5-word `latestRoundData` return blob.
fn decode_round(result: &str) -> Result<OracleRound> {
    let bytes = hex::decode(result.trim_start_matches("0x")).context("decode hex response")?;
    if bytes.len() < 160 {
        anyhow::bail!("response too short: {} bytes", bytes.len());
    }

    let round_id = u128::from_be_bytes(bytes[16..32].try_into().unwrap_or([0; 16]));
    let answer = i128::from_be_bytes(bytes[48..64].try_into().unwrap_or([0; 16]));
    let updated_at = i64::from_be_bytes(bytes[112..120].try_into().unwrap_or([0; 8]));

    let price = (answer as f64) / ANSWER_DECIMALS;
    if !(price.is_finite() && price > 0.0) {
        anyhow::bail!("non-positive oracle answer: {answer}");
    }

    Ok(OracleRound {
        round_id,
        price,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_round(round_id: u128, answer: i128, updated_at: i64) -> String {
        let mut bytes = vec![0u8; 160];
        bytes[16..32].copy_from_slice(&round_id.to_be_bytes());
        bytes[48..64].copy_from_slice(&answer.to_be_bytes());
        bytes[112..120].copy_from_slice(&updated_at.to_be_bytes());
        format!("0x{}", hex::encode(bytes))
    }

    #[test]
    fn decodes_round_data() {
        // 50_000.00000000 with 8 decimals
        let blob = encode_round(42, 5_000_000_000_000, 1_700_000_000);
        let round = decode_round(&blob).unwrap();
        assert_eq!(round.round_id, 42);
        assert!((round.price - 50_000.0).abs() < 1e-9);
        assert_eq!(round.updated_at, 1_700_000_000);
    }

    #[test]
    fn rejects_short_blob() {
        assert!(decode_round("0xdeadbeef").is_err());
    }

    #[test]
    fn rejects_zero_answer() {
        let blob = encode_round(1, 0, 1_700_000_000);
        assert!(decode_round(&blob).is_err());
    }

    #[test]
    fn feeds_env_parsing() {
        std::env::set_var("ORACLE_RPC_URL", "http://localhost:8545");
        std::env::set_var(
            "ORACLE_FEEDS",
            "BTCUSDT=0xc907E116054Ad103354f2D350FD2514433D57F6f, ETHUSDT=0xF9680D99D6C9589e2a93a78A04A279e509205945",
        );
        let cfg = ChainlinkConfig::from_env().unwrap();
        assert_eq!(cfg.feeds.len(), 2);
        assert!(cfg.feeds.contains_key("BTCUSDT"));
        std::env::remove_var("ORACLE_RPC_URL");
        std::env::remove_var("ORACLE_FEEDS");
    }
}
