//! Secondary oracle, polled over HTTPS.
//!
//! Fallback when the primary on-chain oracle goes stale. The endpoint
//! returns a JSON map of symbol -> price; anything unparseable is skipped
//! and counted as a source failure.

use anyhow::{Context, Result};
use reqwest::Client;
use std::{collections::HashMap, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use super::aggregator::{SourceKind, SourceUpdate};

#[derive(Debug, Clone)]
pub struct AuxOracleConfig {
    pub url: String,
    pub symbols: Vec<String>,
    pub poll_interval: Duration,
}

impl AuxOracleConfig {
    pub fn from_env(symbols: Vec<String>) -> Option<Self> {
        let url = std::env::var("AUX_ORACLE_URL").ok().filter(|v| !v.is_empty())?;
        let poll_secs = std::env::var("AUX_ORACLE_POLL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(5);
        Some(Self {
            url,
            symbols,
            poll_interval: Duration::from_secs(poll_secs),
        })
    }
}

pub struct AuxOracleFeed {
    client: Client,
    config: AuxOracleConfig,
}

impl AuxOracleFeed {
    pub fn new(config: AuxOracleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build aux oracle client")?;
        Ok(Self { client, config })
    }

    async fn fetch_prices(&self) -> Result<HashMap<String, f64>> {
        let raw: HashMap<String, serde_json::Value> = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .context("aux oracle request")?
            .json()
            .await
            .context("parse aux oracle response")?;

        let mut out = HashMap::with_capacity(raw.len());
        for (symbol, value) in raw {
            let price = match &value {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            };
            if let Some(p) = price.filter(|p| p.is_finite() && *p > 0.0) {
                out.insert(symbol.to_ascii_uppercase(), p);
            }
        }
        Ok(out)
    }

    pub async fn run(
        self,
        tx: mpsc::Sender<SourceUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            match self.fetch_prices().await {
                Ok(prices) => {
                    let now = chrono::Utc::now().timestamp();
                    for symbol in &self.config.symbols {
                        let Some(&price) = prices.get(symbol.as_str()) else {
                            continue;
                        };
                        let update = SourceUpdate {
                            source: "oracle_secondary",
                            kind: SourceKind::SecondaryOracle,
                            symbol: symbol.clone(),
                            price,
                            ts: now,
                        };
                        if tx.try_send(update).is_err() {
                            metrics::increment_counter!("feed_ticks_dropped", "source" => "oracle_secondary");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "aux oracle poll failed");
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
