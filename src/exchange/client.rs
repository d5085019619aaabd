//! Exchange order API client.
//!
//! `ExchangeApi` is the seam the Order Manager executes through; `ClobClient`
//! is the production implementation speaking authenticated HTTP to the CLOB.
//! Every call is rate limited through a shared token bucket and carries an
//! explicit deadline.
//!
//! Failure semantics are part of the contract:
//! - `ExchangeError::Submission` means the venue never acknowledged anything;
//!   the caller may retry under a fresh intent.
//! - `ExchangeError::Ambiguous` means the request was sent but the ack is
//!   unknown; the caller must enter confirmation polling and must not
//!   re-submit the same intent.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

use super::rate_limit::TokenBucket;
use crate::models::{BestPrices, OrderType, Side};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Raised before the exchange acknowledged anything.
    #[error("submission failed (not sent): {0}")]
    Submission(String),

    /// Request went out but the acknowledgment never arrived.
    #[error("ambiguous submission (sent, ack unknown): {0}")]
    Ambiguous(String),
}

impl ExchangeError {
    /// Some(false) = definitively not placed; None = unknown.
    pub fn order_submitted_to_exchange(&self) -> Option<bool> {
        match self {
            ExchangeError::Submission(_) => Some(false),
            ExchangeError::Ambiguous(_) => None,
        }
    }
}

/// Normalized exchange acknowledgment. `order_id` is always non-empty on a
/// successful call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    /// Raw venue status: live | matched | cancelled | expired | killed.
    pub status: String,
    pub price_filled: Option<f64>,
    pub shares: Option<f64>,
    pub cost: Option<f64>,
    pub fee: Option<f64>,
}

/// The order API surface the engine executes through.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Buy `dollars` worth of `token_id` at up to `limit`.
    async fn place_buy(
        &self,
        token_id: &str,
        dollars: f64,
        limit: Option<f64>,
        order_type: OrderType,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError>;

    /// Sell `shares` of `token_id` at no less than `limit`.
    async fn place_sell(
        &self,
        token_id: &str,
        shares: f64,
        limit: Option<f64>,
        order_type: OrderType,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError>;

    async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError>;

    async fn get_order(&self, order_id: &str) -> Result<Option<OrderAck>, ExchangeError>;

    /// Lookup by the `clientOrderId` we submitted (the intent id rendered as
    /// a string). This is the reconciliation path after a crash.
    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderAck>, ExchangeError>;

    async fn get_best_prices(&self, token_id: &str) -> Result<BestPrices, ExchangeError>;

    async fn get_balance(&self) -> Result<f64, ExchangeError>;
}

/// CLOB L2 credentials.
#[derive(Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl ClobCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("CLOB_API_KEY").ok()?;
        let secret = std::env::var("CLOB_SECRET").ok()?;
        let passphrase = std::env::var("CLOB_PASSPHRASE").ok()?;
        if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            secret,
            passphrase,
        })
    }
}

impl std::fmt::Debug for ClobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobCredentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct WireOrderPayload<'a> {
    #[serde(rename = "tokenId")]
    token_id: &'a str,
    side: &'a str,
    size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
    #[serde(rename = "type")]
    order_type: &'a str,
    #[serde(rename = "clientOrderId")]
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireOrderResponse {
    #[serde(rename = "orderId", alias = "order_id")]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "priceFilled", alias = "price_filled", default)]
    price_filled: Option<serde_json::Value>,
    #[serde(default)]
    shares: Option<serde_json::Value>,
    #[serde(default)]
    cost: Option<serde_json::Value>,
    #[serde(default)]
    fee: Option<serde_json::Value>,
    #[serde(rename = "errorMsg", alias = "error", default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePricesResponse {
    bid: f64,
    ask: f64,
}

/// Accept both numeric and string-encoded decimals; venues are inconsistent.
fn wire_f64(v: &Option<serde_json::Value>) -> Option<f64> {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Live exchange client.
pub struct ClobClient {
    client: Client,
    host: String,
    creds: ClobCredentials,
    bucket: Arc<TokenBucket>,
    call_timeout: Duration,
}

impl std::fmt::Debug for ClobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobClient")
            .field("host", &self.host)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl ClobClient {
    pub fn new(host: String, creds: ClobCredentials, bucket: Arc<TokenBucket>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            host,
            creds,
            bucket,
            call_timeout: Duration::from_secs(5),
        })
    }

    pub fn from_env(bucket: Arc<TokenBucket>) -> Option<Self> {
        let host = std::env::var("CLOB_HOST").ok()?;
        let creds = ClobCredentials::from_env()?;
        Self::new(host, creds, bucket).ok()
    }

    /// Credential-less client. Only the unauthenticated endpoints (prices)
    /// are usable; paper sessions run on this.
    pub fn public(host: String, bucket: Arc<TokenBucket>) -> Result<Self> {
        Self::new(
            host,
            ClobCredentials {
                api_key: String::new(),
                secret: String::new(),
                passphrase: String::new(),
            },
            bucket,
        )
    }

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{}{}{}{}", timestamp, method, path, body);
        let secret_bytes = URL_SAFE
            .decode(&self.creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&self.creds.secret))
            .or_else(|_| BASE64.decode(&self.creds.secret))
            .context("decode CLOB secret")?;
        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| anyhow!("HMAC key error: {}", e))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;
        Ok(vec![
            ("X-API-KEY".to_string(), self.creds.api_key.clone()),
            ("X-SIGNATURE".to_string(), signature),
            ("X-TIMESTAMP".to_string(), timestamp.to_string()),
            ("X-PASSPHRASE".to_string(), self.creds.passphrase.clone()),
        ])
    }

    /// Classify a transport error. Connection failures definitely never
    /// reached the venue; timeouts after send are ambiguous.
    fn classify(e: reqwest::Error) -> ExchangeError {
        if e.is_timeout() {
            ExchangeError::Ambiguous(format!("request timed out: {e}"))
        } else if e.is_connect() || e.is_builder() || e.is_request() {
            ExchangeError::Submission(format!("request failed before send: {e}"))
        } else {
            ExchangeError::Ambiguous(format!("transport error after send: {e}"))
        }
    }

    async fn place(
        &self,
        token_id: &str,
        side: Side,
        size: f64,
        limit: Option<f64>,
        order_type: OrderType,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        self.bucket.acquire().await;

        let payload = WireOrderPayload {
            token_id,
            side: side.as_str(),
            size: format!("{:.6}", size),
            price: limit.map(|p| format!("{:.4}", p)),
            order_type: order_type.as_str(),
            client_order_id,
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| ExchangeError::Submission(format!("serialize order: {e}")))?;

        let path = "/order";
        let headers = self
            .auth_headers("POST", path, &body)
            .map_err(|e| ExchangeError::Submission(format!("auth: {e}")))?;

        let url = format!("{}{}", self.host, path);
        let mut request = self
            .client
            .post(&url)
            .timeout(self.call_timeout)
            .header("Content-Type", "application/json");
        for (k, v) in headers {
            request = request.header(&k, &v);
        }

        debug!(token_id, side = side.as_str(), size, ?limit, client_order_id, "order submission");

        let response = request.body(body).send().await.map_err(Self::classify)?;
        let status = response.status();

        if !status.is_success() {
            // the venue answered; this is a definitive rejection
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %text, "order rejected by venue");
            return Err(ExchangeError::Submission(format!(
                "venue rejected ({status}): {text}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Ambiguous(format!("read response: {e}")))?;
        let resp: WireOrderResponse = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Ambiguous(format!("parse response: {e}")))?;

        if let Some(err) = resp.error_msg.filter(|e| !e.is_empty()) {
            return Err(ExchangeError::Submission(format!("venue error: {err}")));
        }

        let order_id = resp
            .order_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ExchangeError::Ambiguous("ack missing orderId".to_string()))?;

        Ok(OrderAck {
            order_id,
            status: resp.status.unwrap_or_else(|| "live".to_string()),
            price_filled: wire_f64(&resp.price_filled),
            shares: wire_f64(&resp.shares),
            cost: wire_f64(&resp.cost),
            fee: wire_f64(&resp.fee),
        })
    }

    async fn fetch_order(&self, path: &str) -> Result<Option<OrderAck>, ExchangeError> {
        self.bucket.acquire().await;

        let headers = self
            .auth_headers("GET", path, "")
            .map_err(|e| ExchangeError::Submission(format!("auth: {e}")))?;
        let url = format!("{}{}", self.host, path);
        let mut request = self.client.get(&url).timeout(self.call_timeout);
        for (k, v) in headers {
            request = request.header(&k, &v);
        }

        let response = request.send().await.map_err(Self::classify)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ExchangeError::Ambiguous(format!(
                "order lookup failed ({})",
                response.status()
            )));
        }

        let resp: WireOrderResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Ambiguous(format!("parse order: {e}")))?;
        let Some(order_id) = resp.order_id.filter(|id| !id.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(OrderAck {
            order_id,
            status: resp.status.unwrap_or_else(|| "live".to_string()),
            price_filled: wire_f64(&resp.price_filled),
            shares: wire_f64(&resp.shares),
            cost: wire_f64(&resp.cost),
            fee: wire_f64(&resp.fee),
        }))
    }
}

#[async_trait]
impl ExchangeApi for ClobClient {
    async fn place_buy(
        &self,
        token_id: &str,
        dollars: f64,
        limit: Option<f64>,
        order_type: OrderType,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        self.place(token_id, Side::Buy, dollars, limit, order_type, client_order_id)
            .await
    }

    async fn place_sell(
        &self,
        token_id: &str,
        shares: f64,
        limit: Option<f64>,
        order_type: OrderType,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        self.place(token_id, Side::Sell, shares, limit, order_type, client_order_id)
            .await
    }

    async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError> {
        self.bucket.acquire().await;

        let path = format!("/order/{}", order_id);
        let headers = self
            .auth_headers("DELETE", &path, "")
            .map_err(|e| ExchangeError::Submission(format!("auth: {e}")))?;
        let url = format!("{}{}", self.host, path);
        let mut request = self.client.delete(&url).timeout(self.call_timeout);
        for (k, v) in headers {
            request = request.header(&k, &v);
        }

        let response = request.send().await.map_err(Self::classify)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Submission(format!(
                "cancel rejected ({status}): {text}"
            )));
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<OrderAck>, ExchangeError> {
        self.fetch_order(&format!("/order/{}", order_id)).await
    }

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderAck>, ExchangeError> {
        self.fetch_order(&format!("/order/{}?by=client", client_order_id))
            .await
    }

    async fn get_best_prices(&self, token_id: &str) -> Result<BestPrices, ExchangeError> {
        self.bucket.acquire().await;

        let url = format!("{}/prices/{}", self.host, token_id);
        let response = self
            .client
            .get(&url)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(Self::classify)?;
        if !response.status().is_success() {
            return Err(ExchangeError::Submission(format!(
                "prices lookup failed ({})",
                response.status()
            )));
        }
        let prices: WirePricesResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Submission(format!("parse prices: {e}")))?;
        Ok(BestPrices::from_bid_ask(prices.bid, prices.ask))
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        self.bucket.acquire().await;

        let path = "/balance";
        let headers = self
            .auth_headers("GET", path, "")
            .map_err(|e| ExchangeError::Submission(format!("auth: {e}")))?;
        let url = format!("{}{}", self.host, path);
        let mut request = self.client.get(&url).timeout(self.call_timeout);
        for (k, v) in headers {
            request = request.header(&k, &v);
        }

        let response = request.send().await.map_err(Self::classify)?;
        if !response.status().is_success() {
            return Err(ExchangeError::Submission(format!(
                "balance lookup failed ({})",
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Submission(format!("read balance: {e}")))?;
        // plain decimal, or {"balance": "123.45"}
        if let Ok(v) = text.trim().parse::<f64>() {
            return Ok(v);
        }
        let map: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Submission(format!("parse balance: {e}")))?;
        wire_f64(&map.get("balance").cloned())
            .ok_or_else(|| ExchangeError::Submission("balance missing from response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_f64_accepts_both_shapes() {
        assert_eq!(wire_f64(&Some(serde_json::json!(0.52))), Some(0.52));
        assert_eq!(wire_f64(&Some(serde_json::json!("5.77"))), Some(5.77));
        assert_eq!(wire_f64(&Some(serde_json::json!(" 1.25 "))), Some(1.25));
        assert_eq!(wire_f64(&Some(serde_json::json!(null))), None);
        assert_eq!(wire_f64(&None), None);
    }

    #[test]
    fn submission_error_flags() {
        assert_eq!(
            ExchangeError::Submission("x".into()).order_submitted_to_exchange(),
            Some(false)
        );
        assert_eq!(
            ExchangeError::Ambiguous("x".into()).order_submitted_to_exchange(),
            None
        );
    }

    #[test]
    fn credentials_redacted_in_debug() {
        let creds = ClobCredentials {
            api_key: "key-123".to_string(),
            secret: "c2VjcmV0".to_string(),
            passphrase: "hunter2".to_string(),
        };
        let out = format!("{:?}", creds);
        assert!(!out.contains("key-123"));
        assert!(!out.contains("hunter2"));
    }
}
