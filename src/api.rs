//! Dashboard-facing HTTP + WebSocket surface.
//!
//! The browser dashboard is an external collaborator; this module only
//! serves its interface: runtime controls, trade history, instrument and
//! feed health, window assertions, and a WebSocket firehose of engine
//! events.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::engine::{ControlPanel, InstrumentSpec, PaperLedger};
use crate::feeds::{FeedHealthHandle, ReferencePriceResolver};
use crate::models::WsServerEvent;
use crate::store::TradeStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: TradeStore,
    pub controls: Arc<ControlPanel>,
    pub events: broadcast::Sender<WsServerEvent>,
    pub ledger: Arc<parking_lot::Mutex<PaperLedger>>,
    pub feed_health: FeedHealthHandle,
    pub resolver: Arc<ReferencePriceResolver>,
    pub instruments: Arc<Vec<InstrumentSpec>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/controls", get(get_controls).post(post_controls))
        .route("/api/trades", get(get_trades))
        .route("/api/instruments", get(get_instruments))
        .route("/api/assertions", get(get_assertions))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "ts": Utc::now().timestamp()}))
}

async fn get_controls(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({"controls": state.controls.snapshot()}))
}

#[derive(Debug, Deserialize)]
struct ControlUpdate {
    key: String,
    value: String,
}

async fn post_controls(
    State(state): State<ApiState>,
    Json(update): Json<ControlUpdate>,
) -> Response {
    match state.controls.apply(&update.key, &update.value) {
        Ok(controls) => Json(json!({"controls": controls})).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TradesQuery {
    limit: Option<usize>,
}

async fn get_trades(
    State(state): State<ApiState>,
    Query(query): Query<TradesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(100);
    match state.store.recent_orders(limit).await {
        Ok(orders) => {
            let count = orders.len();
            let ledger = state.ledger.lock().clone();
            Json(json!({
                "orders": orders,
                "count": count,
                "session": {
                    "cash_usd": ledger.cash_usd,
                    "total_fees_usd": ledger.total_fees_usd,
                    "trade_count": ledger.trade_count,
                    "reject_count": ledger.reject_count,
                    "partial_fill_count": ledger.partial_fill_count,
                },
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn get_instruments(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let now = Utc::now().timestamp();
    Json(json!({
        "instruments": state
            .instruments
            .iter()
            .map(|i| json!({
                "symbol": i.symbol,
                "market_id": i.market_id,
                "up_token_id": i.up_token_id,
                "down_token_id": i.down_token_id,
                "source_spread": state.resolver.source_spread(&i.symbol, now),
                "oracle_divergence": state.resolver.oracle_divergence(&i.symbol, now),
            }))
            .collect::<Vec<_>>(),
        "feeds": state.feed_health.snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
struct AssertionsQuery {
    limit: Option<usize>,
}

async fn get_assertions(
    State(state): State<ApiState>,
    Query(query): Query<AssertionsQuery>,
) -> Response {
    match state
        .store
        .recent_window_events(query.limit.unwrap_or(100))
        .await
    {
        Ok(windows) => Json(json!({"windows": windows})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn ws_handler(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_connection(socket, state))
}

async fn ws_connection(mut socket: WebSocket, state: ApiState) {
    // first frame: full snapshot
    let init = WsServerEvent::Init {
        ts: Utc::now().timestamp(),
        data: json!({
            "controls": state.controls.snapshot(),
            "session": state.ledger.lock().clone(),
            "feeds": state.feed_health.snapshot(),
        }),
    };
    if let Ok(text) = serde_json::to_string(&init) {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(missed = n, "ws client lagged; skipping");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            msg = socket.recv() => {
                match msg {
                    // inbound traffic is ignored; the control surface is HTTP
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}
