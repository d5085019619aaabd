//! Order manager: the sole mutator of orders.
//!
//! `execute` runs the full admission -> write-ahead -> submit -> confirm ->
//! persist pipeline and returns the same result shape for LIVE, PAPER and
//! DRY_RUN. The invariants it defends:
//!
//! - no exchange call before the intent row is durable
//! - an acknowledged order is never re-submitted (the intent id is the
//!   venue's clientOrderId)
//! - a failed DB write after an ack reports success with `db_write_failed`
//!   rather than risking a double spend
//! - all status changes go through the state machine, serialized per order

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::engine::ledger::PaperLedger;
use crate::engine::status::{exchange_status_is_terminal, map_exchange_status, OrderStatus};
use crate::errors::ExecError;
use crate::exchange::{ExchangeApi, ExchangeError, OrderAck};
use crate::models::{
    ExecutionResult, OrderType, Side, TradeMode, TradeSignal, WsEventKind, WsServerEvent,
};
use crate::store::{IntentKind, IntentLog, OrderRecord, OrderUpdate, PaperTradeRecord, TradeStore};

/// Round to 1e-8 to keep the weighted average-fill accumulation stable.
fn round8(x: f64) -> f64 {
    (x * 1e8).round() / 1e8
}

/// Fees occasionally arrive in micro-dollar integer units; anything that
/// large on a capped order is a unit mismatch, not a real fee.
fn normalize_fee(raw: Option<f64>) -> f64 {
    match raw {
        Some(f) if f > 1e4 => f / 1e6,
        Some(f) if f.is_finite() && f >= 0.0 => f,
        _ => 0.0,
    }
}

#[derive(Debug, Clone)]
pub struct OrderManagerConfig {
    /// Hard per-order cap in dollars.
    pub max_order_usd: f64,
    /// Max non-dead orders per (window, token).
    pub window_order_cap: u32,
    pub confirm_poll_interval: Duration,
    pub confirm_poll_budget: Duration,
    /// Concurrent `execute` calls before returning `Busy`.
    pub max_inflight: usize,
    /// Taker fee applied to simulated fills.
    pub paper_fee_rate: f64,
    /// Whether DRY_RUN fills feed the position lifecycle (operator policy).
    pub dry_run_fills_positions: bool,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            max_order_usd: 5.0,
            window_order_cap: 2,
            confirm_poll_interval: Duration::from_secs(1),
            confirm_poll_budget: Duration::from_secs(5),
            max_inflight: 8,
            paper_fee_rate: 0.005,
            dry_run_fills_positions: false,
        }
    }
}

impl OrderManagerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("MAX_ORDER_USD") {
            if let Ok(val) = v.parse::<f64>() {
                if val > 0.0 {
                    cfg.max_order_usd = val;
                }
            }
        }
        if let Ok(v) = std::env::var("WINDOW_ORDER_CAP") {
            if let Ok(val) = v.parse::<u32>() {
                if val > 0 {
                    cfg.window_order_cap = val;
                }
            }
        }
        if let Ok(v) = std::env::var("CONFIRM_POLL_BUDGET_SECS") {
            if let Ok(val) = v.parse::<u64>() {
                if val > 0 {
                    cfg.confirm_poll_budget = Duration::from_secs(val);
                }
            }
        }
        if let Ok(v) = std::env::var("PAPER_FEE_RATE") {
            if let Ok(val) = v.parse::<f64>() {
                if (0.0..0.2).contains(&val) {
                    cfg.paper_fee_rate = val;
                }
            }
        }
        cfg.dry_run_fills_positions = std::env::var("DRY_RUN_FILLS_POSITIONS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);
        cfg
    }
}

enum ClientLookup {
    Found(OrderAck),
    NotFound,
    Unreachable,
}

pub struct OrderManager {
    store: TradeStore,
    wal: IntentLog,
    exchange: Arc<dyn ExchangeApi>,
    config: OrderManagerConfig,
    ledger: Arc<parking_lot::Mutex<PaperLedger>>,
    /// Per-order serialization of status transitions.
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    inflight: Arc<Semaphore>,
    fills_tx: broadcast::Sender<OrderRecord>,
    events_tx: broadcast::Sender<WsServerEvent>,
}

impl OrderManager {
    pub fn new(
        store: TradeStore,
        wal: IntentLog,
        exchange: Arc<dyn ExchangeApi>,
        config: OrderManagerConfig,
        ledger: Arc<parking_lot::Mutex<PaperLedger>>,
        events_tx: broadcast::Sender<WsServerEvent>,
    ) -> Self {
        let (fills_tx, _) = broadcast::channel(512);
        let inflight = Arc::new(Semaphore::new(config.max_inflight));
        Self {
            store,
            wal,
            exchange,
            config,
            ledger,
            locks: parking_lot::Mutex::new(HashMap::new()),
            inflight,
            fills_tx,
            events_tx,
        }
    }

    pub fn store(&self) -> &TradeStore {
        &self.store
    }

    pub fn wal(&self) -> &IntentLog {
        &self.wal
    }

    pub fn config(&self) -> &OrderManagerConfig {
        &self.config
    }

    /// Filled and partially-filled order rows, for the position manager.
    pub fn subscribe_fills(&self) -> broadcast::Receiver<OrderRecord> {
        self.fills_tx.subscribe()
    }

    // ==================================================================
    // execute
    // ==================================================================

    pub async fn execute(
        &self,
        signal: &TradeSignal,
        mode: TradeMode,
    ) -> Result<ExecutionResult, ExecError> {
        let _permit = self
            .inflight
            .clone()
            .try_acquire_owned()
            .map_err(|_| ExecError::Busy)?;

        self.validate(signal)?;

        let payload = json!({
            "signal": signal,
            "mode": mode.as_str(),
        });
        let intent_id = self
            .wal
            .log_intent(IntentKind::Place, &signal.window_id, &payload)
            .await
            .map_err(|e| ExecError::Storage(format!("intent write failed: {e}")))?;
        self.wal
            .mark_executing(intent_id)
            .await
            .map_err(|e| ExecError::Storage(format!("intent transition failed: {e}")))?;

        if let Err(e) = self.admission_checks(signal, mode).await {
            warn!(
                intent_id,
                code = e.code(),
                token_id = %signal.token_id,
                window_id = %signal.window_id,
                "signal denied at admission"
            );
            let _ = self.wal.mark_failed(intent_id, &format!("{}: {e}", e.code())).await;
            return Err(e);
        }

        let result = match mode {
            TradeMode::Live => self.execute_live(signal, intent_id).await,
            TradeMode::Paper | TradeMode::DryRun => {
                self.execute_simulated(signal, mode, intent_id).await
            }
        };

        if let Ok(ref r) = result {
            let _ = self.events_tx.send(WsServerEvent::Event {
                event: WsEventKind::Order,
                ts: Utc::now().timestamp(),
                data: serde_json::to_value(r).unwrap_or_default(),
            });
        }

        result
    }

    fn validate(&self, signal: &TradeSignal) -> Result<(), ExecError> {
        if signal.token_id.trim().is_empty() {
            return Err(ExecError::Validation("tokenId must be non-empty".into()));
        }
        if !(signal.size > 0.0) {
            return Err(ExecError::Validation(format!(
                "size must be positive, got {}",
                signal.size
            )));
        }
        if signal.side == Side::Buy && signal.size > self.config.max_order_usd {
            return Err(ExecError::Validation(format!(
                "size {} exceeds per-order cap {}",
                signal.size, self.config.max_order_usd
            )));
        }
        if let Some(p) = signal.limit_price {
            if !(0.01..=0.99).contains(&p) {
                return Err(ExecError::Validation(format!(
                    "price {p} outside [0.01, 0.99]"
                )));
            }
        }
        if signal.window_id.trim().is_empty() || signal.market_id.trim().is_empty() {
            return Err(ExecError::Validation(
                "windowId and marketId are required".into(),
            ));
        }
        Ok(())
    }

    async fn admission_checks(
        &self,
        signal: &TradeSignal,
        mode: TradeMode,
    ) -> Result<(), ExecError> {
        // balance, buys only; API failure is fail-open
        if signal.side == Side::Buy {
            match mode {
                TradeMode::Live => match self.exchange.get_balance().await {
                    Ok(balance) if balance < signal.size => {
                        return Err(ExecError::InsufficientBalance {
                            available: balance,
                            required: signal.size,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "balance check failed; proceeding");
                    }
                },
                TradeMode::Paper => {
                    let cash = self.ledger.lock().cash_usd;
                    if cash < signal.size {
                        return Err(ExecError::InsufficientBalance {
                            available: cash,
                            required: signal.size,
                        });
                    }
                }
                TradeMode::DryRun => {}
            }
        }

        // an unresolved UNKNOWN order blocks re-entry for this (window, token)
        match self
            .store
            .unknown_order_for(&signal.window_id, &signal.token_id)
            .await
        {
            Ok(Some(order_id)) => {
                return Err(ExecError::ConfirmationTimeout { order_id });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "unknown-order gate check failed; proceeding"),
        }

        // per-window cap; DB failure is fail-open (unique index backstops it)
        match self
            .store
            .count_window_orders(&signal.window_id, &signal.token_id)
            .await
        {
            Ok(count) if count >= self.config.window_order_cap => {
                return Err(ExecError::WindowCapExceeded {
                    window_id: signal.window_id.clone(),
                    token_id: signal.token_id.clone(),
                    count,
                    cap: self.config.window_order_cap,
                });
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "window cap check failed; proceeding"),
        }

        Ok(())
    }

    // ==================================================================
    // LIVE path
    // ==================================================================

    async fn execute_live(
        &self,
        signal: &TradeSignal,
        intent_id: i64,
    ) -> Result<ExecutionResult, ExecError> {
        let client_order_id = intent_id.to_string();
        let submitted_at = Utc::now();
        let started = Instant::now();

        let call = match signal.side {
            Side::Buy => {
                self.exchange
                    .place_buy(
                        &signal.token_id,
                        signal.size,
                        signal.limit_price,
                        signal.order_type,
                        &client_order_id,
                    )
                    .await
            }
            Side::Sell => {
                self.exchange
                    .place_sell(
                        &signal.token_id,
                        signal.size,
                        signal.limit_price,
                        signal.order_type,
                        &client_order_id,
                    )
                    .await
            }
        };

        let initial_ack = match call {
            Ok(ack) => ack,
            Err(ExchangeError::Submission(msg)) => {
                let _ = self
                    .wal
                    .mark_failed(intent_id, &format!("SUBMISSION_FAILED: {msg}"))
                    .await;
                return Err(ExecError::SubmissionFailed(msg));
            }
            Err(ExchangeError::Ambiguous(msg)) => {
                // the order may exist under our clientOrderId; look before
                // giving up, and never re-submit this intent
                warn!(intent_id, detail = %msg, "ambiguous submission; polling by client id");
                match self.lookup_by_client_id(&client_order_id).await {
                    ClientLookup::Found(ack) => ack,
                    ClientLookup::NotFound => {
                        let _ = self
                            .wal
                            .mark_failed(intent_id, &format!("SUBMISSION_FAILED: {msg}"))
                            .await;
                        return Err(ExecError::SubmissionFailed(msg));
                    }
                    ClientLookup::Unreachable => {
                        // intent stays EXECUTING; the reconciler owns it now
                        return Err(ExecError::AmbiguousSubmission {
                            intent_id,
                            detail: msg,
                        });
                    }
                }
            }
        };
        let acked_at = Utc::now();

        if initial_ack.order_id.trim().is_empty() {
            let _ = self
                .wal
                .mark_failed(intent_id, "SUBMISSION_FAILED: ack missing order id")
                .await;
            return Err(ExecError::SubmissionFailed("ack missing order id".into()));
        }

        let mut status = map_exchange_status(&initial_ack.status, signal.order_type);
        let mut final_ack = initial_ack.clone();
        let mut error_message: Option<String> = None;

        // resting orders get a bounded confirmation window
        if signal.order_type == OrderType::Gtc && status == OrderStatus::Open {
            match self.confirmation_poll(&initial_ack.order_id).await {
                Some(ack) if exchange_status_is_terminal(&ack.status) => {
                    status = map_exchange_status(&ack.status, signal.order_type);
                    final_ack = ack;
                }
                _ => {
                    status = OrderStatus::Unknown;
                    error_message = Some("Order confirmation timed out".to_string());
                }
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;

        // prefer poll data over the initial ack over requested values
        let (fill_price, filled_size, fee_amount) =
            extract_fill(signal, &final_ack, &initial_ack, status);

        let now = Utc::now().timestamp();
        let record = OrderRecord {
            order_id: final_ack.order_id.clone(),
            intent_id,
            window_id: signal.window_id.clone(),
            market_id: signal.market_id.clone(),
            token_id: signal.token_id.clone(),
            side: signal.side,
            order_type: signal.order_type,
            limit_price: signal.limit_price,
            size: signal.size,
            filled_size,
            avg_fill_price: fill_price,
            fee_amount,
            status,
            mode: TradeMode::Live,
            submitted_at: Some(submitted_at.timestamp()),
            acked_at: Some(acked_at.timestamp()),
            filled_at: (status == OrderStatus::Filled).then_some(now),
            cancelled_at: matches!(status, OrderStatus::Cancelled | OrderStatus::Rejected)
                .then_some(now),
            error_message: error_message.clone(),
            position_id: None,
            symbol: signal.context.symbol.clone(),
            strategy_id: signal.context.strategy_id.clone(),
            model_prob: signal.context.model_prob,
            edge: signal.context.edge,
            token_side: signal.context.token_side.clone(),
            book_snapshot: None,
            created_at: now,
            updated_at: now,
        };

        let db_write_failed = match self.store.insert_order(&record).await {
            Ok(()) => false,
            Err(e) => {
                // the exchange accepted this order; retrying would double
                // spend, so report success and leave the gap for the
                // reconciler
                error!(
                    order_id = %record.order_id,
                    intent_id,
                    error = %e,
                    "CRITICAL: order row insert failed after exchange ack"
                );
                true
            }
        };

        let summary = json!({
            "order_id": record.order_id,
            "status": status.as_str(),
            "filled_size": filled_size,
            "fill_price": fill_price,
            "db_write_failed": db_write_failed,
        });
        if let Err(e) = self.wal.mark_completed(intent_id, &summary).await {
            error!(intent_id, error = %e, "intent completion write failed");
        }

        info!(
            order_id = %record.order_id,
            intent_id,
            status = status.as_str(),
            filled_size,
            fill_price,
            latency_ms,
            "live order settled"
        );

        if status == OrderStatus::Filled && !db_write_failed {
            let _ = self.fills_tx.send(record.clone());
        }

        Ok(ExecutionResult {
            order_id: record.order_id,
            status: status.as_str().to_string(),
            fill_price,
            filled_size,
            fee_amount,
            latency_ms,
            intent_id,
            mode: TradeMode::Live,
            order_submitted_to_exchange: Some(true),
            db_write_failed,
            submitted_at: Some(submitted_at),
            acked_at: Some(acked_at),
            order_book_snapshot: None,
        })
    }

    /// Poll `get_order` until the venue reports a terminal status or the
    /// budget runs out. The final poll lands exactly at the budget boundary,
    /// so a terminal status observed there still counts.
    async fn confirmation_poll(&self, order_id: &str) -> Option<OrderAck> {
        let mut elapsed = Duration::ZERO;
        let mut last: Option<OrderAck> = None;

        while elapsed < self.config.confirm_poll_budget {
            sleep(self.config.confirm_poll_interval).await;
            elapsed += self.config.confirm_poll_interval;

            match self.exchange.get_order(order_id).await {
                Ok(Some(ack)) => {
                    if exchange_status_is_terminal(&ack.status) {
                        return Some(ack);
                    }
                    last = Some(ack);
                }
                Ok(None) => {
                    debug!(order_id, "confirmation poll: order not found yet");
                }
                Err(e) => {
                    debug!(order_id, error = %e, "confirmation poll attempt failed");
                }
            }
        }

        last
    }

    async fn lookup_by_client_id(&self, client_order_id: &str) -> ClientLookup {
        let mut elapsed = Duration::ZERO;
        let mut venue_answered_missing = false;

        while elapsed < self.config.confirm_poll_budget {
            sleep(self.config.confirm_poll_interval).await;
            elapsed += self.config.confirm_poll_interval;

            match self.exchange.get_order_by_client_id(client_order_id).await {
                Ok(Some(ack)) => return ClientLookup::Found(ack),
                Ok(None) => venue_answered_missing = true,
                Err(_) => {}
            }
        }

        if venue_answered_missing {
            ClientLookup::NotFound
        } else {
            ClientLookup::Unreachable
        }
    }

    // ==================================================================
    // PAPER / DRY_RUN path
    // ==================================================================

    async fn execute_simulated(
        &self,
        signal: &TradeSignal,
        mode: TradeMode,
        intent_id: i64,
    ) -> Result<ExecutionResult, ExecError> {
        let submitted_at = Utc::now();
        let started = Instant::now();

        // snapshot the book; fall back to the requested limit when empty
        let book = self.exchange.get_best_prices(&signal.token_id).await.ok();
        let book_snapshot = book.map(|b| {
            let mut snap = crate::models::BookSnapshot {
                ts: submitted_at.timestamp(),
                ..Default::default()
            };
            match signal.context.token_side.as_deref() {
                Some("DOWN") => snap.down = b,
                _ => snap.up = b,
            }
            snap
        });
        let book_price = book.and_then(|b| {
            let p = match signal.side {
                Side::Buy => b.ask,
                Side::Sell => b.bid,
            };
            (p > 0.0).then_some(p)
        });
        let Some(fill_price) = book_price.or(signal.limit_price) else {
            let _ = self
                .wal
                .mark_failed(intent_id, "SUBMISSION_FAILED: no book for simulated fill")
                .await;
            return Err(ExecError::SubmissionFailed(
                "no book available for simulated fill".into(),
            ));
        };
        let fill_price = fill_price.clamp(0.01, 0.99);

        let (filled_size, notional) = match signal.side {
            Side::Buy => (round8(signal.size / fill_price), signal.size),
            Side::Sell => (signal.size, round8(signal.size * fill_price)),
        };
        let fee_amount = round8(notional * self.config.paper_fee_rate);

        let prefix = match mode {
            TradeMode::Paper => "paper",
            _ => "dryrun",
        };
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let order_id = format!(
            "{}-{}-{}",
            prefix,
            Utc::now().timestamp_millis(),
            &nonce[..8]
        );

        if mode == TradeMode::Paper {
            let mut ledger = self.ledger.lock();
            match signal.side {
                Side::Buy => {
                    ledger.apply_buy(&signal.token_id, fill_price, notional, fee_amount);
                }
                Side::Sell => {
                    ledger.apply_sell(&signal.token_id, fill_price, filled_size, fee_amount);
                }
            }
        }

        let now = Utc::now().timestamp();
        let record = OrderRecord {
            order_id: order_id.clone(),
            intent_id,
            window_id: signal.window_id.clone(),
            market_id: signal.market_id.clone(),
            token_id: signal.token_id.clone(),
            side: signal.side,
            order_type: signal.order_type,
            limit_price: signal.limit_price,
            size: signal.size,
            filled_size,
            avg_fill_price: fill_price,
            fee_amount,
            status: OrderStatus::Filled,
            mode,
            submitted_at: Some(submitted_at.timestamp()),
            acked_at: Some(now),
            filled_at: Some(now),
            cancelled_at: None,
            error_message: None,
            position_id: None,
            symbol: signal.context.symbol.clone(),
            strategy_id: signal.context.strategy_id.clone(),
            model_prob: signal.context.model_prob,
            edge: signal.context.edge,
            token_side: signal.context.token_side.clone(),
            book_snapshot: book_snapshot.clone(),
            created_at: now,
            updated_at: now,
        };

        let db_write_failed = match self.store.insert_order(&record).await {
            Ok(()) => false,
            Err(e) => {
                error!(order_id = %order_id, error = %e, "simulated order row insert failed");
                true
            }
        };

        let _ = self
            .store
            .insert_paper_trade(&PaperTradeRecord {
                id: order_id.clone(),
                ts: now,
                mode,
                window_id: signal.window_id.clone(),
                token_id: signal.token_id.clone(),
                side: signal.side,
                price: fill_price,
                notional,
                shares: filled_size,
                fee: fee_amount,
            })
            .await;

        let summary = json!({
            "order_id": order_id,
            "status": "filled",
            "filled_size": filled_size,
            "fill_price": fill_price,
            "db_write_failed": db_write_failed,
        });
        if let Err(e) = self.wal.mark_completed(intent_id, &summary).await {
            error!(intent_id, error = %e, "intent completion write failed");
        }

        debug!(
            order_id = %order_id,
            mode = mode.as_str(),
            fill_price,
            filled_size,
            "simulated fill"
        );

        if mode == TradeMode::Paper || self.config.dry_run_fills_positions {
            let _ = self.fills_tx.send(record);
        }

        Ok(ExecutionResult {
            order_id,
            status: OrderStatus::Filled.as_str().to_string(),
            fill_price,
            filled_size,
            fee_amount,
            latency_ms: started.elapsed().as_millis() as u64,
            intent_id,
            mode,
            order_submitted_to_exchange: Some(false),
            db_write_failed,
            submitted_at: Some(submitted_at),
            acked_at: Some(Utc::now()),
            order_book_snapshot: book_snapshot,
        })
    }

    // ==================================================================
    // Status transitions
    // ==================================================================

    fn lock_for(&self, order_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(order_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Transition an order's status, applying whitelisted column updates.
    /// Serialized per order; illegal transitions fail without touching the
    /// row.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        new_status: OrderStatus,
        mut update: OrderUpdate,
    ) -> Result<OrderRecord, ExecError> {
        let lock = self.lock_for(order_id);
        let _guard = lock.lock().await;

        let record = self
            .store
            .get_order(order_id)
            .await
            .map_err(|e| ExecError::Storage(e.to_string()))?
            .ok_or_else(|| ExecError::NotFound(order_id.to_string()))?;

        if !record.status.can_transition_to(new_status) {
            error!(
                order_id,
                from = record.status.as_str(),
                to = new_status.as_str(),
                "illegal status transition rejected"
            );
            return Err(ExecError::InvalidTransition {
                order_id: order_id.to_string(),
                from: record.status.as_str(),
                to: new_status.as_str(),
            });
        }

        let now = Utc::now().timestamp();
        update.status = Some(new_status);
        if new_status == OrderStatus::Filled && record.filled_at.is_none() {
            update.filled_at.get_or_insert(now);
        }
        if matches!(new_status, OrderStatus::Cancelled | OrderStatus::Expired)
            && record.cancelled_at.is_none()
        {
            update.cancelled_at.get_or_insert(now);
        }

        let applied = self
            .store
            .update_order(order_id, record.status, &update)
            .await
            .map_err(|e| ExecError::Storage(e.to_string()))?;
        if !applied {
            // the row moved despite the per-order lock; a second writer is a
            // bug upstream
            error!(order_id, "status precondition failed under per-order lock");
            return Err(ExecError::InvalidTransition {
                order_id: order_id.to_string(),
                from: record.status.as_str(),
                to: new_status.as_str(),
            });
        }

        if new_status.is_terminal() {
            let summary = json!({
                "order_id": order_id,
                "status": new_status.as_str(),
            });
            if let Err(e) = self.wal.mark_completed(record.intent_id, &summary).await {
                warn!(intent_id = record.intent_id, error = %e, "parent intent completion failed");
            }
        }

        let updated = self
            .store
            .get_order(order_id)
            .await
            .map_err(|e| ExecError::Storage(e.to_string()))?
            .ok_or_else(|| ExecError::NotFound(order_id.to_string()))?;

        if matches!(
            new_status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled
        ) {
            let _ = self.fills_tx.send(updated.clone());
            let _ = self.events_tx.send(WsServerEvent::Event {
                event: WsEventKind::Fill,
                ts: now,
                data: serde_json::to_value(&updated).unwrap_or_default(),
            });
        }

        Ok(updated)
    }

    /// Fold one partial fill into the order's running totals.
    pub async fn handle_partial_fill(
        &self,
        order_id: &str,
        fill_size: f64,
        fill_price: f64,
    ) -> Result<OrderRecord, ExecError> {
        if !(fill_size > 0.0) {
            return Err(ExecError::Validation(format!(
                "fill size must be positive, got {fill_size}"
            )));
        }
        if !(0.01..=0.99).contains(&fill_price) {
            return Err(ExecError::Validation(format!(
                "fill price {fill_price} outside [0.01, 0.99]"
            )));
        }

        let record = self
            .store
            .get_order(order_id)
            .await
            .map_err(|e| ExecError::Storage(e.to_string()))?
            .ok_or_else(|| ExecError::NotFound(order_id.to_string()))?;

        if !record.status.can_cancel() {
            // partial fills only land on live orders
            return Err(ExecError::InvalidTransition {
                order_id: order_id.to_string(),
                from: record.status.as_str(),
                to: OrderStatus::PartiallyFilled.as_str(),
            });
        }

        let prev_filled = record.filled_size;
        let new_filled = round8(prev_filled + fill_size);
        let new_avg = round8(
            (prev_filled * record.avg_fill_price + fill_size * fill_price) / new_filled,
        );

        // requested size is dollars for buys; completion compares in shares
        let target_shares = match record.side {
            Side::Sell => Some(record.size),
            Side::Buy => record.limit_price.map(|p| record.size / p),
        };
        if let Some(target) = target_shares {
            if new_filled > target + 1e-6 {
                warn!(
                    order_id,
                    new_filled, target, "cumulative fills exceed requested size"
                );
            }
        }

        let complete = target_shares
            .map(|t| new_filled >= t - 1e-9)
            .unwrap_or(false);
        let next_status = if complete {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        if record.mode != TradeMode::Live {
            self.ledger.lock().record_partial_fill();
        }

        self.update_order_status(
            order_id,
            next_status,
            OrderUpdate {
                filled_size: Some(new_filled),
                avg_fill_price: Some(new_avg),
                ..Default::default()
            },
        )
        .await
    }

    // ==================================================================
    // Cancellation
    // ==================================================================

    pub async fn cancel_order(&self, order_id: &str) -> Result<ExecutionResult, ExecError> {
        let record = self
            .store
            .get_order(order_id)
            .await
            .map_err(|e| ExecError::Storage(e.to_string()))?
            .ok_or_else(|| ExecError::NotFound(order_id.to_string()))?;

        if !record.status.can_cancel() {
            return Err(ExecError::InvalidCancelState {
                order_id: order_id.to_string(),
                status: record.status.as_str(),
            });
        }

        let payload = json!({ "order_id": order_id });
        let intent_id = self
            .wal
            .log_intent(IntentKind::Cancel, &record.window_id, &payload)
            .await
            .map_err(|e| ExecError::Storage(format!("cancel intent write failed: {e}")))?;
        self.wal
            .mark_executing(intent_id)
            .await
            .map_err(|e| ExecError::Storage(e.to_string()))?;

        let started = Instant::now();
        if let Err(e) = self.exchange.cancel(order_id).await {
            // the order may still be live on the venue; leave its status
            // untouched
            let msg = e.to_string();
            let _ = self
                .wal
                .mark_failed(intent_id, &format!("SUBMISSION_FAILED: {msg}"))
                .await;
            return Err(ExecError::SubmissionFailed(msg));
        }
        let latency_ms = started.elapsed().as_millis() as u64;

        let updated = self
            .update_order_status(order_id, OrderStatus::Cancelled, OrderUpdate::default())
            .await?;

        let summary = json!({
            "order_id": order_id,
            "status": "cancelled",
            "latency_ms": latency_ms,
        });
        if let Err(e) = self.wal.mark_completed(intent_id, &summary).await {
            warn!(intent_id, error = %e, "cancel intent completion failed");
        }

        info!(order_id, latency_ms, "order cancelled");

        Ok(ExecutionResult {
            order_id: order_id.to_string(),
            status: OrderStatus::Cancelled.as_str().to_string(),
            fill_price: updated.avg_fill_price,
            filled_size: updated.filled_size,
            fee_amount: updated.fee_amount,
            latency_ms,
            intent_id,
            mode: updated.mode,
            order_submitted_to_exchange: Some(true),
            db_write_failed: false,
            submitted_at: None,
            acked_at: None,
            order_book_snapshot: None,
        })
    }

    /// Cancel every open order; used by the kill switch on escalation to
    /// `flatten`. Returns (cancelled ids, failures).
    pub async fn cancel_all(&self) -> (Vec<String>, Vec<(String, String)>) {
        let open = match self.store.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                error!(error = %e, "cancel_all could not enumerate open orders");
                return (Vec::new(), Vec::new());
            }
        };

        let mut cancelled = Vec::new();
        let mut failed = Vec::new();
        for order in open {
            match self.cancel_order(&order.order_id).await {
                Ok(_) => cancelled.push(order.order_id),
                Err(e) => failed.push((order.order_id, e.to_string())),
            }
        }

        if !failed.is_empty() {
            warn!(
                cancelled = cancelled.len(),
                failed = failed.len(),
                "cancel_all finished with failures"
            );
        }
        (cancelled, failed)
    }
}

/// Pick fill data with poll results first, the initial ack second, and the
/// request itself last.
fn extract_fill(
    signal: &TradeSignal,
    final_ack: &OrderAck,
    initial_ack: &OrderAck,
    status: OrderStatus,
) -> (f64, f64, f64) {
    if !matches!(status, OrderStatus::Filled | OrderStatus::PartiallyFilled) {
        return (0.0, 0.0, 0.0);
    }

    let fill_price = final_ack
        .price_filled
        .or(initial_ack.price_filled)
        .or(signal.limit_price)
        .unwrap_or(0.0);

    let reported_shares = final_ack.shares.or(initial_ack.shares);
    let reported_cost = final_ack.cost.or(initial_ack.cost);
    let filled_size = match signal.side {
        Side::Buy => reported_shares
            .or_else(|| {
                reported_cost
                    .filter(|_| fill_price > 0.0)
                    .map(|c| c / fill_price)
            })
            .unwrap_or_else(|| {
                if fill_price > 0.0 {
                    signal.size / fill_price
                } else {
                    0.0
                }
            }),
        Side::Sell => reported_shares.unwrap_or(signal.size),
    };

    let fee = normalize_fee(final_ack.fee.or(initial_ack.fee));
    (round8(fill_price), round8(filled_size), fee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalContext;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    /// Scripted exchange double: queue of responses per call kind.
    struct MockExchange {
        buy_results: PlMutex<Vec<Result<OrderAck, ExchangeError>>>,
        get_order_results: PlMutex<Vec<Result<Option<OrderAck>, ExchangeError>>>,
        cancel_results: PlMutex<Vec<Result<(), ExchangeError>>>,
        balance: PlMutex<Result<f64, String>>,
        best: PlMutex<Option<(f64, f64)>>,
        buy_calls: PlMutex<u32>,
    }

    impl Default for MockExchange {
        fn default() -> Self {
            Self {
                buy_results: PlMutex::new(Vec::new()),
                get_order_results: PlMutex::new(Vec::new()),
                cancel_results: PlMutex::new(Vec::new()),
                balance: PlMutex::new(Ok(0.0)),
                best: PlMutex::new(None),
                buy_calls: PlMutex::new(0),
            }
        }
    }

    impl MockExchange {
        fn new() -> Self {
            Self {
                balance: PlMutex::new(Ok(100.0)),
                best: PlMutex::new(Some((0.48, 0.52))),
                ..Default::default()
            }
        }

        fn push_buy(&self, r: Result<OrderAck, ExchangeError>) {
            self.buy_results.lock().push(r);
        }

        fn push_get_order(&self, r: Result<Option<OrderAck>, ExchangeError>) {
            self.get_order_results.lock().push(r);
        }

        fn ack(order_id: &str, status: &str) -> OrderAck {
            OrderAck {
                order_id: order_id.to_string(),
                status: status.to_string(),
                price_filled: Some(0.52),
                shares: Some(5.77),
                cost: None,
                fee: None,
            }
        }
    }

    #[async_trait]
    impl ExchangeApi for MockExchange {
        async fn place_buy(
            &self,
            _token_id: &str,
            _dollars: f64,
            _limit: Option<f64>,
            _order_type: OrderType,
            _client_order_id: &str,
        ) -> Result<OrderAck, ExchangeError> {
            *self.buy_calls.lock() += 1;
            let mut q = self.buy_results.lock();
            if q.is_empty() {
                return Err(ExchangeError::Submission("no scripted response".into()));
            }
            q.remove(0)
        }

        async fn place_sell(
            &self,
            token_id: &str,
            shares: f64,
            limit: Option<f64>,
            order_type: OrderType,
            client_order_id: &str,
        ) -> Result<OrderAck, ExchangeError> {
            self.place_buy(token_id, shares, limit, order_type, client_order_id)
                .await
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), ExchangeError> {
            let mut q = self.cancel_results.lock();
            if q.is_empty() {
                return Ok(());
            }
            q.remove(0)
        }

        async fn get_order(&self, _order_id: &str) -> Result<Option<OrderAck>, ExchangeError> {
            let mut q = self.get_order_results.lock();
            if q.is_empty() {
                return Ok(None);
            }
            q.remove(0)
        }

        async fn get_order_by_client_id(
            &self,
            client_order_id: &str,
        ) -> Result<Option<OrderAck>, ExchangeError> {
            self.get_order(client_order_id).await
        }

        async fn get_best_prices(
            &self,
            _token_id: &str,
        ) -> Result<crate::models::BestPrices, ExchangeError> {
            match *self.best.lock() {
                Some((bid, ask)) => Ok(crate::models::BestPrices::from_bid_ask(bid, ask)),
                None => Err(ExchangeError::Submission("book unavailable".into())),
            }
        }

        async fn get_balance(&self) -> Result<f64, ExchangeError> {
            self.balance
                .lock()
                .clone()
                .map_err(ExchangeError::Submission)
        }
    }

    struct Harness {
        om: OrderManager,
        exchange: Arc<MockExchange>,
    }

    fn harness() -> Harness {
        let store = TradeStore::open_in_memory().unwrap();
        let wal = IntentLog::new(&store);
        let exchange = Arc::new(MockExchange::new());
        let ledger = Arc::new(parking_lot::Mutex::new(PaperLedger::with_cash(100.0)));
        let (events_tx, _) = broadcast::channel(64);
        let mut config = OrderManagerConfig::default();
        // keep confirmation polling fast in tests
        config.confirm_poll_interval = Duration::from_millis(10);
        config.confirm_poll_budget = Duration::from_millis(50);
        let om = OrderManager::new(store, wal, exchange.clone(), config, ledger, events_tx);
        Harness { om, exchange }
    }

    fn buy_signal() -> TradeSignal {
        TradeSignal {
            token_id: "t1".to_string(),
            side: Side::Buy,
            size: 3.0,
            limit_price: Some(0.52),
            order_type: OrderType::Ioc,
            window_id: "btc-15m-1000".to_string(),
            market_id: "m1".to_string(),
            context: SignalContext::default(),
        }
    }

    #[tokio::test]
    async fn happy_buy_immediate_fill() {
        let h = harness();
        h.exchange
            .push_buy(Ok(MockExchange::ack("o1", "matched")));

        let result = h.om.execute(&buy_signal(), TradeMode::Live).await.unwrap();
        assert_eq!(result.order_id, "o1");
        assert_eq!(result.status, "filled");
        assert_eq!(result.order_submitted_to_exchange, Some(true));
        assert!(!result.db_write_failed);
        assert!((result.filled_size - 5.77).abs() < 1e-9);
        assert!((result.fill_price - 0.52).abs() < 1e-9);

        let rec = h.om.store().get_order("o1").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Filled);
        assert!(rec.filled_at.is_some());

        let intent = h.om.wal().get_intent(result.intent_id).await.unwrap().unwrap();
        assert_eq!(intent.state, crate::store::IntentState::Completed);
    }

    #[tokio::test]
    async fn gtc_delayed_match_via_confirmation_poll() {
        let h = harness();
        h.exchange.push_buy(Ok(MockExchange::ack("o2", "live")));
        h.exchange.push_get_order(Ok(Some(MockExchange::ack("o2", "live"))));
        h.exchange
            .push_get_order(Ok(Some(MockExchange::ack("o2", "matched"))));

        let mut signal = buy_signal();
        signal.order_type = OrderType::Gtc;

        let result = h.om.execute(&signal, TradeMode::Live).await.unwrap();
        assert_eq!(result.status, "filled");

        let rec = h.om.store().get_order("o2").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Filled);
        assert!(rec.filled_at.is_some());
    }

    #[tokio::test]
    async fn confirmation_timeout_leaves_unknown_and_blocks_reentry() {
        let h = harness();
        h.exchange.push_buy(Ok(MockExchange::ack("o3", "live")));
        // every poll keeps reporting live

        let mut signal = buy_signal();
        signal.order_type = OrderType::Gtc;

        let result = h.om.execute(&signal, TradeMode::Live).await.unwrap();
        assert_eq!(result.status, "unknown");

        let rec = h.om.store().get_order("o3").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Unknown);
        assert_eq!(
            rec.error_message.as_deref(),
            Some("Order confirmation timed out")
        );

        // same (window, token) is now gated
        let err = h.om.execute(&signal, TradeMode::Live).await.unwrap_err();
        assert_eq!(err.code(), "CONFIRMATION_TIMEOUT");
    }

    #[tokio::test]
    async fn submission_exception_fails_intent_without_order_row() {
        let h = harness();
        h.exchange
            .push_buy(Err(ExchangeError::Submission("connection refused".into())));

        let err = h.om.execute(&buy_signal(), TradeMode::Live).await.unwrap_err();
        assert_eq!(err.code(), "SUBMISSION_FAILED");

        // no order row was written
        let open = h.om.store().recent_orders(10).await.unwrap();
        assert!(open.is_empty());

        // the place intent is FAILED
        let intents = h.om.wal().intents_for_window("btc-15m-1000").await.unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].state, crate::store::IntentState::Failed);

        // retrying under a fresh intent is allowed
        h.exchange
            .push_buy(Ok(MockExchange::ack("o4", "matched")));
        assert!(h.om.execute(&buy_signal(), TradeMode::Live).await.is_ok());
    }

    #[tokio::test]
    async fn window_cap_blocks_before_exchange_call() {
        let h = harness();
        h.exchange
            .push_buy(Ok(MockExchange::ack("o1", "matched")));
        h.exchange
            .push_buy(Ok(MockExchange::ack("o2", "matched")));

        h.om.execute(&buy_signal(), TradeMode::Live).await.unwrap();
        h.om.execute(&buy_signal(), TradeMode::Live).await.unwrap();

        let calls_before = *h.exchange.buy_calls.lock();
        let err = h.om.execute(&buy_signal(), TradeMode::Live).await.unwrap_err();
        assert_eq!(err.code(), "WINDOW_CAP_EXCEEDED");
        // the third signal never reached the exchange
        assert_eq!(*h.exchange.buy_calls.lock(), calls_before);

        // its intent is logged and FAILED
        let intents = h.om.wal().intents_for_window("btc-15m-1000").await.unwrap();
        assert_eq!(intents.len(), 3);
        assert_eq!(intents[2].state, crate::store::IntentState::Failed);
    }

    #[tokio::test]
    async fn insufficient_balance_denied() {
        let h = harness();
        *h.exchange.balance.lock() = Ok(1.0);
        let err = h.om.execute(&buy_signal(), TradeMode::Live).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    }

    #[tokio::test]
    async fn balance_api_failure_is_fail_open() {
        let h = harness();
        *h.exchange.balance.lock() = Err("balance endpoint down".into());
        h.exchange
            .push_buy(Ok(MockExchange::ack("o1", "matched")));
        assert!(h.om.execute(&buy_signal(), TradeMode::Live).await.is_ok());
    }

    #[tokio::test]
    async fn validation_boundaries() {
        let h = harness();

        let mut s = buy_signal();
        s.limit_price = Some(0.01);
        h.exchange.push_buy(Ok(MockExchange::ack("o1", "matched")));
        assert!(h.om.execute(&s, TradeMode::Live).await.is_ok());

        let mut s = buy_signal();
        s.token_id = "t2".to_string();
        s.limit_price = Some(0.99);
        h.exchange.push_buy(Ok(MockExchange::ack("o2", "matched")));
        assert!(h.om.execute(&s, TradeMode::Live).await.is_ok());

        let mut s = buy_signal();
        s.limit_price = Some(0.0);
        assert_eq!(
            h.om.execute(&s, TradeMode::Live).await.unwrap_err().code(),
            "VALIDATION"
        );

        let mut s = buy_signal();
        s.limit_price = Some(1.0);
        assert_eq!(
            h.om.execute(&s, TradeMode::Live).await.unwrap_err().code(),
            "VALIDATION"
        );

        // size at the cap passes validation; over the cap does not
        let mut s = buy_signal();
        s.token_id = "t3".to_string();
        s.size = 5.0;
        h.exchange.push_buy(Ok(MockExchange::ack("o3", "matched")));
        assert!(h.om.execute(&s, TradeMode::Live).await.is_ok());

        let mut s = buy_signal();
        s.size = 5.0 + 1e-6;
        assert_eq!(
            h.om.execute(&s, TradeMode::Live).await.unwrap_err().code(),
            "VALIDATION"
        );
    }

    #[tokio::test]
    async fn paper_fill_at_ask_with_synthetic_id() {
        let h = harness();
        let result = h.om.execute(&buy_signal(), TradeMode::Paper).await.unwrap();
        assert!(result.order_id.starts_with("paper-"));
        assert_eq!(result.status, "filled");
        assert_eq!(result.order_submitted_to_exchange, Some(false));
        // simulated buys cross the spread at the ask
        assert!((result.fill_price - 0.52).abs() < 1e-9);

        let rec = h.om.store().get_order(&result.order_id).await.unwrap().unwrap();
        assert_eq!(rec.mode, TradeMode::Paper);
    }

    #[tokio::test]
    async fn paper_falls_back_to_limit_without_book() {
        let h = harness();
        *h.exchange.best.lock() = None;
        let result = h.om.execute(&buy_signal(), TradeMode::Paper).await.unwrap();
        assert!((result.fill_price - 0.52).abs() < 1e-9);
    }

    /// Insert an OPEN sell order directly, bypassing execute, so partial
    /// fills can be driven deterministically.
    async fn seed_open_order(h: &Harness, order_id: &str, side: Side, size: f64) -> OrderRecord {
        let now = Utc::now().timestamp();
        let intent_id = h
            .om
            .wal()
            .log_intent(IntentKind::Place, "w", &json!({}))
            .await
            .unwrap();
        h.om.wal().mark_executing(intent_id).await.unwrap();
        let rec = OrderRecord {
            order_id: order_id.to_string(),
            intent_id,
            window_id: "w".to_string(),
            market_id: "m1".to_string(),
            token_id: "t1".to_string(),
            side,
            order_type: OrderType::Gtc,
            limit_price: Some(0.50),
            size,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            fee_amount: 0.0,
            status: OrderStatus::Open,
            mode: TradeMode::Live,
            submitted_at: Some(now),
            acked_at: Some(now),
            filled_at: None,
            cancelled_at: None,
            error_message: None,
            position_id: None,
            symbol: None,
            strategy_id: None,
            model_prob: None,
            edge: None,
            token_side: None,
            book_snapshot: None,
            created_at: now,
            updated_at: now,
        };
        h.om.store().insert_order(&rec).await.unwrap();
        rec
    }

    #[tokio::test]
    async fn partial_fill_rejected_on_terminal_order() {
        let h = harness();
        seed_open_order(&h, "o5", Side::Sell, 10.0).await;
        h.om.update_order_status("o5", OrderStatus::Cancelled, OrderUpdate::default())
            .await
            .unwrap();

        let err = h.om.handle_partial_fill("o5", 4.0, 0.50).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn partial_fill_math_on_open_order() {
        let h = harness();
        seed_open_order(&h, "o7", Side::Sell, 10.0).await;

        let after = h.om.handle_partial_fill("o7", 4.0, 0.40).await.unwrap();
        assert_eq!(after.status, OrderStatus::PartiallyFilled);
        assert!((after.avg_fill_price - 0.40).abs() < 1e-9);

        let after = h.om.handle_partial_fill("o7", 6.0, 0.50).await.unwrap();
        assert_eq!(after.status, OrderStatus::Filled);
        assert!(after.filled_at.is_some());
        // weighted mean: (4*0.40 + 6*0.50) / 10 = 0.46
        assert!((after.avg_fill_price - 0.46).abs() < 1e-8);

        // terminal transition closed the parent intent
        let intent = h.om.wal().get_intent(after.intent_id).await.unwrap().unwrap();
        assert_eq!(intent.state, crate::store::IntentState::Completed);
    }

    #[tokio::test]
    async fn partial_fill_validates_inputs() {
        let h = harness();
        seed_open_order(&h, "o7b", Side::Sell, 10.0).await;

        assert_eq!(
            h.om.handle_partial_fill("o7b", 0.0, 0.50).await.unwrap_err().code(),
            "VALIDATION"
        );
        assert_eq!(
            h.om.handle_partial_fill("o7b", 1.0, 0.005).await.unwrap_err().code(),
            "VALIDATION"
        );
    }

    #[tokio::test]
    async fn cancel_requires_cancellable_state() {
        let h = harness();
        h.exchange
            .push_buy(Ok(MockExchange::ack("o8", "matched")));
        h.om.execute(&buy_signal(), TradeMode::Live).await.unwrap();

        let err = h.om.cancel_order("o8").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_CANCEL_STATE");
    }

    #[tokio::test]
    async fn cancel_success_and_failure_paths() {
        let h = harness();
        seed_open_order(&h, "o9", Side::Buy, 3.0).await;
        assert!(h.om.cancel_order("o9").await.is_ok());
        let rec = h.om.store().get_order("o9").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Cancelled);
        assert!(rec.cancelled_at.is_some());

        // API failure: cancel intent FAILED, order status untouched
        seed_open_order(&h, "o11", Side::Buy, 3.0).await;
        h.exchange
            .cancel_results
            .lock()
            .push(Err(ExchangeError::Submission("cancel endpoint down".into())));

        let err = h.om.cancel_order("o11").await.unwrap_err();
        assert_eq!(err.code(), "SUBMISSION_FAILED");
        // order may still be live on the venue
        let rec = h.om.store().get_order("o11").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn cancel_all_sweeps_open_orders() {
        let h = harness();
        seed_open_order(&h, "c1", Side::Buy, 3.0).await;
        seed_open_order(&h, "c2", Side::Sell, 5.0).await;

        let (cancelled, failed) = h.om.cancel_all().await;
        assert_eq!(cancelled.len(), 2);
        assert!(failed.is_empty());
        assert!(h.om.store().open_orders().await.unwrap().is_empty());
    }

    #[test]
    fn fee_normalization() {
        assert_eq!(normalize_fee(Some(0.03)), 0.03);
        assert!((normalize_fee(Some(15_000.0)) - 0.015).abs() < 1e-12);
        assert_eq!(normalize_fee(Some(-1.0)), 0.0);
        assert_eq!(normalize_fee(None), 0.0);
    }

    #[test]
    fn round8_kills_drift() {
        let x = 0.1 + 0.2;
        assert_eq!(round8(x), 0.3);
    }
}
