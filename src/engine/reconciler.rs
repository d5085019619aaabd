//! Startup reconciler.
//!
//! Runs before any new signal is admitted. Three gaps can exist after a
//! crash or an ambiguous exchange response:
//!
//! 1. intents stranded in EXECUTING - the venue may or may not have the
//!    order; look it up by clientOrderId (the intent id) and settle the
//!    intent either way
//! 2. orders stuck in UNKNOWN - confirmation polling timed out earlier;
//!    re-query and drive them to a terminal status
//! 3. COMPLETED place intents whose order row insert failed
//!    (`db_write_failed`) - pull the order from the venue and insert the
//!    missing row

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::order_manager::OrderManager;
use crate::engine::status::{exchange_status_is_terminal, map_exchange_status, OrderStatus};
use crate::exchange::{ExchangeApi, OrderAck};
use crate::models::{TradeMode, TradeSignal};
use crate::store::{
    IntentKind, IntentLog, IntentRecord, OrderRecord, OrderUpdate, TradeStore,
};

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub intents_completed: u32,
    pub intents_failed: u32,
    pub intents_unresolved: u32,
    pub orders_inserted: u32,
    pub unknowns_resolved: u32,
    pub unknowns_remaining: u32,
}

pub struct Reconciler {
    store: TradeStore,
    wal: IntentLog,
    exchange: Arc<dyn ExchangeApi>,
    orders: Arc<OrderManager>,
}

impl Reconciler {
    pub fn new(
        store: TradeStore,
        wal: IntentLog,
        exchange: Arc<dyn ExchangeApi>,
        orders: Arc<OrderManager>,
    ) -> Self {
        Self {
            store,
            wal,
            exchange,
            orders,
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        self.settle_executing_intents(&mut report).await?;
        self.resolve_unknown_orders(&mut report).await?;
        self.backfill_missing_order_rows(&mut report).await?;

        info!(
            intents_completed = report.intents_completed,
            intents_failed = report.intents_failed,
            intents_unresolved = report.intents_unresolved,
            orders_inserted = report.orders_inserted,
            unknowns_resolved = report.unknowns_resolved,
            unknowns_remaining = report.unknowns_remaining,
            "startup reconciliation finished"
        );
        Ok(report)
    }

    async fn settle_executing_intents(&self, report: &mut ReconcileReport) -> Result<()> {
        let stranded = self.wal.executing_intents().await?;
        for intent in stranded {
            match intent.kind {
                IntentKind::Place => self.settle_place_intent(&intent, report).await,
                IntentKind::Cancel => self.settle_cancel_intent(&intent, report).await,
            }
        }
        Ok(())
    }

    async fn settle_place_intent(&self, intent: &IntentRecord, report: &mut ReconcileReport) {
        let client_id = intent.intent_id.to_string();
        match self.exchange.get_order_by_client_id(&client_id).await {
            Ok(Some(ack)) => {
                // the venue has it; make sure we have a row, then close the
                // intent with what was observed
                let have_row = self
                    .store
                    .order_by_intent(intent.intent_id)
                    .await
                    .ok()
                    .flatten()
                    .is_some();
                if !have_row {
                    if let Some(record) = order_record_from_intent(intent, &ack) {
                        match self.store.insert_order(&record).await {
                            Ok(()) => report.orders_inserted += 1,
                            Err(e) => {
                                warn!(intent_id = intent.intent_id, error = %e, "reconciled order insert failed")
                            }
                        }
                    }
                }
                let summary = json!({
                    "order_id": ack.order_id,
                    "status": ack.status,
                    "reconciled": true,
                });
                if self.wal.mark_completed(intent.intent_id, &summary).await.is_ok() {
                    report.intents_completed += 1;
                }
                info!(
                    intent_id = intent.intent_id,
                    order_id = %ack.order_id,
                    "stranded place intent reconciled against venue"
                );
            }
            Ok(None) => {
                // the venue never saw it; the action definitively failed
                if self
                    .wal
                    .mark_failed(intent.intent_id, "reconciler: no exchange record")
                    .await
                    .is_ok()
                {
                    report.intents_failed += 1;
                }
            }
            Err(e) => {
                warn!(intent_id = intent.intent_id, error = %e, "reconciliation lookup failed; leaving EXECUTING");
                report.intents_unresolved += 1;
            }
        }
    }

    async fn settle_cancel_intent(&self, intent: &IntentRecord, report: &mut ReconcileReport) {
        let Some(order_id) = intent
            .payload
            .get("order_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            warn!(intent_id = intent.intent_id, "cancel intent without order id");
            let _ = self
                .wal
                .mark_failed(intent.intent_id, "reconciler: malformed cancel payload")
                .await;
            report.intents_failed += 1;
            return;
        };

        match self.exchange.get_order(&order_id).await {
            Ok(Some(ack)) if exchange_status_is_terminal(&ack.status) => {
                // the cancel (or a fill) landed; reflect it on the row
                let target = if ack.status.eq_ignore_ascii_case("matched") {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Cancelled
                };
                if let Err(e) = self
                    .orders
                    .update_order_status(&order_id, target, OrderUpdate::default())
                    .await
                {
                    warn!(order_id = %order_id, error = %e, "cancel reconciliation transition failed");
                }
                let _ = self
                    .wal
                    .mark_completed(
                        intent.intent_id,
                        &json!({"order_id": order_id, "status": ack.status, "reconciled": true}),
                    )
                    .await;
                report.intents_completed += 1;
            }
            Ok(_) => {
                // still live or gone: the cancel did not take effect
                let _ = self
                    .wal
                    .mark_failed(intent.intent_id, "reconciler: cancel not effective")
                    .await;
                report.intents_failed += 1;
            }
            Err(e) => {
                warn!(intent_id = intent.intent_id, error = %e, "cancel reconciliation lookup failed");
                report.intents_unresolved += 1;
            }
        }
    }

    async fn resolve_unknown_orders(&self, report: &mut ReconcileReport) -> Result<()> {
        let unknowns = self.store.orders_with_status(OrderStatus::Unknown).await?;
        for order in unknowns {
            match self.exchange.get_order(&order.order_id).await {
                Ok(Some(ack)) if exchange_status_is_terminal(&ack.status) => {
                    let target = map_exchange_status(&ack.status, order.order_type);
                    // UNKNOWN may only resolve to filled/cancelled/expired
                    let target = if order.status.can_transition_to(target) {
                        target
                    } else {
                        OrderStatus::Cancelled
                    };
                    let mut update = OrderUpdate::default();
                    if target == OrderStatus::Filled {
                        update.filled_size = ack.shares;
                        update.avg_fill_price = ack.price_filled;
                    }
                    match self
                        .orders
                        .update_order_status(&order.order_id, target, update)
                        .await
                    {
                        Ok(_) => {
                            report.unknowns_resolved += 1;
                            info!(
                                order_id = %order.order_id,
                                status = target.as_str(),
                                "UNKNOWN order resolved"
                            );
                        }
                        Err(e) => {
                            warn!(order_id = %order.order_id, error = %e, "UNKNOWN resolution failed")
                        }
                    }
                }
                Ok(Some(_)) => {
                    // still live on the venue; keep the gate closed
                    report.unknowns_remaining += 1;
                }
                Ok(None) => {
                    // no record: the venue dropped it
                    match self
                        .orders
                        .update_order_status(
                            &order.order_id,
                            OrderStatus::Cancelled,
                            OrderUpdate {
                                error_message: Some("reconciler: no exchange record".to_string()),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        Ok(_) => report.unknowns_resolved += 1,
                        Err(e) => {
                            warn!(order_id = %order.order_id, error = %e, "UNKNOWN cleanup failed")
                        }
                    }
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "UNKNOWN lookup failed");
                    report.unknowns_remaining += 1;
                }
            }
        }
        Ok(())
    }

    async fn backfill_missing_order_rows(&self, report: &mut ReconcileReport) -> Result<()> {
        let recent = self.wal.recent_completed_intents(500).await?;
        for intent in recent {
            let Some(order_id) = intent
                .result
                .as_ref()
                .and_then(|r| r.get("order_id"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
            else {
                continue;
            };
            if self
                .store
                .get_order(&order_id)
                .await
                .ok()
                .flatten()
                .is_some()
            {
                continue;
            }

            match self.exchange.get_order(&order_id).await {
                Ok(Some(ack)) => {
                    if let Some(record) = order_record_from_intent(&intent, &ack) {
                        match self.store.insert_order(&record).await {
                            Ok(()) => {
                                report.orders_inserted += 1;
                                info!(order_id = %order_id, "backfilled order row lost to a failed write");
                            }
                            Err(e) => {
                                warn!(order_id = %order_id, error = %e, "order backfill insert failed")
                            }
                        }
                    }
                }
                Ok(None) => {
                    warn!(order_id = %order_id, "completed intent references an order the venue no longer reports");
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "order backfill lookup failed");
                }
            }
        }
        Ok(())
    }
}

/// Rebuild an order row from a place intent's payload plus the venue's
/// current view of the order.
fn order_record_from_intent(intent: &IntentRecord, ack: &OrderAck) -> Option<OrderRecord> {
    let signal: TradeSignal =
        serde_json::from_value(intent.payload.get("signal")?.clone()).ok()?;
    let mode = intent
        .payload
        .get("mode")
        .and_then(|v| v.as_str())
        .and_then(TradeMode::parse)
        .unwrap_or(TradeMode::Live);

    let status = map_exchange_status(&ack.status, signal.order_type);
    let fill_price = ack.price_filled.unwrap_or(signal.limit_price.unwrap_or(0.0));
    let filled_size = ack.shares.unwrap_or(0.0);
    let now = Utc::now().timestamp();

    Some(OrderRecord {
        order_id: ack.order_id.clone(),
        intent_id: intent.intent_id,
        window_id: signal.window_id.clone(),
        market_id: signal.market_id.clone(),
        token_id: signal.token_id.clone(),
        side: signal.side,
        order_type: signal.order_type,
        limit_price: signal.limit_price,
        size: signal.size,
        filled_size,
        avg_fill_price: fill_price,
        fee_amount: ack.fee.unwrap_or(0.0),
        status,
        mode,
        submitted_at: Some(intent.created_at),
        acked_at: Some(now),
        filled_at: (status == OrderStatus::Filled).then_some(now),
        cancelled_at: matches!(status, OrderStatus::Cancelled | OrderStatus::Rejected)
            .then_some(now),
        error_message: Some("inserted by reconciler".to_string()),
        position_id: None,
        symbol: signal.context.symbol.clone(),
        strategy_id: signal.context.strategy_id.clone(),
        model_prob: signal.context.model_prob,
        edge: signal.context.edge,
        token_side: signal.context.token_side.clone(),
        book_snapshot: None,
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ledger::PaperLedger;
    use crate::engine::order_manager::OrderManagerConfig;
    use crate::exchange::ExchangeError;
    use crate::models::{BestPrices, OrderType, Side, SignalContext};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;

    /// Venue double with a fixed order table keyed by both order id and
    /// client id.
    #[derive(Default)]
    struct TableExchange {
        by_client: PlMutex<HashMap<String, OrderAck>>,
        by_order: PlMutex<HashMap<String, OrderAck>>,
    }

    #[async_trait]
    impl ExchangeApi for TableExchange {
        async fn place_buy(
            &self,
            _t: &str,
            _d: f64,
            _l: Option<f64>,
            _o: OrderType,
            _c: &str,
        ) -> Result<OrderAck, ExchangeError> {
            Err(ExchangeError::Submission("not used".into()))
        }

        async fn place_sell(
            &self,
            _t: &str,
            _s: f64,
            _l: Option<f64>,
            _o: OrderType,
            _c: &str,
        ) -> Result<OrderAck, ExchangeError> {
            Err(ExchangeError::Submission("not used".into()))
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn get_order(&self, order_id: &str) -> Result<Option<OrderAck>, ExchangeError> {
            Ok(self.by_order.lock().get(order_id).cloned())
        }

        async fn get_order_by_client_id(
            &self,
            client_order_id: &str,
        ) -> Result<Option<OrderAck>, ExchangeError> {
            Ok(self.by_client.lock().get(client_order_id).cloned())
        }

        async fn get_best_prices(&self, _t: &str) -> Result<BestPrices, ExchangeError> {
            Ok(BestPrices::from_bid_ask(0.48, 0.52))
        }

        async fn get_balance(&self) -> Result<f64, ExchangeError> {
            Ok(1000.0)
        }
    }

    struct Rig {
        store: TradeStore,
        wal: IntentLog,
        exchange: Arc<TableExchange>,
        reconciler: Reconciler,
    }

    fn rig() -> Rig {
        let store = TradeStore::open_in_memory().unwrap();
        let wal = IntentLog::new(&store);
        let exchange = Arc::new(TableExchange::default());
        let ledger = Arc::new(parking_lot::Mutex::new(PaperLedger::with_cash(100.0)));
        let (events_tx, _) = tokio::sync::broadcast::channel(16);
        let orders = Arc::new(OrderManager::new(
            store.clone(),
            wal.clone(),
            exchange.clone(),
            OrderManagerConfig::default(),
            ledger,
            events_tx,
        ));
        let reconciler = Reconciler::new(store.clone(), wal.clone(), exchange.clone(), orders);
        Rig {
            store,
            wal,
            exchange,
            reconciler,
        }
    }

    fn place_payload() -> serde_json::Value {
        let signal = TradeSignal {
            token_id: "t1".to_string(),
            side: Side::Buy,
            size: 3.0,
            limit_price: Some(0.52),
            order_type: OrderType::Gtc,
            window_id: "btcusdt-15m-900".to_string(),
            market_id: "m1".to_string(),
            context: SignalContext::default(),
        };
        json!({"signal": signal, "mode": "LIVE"})
    }

    fn matched_ack(order_id: &str) -> OrderAck {
        OrderAck {
            order_id: order_id.to_string(),
            status: "matched".to_string(),
            price_filled: Some(0.52),
            shares: Some(5.77),
            cost: None,
            fee: None,
        }
    }

    #[tokio::test]
    async fn stranded_intent_with_venue_record_completes_and_inserts() {
        let r = rig();
        let intent_id = r
            .wal
            .log_intent(IntentKind::Place, "btcusdt-15m-900", &place_payload())
            .await
            .unwrap();
        r.wal.mark_executing(intent_id).await.unwrap();
        r.exchange
            .by_client
            .lock()
            .insert(intent_id.to_string(), matched_ack("o1"));

        let report = r.reconciler.run().await.unwrap();
        assert_eq!(report.intents_completed, 1);
        assert_eq!(report.orders_inserted, 1);

        let rec = r.store.get_order("o1").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Filled);
        assert_eq!(rec.intent_id, intent_id);

        let intent = r.wal.get_intent(intent_id).await.unwrap().unwrap();
        assert_eq!(intent.state, crate::store::IntentState::Completed);
    }

    #[tokio::test]
    async fn stranded_intent_without_venue_record_fails() {
        let r = rig();
        let intent_id = r
            .wal
            .log_intent(IntentKind::Place, "w", &place_payload())
            .await
            .unwrap();
        r.wal.mark_executing(intent_id).await.unwrap();

        let report = r.reconciler.run().await.unwrap();
        assert_eq!(report.intents_failed, 1);
        let intent = r.wal.get_intent(intent_id).await.unwrap().unwrap();
        assert_eq!(intent.state, crate::store::IntentState::Failed);
    }

    #[tokio::test]
    async fn unknown_order_resolves_to_filled() {
        let r = rig();
        let intent_id = r
            .wal
            .log_intent(IntentKind::Place, "w", &place_payload())
            .await
            .unwrap();
        r.wal.mark_executing(intent_id).await.unwrap();

        let now = Utc::now().timestamp();
        let rec = OrderRecord {
            order_id: "o2".to_string(),
            intent_id,
            window_id: "w".to_string(),
            market_id: "m1".to_string(),
            token_id: "t1".to_string(),
            side: Side::Buy,
            order_type: OrderType::Gtc,
            limit_price: Some(0.52),
            size: 3.0,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            fee_amount: 0.0,
            status: OrderStatus::Unknown,
            mode: TradeMode::Live,
            submitted_at: Some(now),
            acked_at: Some(now),
            filled_at: None,
            cancelled_at: None,
            error_message: Some("Order confirmation timed out".to_string()),
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
        r.store.insert_order(&rec).await.unwrap();
        r.exchange.by_order.lock().insert("o2".to_string(), matched_ack("o2"));

        let report = r.reconciler.run().await.unwrap();
        assert_eq!(report.unknowns_resolved, 1);

        let rec = r.store.get_order("o2").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Filled);
        assert!((rec.filled_size - 5.77).abs() < 1e-9);
        assert!(rec.filled_at.is_some());
    }

    #[tokio::test]
    async fn db_write_failed_gap_is_backfilled() {
        let r = rig();
        // a completed intent whose order row never landed
        let intent_id = r
            .wal
            .log_intent(IntentKind::Place, "btcusdt-15m-900", &place_payload())
            .await
            .unwrap();
        r.wal.mark_executing(intent_id).await.unwrap();
        r.wal
            .mark_completed(
                intent_id,
                &json!({"order_id": "o3", "status": "filled", "db_write_failed": true}),
            )
            .await
            .unwrap();
        r.exchange.by_order.lock().insert("o3".to_string(), matched_ack("o3"));

        let report = r.reconciler.run().await.unwrap();
        assert_eq!(report.orders_inserted, 1);

        let rec = r.store.get_order("o3").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Filled);
        assert_eq!(rec.intent_id, intent_id);
    }
}
