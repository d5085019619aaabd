//! Position manager.
//!
//! Consumes fills from the order manager, opens and updates positions, runs
//! the trailing-stop / stop-loss monitor on every price update, and settles
//! or force-closes positions when their window ends. Exits always go back
//! through the order manager; this module never talks to the exchange.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::engine::ledger::PaperLedger;
use crate::engine::order_manager::OrderManager;
use crate::errors::ExecError;
use crate::models::{Direction, OrderType, Side, SignalContext, TradeMode, TradeSignal};
use crate::store::{OrderRecord, PositionLifecycle, PositionRecord, TradeStore};
use crate::window::WindowClosed;

#[derive(Debug, Clone)]
pub struct PositionConfig {
    /// PnL fraction that arms the trailing stop.
    pub trailing_activation_pct: f64,
    /// Stop distance below the high-water mark once trailing.
    pub trailing_pct: f64,
    /// Trailing stop never drops below entry * (1 + floor).
    pub profit_floor_pct: f64,
    /// Hard stop-loss as a PnL fraction.
    pub stop_loss_pct: f64,
    /// Minimum PnL on the opposite side before a reversal closes it.
    pub reversal_threshold_pct: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            trailing_activation_pct: 0.10,
            trailing_pct: 0.05,
            profit_floor_pct: 0.02,
            stop_loss_pct: 0.15,
            reversal_threshold_pct: 0.0,
        }
    }
}

impl PositionConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let read = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<f64>().ok());
        if let Some(v) = read("TRAILING_ACTIVATION_PCT").filter(|v| *v > 0.0) {
            cfg.trailing_activation_pct = v;
        }
        if let Some(v) = read("TRAILING_PCT").filter(|v| *v > 0.0) {
            cfg.trailing_pct = v;
        }
        if let Some(v) = read("PROFIT_FLOOR_PCT").filter(|v| *v >= 0.0) {
            cfg.profit_floor_pct = v;
        }
        if let Some(v) = read("STOP_LOSS_PCT").filter(|v| *v > 0.0) {
            cfg.stop_loss_pct = v;
        }
        if let Some(v) = read("REVERSAL_THRESHOLD_PCT") {
            cfg.reversal_threshold_pct = v;
        }
        cfg
    }
}

/// What to do with a signal whose opposite side is already held.
#[derive(Debug, Clone)]
pub enum OppositeDecision {
    /// No opposite position; proceed.
    Allow,
    /// Opposite side is profitable enough; close it, then enter.
    CloseFirst(Box<PositionRecord>),
    /// Opposite side is under water; block the new signal.
    Block { reason: &'static str },
}

pub struct PositionManager {
    store: TradeStore,
    orders: Arc<OrderManager>,
    ledger: Arc<parking_lot::Mutex<PaperLedger>>,
    config: PositionConfig,
}

fn position_id(symbol: &str, epoch: i64, direction: Direction) -> String {
    format!(
        "{}-{}-{}",
        symbol.to_ascii_lowercase(),
        epoch,
        direction.as_str().to_ascii_lowercase()
    )
}

fn epoch_from_window_id(window_id: &str) -> Option<i64> {
    window_id.rsplit('-').next()?.parse().ok()
}

impl PositionManager {
    pub fn new(
        store: TradeStore,
        orders: Arc<OrderManager>,
        ledger: Arc<parking_lot::Mutex<PaperLedger>>,
        config: PositionConfig,
    ) -> Self {
        Self {
            store,
            orders,
            ledger,
            config,
        }
    }

    // ==================================================================
    // Fill intake
    // ==================================================================

    /// Fold a filled (or partially filled) order into position state.
    pub async fn on_fill(&self, order: &OrderRecord) -> Result<()> {
        if order.filled_size <= 0.0 {
            return Ok(());
        }
        let Some(symbol) = order.symbol.clone() else {
            debug!(order_id = %order.order_id, "fill without symbol context; skipping");
            return Ok(());
        };
        let Some(epoch) = epoch_from_window_id(&order.window_id) else {
            warn!(order_id = %order.order_id, window_id = %order.window_id, "unparseable window id");
            return Ok(());
        };
        let direction = match order.token_side.as_deref() {
            Some("UP") => Direction::Up,
            Some("DOWN") => Direction::Down,
            _ => {
                debug!(order_id = %order.order_id, "fill without token side; skipping");
                return Ok(());
            }
        };

        match order.side {
            Side::Buy => self.open_or_add(order, &symbol, epoch, direction).await,
            Side::Sell => self.reduce(order, &symbol, epoch, direction).await,
        }
    }

    async fn open_or_add(
        &self,
        order: &OrderRecord,
        symbol: &str,
        epoch: i64,
        direction: Direction,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let id = position_id(symbol, epoch, direction);

        let mut pos = match self.store.get_position(&id).await? {
            Some(existing) if existing.lifecycle.is_open() => existing,
            _ => PositionRecord {
                id: id.clone(),
                symbol: symbol.to_string(),
                epoch,
                token_id: order.token_id.clone(),
                direction,
                mode: order.mode,
                shares: 0.0,
                avg_entry: order.avg_fill_price,
                high_water_mark: order.avg_fill_price,
                trailing_active: false,
                trailing_activation_price: None,
                stop_price: None,
                peak_pnl_pct: 0.0,
                stop_loss_triggered: false,
                lifecycle: PositionLifecycle::Entry,
                opened_at: now,
                closed_at: None,
                updated_at: now,
            },
        };

        let new_shares = pos.shares + order.filled_size;
        pos.avg_entry = if new_shares > 0.0 {
            (pos.shares * pos.avg_entry + order.filled_size * order.avg_fill_price) / new_shares
        } else {
            order.avg_fill_price
        };
        pos.shares = new_shares;
        pos.high_water_mark = pos.high_water_mark.max(order.avg_fill_price);
        if pos.lifecycle == PositionLifecycle::Entry {
            pos.lifecycle = PositionLifecycle::Monitoring;
        }
        pos.updated_at = now;

        info!(
            position_id = %pos.id,
            shares = pos.shares,
            avg_entry = pos.avg_entry,
            mode = pos.mode.as_str(),
            "position opened/increased"
        );
        self.store.upsert_position(&pos).await
    }

    async fn reduce(
        &self,
        order: &OrderRecord,
        symbol: &str,
        epoch: i64,
        direction: Direction,
    ) -> Result<()> {
        let id = position_id(symbol, epoch, direction);
        let Some(mut pos) = self.store.get_position(&id).await? else {
            warn!(order_id = %order.order_id, position_id = %id, "sell fill for unknown position");
            return Ok(());
        };

        let now = Utc::now().timestamp();
        pos.shares = (pos.shares - order.filled_size).max(0.0);
        pos.updated_at = now;
        if pos.shares <= 1e-9 {
            pos.shares = 0.0;
            pos.lifecycle = PositionLifecycle::Closed;
            pos.closed_at = Some(now);
            info!(position_id = %pos.id, "position closed by exit fill");
        }
        self.store.upsert_position(&pos).await
    }

    // ==================================================================
    // Price monitoring
    // ==================================================================

    /// Evaluate stops for every open position on this token. `price` is the
    /// current bid for the held token (what an exit would realize).
    pub async fn on_price(&self, token_id: &str, price: f64, _now: i64) -> Result<()> {
        if !(0.0..=1.0).contains(&price) {
            return Ok(());
        }
        let open = self.store.open_positions().await?;
        for pos in open {
            if pos.token_id != token_id || pos.lifecycle == PositionLifecycle::ExitPending {
                continue;
            }
            if let Err(e) = self.evaluate_position(pos, price).await {
                warn!(error = %e, "position evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate_position(&self, mut pos: PositionRecord, price: f64) -> Result<()> {
        let now = Utc::now().timestamp();
        let entry = pos.avg_entry.max(1e-9);
        let pnl_pct = (price - entry) / entry;

        pos.high_water_mark = pos.high_water_mark.max(price);
        pos.peak_pnl_pct = pos.peak_pnl_pct.max(pnl_pct);

        if !pos.trailing_active && pnl_pct >= self.config.trailing_activation_pct {
            pos.trailing_active = true;
            pos.trailing_activation_price = Some(price);
            info!(
                position_id = %pos.id,
                pnl_pct,
                "trailing stop armed"
            );
        }

        let mut exit_reason: Option<&'static str> = None;

        if pos.trailing_active {
            let stop = (pos.high_water_mark * (1.0 - self.config.trailing_pct))
                .max(entry * (1.0 + self.config.profit_floor_pct));
            pos.stop_price = Some(stop);
            if price <= stop {
                pos.lifecycle = PositionLifecycle::TpTriggered;
                exit_reason = Some("trailing_stop");
            }
        }

        if exit_reason.is_none()
            && pnl_pct <= -self.config.stop_loss_pct
            && !pos.stop_loss_triggered
        {
            pos.stop_loss_triggered = true;
            pos.lifecycle = PositionLifecycle::StopTriggered;
            exit_reason = Some("stop_loss");
        }

        pos.updated_at = now;

        if let Some(reason) = exit_reason {
            info!(
                position_id = %pos.id,
                reason,
                price,
                pnl_pct,
                "exit triggered"
            );
            self.store.upsert_position(&pos).await?;
            self.place_exit(&pos, price, reason).await?;
        } else {
            self.store.upsert_position(&pos).await?;
        }
        Ok(())
    }

    /// Sell the full held size through the order manager; on success the
    /// lifecycle moves to EXIT_PENDING.
    async fn place_exit(&self, pos: &PositionRecord, price: f64, reason: &'static str) -> Result<()> {
        let signal = TradeSignal {
            token_id: pos.token_id.clone(),
            side: Side::Sell,
            size: pos.shares,
            limit_price: Some(price.clamp(0.01, 0.99)),
            order_type: OrderType::Ioc,
            window_id: crate::window::window_id(&pos.symbol, pos.epoch),
            market_id: pos.symbol.to_ascii_lowercase(),
            context: SignalContext {
                symbol: Some(pos.symbol.clone()),
                strategy_id: Some(format!("position_exit:{reason}")),
                model_prob: None,
                edge: None,
                token_side: Some(pos.direction.as_str().to_string()),
            },
        };

        match self.orders.execute(&signal, pos.mode).await {
            Ok(result) => {
                let mut updated = pos.clone();
                updated.lifecycle = PositionLifecycle::ExitPending;
                updated.updated_at = Utc::now().timestamp();
                self.store.upsert_position(&updated).await?;
                debug!(
                    position_id = %pos.id,
                    order_id = %result.order_id,
                    "exit order placed"
                );
            }
            Err(ExecError::Busy) => {
                // retried on the next price update
                warn!(position_id = %pos.id, "order manager busy; exit deferred");
            }
            Err(e) => {
                warn!(position_id = %pos.id, code = e.code(), error = %e, "exit order failed");
            }
        }
        Ok(())
    }

    /// Kill-switch `flatten`: exit every open position at a best-effort
    /// limit. Exits that fail stay open and are retried by the price
    /// monitor or swept at window close.
    pub async fn flatten_all(&self) -> Result<()> {
        for pos in self.store.open_positions().await? {
            if pos.shares > 0.0 && pos.lifecycle != PositionLifecycle::ExitPending {
                let limit = pos.avg_entry.clamp(0.01, 0.99);
                self.place_exit(&pos, limit, "flatten").await?;
            }
        }
        Ok(())
    }

    // ==================================================================
    // Opposite-signal resolution
    // ==================================================================

    /// Resolve a buy signal against a held position on the other side of
    /// the same (symbol, epoch).
    pub async fn check_opposite(
        &self,
        symbol: &str,
        epoch: i64,
        direction: Direction,
        current_opposite_price: Option<f64>,
    ) -> Result<OppositeDecision> {
        let opposite_dir = match direction {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        };
        let Some(pos) = self.store.position_for(symbol, epoch, opposite_dir).await? else {
            return Ok(OppositeDecision::Allow);
        };
        if !pos.lifecycle.is_open() || pos.shares <= 0.0 {
            return Ok(OppositeDecision::Allow);
        }

        let entry = pos.avg_entry.max(1e-9);
        let pnl_pct = current_opposite_price
            .map(|p| (p - entry) / entry)
            .unwrap_or(f64::MIN);

        if pnl_pct >= self.config.reversal_threshold_pct {
            Ok(OppositeDecision::CloseFirst(Box::new(pos)))
        } else {
            Ok(OppositeDecision::Block {
                reason: "opposite_position_unprofitable",
            })
        }
    }

    /// Close a profitable opposite position ahead of a reversal entry.
    pub async fn close_for_reversal(&self, pos: &PositionRecord, price: f64) -> Result<()> {
        self.place_exit(pos, price, "reversal").await
    }

    // ==================================================================
    // Window close & orphan sweep
    // ==================================================================

    /// Settle every open position bound to a closed window: winning shares
    /// pay out $1, losing shares expire worthless. Positions that were
    /// mid-exit are swept as orphans.
    pub async fn on_window_closed(&self, event: &WindowClosed) -> Result<()> {
        let open = self.store.open_positions().await?;
        let now = Utc::now().timestamp();

        for mut pos in open {
            if pos.symbol != event.symbol || pos.epoch != event.epoch {
                continue;
            }

            let won = event.outcome == Some(pos.direction);
            let payout_per_share = if won { 1.0 } else { 0.0 };
            let payout = pos.shares * payout_per_share;

            if pos.mode != TradeMode::Live && payout > 0.0 {
                let mut ledger = self.ledger.lock();
                ledger.cash_usd += payout;
                ledger.positions.remove(&pos.token_id);
            }

            let orphaned = pos.lifecycle == PositionLifecycle::ExitPending;
            pos.lifecycle = PositionLifecycle::Closed;
            pos.closed_at = Some(now);
            pos.updated_at = now;
            self.store.upsert_position(&pos).await?;

            info!(
                position_id = %pos.id,
                won,
                payout,
                orphaned,
                outcome = ?event.outcome,
                "position settled at window close"
            );
        }

        // stragglers from earlier windows that never settled
        let orphans = self.store.orphan_positions(event.epoch).await?;
        for mut pos in orphans {
            warn!(position_id = %pos.id, epoch = pos.epoch, "sweeping orphan position");
            pos.lifecycle = PositionLifecycle::Closed;
            pos.closed_at = Some(now);
            pos.updated_at = now;
            self.store.upsert_position(&pos).await?;
        }

        Ok(())
    }

    /// Event loop: fills from the order manager, closes from the window
    /// manager.
    pub async fn run(
        self: Arc<Self>,
        mut fills: broadcast::Receiver<OrderRecord>,
        mut windows: broadcast::Receiver<WindowClosed>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("position manager running");
        loop {
            tokio::select! {
                fill = fills.recv() => {
                    match fill {
                        Ok(order) => {
                            if let Err(e) = self.on_fill(&order).await {
                                warn!(error = %e, "fill processing failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "position manager lagged on fills");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                closed = windows.recv() => {
                    match closed {
                        Ok(event) => {
                            if let Err(e) = self.on_window_closed(&event).await {
                                warn!(error = %e, "window settlement failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "position manager lagged on window events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("position manager shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::order_manager::{OrderManager, OrderManagerConfig};
    use crate::engine::status::OrderStatus;
    use crate::exchange::{ExchangeApi, ExchangeError, OrderAck};
    use crate::models::BestPrices;
    use crate::store::IntentLog;
    use async_trait::async_trait;

    /// Exchange stub that fills everything instantly at the requested limit.
    struct InstantFillExchange;

    #[async_trait]
    impl ExchangeApi for InstantFillExchange {
        async fn place_buy(
            &self,
            _token_id: &str,
            dollars: f64,
            limit: Option<f64>,
            _order_type: OrderType,
            client_order_id: &str,
        ) -> Result<OrderAck, ExchangeError> {
            let price = limit.unwrap_or(0.5);
            Ok(OrderAck {
                order_id: format!("x-{client_order_id}"),
                status: "matched".to_string(),
                price_filled: Some(price),
                shares: Some(dollars / price),
                cost: None,
                fee: None,
            })
        }

        async fn place_sell(
            &self,
            _token_id: &str,
            shares: f64,
            limit: Option<f64>,
            _order_type: OrderType,
            client_order_id: &str,
        ) -> Result<OrderAck, ExchangeError> {
            Ok(OrderAck {
                order_id: format!("x-{client_order_id}"),
                status: "matched".to_string(),
                price_filled: limit,
                shares: Some(shares),
                cost: None,
                fee: None,
            })
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn get_order(&self, _order_id: &str) -> Result<Option<OrderAck>, ExchangeError> {
            Ok(None)
        }

        async fn get_order_by_client_id(
            &self,
            _client_order_id: &str,
        ) -> Result<Option<OrderAck>, ExchangeError> {
            Ok(None)
        }

        async fn get_best_prices(&self, _token_id: &str) -> Result<BestPrices, ExchangeError> {
            Ok(BestPrices::from_bid_ask(0.48, 0.52))
        }

        async fn get_balance(&self) -> Result<f64, ExchangeError> {
            Ok(1000.0)
        }
    }

    fn harness() -> (Arc<PositionManager>, TradeStore) {
        let store = TradeStore::open_in_memory().unwrap();
        let wal = IntentLog::new(&store);
        let ledger = Arc::new(parking_lot::Mutex::new(PaperLedger::with_cash(100.0)));
        let (events_tx, _) = tokio::sync::broadcast::channel(64);
        let orders = Arc::new(OrderManager::new(
            store.clone(),
            wal,
            Arc::new(InstantFillExchange),
            OrderManagerConfig::default(),
            ledger.clone(),
            events_tx,
        ));
        let pm = Arc::new(PositionManager::new(
            store.clone(),
            orders,
            ledger,
            PositionConfig::default(),
        ));
        (pm, store)
    }

    fn buy_fill(symbol: &str, epoch: i64, direction: &str, shares: f64, price: f64) -> OrderRecord {
        let now = Utc::now().timestamp();
        OrderRecord {
            order_id: format!("f-{}", rand::random::<u32>()),
            intent_id: 1,
            window_id: format!("{}-15m-{}", symbol.to_ascii_lowercase(), epoch),
            market_id: "m1".to_string(),
            token_id: format!("tok-{}", direction.to_ascii_lowercase()),
            side: Side::Buy,
            order_type: OrderType::Ioc,
            limit_price: Some(price),
            size: shares * price,
            filled_size: shares,
            avg_fill_price: price,
            fee_amount: 0.0,
            status: OrderStatus::Filled,
            mode: TradeMode::Paper,
            submitted_at: Some(now),
            acked_at: Some(now),
            filled_at: Some(now),
            cancelled_at: None,
            error_message: None,
            position_id: None,
            symbol: Some(symbol.to_string()),
            strategy_id: Some("drift".to_string()),
            model_prob: None,
            edge: None,
            token_side: Some(direction.to_string()),
            book_snapshot: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn buy_fill_opens_position() {
        let (pm, store) = harness();
        pm.on_fill(&buy_fill("BTCUSDT", 900, "UP", 10.0, 0.50))
            .await
            .unwrap();

        let pos = store
            .position_for("BTCUSDT", 900, Direction::Up)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.lifecycle, PositionLifecycle::Monitoring);
        assert!((pos.shares - 10.0).abs() < 1e-9);
        assert!((pos.avg_entry - 0.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn second_fill_averages_entry() {
        let (pm, store) = harness();
        pm.on_fill(&buy_fill("BTCUSDT", 900, "UP", 10.0, 0.40))
            .await
            .unwrap();
        pm.on_fill(&buy_fill("BTCUSDT", 900, "UP", 10.0, 0.60))
            .await
            .unwrap();

        let pos = store
            .position_for("BTCUSDT", 900, Direction::Up)
            .await
            .unwrap()
            .unwrap();
        assert!((pos.shares - 20.0).abs() < 1e-9);
        assert!((pos.avg_entry - 0.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trailing_stop_arms_and_fires() {
        let (pm, store) = harness();
        pm.on_fill(&buy_fill("BTCUSDT", 900, "UP", 10.0, 0.50))
            .await
            .unwrap();

        // +12% arms the trailing stop
        pm.on_price("tok-up", 0.56, 0).await.unwrap();
        let pos = store
            .position_for("BTCUSDT", 900, Direction::Up)
            .await
            .unwrap()
            .unwrap();
        assert!(pos.trailing_active);
        assert!(pos.stop_price.is_some());

        // run up, then fall through the stop
        pm.on_price("tok-up", 0.70, 0).await.unwrap();
        pm.on_price("tok-up", 0.60, 0).await.unwrap();

        let pos = store
            .position_for("BTCUSDT", 900, Direction::Up)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.lifecycle, PositionLifecycle::ExitPending);
    }

    #[tokio::test]
    async fn stop_loss_fires_once() {
        let (pm, store) = harness();
        pm.on_fill(&buy_fill("BTCUSDT", 900, "UP", 10.0, 0.50))
            .await
            .unwrap();

        // -20% breaches the 15% stop
        pm.on_price("tok-up", 0.40, 0).await.unwrap();
        let pos = store
            .position_for("BTCUSDT", 900, Direction::Up)
            .await
            .unwrap()
            .unwrap();
        assert!(pos.stop_loss_triggered);
        assert_eq!(pos.lifecycle, PositionLifecycle::ExitPending);
    }

    #[tokio::test]
    async fn opposite_signal_resolution() {
        let (pm, _store) = harness();
        pm.on_fill(&buy_fill("BTCUSDT", 900, "DOWN", 10.0, 0.50))
            .await
            .unwrap();

        // profitable opposite: close first
        let decision = pm
            .check_opposite("BTCUSDT", 900, Direction::Up, Some(0.55))
            .await
            .unwrap();
        assert!(matches!(decision, OppositeDecision::CloseFirst(_)));

        // losing opposite: block
        let decision = pm
            .check_opposite("BTCUSDT", 900, Direction::Up, Some(0.45))
            .await
            .unwrap();
        match decision {
            OppositeDecision::Block { reason } => {
                assert_eq!(reason, "opposite_position_unprofitable")
            }
            other => panic!("expected Block, got {other:?}"),
        }

        // no position on the other side at all
        let decision = pm
            .check_opposite("BTCUSDT", 900, Direction::Down, Some(0.5))
            .await
            .unwrap();
        assert!(matches!(decision, OppositeDecision::Allow));
    }

    #[tokio::test]
    async fn window_close_settles_and_sweeps() {
        let (pm, store) = harness();
        pm.on_fill(&buy_fill("BTCUSDT", 900, "UP", 10.0, 0.50))
            .await
            .unwrap();
        pm.on_fill(&buy_fill("BTCUSDT", 900, "DOWN", 4.0, 0.50))
            .await
            .unwrap();

        let cash_before = pm.ledger.lock().cash_usd;
        pm.on_window_closed(&WindowClosed {
            symbol: "BTCUSDT".to_string(),
            epoch: 900,
            window_id: "btcusdt-15m-900".to_string(),
            strike: Some(50_000.0),
            final_price: Some(50_100.0),
            outcome: Some(Direction::Up),
        })
        .await
        .unwrap();

        let up = store
            .position_for("BTCUSDT", 900, Direction::Up)
            .await
            .unwrap()
            .unwrap();
        let down = store
            .position_for("BTCUSDT", 900, Direction::Down)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(up.lifecycle, PositionLifecycle::Closed);
        assert_eq!(down.lifecycle, PositionLifecycle::Closed);

        // winning UP shares paid $1 each
        let cash_after = pm.ledger.lock().cash_usd;
        assert!((cash_after - cash_before - 10.0).abs() < 1e-9);
    }
}
