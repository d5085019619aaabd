use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::engine::status::OrderStatus;
use crate::models::{BookSnapshot, Direction, OrderType, Side, TradeMode};

/// One row per exchange order id. The persisted row is the source of truth;
/// nothing in memory outlives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub intent_id: i64,
    pub window_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub size: f64,
    pub filled_size: f64,
    pub avg_fill_price: f64,
    pub fee_amount: f64,
    pub status: OrderStatus,
    pub mode: TradeMode,
    pub submitted_at: Option<i64>,
    pub acked_at: Option<i64>,
    pub filled_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub error_message: Option<String>,
    pub position_id: Option<String>,
    pub symbol: Option<String>,
    pub strategy_id: Option<String>,
    pub model_prob: Option<f64>,
    pub edge: Option<f64>,
    pub token_side: Option<String>,
    pub book_snapshot: Option<BookSnapshot>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Columns `update_order` may touch. Everything else on an order row is
/// immutable after insert; a field left `None` is not written.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    pub status: Option<OrderStatus>,
    pub filled_size: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub filled_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub error_message: Option<String>,
    pub position_id: Option<String>,
    pub fee_amount: Option<f64>,
}

/// Position lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionLifecycle {
    Entry,
    Monitoring,
    StopTriggered,
    TpTriggered,
    ExitPending,
    Expiry,
    Closed,
}

impl PositionLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionLifecycle::Entry => "entry",
            PositionLifecycle::Monitoring => "monitoring",
            PositionLifecycle::StopTriggered => "stop_triggered",
            PositionLifecycle::TpTriggered => "tp_triggered",
            PositionLifecycle::ExitPending => "exit_pending",
            PositionLifecycle::Expiry => "expiry",
            PositionLifecycle::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(PositionLifecycle::Entry),
            "monitoring" => Some(PositionLifecycle::Monitoring),
            "stop_triggered" => Some(PositionLifecycle::StopTriggered),
            "tp_triggered" => Some(PositionLifecycle::TpTriggered),
            "exit_pending" => Some(PositionLifecycle::ExitPending),
            "expiry" => Some(PositionLifecycle::Expiry),
            "closed" => Some(PositionLifecycle::Closed),
        _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, PositionLifecycle::Closed)
    }
}

/// One position per (symbol, epoch, direction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: String,
    pub symbol: String,
    pub epoch: i64,
    pub token_id: String,
    pub direction: Direction,
    /// Execution mode of the orders that built this position; exits reuse it.
    pub mode: TradeMode,
    pub shares: f64,
    pub avg_entry: f64,
    pub high_water_mark: f64,
    pub trailing_active: bool,
    pub trailing_activation_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub peak_pnl_pct: f64,
    pub stop_loss_triggered: bool,
    pub lifecycle: PositionLifecycle,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub updated_at: i64,
}

/// Per-(symbol, epoch) window row. The strike, once set, never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEventRecord {
    pub symbol: String,
    pub epoch: i64,
    pub open_ts: i64,
    pub close_ts: i64,
    pub strike: Option<f64>,
    pub strike_source: Option<String>,
    pub final_price: Option<f64>,
    pub resolved: Option<Direction>,
    pub onchain_resolved: Option<Direction>,
    /// Whether the oracle and the exchange consensus agreed on the outcome;
    /// None when either side lacked open/close prices.
    pub oracle_agreement: Option<bool>,
    pub recorded_at: i64,
}

/// Simulated fill persisted for PAPER/DRY_RUN accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTradeRecord {
    pub id: String,
    pub ts: i64,
    pub mode: TradeMode,
    pub window_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub notional: f64,
    pub shares: f64,
    pub fee: f64,
}

/// Durable store for orders, positions, window events, ticks and paper
/// trades. Intents live in the same database, owned by `IntentLog`.
#[derive(Clone)]
pub struct TradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl TradeStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open trade db")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY NOT NULL,
                intent_id INTEGER NOT NULL,
                window_id TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                limit_price REAL,
                size REAL NOT NULL,
                filled_size REAL NOT NULL DEFAULT 0,
                avg_fill_price REAL NOT NULL DEFAULT 0,
                fee_amount REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                submitted_at INTEGER,
                acked_at INTEGER,
                filled_at INTEGER,
                cancelled_at INTEGER,
                error_message TEXT,
                position_id TEXT,
                symbol TEXT,
                strategy_id TEXT,
                model_prob REAL,
                edge REAL,
                token_side TEXT,
                book_snapshot TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_window_token_intent
             ON orders(window_id, token_id, intent_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_window_token ON orders(window_id, token_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                token_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                mode TEXT NOT NULL,
                shares REAL NOT NULL,
                avg_entry REAL NOT NULL,
                high_water_mark REAL NOT NULL,
                trailing_active INTEGER NOT NULL DEFAULT 0,
                trailing_activation_price REAL,
                stop_price REAL,
                peak_pnl_pct REAL NOT NULL DEFAULT 0,
                stop_loss_triggered INTEGER NOT NULL DEFAULT 0,
                lifecycle TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                updated_at INTEGER NOT NULL,
                UNIQUE(symbol, epoch, direction)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_lifecycle ON positions(lifecycle)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS window_close_events (
                symbol TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                open_ts INTEGER NOT NULL,
                close_ts INTEGER NOT NULL,
                strike REAL,
                strike_source TEXT,
                final_price REAL,
                resolved TEXT,
                onchain_resolved TEXT,
                oracle_agreement INTEGER,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY(symbol, epoch)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ticks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                spot REAL NOT NULL,
                implied_up REAL,
                secs_remaining INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ticks_symbol_ts ON ticks(symbol, ts DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS paper_trades (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                mode TEXT NOT NULL,
                window_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                notional REAL NOT NULL,
                shares REAL NOT NULL,
                fee REAL NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS intents (
                intent_id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                window_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                result TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_intents_state ON intents(state)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_intents_window ON intents(window_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Shared connection handle for `IntentLog`, which lives in the same
    /// database file.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Insert an order row. Fails on duplicate order_id and on a duplicate
    /// (window_id, token_id, intent_id) triple.
    pub async fn insert_order(&self, rec: &OrderRecord) -> Result<()> {
        if rec.order_id.trim().is_empty() {
            anyhow::bail!("order_id must be non-empty");
        }
        let snapshot_json = rec
            .book_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO orders \
             (order_id, intent_id, window_id, market_id, token_id, side, order_type, limit_price, \
              size, filled_size, avg_fill_price, fee_amount, status, mode, \
              submitted_at, acked_at, filled_at, cancelled_at, error_message, position_id, \
              symbol, strategy_id, model_prob, edge, token_side, book_snapshot, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                     ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            params![
                &rec.order_id,
                rec.intent_id,
                &rec.window_id,
                &rec.market_id,
                &rec.token_id,
                rec.side.as_str(),
                rec.order_type.as_str(),
                rec.limit_price,
                rec.size,
                rec.filled_size,
                rec.avg_fill_price,
                rec.fee_amount,
                rec.status.as_str(),
                rec.mode.as_str(),
                rec.submitted_at,
                rec.acked_at,
                rec.filled_at,
                rec.cancelled_at,
                rec.error_message.as_deref(),
                rec.position_id.as_deref(),
                rec.symbol.as_deref(),
                rec.strategy_id.as_deref(),
                rec.model_prob,
                rec.edge,
                rec.token_side.as_deref(),
                snapshot_json.as_deref(),
                rec.created_at,
                rec.updated_at,
            ],
        )
        .context("insert order")?;
        Ok(())
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM orders WHERE order_id = ?1 LIMIT 1",
            ORDER_COLUMNS
        ))?;
        stmt.query_row(params![order_id], row_to_order)
            .optional()
            .context("get order")
    }

    /// Apply whitelisted updates to an order row, preconditioned on the
    /// status the caller last observed. Returns false when the row moved
    /// under us (another writer won the race).
    pub async fn update_order(
        &self,
        order_id: &str,
        expected_status: OrderStatus,
        update: &OrderUpdate,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;

        let mut sets: Vec<String> = vec!["updated_at = ?1".to_string()];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];

        let mut push_set = |col: &str, value: Box<dyn rusqlite::ToSql>| {
            values.push(value);
            sets.push(format!("{} = ?{}", col, values.len()));
        };
        if let Some(status) = update.status {
            push_set("status", Box::new(status.as_str().to_string()));
        }
        if let Some(v) = update.filled_size {
            push_set("filled_size", Box::new(v));
        }
        if let Some(v) = update.avg_fill_price {
            push_set("avg_fill_price", Box::new(v));
        }
        if let Some(v) = update.filled_at {
            push_set("filled_at", Box::new(v));
        }
        if let Some(v) = update.cancelled_at {
            push_set("cancelled_at", Box::new(v));
        }
        if let Some(v) = update.error_message.clone() {
            push_set("error_message", Box::new(v));
        }
        if let Some(v) = update.position_id.clone() {
            push_set("position_id", Box::new(v));
        }
        if let Some(v) = update.fee_amount {
            push_set("fee_amount", Box::new(v));
        }
        drop(push_set);

        let sql = format!(
            "UPDATE orders SET {} WHERE order_id = ?{} AND status = ?{}",
            sets.join(", "),
            values.len() + 1,
            values.len() + 2
        );
        values.push(Box::new(order_id.to_string()));
        values.push(Box::new(expected_status.as_str().to_string()));

        let changed = conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(changed == 1)
    }

    /// Orders counting toward the per-window cap for (window_id, token_id).
    pub async fn count_window_orders(&self, window_id: &str, token_id: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM orders \
             WHERE window_id = ?1 AND token_id = ?2 AND status NOT IN ('rejected', 'cancelled')",
        )?;
        let n: i64 = stmt.query_row(params![window_id, token_id], |row| row.get(0))?;
        Ok(n as u32)
    }

    /// Id of an unresolved UNKNOWN order for this (window, token), if any.
    /// Such an order blocks re-entry until the reconciler settles it.
    pub async fn unknown_order_for(
        &self,
        window_id: &str,
        token_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT order_id FROM orders \
             WHERE window_id = ?1 AND token_id = ?2 AND status = 'unknown' LIMIT 1",
        )?;
        stmt.query_row(params![window_id, token_id], |row| row.get(0))
            .optional()
            .context("unknown order gate")
    }

    pub async fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<OrderRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM orders WHERE status = ?1 ORDER BY created_at ASC",
            ORDER_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_order)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn open_orders(&self) -> Result<Vec<OrderRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM orders WHERE status IN ('open', 'partially_filled') \
             ORDER BY created_at ASC",
            ORDER_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_order)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn order_by_intent(&self, intent_id: i64) -> Result<Option<OrderRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM orders WHERE intent_id = ?1 LIMIT 1",
            ORDER_COLUMNS
        ))?;
        stmt.query_row(params![intent_id], row_to_order)
            .optional()
            .context("order by intent")
    }

    pub async fn recent_orders(&self, limit: usize) -> Result<Vec<OrderRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM orders ORDER BY created_at DESC LIMIT ?1",
            ORDER_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit], row_to_order)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    pub async fn upsert_position(&self, rec: &PositionRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions \
             (id, symbol, epoch, token_id, direction, mode, shares, avg_entry, high_water_mark, \
              trailing_active, trailing_activation_price, stop_price, peak_pnl_pct, \
              stop_loss_triggered, lifecycle, opened_at, closed_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
             ON CONFLICT(id) DO UPDATE SET
                shares = excluded.shares,
                avg_entry = excluded.avg_entry,
                high_water_mark = excluded.high_water_mark,
                trailing_active = excluded.trailing_active,
                trailing_activation_price = excluded.trailing_activation_price,
                stop_price = excluded.stop_price,
                peak_pnl_pct = excluded.peak_pnl_pct,
                stop_loss_triggered = excluded.stop_loss_triggered,
                lifecycle = excluded.lifecycle,
                closed_at = excluded.closed_at,
                updated_at = excluded.updated_at",
            params![
                &rec.id,
                &rec.symbol,
                rec.epoch,
                &rec.token_id,
                rec.direction.as_str(),
                rec.mode.as_str(),
                rec.shares,
                rec.avg_entry,
                rec.high_water_mark,
                rec.trailing_active as i64,
                rec.trailing_activation_price,
                rec.stop_price,
                rec.peak_pnl_pct,
                rec.stop_loss_triggered as i64,
                rec.lifecycle.as_str(),
                rec.opened_at,
                rec.closed_at,
                rec.updated_at,
            ],
        )
        .context("upsert position")?;
        Ok(())
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<PositionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE id = ?1 LIMIT 1",
            POSITION_COLUMNS
        ))?;
        stmt.query_row(params![id], row_to_position)
            .optional()
            .context("get position")
    }

    pub async fn open_positions(&self) -> Result<Vec<PositionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE lifecycle != 'closed' ORDER BY opened_at ASC",
            POSITION_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_position)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn position_for(
        &self,
        symbol: &str,
        epoch: i64,
        direction: Direction,
    ) -> Result<Option<PositionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM positions \
             WHERE symbol = ?1 AND epoch = ?2 AND direction = ?3 LIMIT 1",
            POSITION_COLUMNS
        ))?;
        stmt.query_row(params![symbol, epoch, direction.as_str()], row_to_position)
            .optional()
            .context("position for window")
    }

    /// Positions whose window has closed but which never finished exiting.
    pub async fn orphan_positions(&self, before_epoch: i64) -> Result<Vec<PositionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE lifecycle != 'closed' AND epoch < ?1",
            POSITION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![before_epoch], row_to_position)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Windows
    // ------------------------------------------------------------------

    pub async fn upsert_window_event(&self, rec: &WindowEventRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO window_close_events \
             (symbol, epoch, open_ts, close_ts, strike, strike_source, final_price, resolved, \
              onchain_resolved, oracle_agreement, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(symbol, epoch) DO UPDATE SET
                strike = COALESCE(window_close_events.strike, excluded.strike),
                strike_source = COALESCE(window_close_events.strike_source, excluded.strike_source),
                final_price = excluded.final_price,
                resolved = excluded.resolved,
                onchain_resolved = excluded.onchain_resolved,
                oracle_agreement = excluded.oracle_agreement,
                recorded_at = excluded.recorded_at",
            params![
                &rec.symbol,
                rec.epoch,
                rec.open_ts,
                rec.close_ts,
                rec.strike,
                rec.strike_source.as_deref(),
                rec.final_price,
                rec.resolved.map(|d| d.as_str()),
                rec.onchain_resolved.map(|d| d.as_str()),
                rec.oracle_agreement.map(|b| b as i64),
                rec.recorded_at,
            ],
        )
        .context("upsert window event")?;
        Ok(())
    }

    pub async fn get_window_event(
        &self,
        symbol: &str,
        epoch: i64,
    ) -> Result<Option<WindowEventRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, epoch, open_ts, close_ts, strike, strike_source, final_price, \
                    resolved, onchain_resolved, oracle_agreement, recorded_at \
             FROM window_close_events WHERE symbol = ?1 AND epoch = ?2 LIMIT 1",
        )?;
        stmt.query_row(params![symbol, epoch], row_to_window)
            .optional()
            .context("get window event")
    }

    pub async fn recent_window_events(&self, limit: usize) -> Result<Vec<WindowEventRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, epoch, open_ts, close_ts, strike, strike_source, final_price, \
                    resolved, onchain_resolved, oracle_agreement, recorded_at \
             FROM window_close_events ORDER BY epoch DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_window)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Ticks & paper trades
    // ------------------------------------------------------------------

    pub async fn insert_tick(
        &self,
        ts: i64,
        symbol: &str,
        spot: f64,
        implied_up: Option<f64>,
        secs_remaining: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO ticks (ts, symbol, spot, implied_up, secs_remaining) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ts, symbol, spot, implied_up, secs_remaining],
        )?;
        Ok(())
    }

    pub async fn prune_ticks_before(&self, cutoff_ts: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM ticks WHERE ts < ?1", params![cutoff_ts])?;
        Ok(deleted)
    }

    pub async fn insert_paper_trade(&self, rec: &PaperTradeRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO paper_trades \
             (id, ts, mode, window_id, token_id, side, price, notional, shares, fee) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &rec.id,
                rec.ts,
                rec.mode.as_str(),
                &rec.window_id,
                &rec.token_id,
                rec.side.as_str(),
                rec.price,
                rec.notional,
                rec.shares,
                rec.fee,
            ],
        )?;
        Ok(())
    }
}

const ORDER_COLUMNS: &str = "order_id, intent_id, window_id, market_id, token_id, side, order_type, \
     limit_price, size, filled_size, avg_fill_price, fee_amount, status, mode, submitted_at, \
     acked_at, filled_at, cancelled_at, error_message, position_id, symbol, strategy_id, \
     model_prob, edge, token_side, book_snapshot, created_at, updated_at";

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    let side: String = row.get(5)?;
    let order_type: String = row.get(6)?;
    let status: String = row.get(12)?;
    let mode: String = row.get(13)?;
    let snapshot_json: Option<String> = row.get(25)?;
    Ok(OrderRecord {
        order_id: row.get(0)?,
        intent_id: row.get(1)?,
        window_id: row.get(2)?,
        market_id: row.get(3)?,
        token_id: row.get(4)?,
        side: Side::parse(&side).unwrap_or(Side::Buy),
        order_type: OrderType::parse(&order_type).unwrap_or(OrderType::Gtc),
        limit_price: row.get(7)?,
        size: row.get(8)?,
        filled_size: row.get(9)?,
        avg_fill_price: row.get(10)?,
        fee_amount: row.get(11)?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Unknown),
        mode: TradeMode::parse(&mode).unwrap_or(TradeMode::Paper),
        submitted_at: row.get(14)?,
        acked_at: row.get(15)?,
        filled_at: row.get(16)?,
        cancelled_at: row.get(17)?,
        error_message: row.get(18)?,
        position_id: row.get(19)?,
        symbol: row.get(20)?,
        strategy_id: row.get(21)?,
        model_prob: row.get(22)?,
        edge: row.get(23)?,
        token_side: row.get(24)?,
        book_snapshot: snapshot_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(26)?,
        updated_at: row.get(27)?,
    })
}

const POSITION_COLUMNS: &str = "id, symbol, epoch, token_id, direction, mode, shares, avg_entry, \
     high_water_mark, trailing_active, trailing_activation_price, stop_price, peak_pnl_pct, \
     stop_loss_triggered, lifecycle, opened_at, closed_at, updated_at";

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<PositionRecord> {
    let direction: String = row.get(4)?;
    let mode: String = row.get(5)?;
    let lifecycle: String = row.get(14)?;
    let trailing_active: i64 = row.get(9)?;
    let stop_loss_triggered: i64 = row.get(13)?;
    Ok(PositionRecord {
        id: row.get(0)?,
        symbol: row.get(1)?,
        epoch: row.get(2)?,
        token_id: row.get(3)?,
        direction: if direction == "UP" {
            Direction::Up
        } else {
            Direction::Down
        },
        mode: TradeMode::parse(&mode).unwrap_or(TradeMode::Paper),
        shares: row.get(6)?,
        avg_entry: row.get(7)?,
        high_water_mark: row.get(8)?,
        trailing_active: trailing_active != 0,
        trailing_activation_price: row.get(10)?,
        stop_price: row.get(11)?,
        peak_pnl_pct: row.get(12)?,
        stop_loss_triggered: stop_loss_triggered != 0,
        lifecycle: PositionLifecycle::parse(&lifecycle).unwrap_or(PositionLifecycle::Monitoring),
        opened_at: row.get(15)?,
        closed_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn row_to_window(row: &rusqlite::Row<'_>) -> rusqlite::Result<WindowEventRecord> {
    let resolved: Option<String> = row.get(7)?;
    let onchain: Option<String> = row.get(8)?;
    let agreement: Option<i64> = row.get(9)?;
    let parse_dir = |s: Option<String>| {
        s.and_then(|v| match v.as_str() {
            "UP" => Some(Direction::Up),
            "DOWN" => Some(Direction::Down),
            _ => None,
        })
    };
    Ok(WindowEventRecord {
        symbol: row.get(0)?,
        epoch: row.get(1)?,
        open_ts: row.get(2)?,
        close_ts: row.get(3)?,
        strike: row.get(4)?,
        strike_source: row.get(5)?,
        final_price: row.get(6)?,
        resolved: parse_dir(resolved),
        onchain_resolved: parse_dir(onchain),
        oracle_agreement: agreement.map(|v| v != 0),
        recorded_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_order(order_id: &str, intent_id: i64) -> OrderRecord {
        let now = Utc::now().timestamp();
        OrderRecord {
            order_id: order_id.to_string(),
            intent_id,
            window_id: "btc-15m-1000".to_string(),
            market_id: "m1".to_string(),
            token_id: "t1".to_string(),
            side: Side::Buy,
            order_type: OrderType::Gtc,
            limit_price: Some(0.52),
            size: 3.0,
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
            symbol: Some("BTCUSDT".to_string()),
            strategy_id: Some("drift".to_string()),
            model_prob: Some(0.61),
            edge: Some(0.07),
            token_side: Some("UP".to_string()),
            book_snapshot: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn duplicate_order_id_rejected() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_order(&sample_order("o1", 1)).await.unwrap();
        assert!(store.insert_order(&sample_order("o1", 2)).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_window_token_intent_rejected() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_order(&sample_order("o1", 1)).await.unwrap();
        // same (window, token, intent) under a different order id
        assert!(store.insert_order(&sample_order("o2", 1)).await.is_err());
    }

    #[tokio::test]
    async fn empty_order_id_rejected() {
        let store = TradeStore::open_in_memory().unwrap();
        assert!(store.insert_order(&sample_order("", 1)).await.is_err());
    }

    #[tokio::test]
    async fn optimistic_update_respects_precondition() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_order(&sample_order("o1", 1)).await.unwrap();

        let update = OrderUpdate {
            status: Some(OrderStatus::Filled),
            filled_size: Some(5.77),
            avg_fill_price: Some(0.52),
            filled_at: Some(Utc::now().timestamp()),
            ..Default::default()
        };
        // precondition matches
        assert!(store
            .update_order("o1", OrderStatus::Open, &update)
            .await
            .unwrap());
        // row moved; stale precondition loses
        assert!(!store
            .update_order("o1", OrderStatus::Open, &update)
            .await
            .unwrap());

        let rec = store.get_order("o1").await.unwrap().unwrap();
        assert_eq!(rec.status, OrderStatus::Filled);
        assert!((rec.filled_size - 5.77).abs() < 1e-9);
    }

    #[tokio::test]
    async fn window_cap_count_excludes_dead_orders() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_order(&sample_order("o1", 1)).await.unwrap();
        let mut dead = sample_order("o2", 2);
        dead.status = OrderStatus::Rejected;
        store.insert_order(&dead).await.unwrap();
        let mut cancelled = sample_order("o3", 3);
        cancelled.status = OrderStatus::Cancelled;
        store.insert_order(&cancelled).await.unwrap();

        let n = store
            .count_window_orders("btc-15m-1000", "t1")
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn strike_is_immutable_once_set() {
        let store = TradeStore::open_in_memory().unwrap();
        let mut rec = WindowEventRecord {
            symbol: "BTCUSDT".to_string(),
            epoch: 900,
            open_ts: 900,
            close_ts: 1800,
            strike: Some(50_000.0),
            strike_source: Some("chainlink".to_string()),
            final_price: None,
            resolved: None,
            onchain_resolved: None,
            oracle_agreement: None,
            recorded_at: 900,
        };
        store.upsert_window_event(&rec).await.unwrap();

        // later upsert with a different strike must not overwrite
        rec.strike = Some(51_000.0);
        rec.final_price = Some(50_500.0);
        rec.resolved = Some(Direction::Up);
        rec.oracle_agreement = Some(true);
        store.upsert_window_event(&rec).await.unwrap();

        let got = store.get_window_event("BTCUSDT", 900).await.unwrap().unwrap();
        assert_eq!(got.strike, Some(50_000.0));
        assert_eq!(got.resolved, Some(Direction::Up));
        assert_eq!(got.oracle_agreement, Some(true));
    }

    #[tokio::test]
    async fn orphan_positions_filtered_by_epoch() {
        let store = TradeStore::open_in_memory().unwrap();
        let now = Utc::now().timestamp();
        let pos = PositionRecord {
            id: "p1".to_string(),
            symbol: "BTCUSDT".to_string(),
            epoch: 900,
            token_id: "t1".to_string(),
            direction: Direction::Up,
            mode: TradeMode::Paper,
            shares: 5.0,
            avg_entry: 0.5,
            high_water_mark: 0.5,
            trailing_active: false,
            trailing_activation_price: None,
            stop_price: None,
            peak_pnl_pct: 0.0,
            stop_loss_triggered: false,
            lifecycle: PositionLifecycle::Monitoring,
            opened_at: now,
            closed_at: None,
            updated_at: now,
        };
        store.upsert_position(&pos).await.unwrap();

        assert_eq!(store.orphan_positions(900).await.unwrap().len(), 0);
        assert_eq!(store.orphan_positions(1800).await.unwrap().len(), 1);
    }
}
