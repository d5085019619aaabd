//! Write-ahead intent log.
//!
//! Every externally-visible action (place, cancel) writes an intent row
//! before the exchange sees anything. Intent rows are never deleted; they are
//! the ground truth of "was this action attempted". The intent id doubles as
//! the exchange `clientOrderId`, which is what makes startup reconciliation
//! possible.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

use super::db::TradeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Place,
    Cancel,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Place => "place",
            IntentKind::Cancel => "cancel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "place" => Some(IntentKind::Place),
            "cancel" => Some(IntentKind::Cancel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentState {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl IntentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Pending => "PENDING",
            IntentState::Executing => "EXECUTING",
            IntentState::Completed => "COMPLETED",
            IntentState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(IntentState::Pending),
            "EXECUTING" => Some(IntentState::Executing),
            "COMPLETED" => Some(IntentState::Completed),
            "FAILED" => Some(IntentState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentState::Completed | IntentState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRecord {
    pub intent_id: i64,
    pub kind: IntentKind,
    pub window_id: String,
    pub payload: serde_json::Value,
    pub state: IntentState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append-only intent log sharing the trade database.
#[derive(Clone)]
pub struct IntentLog {
    conn: Arc<Mutex<Connection>>,
}

impl IntentLog {
    pub fn new(store: &TradeStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    /// Insert an intent in PENDING. Committed before any external side
    /// effect; if this fails the caller must abort without touching the
    /// exchange.
    pub async fn log_intent(
        &self,
        kind: IntentKind,
        window_id: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO intents (kind, window_id, payload, state, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'PENDING', ?4, ?4)",
            params![kind.as_str(), window_id, payload.to_string(), now],
        )
        .context("log intent")?;
        Ok(conn.last_insert_rowid())
    }

    /// PENDING -> EXECUTING. Repeating while already EXECUTING is a no-op.
    pub async fn mark_executing(&self, intent_id: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE intents SET state = 'EXECUTING', updated_at = ?1 \
             WHERE intent_id = ?2 AND state IN ('PENDING', 'EXECUTING')",
            params![now, intent_id],
        )?;
        if changed == 0 {
            anyhow::bail!("intent {} is not in PENDING/EXECUTING", intent_id);
        }
        Ok(())
    }

    /// Transition to COMPLETED with a result summary.
    ///
    /// Calling twice with an equal result is a no-op. A second call with a
    /// different result, or after FAILED, is flagged as a log line but not an
    /// error: the exchange side effect already happened and there is nothing
    /// left to unwind.
    pub async fn mark_completed(&self, intent_id: i64, result: &serde_json::Value) -> Result<()> {
        self.finish(intent_id, IntentState::Completed, Some(result), None)
            .await
    }

    /// Transition to FAILED with an error description. Same double-transition
    /// semantics as `mark_completed`.
    pub async fn mark_failed(&self, intent_id: i64, err: &str) -> Result<()> {
        self.finish(intent_id, IntentState::Failed, None, Some(err))
            .await
    }

    async fn finish(
        &self,
        intent_id: i64,
        target: IntentState,
        result: Option<&serde_json::Value>,
        err: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;

        let existing: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT state, result FROM intents WHERE intent_id = ?1",
                params![intent_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((state_str, prev_result)) = existing else {
            anyhow::bail!("intent {} not found", intent_id);
        };
        let state = IntentState::parse(&state_str).unwrap_or(IntentState::Pending);

        if state.is_terminal() {
            let same = state == target
                && match (target, result, prev_result.as_deref()) {
                    (IntentState::Completed, Some(r), Some(prev)) => {
                        serde_json::from_str::<serde_json::Value>(prev)
                            .map(|p| p == *r)
                            .unwrap_or(false)
                    }
                    (IntentState::Failed, _, _) => true,
                    _ => false,
                };
            if !same {
                error!(
                    intent_id,
                    from = %state_str,
                    to = target.as_str(),
                    "double terminal transition on intent; keeping first outcome"
                );
            }
            return Ok(());
        }

        conn.execute(
            "UPDATE intents SET state = ?1, result = ?2, error = ?3, updated_at = ?4 \
             WHERE intent_id = ?5",
            params![
                target.as_str(),
                result.map(|r| r.to_string()),
                err,
                now,
                intent_id
            ],
        )?;
        Ok(())
    }

    pub async fn get_intent(&self, intent_id: i64) -> Result<Option<IntentRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT intent_id, kind, window_id, payload, state, result, error, created_at, \
                    updated_at \
             FROM intents WHERE intent_id = ?1 LIMIT 1",
        )?;
        stmt.query_row(params![intent_id], row_to_intent)
            .optional()
            .context("get intent")
    }

    /// Intents stranded in EXECUTING; the reconciler resolves these at
    /// startup before new signals are admitted.
    pub async fn executing_intents(&self) -> Result<Vec<IntentRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT intent_id, kind, window_id, payload, state, result, error, created_at, \
                    updated_at \
             FROM intents WHERE state = 'EXECUTING' ORDER BY intent_id ASC",
        )?;
        let rows = stmt.query_map([], row_to_intent)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Recent COMPLETED place intents, newest first. The reconciler uses
    /// these to find acknowledged orders whose row insert failed.
    pub async fn recent_completed_intents(&self, limit: usize) -> Result<Vec<IntentRecord>> {
        let limit = limit.clamp(1, 5_000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT intent_id, kind, window_id, payload, state, result, error, created_at, \
                    updated_at \
             FROM intents WHERE state = 'COMPLETED' AND kind = 'place' \
             ORDER BY intent_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_intent)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Monotonic prefix of intents appended for a window, in call order.
    pub async fn intents_for_window(&self, window_id: &str) -> Result<Vec<IntentRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT intent_id, kind, window_id, payload, state, result, error, created_at, \
                    updated_at \
             FROM intents WHERE window_id = ?1 ORDER BY intent_id ASC",
        )?;
        let rows = stmt.query_map(params![window_id], row_to_intent)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_intent(row: &rusqlite::Row<'_>) -> rusqlite::Result<IntentRecord> {
    let kind: String = row.get(1)?;
    let state: String = row.get(4)?;
    let payload: String = row.get(3)?;
    let result: Option<String> = row.get(5)?;
    Ok(IntentRecord {
        intent_id: row.get(0)?,
        kind: IntentKind::parse(&kind).unwrap_or(IntentKind::Place),
        window_id: row.get(2)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        state: IntentState::parse(&state).unwrap_or(IntentState::Pending),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
