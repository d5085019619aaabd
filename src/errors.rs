//! Execution error taxonomy.
//!
//! Every failure that can surface from the order pipeline maps to exactly one
//! variant here. Strategies and the UI only ever see `code()` plus the display
//! string; they must never branch on message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// Caller fault. Never retried, never reaches the exchange.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient balance: have ${available:.2}, need ${required:.2}")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("window order cap reached for ({window_id}, {token_id}): {count}/{cap}")]
    WindowCapExceeded {
        window_id: String,
        token_id: String,
        count: u32,
        cap: u32,
    },

    /// Exchange call failed before anything was acknowledged. Safe to
    /// re-signal with a fresh intent.
    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    /// The exchange may or may not have the order. The caller must enter
    /// confirmation polling and must NOT re-submit under the same intent.
    #[error("ambiguous submission for intent {intent_id}: {detail}")]
    AmbiguousSubmission { intent_id: i64, detail: String },

    #[error("order confirmation timed out for {order_id}")]
    ConfirmationTimeout { order_id: String },

    #[error("invalid status transition {from} -> {to} for order {order_id}")]
    InvalidTransition {
        order_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("order {0} not found")]
    NotFound(String),

    #[error("order {order_id} cannot be cancelled from status {status}")]
    InvalidCancelState {
        order_id: String,
        status: &'static str,
    },

    /// Durable write failed. When this happens after an exchange ack the
    /// pipeline still reports success with `db_write_failed = true`.
    #[error("storage error: {0}")]
    Storage(String),

    /// Order Manager queue is saturated; the strategy may re-submit on the
    /// next tick.
    #[error("order manager busy")]
    Busy,

    /// Unrecoverable. Auto-escalates the kill switch to `flatten`.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExecError {
    /// Stable machine-readable code, part of the external contract.
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::Validation(_) => "VALIDATION",
            ExecError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            ExecError::WindowCapExceeded { .. } => "WINDOW_CAP_EXCEEDED",
            ExecError::SubmissionFailed(_) => "SUBMISSION_FAILED",
            ExecError::AmbiguousSubmission { .. } => "AMBIGUOUS_SUBMISSION",
            ExecError::ConfirmationTimeout { .. } => "CONFIRMATION_TIMEOUT",
            ExecError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ExecError::NotFound(_) => "NOT_FOUND",
            ExecError::InvalidCancelState { .. } => "INVALID_CANCEL_STATE",
            ExecError::Storage(_) => "STORAGE_ERROR",
            ExecError::Busy => "BUSY",
            ExecError::Fatal(_) => "FATAL",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::Fatal(_))
    }

    /// Whether the strategy may safely retry the same logical action with a
    /// new intent.
    pub fn retry_safe(&self) -> bool {
        matches!(self, ExecError::SubmissionFailed(_) | ExecError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ExecError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(
            ExecError::SubmissionFailed("net".into()).code(),
            "SUBMISSION_FAILED"
        );
        assert_eq!(ExecError::Busy.code(), "BUSY");
    }

    #[test]
    fn retry_safety() {
        assert!(ExecError::SubmissionFailed("conn reset".into()).retry_safe());
        assert!(!ExecError::AmbiguousSubmission {
            intent_id: 7,
            detail: "timeout after send".into()
        }
        .retry_safe());
        assert!(!ExecError::Validation("bad size".into()).retry_safe());
    }
}
