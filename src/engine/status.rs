//! Order status state machine.
//!
//! Statuses are a closed variant type and the transition table is an
//! exhaustive match, so adding a status without deciding its transitions is a
//! compile error.

use serde::{Deserialize, Serialize};

use crate::models::OrderType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged by the exchange.
    Pending,
    /// Acknowledged and resting on the book.
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    /// Admission or exchange rejection; never reached the book.
    Rejected,
    /// Ack was ambiguous or confirmation polling timed out. Resolved later by
    /// the reconciler.
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "open" => Some(OrderStatus::Open),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "expired" => Some(OrderStatus::Expired),
            "rejected" => Some(OrderStatus::Rejected),
            "unknown" => Some(OrderStatus::Unknown),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }

    /// Statuses that still count against the per-window order cap.
    pub fn counts_toward_window_cap(&self) -> bool {
        !matches!(self, OrderStatus::Rejected | OrderStatus::Cancelled)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    /// The full transition table. Terminal statuses accept nothing; a
    /// partial fill may repeat (each increment re-enters the same status).
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Pending => matches!(next, Open | Filled | Rejected | Unknown),
            Open => matches!(next, PartiallyFilled | Filled | Cancelled | Expired | Unknown),
            PartiallyFilled => {
                matches!(next, PartiallyFilled | Filled | Cancelled | Expired | Unknown)
            }
            Unknown => matches!(next, Filled | Cancelled | Expired),
            Filled | Cancelled | Expired | Rejected => false,
        }
    }
}

/// Map an exchange-reported status string to an internal status.
///
/// Immediate order types (FOK/IOC) that come back dead were rejected by the
/// matching engine; resting orders that come back dead were cancelled. An
/// unrecognized status is never mapped to Open.
pub fn map_exchange_status(raw: &str, order_type: OrderType) -> OrderStatus {
    match raw.to_ascii_lowercase().as_str() {
        "live" => OrderStatus::Open,
        "matched" => OrderStatus::Filled,
        "cancelled" | "canceled" | "expired" | "killed" => {
            if order_type.is_immediate() {
                OrderStatus::Rejected
            } else {
                OrderStatus::Cancelled
            }
        }
        _ => {
            if order_type.is_immediate() {
                OrderStatus::Rejected
            } else {
                OrderStatus::Cancelled
            }
        }
    }
}

/// Whether an exchange-reported status string is terminal from the venue's
/// point of view (used by the confirmation poll loop).
pub fn exchange_status_is_terminal(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "matched" | "cancelled" | "canceled" | "expired" | "killed"
    )
}
