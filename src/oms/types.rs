//! Order intent types
//!
//! An intent is the write-ahead record of an order: durably persisted with
//! status `Created` before any network call, promoted to `Submitted` once the
//! exchange accepts it, and removed from the pending set only after its
//! terminal outcome has been applied to the cycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Money, Side};

/// Order intent state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    /// Durably recorded, not yet sent to the exchange
    Created,

    /// Accepted by the exchange, exchange order id recorded
    Submitted,

    /// Seen open (NEW) on the exchange during reconciliation
    Acknowledged,

    /// Exchange reports a partial execution; still open
    PartiallyFilled,

    /// Cancel requested, awaiting exchange confirmation
    CancelPending,

    /// Fully executed and applied to cycle state
    Filled,

    /// Cancelled/expired without execution
    Cancelled,

    /// Rejected or lost; no state mutation happened
    Failed,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Filled | IntentStatus::Cancelled | IntentStatus::Failed
        )
    }
}

/// Write-ahead order record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_order_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub side: Side,
    pub quantity: Money,
    /// None = market order
    pub price: Option<Money>,
    pub status: IntentStatus,
    /// Label the resulting trade is expected to carry, for logs and alerts
    pub cycle_label: String,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl OrderIntent {
    pub fn new(side: Side, quantity: Money, price: Option<Money>, cycle_label: String) -> Self {
        OrderIntent {
            client_order_id: Uuid::new_v4(),
            exchange_order_id: None,
            side,
            quantity,
            price,
            status: IntentStatus::Created,
            cycle_label,
            created_at: Utc::now(),
            last_checked_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Age of the intent relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// The dedup key used for trade records and reconciliation: the exchange
    /// order id when known, otherwise the client order id.
    pub fn dedup_key(&self) -> String {
        self.exchange_order_id
            .clone()
            .unwrap_or_else(|| self.client_order_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_intent_is_created_and_open() {
        let intent = OrderIntent::new(
            Side::Buy,
            Money::from_f64(1.0),
            None,
            "D1-1".to_string(),
        );
        assert_eq!(intent.status, IntentStatus::Created);
        assert!(intent.is_open());
        assert!(intent.exchange_order_id.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(IntentStatus::Filled.is_terminal());
        assert!(IntentStatus::Cancelled.is_terminal());
        assert!(IntentStatus::Failed.is_terminal());
        assert!(!IntentStatus::Created.is_terminal());
        assert!(!IntentStatus::Submitted.is_terminal());
        assert!(!IntentStatus::CancelPending.is_terminal());
    }

    #[test]
    fn test_dedup_key_prefers_exchange_id() {
        let mut intent = OrderIntent::new(
            Side::Sell,
            Money::from_f64(2.0),
            Some(Money::from_f64(100.0)),
            "D1-2".to_string(),
        );
        assert_eq!(intent.dedup_key(), intent.client_order_id.to_string());
        intent.exchange_order_id = Some("12345".to_string());
        assert_eq!(intent.dedup_key(), "12345");
    }
}
