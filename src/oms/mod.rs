//! Order Management System (OMS)
//!
//! Write-ahead logged order intents with exchange reconciliation:
//! - intent persisted before any network call
//! - fills applied to cycle state exactly once
//! - single order in flight per strategy
//! - timeout cancellation and crash recovery on restart

pub mod manager;
pub mod types;

pub use manager::{OrderManager, OrderManagerConfig, ReconcileReport};
pub use types::{IntentStatus, OrderIntent};
