//! DCA + OTT Trading Engine
//!
//! An automated position-averaging trading system driven by an OTT trend
//! indicator, built around a write-ahead logged order lifecycle: intents are
//! durably recorded before submission, reconciled against the exchange on
//! every tick, and applied to cycle state exactly once - so a crash at any
//! point is recoverable without double-counting money.

pub mod config;
pub mod cycle;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod notify;
pub mod oms;
pub mod pnl;
pub mod safety;
pub mod store;
pub mod strategy;
pub mod types;

pub use config::Config;
pub use types::*;
