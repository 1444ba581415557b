//! Error taxonomy for the trading engine
//!
//! Transient I/O errors (exchange, store) are retried on the next tick and
//! counted toward the per-strategy error threshold. Consistency errors halt
//! the strategy. Configuration errors are surfaced at startup and prevent the
//! strategy from ever running.

use thiserror::Error;

/// Errors from the exchange client. All variants are treated as transient by
/// the tick loop and retried.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("exchange rejected request: {0}")]
    Api(String),

    #[error("order not found on exchange: {0}")]
    OrderNotFound(String),

    #[error("malformed exchange response: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Transport(err.to_string())
    }
}

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt persisted record: {0}")]
    Corrupt(String),
}

/// Fatal configuration errors, surfaced before any strategy task starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid parameter {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("duplicate strategy id: {0}")]
    DuplicateStrategyId(String),
}

/// Mismatches between the cycle state and the replayed trade history.
/// Always halts the strategy.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("position quantity mismatch: state has {actual}, trade replay gives {expected}")]
    QuantityMismatch { expected: String, actual: String },

    #[error("duplicate fill detected for order {order_id}")]
    DuplicateFill { order_id: String },

    #[error("sell fill with no open position (order {order_id})")]
    GhostSell { order_id: String },

    #[error("invalid fill report for order {order_id}: {reason}")]
    InvalidFill { order_id: String, reason: String },
}

/// Notification delivery failure after the bounded retry policy is exhausted.
/// Trading without alerting capability is prohibited, so this halts too.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("notifier misconfigured: {0}")]
    Misconfigured(&'static str),
}

/// Errors surfaced by order manager operations.
#[derive(Debug, Error)]
pub enum OmsError {
    #[error("an order intent is already in flight for this strategy")]
    IntentInFlight,

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

impl OmsError {
    /// Transient errors are retried next tick and counted toward the
    /// per-strategy error threshold; consistency errors halt immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, OmsError::Exchange(_) | OmsError::Store(_))
    }
}
