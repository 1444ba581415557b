//! Safety monitor
//!
//! Periodic audit of cycle state against the append-only trade history, plus
//! per-strategy error counting. Replays the full history through the PnL
//! model and compares the result to the live state; any mismatch, duplicate
//! fill, or exhausted error budget halts the strategy.

use std::collections::HashSet;
use tracing::warn;

use crate::cycle::CycleState;
use crate::error::ConsistencyError;
use crate::types::{Money, TradeRecord};

/// One detected inconsistency
#[derive(Debug, Clone, PartialEq)]
pub enum AuditIssue {
    QuantityMismatch { expected: Money, actual: Money },
    AverageCostMismatch { expected: Money, actual: Money },
    CycleNumberMismatch { expected: u32, actual: u32 },
    BalanceMismatch { expected: Money, actual: Money },
    DuplicateTrade { order_id: String },
    ReplayFailed { reason: String },
}

/// Outcome of one audit pass
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub issues: Vec<AuditIssue>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validate a live cycle state against its trade history.
///
/// Duplicate-fill detection runs over the raw records; the structural checks
/// replay the history from flat and compare position, cycle numbering and
/// cash against the live state.
pub fn audit(state: &CycleState, trades: &[TradeRecord]) -> AuditReport {
    let mut issues = Vec::new();

    let mut seen = HashSet::new();
    for trade in trades {
        if !seen.insert(trade.order_id.as_str()) {
            issues.push(AuditIssue::DuplicateTrade {
                order_id: trade.order_id.clone(),
            });
        }
    }

    match CycleState::replay(&state.strategy_id, state.balance.initial_balance, trades) {
        Ok(replayed) => {
            if replayed.position.quantity != state.position.quantity {
                issues.push(AuditIssue::QuantityMismatch {
                    expected: replayed.position.quantity,
                    actual: state.position.quantity,
                });
            }
            if !state.is_flat() && replayed.position.average_cost != state.position.average_cost {
                issues.push(AuditIssue::AverageCostMismatch {
                    expected: replayed.position.average_cost,
                    actual: state.position.average_cost,
                });
            }
            if replayed.cycle_number != state.cycle_number {
                issues.push(AuditIssue::CycleNumberMismatch {
                    expected: replayed.cycle_number,
                    actual: state.cycle_number,
                });
            }
            if replayed.balance.cash_balance != state.balance.cash_balance {
                issues.push(AuditIssue::BalanceMismatch {
                    expected: replayed.balance.cash_balance,
                    actual: state.balance.cash_balance,
                });
            }
        }
        Err(e) => issues.push(AuditIssue::ReplayFailed {
            reason: e.to_string(),
        }),
    }

    if !issues.is_empty() {
        warn!(
            strategy = %state.strategy_id,
            issues = issues.len(),
            "audit found inconsistencies"
        );
    }
    AuditReport { issues }
}

/// Rebuild a cycle state from its trade history (recovery after corruption).
pub fn rebuild(
    strategy_id: &str,
    initial_balance: Money,
    trades: &[TradeRecord],
) -> Result<CycleState, ConsistencyError> {
    CycleState::replay(strategy_id, initial_balance, trades)
}

/// Per-strategy consecutive transient-error counter.
///
/// Successful ticks reset it; hitting the limit is the halt signal.
#[derive(Debug)]
pub struct ErrorCounter {
    count: u32,
    limit: u32,
}

impl ErrorCounter {
    pub fn new(limit: u32) -> Self {
        ErrorCounter { count: 0, limit }
    }

    /// Record one error; returns true when the threshold is now reached.
    pub fn record(&mut self) -> bool {
        self.count += 1;
        warn!(count = self.count, limit = self.limit, "strategy error recorded");
        self.count >= self.limit
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::Utc;

    fn money(v: f64) -> Money {
        Money::from_f64(v)
    }

    fn trade(order_id: &str, side: Side, qty: f64, price: f64) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            side,
            quantity: money(qty),
            price: money(price),
            cycle_label: String::new(),
            realized_pnl: Money::ZERO,
            commission: Money::ZERO,
            order_id: order_id.to_string(),
        }
    }

    fn state_from(trades: &[TradeRecord]) -> CycleState {
        CycleState::replay("test", money(1000.0), trades).unwrap()
    }

    #[test]
    fn test_consistent_state_passes_audit() {
        let trades = vec![
            trade("o1", Side::Buy, 10.0, 100.0),
            trade("o2", Side::Buy, 15.0, 97.0),
        ];
        let state = state_from(&trades);
        assert!(audit(&state, &trades).is_consistent());
    }

    #[test]
    fn test_quantity_drift_detected() {
        let trades = vec![trade("o1", Side::Buy, 10.0, 100.0)];
        let mut state = state_from(&trades);
        state.position.quantity = money(12.0);

        let report = audit(&state, &trades);
        assert!(!report.is_consistent());
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, AuditIssue::QuantityMismatch { .. })));
    }

    #[test]
    fn test_duplicate_fill_detected() {
        let trades = vec![
            trade("o1", Side::Buy, 10.0, 100.0),
            trade("o1", Side::Buy, 10.0, 100.0),
        ];
        let state = state_from(&[trades[0].clone()]);
        let report = audit(&state, &trades);
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, AuditIssue::DuplicateTrade { .. })));
    }

    #[test]
    fn test_balance_drift_detected() {
        let trades = vec![
            trade("o1", Side::Buy, 10.0, 100.0),
            trade("o2", Side::Sell, 10.0, 105.0),
        ];
        let mut state = state_from(&trades);
        state.balance.cash_balance = money(999.0);

        let report = audit(&state, &trades);
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, AuditIssue::BalanceMismatch { .. })));
    }

    #[test]
    fn test_rebuild_restores_consistency() {
        let trades = vec![
            trade("o1", Side::Buy, 10.0, 100.0),
            trade("o2", Side::Buy, 15.0, 97.0),
            trade("o3", Side::Sell, 25.0, 99.5),
        ];
        let rebuilt = rebuild("test", money(1000.0), &trades).unwrap();
        assert!(rebuilt.is_flat());
        assert_eq!(rebuilt.cycle_number, 1);
        assert_eq!(rebuilt.balance.cash_balance, money(1032.5));
        assert!(audit(&rebuilt, &trades).is_consistent());
    }

    #[test]
    fn test_error_counter_threshold() {
        let mut counter = ErrorCounter::new(3);
        assert!(!counter.record());
        assert!(!counter.record());
        assert!(counter.record());
        counter.reset();
        assert_eq!(counter.count(), 0);
        assert!(!counter.record());
    }
}
