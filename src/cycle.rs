//! Cycle and position state
//!
//! The durable per-strategy record: open position, cycle numbering, DCA entry
//! stack, reference price and balance. All transitions - and all cycle labels -
//! happen in `apply_fill`; no other component derives cycle numbers or steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConsistencyError;
use crate::pnl::{self, Position};
use crate::types::{Money, Side, TradeRecord};

/// One same-direction entry within the current cycle (LIFO stack).
///
/// Partial sells pop the most recent entry; the stack is not used for average
/// cost, which lives on `Position` and only moves on increasing fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEntry {
    pub price: Money,
    pub quantity: Money,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Cash accounting. `cash_balance` changes only by realized PnL, never by
/// position-increasing notional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub initial_balance: Money,
    pub cash_balance: Money,
    pub realized_pnl: Money,
}

impl BalanceRecord {
    pub fn new(initial_balance: Money) -> Self {
        BalanceRecord {
            initial_balance,
            cash_balance: initial_balance,
            realized_pnl: Money::ZERO,
        }
    }
}

/// What a fill did to the cycle, as seen by the order manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    FirstEntry,
    DcaEntry,
    PartialSell,
    FullExit,
}

/// Result of applying one fill.
#[derive(Debug, Clone)]
pub struct AppliedFill {
    pub outcome: FillOutcome,
    pub realized_pnl: Money,
    /// Label of the trade itself, computed before any post-exit reset
    pub cycle_label: String,
}

/// Durable cycle/position state for one strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub strategy_id: String,
    /// Number of the current cycle; 0 until the first-ever entry
    pub cycle_number: u32,
    /// Trades within the current cycle; 0 while flat
    pub cycle_step: u32,
    /// Same-direction averaging entries made in the current cycle
    pub dca_step_count: u32,
    /// Most recent fill price of any kind; zero = eligible for a fresh cycle
    pub reference_price: Money,
    pub position: Position,
    pub entries: Vec<CycleEntry>,
    pub balance: BalanceRecord,
    pub halted: bool,
    pub last_update: DateTime<Utc>,
}

impl CycleState {
    pub fn new(strategy_id: impl Into<String>, initial_balance: Money) -> Self {
        CycleState {
            strategy_id: strategy_id.into(),
            cycle_number: 0,
            cycle_step: 0,
            dca_step_count: 0,
            reference_price: Money::ZERO,
            position: Position::flat(),
            entries: Vec::new(),
            balance: BalanceRecord::new(initial_balance),
            halted: false,
            last_update: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_flat()
    }

    /// Display/audit label of the current cycle position
    pub fn cycle_label(&self) -> String {
        format!("D{}-{}", self.cycle_number, self.cycle_step)
    }

    /// Label the next trade will carry, without mutating anything.
    /// A first entry from flat starts the next cycle at step 1.
    pub fn next_trade_label(&self) -> String {
        if self.is_flat() {
            format!("D{}-1", self.cycle_number + 1)
        } else {
            format!("D{}-{}", self.cycle_number, self.cycle_step + 1)
        }
    }

    pub fn last_entry(&self) -> Option<&CycleEntry> {
        self.entries.last()
    }

    pub fn equity(&self, mark: Money) -> Money {
        self.balance.cash_balance + pnl::mark_to_market(&self.position, mark)
    }

    pub fn unrealized_pnl(&self, mark: Money) -> Money {
        pnl::mark_to_market(&self.position, mark)
    }

    /// Apply one exchange-confirmed fill. This is the only mutation path for
    /// position, cycle counters, reference price and balance.
    pub fn apply_fill(
        &mut self,
        side: Side,
        quantity: Money,
        price: Money,
        order_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<AppliedFill, ConsistencyError> {
        if !quantity.is_positive() || !price.is_positive() {
            return Err(ConsistencyError::InvalidFill {
                order_id: order_id.to_string(),
                reason: format!("quantity {quantity} / price {price} must be positive"),
            });
        }

        let applied = match side {
            Side::Buy => self.apply_buy(quantity, price, order_id, timestamp),
            Side::Sell => self.apply_sell(quantity, price, order_id)?,
        };

        self.last_update = timestamp;
        info!(
            strategy = %self.strategy_id,
            label = %applied.cycle_label,
            ?side,
            %quantity,
            %price,
            realized = %applied.realized_pnl,
            "fill applied"
        );
        Ok(applied)
    }

    fn apply_buy(
        &mut self,
        quantity: Money,
        price: Money,
        order_id: &str,
        timestamp: DateTime<Utc>,
    ) -> AppliedFill {
        let outcome = if self.is_flat() {
            // New cycle: numbering advances exactly here
            self.cycle_number += 1;
            self.cycle_step = 1;
            self.dca_step_count = 0;
            self.entries.clear();
            FillOutcome::FirstEntry
        } else {
            self.cycle_step += 1;
            self.dca_step_count += 1;
            FillOutcome::DcaEntry
        };

        let (position, realized) = pnl::apply_fill(&self.position, Side::Buy, quantity, price);
        debug_assert!(realized.is_zero(), "buy into long cycle must not realize");
        self.position = position;
        self.reference_price = price;
        self.entries.push(CycleEntry {
            price,
            quantity,
            order_id: order_id.to_string(),
            timestamp,
        });

        self.settle(realized);
        AppliedFill {
            outcome,
            realized_pnl: realized,
            cycle_label: self.cycle_label(),
        }
    }

    fn apply_sell(
        &mut self,
        quantity: Money,
        price: Money,
        order_id: &str,
    ) -> Result<AppliedFill, ConsistencyError> {
        if self.is_flat() {
            return Err(ConsistencyError::GhostSell {
                order_id: order_id.to_string(),
            });
        }

        let full_exit = quantity >= self.position.quantity.abs();
        let (position, realized) = pnl::apply_fill(&self.position, Side::Sell, quantity, price);
        self.position = position;
        self.settle(realized);

        if full_exit {
            // Label the closing trade inside the cycle it ends, then reset
            let label = format!("D{}-{}", self.cycle_number, self.cycle_step + 1);
            self.cycle_step = 0;
            self.dca_step_count = 0;
            self.reference_price = Money::ZERO;
            self.entries.clear();
            Ok(AppliedFill {
                outcome: FillOutcome::FullExit,
                realized_pnl: realized,
                cycle_label: label,
            })
        } else {
            self.cycle_step += 1;
            self.reference_price = price;
            // LIFO: a partial sell retires the most recent entry
            self.entries.pop();
            Ok(AppliedFill {
                outcome: FillOutcome::PartialSell,
                realized_pnl: realized,
                cycle_label: self.cycle_label(),
            })
        }
    }

    fn settle(&mut self, realized: Money) {
        self.balance.realized_pnl += realized;
        self.balance.cash_balance += realized;
    }

    /// Rebuild a state by folding the full trade history from flat.
    /// Used by the safety monitor when corruption is detected.
    pub fn replay(
        strategy_id: &str,
        initial_balance: Money,
        trades: &[TradeRecord],
    ) -> Result<CycleState, ConsistencyError> {
        let mut state = CycleState::new(strategy_id, initial_balance);
        for trade in trades {
            state.apply_fill(
                trade.side,
                trade.quantity,
                trade.price,
                &trade.order_id,
                trade.timestamp,
            )?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(v: f64) -> Money {
        Money::from_f64(v)
    }

    fn new_state() -> CycleState {
        CycleState::new("test", money(1000.0))
    }

    fn buy(state: &mut CycleState, qty: f64, price: f64, order: &str) -> AppliedFill {
        state
            .apply_fill(Side::Buy, money(qty), money(price), order, Utc::now())
            .unwrap()
    }

    fn sell(state: &mut CycleState, qty: f64, price: f64, order: &str) -> AppliedFill {
        state
            .apply_fill(Side::Sell, money(qty), money(price), order, Utc::now())
            .unwrap()
    }

    #[test]
    fn test_first_entry_starts_cycle_one() {
        // Scenario A
        let mut state = new_state();
        let applied = buy(&mut state, 10.0, 100.0, "o1");

        assert_eq!(applied.outcome, FillOutcome::FirstEntry);
        assert_eq!(applied.cycle_label, "D1-1");
        assert_eq!(state.cycle_number, 1);
        assert_eq!(state.cycle_step, 1);
        assert_eq!(state.position.quantity, money(10.0));
        assert_eq!(state.position.average_cost, money(100.0));
        assert_eq!(state.reference_price, money(100.0));
        assert_eq!(state.balance.cash_balance, money(1000.0), "entries never move cash");
    }

    #[test]
    fn test_dca_entry_updates_reference_and_average() {
        // Scenario B
        let mut state = new_state();
        buy(&mut state, 10.0, 100.0, "o1");
        let applied = buy(&mut state, 15.0, 97.0, "o2");

        assert_eq!(applied.outcome, FillOutcome::DcaEntry);
        assert_eq!(applied.cycle_label, "D1-2");
        assert_eq!(state.position.average_cost, money(98.2));
        assert_eq!(state.reference_price, money(97.0));
        assert_eq!(state.dca_step_count, 1);
        assert_eq!(state.entries.len(), 2);
    }

    #[test]
    fn test_full_exit_resets_for_next_cycle() {
        // Scenario C
        let mut state = new_state();
        buy(&mut state, 10.0, 100.0, "o1");
        buy(&mut state, 15.0, 97.0, "o2");
        let applied = sell(&mut state, 25.0, 99.5, "o3");

        assert_eq!(applied.outcome, FillOutcome::FullExit);
        assert_eq!(applied.cycle_label, "D1-3");
        assert_eq!(applied.realized_pnl, money(32.5));
        assert!(state.is_flat());
        assert_eq!(state.reference_price, Money::ZERO);
        assert_eq!(state.cycle_step, 0);
        assert_eq!(state.cycle_number, 1, "cycle number is retained until the next entry");
        assert_eq!(state.balance.cash_balance, money(1032.5));
        assert_eq!(state.balance.realized_pnl, money(32.5));
        assert!(state.entries.is_empty());

        // Next entry opens cycle 2
        let applied = buy(&mut state, 10.0, 95.0, "o4");
        assert_eq!(applied.cycle_label, "D2-1");
        assert_eq!(state.cycle_number, 2);
    }

    #[test]
    fn test_partial_sell_pops_last_entry() {
        let mut state = new_state();
        buy(&mut state, 10.0, 100.0, "o1");
        buy(&mut state, 15.0, 97.0, "o2");
        let applied = sell(&mut state, 15.0, 99.0, "o3");

        assert_eq!(applied.outcome, FillOutcome::PartialSell);
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].order_id, "o1");
        assert_eq!(state.position.quantity, money(10.0));
        // Average cost untouched by the reduce
        assert_eq!(state.position.average_cost, money(98.2));
        // Reference follows the most recent fill of any kind
        assert_eq!(state.reference_price, money(99.0));
        assert_eq!(state.cycle_step, 3);
    }

    #[test]
    fn test_cycle_number_monotonic_over_cycles() {
        // P3
        let mut state = new_state();
        for cycle in 1u32..=4 {
            buy(&mut state, 10.0, 100.0, &format!("b{cycle}"));
            assert_eq!(state.cycle_number, cycle);
            sell(&mut state, 10.0, 105.0, &format!("s{cycle}"));
            assert_eq!(state.cycle_number, cycle);
            assert_eq!(state.cycle_step, 0);
        }
    }

    #[test]
    fn test_cash_conservation() {
        // P2: cash moves exactly by realized deltas
        let mut state = new_state();
        let before = state.balance.cash_balance;
        buy(&mut state, 10.0, 100.0, "o1");
        assert_eq!(state.balance.cash_balance, before);

        let applied = sell(&mut state, 10.0, 103.0, "o2");
        assert_eq!(
            state.balance.cash_balance,
            before + applied.realized_pnl
        );
        assert_eq!(
            state.equity(money(103.0)),
            state.balance.initial_balance + state.balance.realized_pnl
        );
    }

    #[test]
    fn test_ghost_sell_is_consistency_error() {
        let mut state = new_state();
        let err = state
            .apply_fill(Side::Sell, money(5.0), money(100.0), "ghost", Utc::now())
            .unwrap_err();
        assert!(matches!(err, ConsistencyError::GhostSell { .. }));
    }

    #[test]
    fn test_invalid_fill_rejected() {
        let mut state = new_state();
        assert!(state
            .apply_fill(Side::Buy, Money::ZERO, money(100.0), "o", Utc::now())
            .is_err());
        assert!(state
            .apply_fill(Side::Buy, money(1.0), Money::ZERO, "o", Utc::now())
            .is_err());
    }

    #[test]
    fn test_replay_reproduces_state() {
        let mut state = new_state();
        buy(&mut state, 10.0, 100.0, "o1");
        buy(&mut state, 15.0, 97.0, "o2");
        sell(&mut state, 15.0, 99.0, "o3");

        let trades = vec![
            TradeRecord {
                timestamp: Utc::now(),
                side: Side::Buy,
                quantity: money(10.0),
                price: money(100.0),
                cycle_label: "D1-1".into(),
                realized_pnl: Money::ZERO,
                commission: Money::ZERO,
                order_id: "o1".into(),
            },
            TradeRecord {
                timestamp: Utc::now(),
                side: Side::Buy,
                quantity: money(15.0),
                price: money(97.0),
                cycle_label: "D1-2".into(),
                realized_pnl: Money::ZERO,
                commission: Money::ZERO,
                order_id: "o2".into(),
            },
            TradeRecord {
                timestamp: Utc::now(),
                side: Side::Sell,
                quantity: money(15.0),
                price: money(99.0),
                cycle_label: "D1-3".into(),
                realized_pnl: money(12.0),
                commission: Money::ZERO,
                order_id: "o3".into(),
            },
        ];

        let rebuilt = CycleState::replay("test", money(1000.0), &trades).unwrap();
        assert_eq!(rebuilt.position, state.position);
        assert_eq!(rebuilt.cycle_number, state.cycle_number);
        assert_eq!(rebuilt.cycle_step, state.cycle_step);
        assert_eq!(rebuilt.reference_price, state.reference_price);
        assert_eq!(rebuilt.entries.len(), state.entries.len());
        assert_eq!(rebuilt.balance.cash_balance, state.balance.cash_balance);
    }
}
