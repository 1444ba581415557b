//! DCA strategy decision function
//!
//! Pure mapping from (cycle state, indicator signal, market price, params) to
//! a proposed action. Never touches durable state; the order manager decides
//! whether and how the proposal becomes an order.
//!
//! Entry rules: a BUY signal opens a cycle from flat, or adds a DCA entry
//! once price has dropped at least `min_drop_pct` from the reference price.
//! Exit rules: on a SELL signal a full exit fires when price clears the
//! average cost by `profit_threshold_pct`; otherwise a partial sell of the
//! most recent entry fires when price clears the reference price by the same
//! threshold. Full exit wins when both hold.

use crate::config::DcaParams;
use crate::cycle::CycleState;
use crate::exchange::MarketInfo;
use crate::indicators::{OttMode, OttSignal};
use crate::types::{Money, Side};

/// What kind of cycle action a proposal represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    FirstEntry,
    DcaEntry,
    PartialSell,
    FullExit,
}

/// A concrete order proposal for the order manager
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub side: Side,
    pub quantity: Money,
    /// None = market order
    pub price: Option<Money>,
    pub kind: ActionKind,
}

/// Outcome of one decision evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Trade(Proposal),
    Hold(&'static str),
}

/// `base_quantity * dca_multiplier^n` for the n-th entry of a cycle
fn entry_quantity(params: &DcaParams, entry_index: usize) -> Money {
    let mut quantity = Money::from_f64(params.base_quantity);
    let multiplier = Money::from_f64(params.dca_multiplier);
    for _ in 0..entry_index {
        quantity = quantity * multiplier;
    }
    quantity
}

/// Conform a raw quantity to exchange filters. Returns `None` when the
/// rounded quantity falls below the minimum quantity or notional.
fn conform_quantity(raw: Money, price: Money, market: &MarketInfo) -> Option<Money> {
    let quantity = raw.round_down_to(market.step_size);
    if quantity < market.min_qty || !quantity.is_positive() {
        return None;
    }
    if quantity * price < market.min_notional {
        return None;
    }
    Some(quantity)
}

fn order_price(params: &DcaParams, price: Money, market: &MarketInfo) -> Option<Money> {
    if params.use_market_orders {
        None
    } else {
        Some(price.round_down_to(market.tick_size))
    }
}

/// Evaluate the strategy for one tick.
pub fn decide(
    state: &CycleState,
    signal: &OttSignal,
    price: Money,
    params: &DcaParams,
    market: &MarketInfo,
) -> Decision {
    if state.halted {
        return Decision::Hold("strategy is halted");
    }
    if !price.is_positive() {
        return Decision::Hold("market price is not positive");
    }

    match signal.mode {
        OttMode::Buy => decide_buy(state, price, params, market),
        OttMode::Sell => decide_sell(state, price, params, market),
    }
}

fn decide_buy(
    state: &CycleState,
    price: Money,
    params: &DcaParams,
    market: &MarketInfo,
) -> Decision {
    // Fresh cycle: reference price sentinel zero means eligible for entry
    if state.is_flat() {
        let Some(quantity) = conform_quantity(entry_quantity(params, 0), price, market) else {
            return Decision::Hold("first entry below exchange minimum");
        };
        return Decision::Trade(Proposal {
            side: Side::Buy,
            quantity,
            price: order_price(params, price, market),
            kind: ActionKind::FirstEntry,
        });
    }

    if state.entries.len() >= params.max_dca_steps {
        return Decision::Hold("max DCA entries reached for this cycle");
    }

    // Drop is measured from the last fill of any kind, not the average cost
    let reference = state.reference_price;
    if !reference.is_positive() {
        return Decision::Hold("open cycle without reference price");
    }
    let hundred = Money::from_i64(100);
    let drop_pct = (reference - price) / reference * hundred;
    if drop_pct < Money::from_f64(params.min_drop_pct) {
        return Decision::Hold("drop from reference below DCA threshold");
    }

    let raw = entry_quantity(params, state.entries.len());
    let Some(quantity) = conform_quantity(raw, price, market) else {
        return Decision::Hold("DCA entry below exchange minimum");
    };
    Decision::Trade(Proposal {
        side: Side::Buy,
        quantity,
        price: order_price(params, price, market),
        kind: ActionKind::DcaEntry,
    })
}

fn decide_sell(
    state: &CycleState,
    price: Money,
    params: &DcaParams,
    market: &MarketInfo,
) -> Decision {
    if state.is_flat() {
        return Decision::Hold("sell signal with no position");
    }

    let threshold = Money::from_f64(1.0 + params.profit_threshold_pct / 100.0);

    // Full exit takes precedence: closing everything is the stronger signal
    let avg_cost = state.position.average_cost;
    if avg_cost.is_positive() && price >= avg_cost * threshold {
        let Some(quantity) =
            conform_quantity(state.position.quantity.abs(), price, market)
        else {
            return Decision::Hold("position below exchange minimum");
        };
        return Decision::Trade(Proposal {
            side: Side::Sell,
            quantity,
            price: order_price(params, price, market),
            kind: ActionKind::FullExit,
        });
    }

    // Partial: retire the most recent entry when price clears the reference
    let reference = state.reference_price;
    if reference.is_positive() && price >= reference * threshold {
        let Some(last) = state.last_entry() else {
            return Decision::Hold("no cycle entry left to sell");
        };
        // Never sell more than the open quantity
        let raw = last.quantity.min(state.position.quantity.abs());
        let Some(quantity) = conform_quantity(raw, price, market) else {
            return Decision::Hold("partial sell below exchange minimum");
        };
        if quantity >= state.position.quantity.abs() {
            return Decision::Hold("partial sell would flatten the position");
        }
        return Decision::Trade(Proposal {
            side: Side::Sell,
            quantity,
            price: order_price(params, price, market),
            kind: ActionKind::PartialSell,
        });
    }

    Decision::Hold("profit conditions unmet")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::OttMode;
    use chrono::Utc;

    fn money(v: f64) -> Money {
        Money::from_f64(v)
    }

    fn market() -> MarketInfo {
        MarketInfo {
            tick_size: money(0.01),
            step_size: money(0.01),
            min_qty: money(0.01),
            min_notional: money(5.0),
        }
    }

    fn params() -> DcaParams {
        DcaParams {
            base_quantity: 10.0,
            dca_multiplier: 1.5,
            min_drop_pct: 2.0,
            profit_threshold_pct: 1.0,
            max_dca_steps: 10,
            use_market_orders: true,
            initial_balance: 1000.0,
        }
    }

    fn signal(mode: OttMode) -> OttSignal {
        OttSignal {
            mode,
            line: 0.0,
            support: 0.0,
            long_stop: 0.0,
            short_stop: 0.0,
        }
    }

    fn state_with_fills(fills: &[(Side, f64, f64)]) -> CycleState {
        let mut state = CycleState::new("test", money(1000.0));
        for (i, (side, qty, price)) in fills.iter().enumerate() {
            state
                .apply_fill(*side, money(*qty), money(*price), &format!("o{i}"), Utc::now())
                .unwrap();
        }
        state
    }

    #[test]
    fn test_first_entry_on_buy_signal() {
        let state = CycleState::new("test", money(1000.0));
        let decision = decide(&state, &signal(OttMode::Buy), money(100.0), &params(), &market());
        match decision {
            Decision::Trade(p) => {
                assert_eq!(p.kind, ActionKind::FirstEntry);
                assert_eq!(p.side, Side::Buy);
                assert_eq!(p.quantity, money(10.0));
                assert_eq!(p.price, None);
            }
            other => panic!("expected first entry, got {other:?}"),
        }
    }

    #[test]
    fn test_dca_triggers_on_sufficient_drop() {
        // Scenario B: ref 100, price 97 is a 3% drop over the 2% threshold
        let state = state_with_fills(&[(Side::Buy, 10.0, 100.0)]);
        let decision = decide(&state, &signal(OttMode::Buy), money(97.0), &params(), &market());
        match decision {
            Decision::Trade(p) => {
                assert_eq!(p.kind, ActionKind::DcaEntry);
                assert_eq!(p.quantity, money(15.0), "second entry is base * multiplier");
            }
            other => panic!("expected DCA entry, got {other:?}"),
        }
    }

    #[test]
    fn test_dca_blocked_below_threshold() {
        let state = state_with_fills(&[(Side::Buy, 10.0, 100.0)]);
        // 1% drop < 2% threshold
        let decision = decide(&state, &signal(OttMode::Buy), money(99.0), &params(), &market());
        assert!(matches!(decision, Decision::Hold(_)));
    }

    #[test]
    fn test_dca_blocked_at_max_steps() {
        let mut p = params();
        p.max_dca_steps = 1;
        let state = state_with_fills(&[(Side::Buy, 10.0, 100.0)]);
        let decision = decide(&state, &signal(OttMode::Buy), money(90.0), &p, &market());
        assert_eq!(decision, Decision::Hold("max DCA entries reached for this cycle"));
    }

    #[test]
    fn test_full_exit_above_average_cost_threshold() {
        // Scenario C: avg 98.2, threshold 1% -> exit at 99.5
        let state = state_with_fills(&[(Side::Buy, 10.0, 100.0), (Side::Buy, 15.0, 97.0)]);
        let decision = decide(&state, &signal(OttMode::Sell), money(99.5), &params(), &market());
        match decision {
            Decision::Trade(p) => {
                assert_eq!(p.kind, ActionKind::FullExit);
                assert_eq!(p.quantity, money(25.0));
            }
            other => panic!("expected full exit, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_sell_against_reference() {
        // avg 98.2 needs 99.182 to exit; reference is 97 so 98.5 clears the
        // partial threshold (97.97) without clearing the full one
        let state = state_with_fills(&[(Side::Buy, 10.0, 100.0), (Side::Buy, 15.0, 97.0)]);
        let decision = decide(&state, &signal(OttMode::Sell), money(98.5), &params(), &market());
        match decision {
            Decision::Trade(p) => {
                assert_eq!(p.kind, ActionKind::PartialSell);
                assert_eq!(p.quantity, money(15.0), "partial sell retires the last entry");
            }
            other => panic!("expected partial sell, got {other:?}"),
        }
    }

    #[test]
    fn test_full_exit_takes_precedence_over_partial() {
        let state = state_with_fills(&[(Side::Buy, 10.0, 100.0), (Side::Buy, 15.0, 97.0)]);
        // 105 clears both thresholds; closing wins
        let decision = decide(&state, &signal(OttMode::Sell), money(105.0), &params(), &market());
        match decision {
            Decision::Trade(p) => assert_eq!(p.kind, ActionKind::FullExit),
            other => panic!("expected full exit, got {other:?}"),
        }
    }

    #[test]
    fn test_sell_signal_flat_is_noop() {
        let state = CycleState::new("test", money(1000.0));
        let decision = decide(&state, &signal(OttMode::Sell), money(100.0), &params(), &market());
        assert_eq!(decision, Decision::Hold("sell signal with no position"));
    }

    #[test]
    fn test_halted_strategy_never_trades() {
        let mut state = CycleState::new("test", money(1000.0));
        state.halted = true;
        let decision = decide(&state, &signal(OttMode::Buy), money(100.0), &params(), &market());
        assert_eq!(decision, Decision::Hold("strategy is halted"));
    }

    #[test]
    fn test_exchange_minimums_block_tiny_orders() {
        let mut p = params();
        p.base_quantity = 0.001;
        let state = CycleState::new("test", money(1000.0));
        let decision = decide(&state, &signal(OttMode::Buy), money(100.0), &p, &market());
        assert!(matches!(decision, Decision::Hold(_)));
    }

    #[test]
    fn test_limit_order_price_rounded_to_tick() {
        let mut p = params();
        p.use_market_orders = false;
        let state = CycleState::new("test", money(1000.0));
        let decision = decide(&state, &signal(OttMode::Buy), money(100.456), &p, &market());
        match decision {
            Decision::Trade(prop) => assert_eq!(prop.price, Some(money(100.45))),
            other => panic!("expected trade, got {other:?}"),
        }
    }
}
