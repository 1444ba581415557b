//! PnL accounting model
//!
//! Pure fill-application and mark-to-market arithmetic over a signed
//! position. Average cost moves only on quantity-increasing fills; reducing
//! fills realize PnL and leave the average untouched. Every intermediate is
//! clamped to the safe magnitude window - this sits on the hot path of every
//! signal evaluation, so a clamped neutral value always beats a panic.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Money, PositionSide, Side};

/// Signed position: positive quantity = long, negative = short, zero = flat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub quantity: Money,
    /// Weighted average entry price of the open quantity; zero when flat
    pub average_cost: Money,
}

impl Position {
    pub fn flat() -> Self {
        Position {
            quantity: Money::ZERO,
            average_cost: Money::ZERO,
        }
    }

    pub fn side(&self) -> PositionSide {
        if self.quantity.is_positive() {
            PositionSide::Long
        } else if self.quantity.is_negative() {
            PositionSide::Short
        } else {
            PositionSide::Flat
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}

/// Clamp a value into the safe magnitude window, logging when it triggers.
fn clamp(value: Money) -> Money {
    let bound = Money::safe_bound();
    if value.abs() > bound {
        warn!(%value, "accounting value clamped to safe bound");
        if value.is_negative() {
            -bound
        } else {
            bound
        }
    } else {
        value
    }
}

/// Multiply with overflow protection: a product past Decimal range collapses
/// to the signed safe bound instead of panicking.
fn mul_clamped(a: Money, b: Money) -> Money {
    match a.checked_mul(b) {
        Some(product) => clamp(product),
        None => {
            warn!(%a, %b, "accounting product overflowed, clamping to safe bound");
            let negative = a.is_negative() != b.is_negative();
            if negative {
                -Money::safe_bound()
            } else {
                Money::safe_bound()
            }
        }
    }
}

/// Apply a fill to a position.
///
/// Returns the new position and the realized PnL delta (zero for
/// quantity-increasing fills). A reducing fill larger than the open quantity
/// flips through flat: the closing portion realizes PnL against the old
/// average, the remainder opens a fresh position at the fill price.
pub fn apply_fill(position: &Position, side: Side, quantity: Money, price: Money) -> (Position, Money) {
    let fill_qty = quantity.abs();
    if fill_qty.is_zero() {
        return (*position, Money::ZERO);
    }

    let signed_fill = match side {
        Side::Buy => fill_qty,
        Side::Sell => -fill_qty,
    };

    let old_qty = position.quantity;

    // Opening from flat
    if old_qty.is_zero() {
        let new = Position {
            quantity: signed_fill,
            average_cost: price,
        };
        return (new, Money::ZERO);
    }

    let same_direction = old_qty.is_positive() == signed_fill.is_positive();

    if same_direction {
        // Quantity-increasing: recompute the weighted average, no PnL
        let old_abs = old_qty.abs();
        let new_abs = old_abs + fill_qty;
        let total_cost =
            clamp(mul_clamped(old_abs, position.average_cost) + mul_clamped(fill_qty, price));
        let new = Position {
            quantity: old_qty + signed_fill,
            average_cost: clamp(total_cost / new_abs),
        };
        return (new, Money::ZERO);
    }

    // Quantity-reducing: realize PnL on the closed portion using the
    // absolute quantity so the sign comes from price vs side alone
    let old_abs = old_qty.abs();
    let closed = fill_qty.min(old_abs);
    let realized = if old_qty.is_positive() {
        mul_clamped(price - position.average_cost, closed)
    } else {
        mul_clamped(position.average_cost - price, closed)
    };

    let remainder = fill_qty - closed;
    let new = if remainder.is_positive() {
        // Flip through flat: the opening remainder sets a fresh average
        Position {
            quantity: match side {
                Side::Buy => remainder,
                Side::Sell => -remainder,
            },
            average_cost: price,
        }
    } else if old_abs > closed {
        // Partial close: average cost unchanged
        Position {
            quantity: old_qty + signed_fill,
            average_cost: position.average_cost,
        }
    } else {
        Position::flat()
    };

    (new, realized)
}

/// Unrealized PnL of an open position at a mark price.
///
/// Mirrors the realized formula against the mark instead of a fill price.
/// Never touches cash; only realized deltas do.
pub fn mark_to_market(position: &Position, mark: Money) -> Money {
    if position.is_flat() {
        return Money::ZERO;
    }
    let qty_abs = position.quantity.abs();
    if position.quantity.is_positive() {
        mul_clamped(mark - position.average_cost, qty_abs)
    } else {
        mul_clamped(position.average_cost - mark, qty_abs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(v: f64) -> Money {
        Money::from_f64(v)
    }

    #[test]
    fn test_open_from_flat() {
        // Scenario A: first buy 10 @ 100
        let (pos, realized) = apply_fill(&Position::flat(), Side::Buy, money(10.0), money(100.0));
        assert_eq!(pos.quantity, money(10.0));
        assert_eq!(pos.average_cost, money(100.0));
        assert_eq!(realized, Money::ZERO);
        assert_eq!(pos.side(), PositionSide::Long);
    }

    #[test]
    fn test_same_direction_weighted_average() {
        // Scenario B: 10 @ 100 then 15 @ 97 -> avg 98.2
        let (pos, _) = apply_fill(&Position::flat(), Side::Buy, money(10.0), money(100.0));
        let (pos, realized) = apply_fill(&pos, Side::Buy, money(15.0), money(97.0));
        assert_eq!(pos.quantity, money(25.0));
        assert_eq!(pos.average_cost, money(98.2));
        assert_eq!(realized, Money::ZERO);
    }

    #[test]
    fn test_full_exit_realizes_pnl() {
        // Scenario C: 25 @ 98.2 sold at 99.5 -> realized 32.5
        let pos = Position {
            quantity: money(25.0),
            average_cost: money(98.2),
        };
        let (pos, realized) = apply_fill(&pos, Side::Sell, money(25.0), money(99.5));
        assert!(pos.is_flat());
        assert_eq!(pos.average_cost, Money::ZERO);
        assert_eq!(realized, money(32.5));
    }

    #[test]
    fn test_partial_close_keeps_average() {
        let pos = Position {
            quantity: money(25.0),
            average_cost: money(98.2),
        };
        let (pos, realized) = apply_fill(&pos, Side::Sell, money(15.0), money(99.5));
        assert_eq!(pos.quantity, money(10.0));
        assert_eq!(pos.average_cost, money(98.2), "reduce must not touch average cost");
        assert_eq!(realized, money(19.5));
    }

    #[test]
    fn test_short_close_sign() {
        // Short 10 @ 100, bought back at 95 -> +50
        let pos = Position {
            quantity: money(-10.0),
            average_cost: money(100.0),
        };
        let (pos, realized) = apply_fill(&pos, Side::Buy, money(10.0), money(95.0));
        assert!(pos.is_flat());
        assert_eq!(realized, money(50.0));
    }

    #[test]
    fn test_flip_through_flat() {
        // Long 10 @ 100, sell 25 @ 110: close 10 (+100), open short 15 @ 110
        let pos = Position {
            quantity: money(10.0),
            average_cost: money(100.0),
        };
        let (pos, realized) = apply_fill(&pos, Side::Sell, money(25.0), money(110.0));
        assert_eq!(realized, money(100.0));
        assert_eq!(pos.quantity, money(-15.0));
        assert_eq!(pos.average_cost, money(110.0));
        assert_eq!(pos.side(), PositionSide::Short);
    }

    #[test]
    fn test_average_cost_ignores_interleaved_reduces() {
        // P1: the average after each same-direction fill equals the weighted
        // mean of the remaining entries regardless of reduce prices
        let (pos, _) = apply_fill(&Position::flat(), Side::Buy, money(10.0), money(100.0));
        let (pos, _) = apply_fill(&pos, Side::Sell, money(5.0), money(250.0));
        assert_eq!(pos.average_cost, money(100.0));
        let (pos, _) = apply_fill(&pos, Side::Buy, money(5.0), money(90.0));
        // (5*100 + 5*90) / 10 = 95
        assert_eq!(pos.average_cost, money(95.0));
    }

    #[test]
    fn test_mark_to_market_long_and_short() {
        let long = Position {
            quantity: money(10.0),
            average_cost: money(100.0),
        };
        assert_eq!(mark_to_market(&long, money(105.0)), money(50.0));

        // Scenario E: short 10 @ 100, mark 105 -> -50, not +50
        let short = Position {
            quantity: money(-10.0),
            average_cost: money(100.0),
        };
        assert_eq!(mark_to_market(&short, money(105.0)), money(-50.0));
        assert_eq!(mark_to_market(&Position::flat(), money(105.0)), Money::ZERO);
    }

    #[test]
    fn test_overflow_clamps_instead_of_panicking() {
        let pos = Position {
            quantity: Money::safe_bound(),
            average_cost: Money::ZERO,
        };
        let pnl = mark_to_market(&pos, Money::safe_bound());
        assert_eq!(pnl, Money::safe_bound());
    }

    #[test]
    fn test_zero_quantity_fill_is_noop() {
        let pos = Position {
            quantity: money(10.0),
            average_cost: money(100.0),
        };
        let (new_pos, realized) = apply_fill(&pos, Side::Sell, Money::ZERO, money(120.0));
        assert_eq!(new_pos, pos);
        assert_eq!(realized, Money::ZERO);
    }
}
