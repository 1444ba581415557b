//! Technical indicators
//!
//! OTT (Optimized Trend Tracker) signal pipeline: Chande Momentum Oscillator
//! drives a VIDYA (variable-rate moving average), which feeds a
//! direction-aware trailing-stop envelope. All arithmetic is bounded: inputs
//! and intermediates outside the safe magnitude window produce "no signal"
//! instead of propagating.

use tracing::warn;

/// Momentum window feeding the VIDYA adaptation rate
pub const CMO_PERIOD: usize = 9;

/// Magnitude ceiling for any price or intermediate value
const MAX_SAFE_VALUE: f64 = 1e15;

/// Denominators below this are treated as failed divisions
const MIN_DENOMINATOR: f64 = 1e-15;

/// Indicator verdict for the current bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OttMode {
    Buy,
    Sell,
}

/// Result of an OTT evaluation over a price window
#[derive(Debug, Clone, Copy)]
pub struct OttSignal {
    pub mode: OttMode,
    /// Published trend line (active stop with the correction factor applied)
    pub line: f64,
    /// Support line (last VIDYA value)
    pub support: f64,
    pub long_stop: f64,
    pub short_stop: f64,
}

fn window_is_sane(prices: &[f64]) -> bool {
    prices
        .iter()
        .all(|p| p.is_finite() && *p > 0.0 && p.abs() < MAX_SAFE_VALUE)
}

/// Chande Momentum Oscillator over a fixed window, in [-100, 100].
///
/// Returns one value per bar starting at index `period`.
pub fn cmo(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.len() < period + 1 || period == 0 {
        return Vec::new();
    }

    let mut values = Vec::with_capacity(prices.len() - period);
    for i in period..prices.len() {
        let mut gains = 0.0;
        let mut losses = 0.0;
        for j in (i - period + 1)..=i {
            let change = prices[j] - prices[j - 1];
            if change > 0.0 {
                gains += change;
            } else {
                losses += -change;
            }
        }

        let total = gains + losses;
        if total < MIN_DENOMINATOR {
            values.push(0.0);
        } else {
            values.push((gains - losses) / total * 100.0);
        }
    }
    values
}

/// VIDYA: `vma[t] = vma[t-1] + alpha * |cmo[t]|/100 * (price[t] - vma[t-1])`
/// with `alpha = 2 / (period + 1)`.
///
/// Returns one value per bar starting at index `max(period, cmo_period)`.
pub fn vidya(prices: &[f64], period: usize, cmo_period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period.max(cmo_period) + 1 {
        return Vec::new();
    }

    let cmo_values = cmo(prices, cmo_period);
    if cmo_values.is_empty() {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let start = period.max(cmo_period);
    let mut vma = prices[period - 1];
    let mut values = Vec::with_capacity(prices.len() - start);

    for (offset, i) in (start..prices.len()).enumerate() {
        // cmo series starts at index cmo_period; align to the same bar
        let cmo_idx = i - cmo_period;
        let rate = cmo_values
            .get(cmo_idx.min(cmo_values.len() - 1))
            .copied()
            .unwrap_or(0.0)
            .abs()
            / 100.0;
        vma += alpha * rate * (prices[i] - vma);

        if !vma.is_finite() || vma.abs() > MAX_SAFE_VALUE {
            warn!(offset, vma, "vidya value left the safe window, truncating series");
            return values;
        }
        values.push(vma);
    }
    values
}

/// Evaluate the OTT signal over a closing-price window.
///
/// `period` is the VIDYA period, `opt` the envelope factor in percent. The
/// trailing stops ratchet: in an uptrend the long stop only moves up, in a
/// downtrend the short stop only moves down, and the trend flips when price
/// crosses the opposite stop. Returns `None` on insufficient or unusable
/// history (the caller treats that as "no signal", never an error).
pub fn compute_signal(prices: &[f64], period: usize, opt: f64) -> Option<OttSignal> {
    if period == 0 || !opt.is_finite() || opt <= 0.0 {
        return None;
    }
    if prices.len() < period.max(CMO_PERIOD) + 1 {
        return None;
    }
    if !window_is_sane(prices) {
        warn!("rejecting indicator window with non-finite or non-positive prices");
        return None;
    }

    let vma_series = vidya(prices, period, CMO_PERIOD);
    if vma_series.is_empty() {
        return None;
    }
    let start = period.max(CMO_PERIOD);

    let mut trending_up = prices[start] >= vma_series[0];
    let mut long_stop = f64::MIN;
    let mut short_stop = f64::MAX;

    for (offset, &vma) in vma_series.iter().enumerate() {
        let price = prices[start + offset];
        let stop_offset = vma * opt / 100.0;

        if trending_up {
            long_stop = long_stop.max(vma - stop_offset);
            if price < long_stop {
                trending_up = false;
                short_stop = vma + stop_offset;
            }
        } else {
            short_stop = short_stop.min(vma + stop_offset);
            if price > short_stop {
                trending_up = true;
                long_stop = vma - stop_offset;
            }
        }
    }

    let support = *vma_series.last()?;
    // Correction factor: long stop nudged up, short stop nudged down
    let line = if trending_up {
        long_stop * (1.0 + opt / 200.0)
    } else {
        short_stop * (1.0 - opt / 200.0)
    };

    if !line.is_finite() || line.abs() > MAX_SAFE_VALUE {
        warn!(line, "ott line left the safe window, suppressing signal");
        return None;
    }

    let mode = if line < support {
        OttMode::Buy
    } else {
        OttMode::Sell
    };

    Some(OttSignal {
        mode,
        line,
        support,
        long_stop,
        short_stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    fn falling(n: usize) -> Vec<f64> {
        (0..n).map(|i| 200.0 - i as f64).collect()
    }

    #[test]
    fn test_cmo_monotonic_series_saturates() {
        let values = cmo(&rising(20), CMO_PERIOD);
        assert!(!values.is_empty());
        for v in values {
            assert_relative_eq!(v, 100.0);
        }

        let values = cmo(&falling(20), CMO_PERIOD);
        for v in values {
            assert_relative_eq!(v, -100.0);
        }
    }

    #[test]
    fn test_cmo_flat_series_is_zero() {
        let flat = vec![50.0; 20];
        for v in cmo(&flat, CMO_PERIOD) {
            assert_relative_eq!(v, 0.0);
        }
    }

    #[test]
    fn test_cmo_insufficient_data() {
        assert!(cmo(&rising(CMO_PERIOD), CMO_PERIOD).is_empty());
    }

    #[test]
    fn test_vidya_tracks_trend() {
        let prices = rising(60);
        let values = vidya(&prices, 20, CMO_PERIOD);
        assert!(!values.is_empty());
        // Full momentum: vidya follows the price upward
        let last = *values.last().unwrap();
        assert!(last > prices[19]);
        assert!(last < *prices.last().unwrap());
    }

    #[test]
    fn test_compute_signal_requires_history() {
        assert!(compute_signal(&rising(20), 20, 2.0).is_none());
        assert!(compute_signal(&rising(40), 20, 2.0).is_some());
    }

    #[test]
    fn test_compute_signal_rejects_bad_window() {
        let mut prices = rising(40);
        prices[5] = f64::NAN;
        assert!(compute_signal(&prices, 20, 2.0).is_none());

        let mut prices = rising(40);
        prices[5] = -10.0;
        assert!(compute_signal(&prices, 20, 2.0).is_none());
    }

    #[test]
    fn test_uptrend_gives_buy() {
        let signal = compute_signal(&rising(80), 20, 2.0).unwrap();
        assert_eq!(signal.mode, OttMode::Buy);
        assert!(signal.line < signal.support);
    }

    #[test]
    fn test_downtrend_gives_sell() {
        let signal = compute_signal(&falling(80), 20, 2.0).unwrap();
        assert_eq!(signal.mode, OttMode::Sell);
        assert!(signal.line >= signal.support);
    }

    #[test]
    fn test_long_stop_ratchets_in_uptrend() {
        let signal = compute_signal(&rising(80), 20, 2.0).unwrap();
        // The ratcheted long stop must sit below the support line by the
        // envelope offset at most
        assert!(signal.long_stop < signal.support);
        assert!(signal.long_stop > signal.support * 0.9);
    }

    #[test]
    fn test_invalid_params_no_signal() {
        assert!(compute_signal(&rising(80), 0, 2.0).is_none());
        assert!(compute_signal(&rising(80), 20, 0.0).is_none());
        assert!(compute_signal(&rising(80), 20, f64::NAN).is_none());
    }
}
