//! Iteration-over-iteration composite deltas and convergence

use serde::{Deserialize, Serialize};

/// Guards the percentage computation when the previous composite is ~zero
pub const DELTA_EPSILON: f64 = 1e-9;

/// Change against the previous iteration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Delta {
    pub absolute: f64,
    /// Fraction of the previous composite
    pub percentage: f64,
}

/// Delta of `current` against `previous`
pub fn delta(current: f64, previous: f64) -> Delta {
    let absolute = current - previous;
    Delta {
        absolute,
        percentage: absolute / previous.max(DELTA_EPSILON),
    }
}

/// Convergence check over the composite history (ascending by iteration)
///
/// Fires when the last `window` successive deltas each moved less than
/// `threshold` (as a fraction of the previous composite, in magnitude).
pub fn converged(history: &[f64], window: u32, threshold: f64) -> bool {
    let window = window as usize;
    if window == 0 || history.len() < window + 1 {
        return false;
    }
    history
        .windows(2)
        .rev()
        .take(window)
        .all(|pair| delta(pair[1], pair[0]).percentage.abs() < threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta() {
        let d = delta(7.10, 7.00);
        assert!((d.absolute - 0.10).abs() < 1e-9);
        assert!((d.percentage - 0.10 / 7.00).abs() < 1e-9);
    }

    #[test]
    fn test_delta_zero_previous() {
        let d = delta(5.0, 0.0);
        assert!(d.percentage.is_finite());
        assert!(d.percentage > 0.0);
    }

    #[test]
    fn test_convergence_fires() {
        // Deltas: 1.43%, 0.14%, 0.14% -- all under 2%
        assert!(converged(&[7.00, 7.10, 7.11, 7.12], 3, 0.02));
    }

    #[test]
    fn test_convergence_needs_full_window() {
        assert!(!converged(&[7.10, 7.11, 7.12], 3, 0.02));
        assert!(!converged(&[7.12], 1, 0.02));
    }

    #[test]
    fn test_convergence_blocked_by_large_delta() {
        // Last delta is a 10% jump
        assert!(!converged(&[7.00, 7.01, 7.02, 7.72], 3, 0.02));
    }

    #[test]
    fn test_regression_counts_as_movement() {
        // A big drop is movement, not convergence
        assert!(!converged(&[7.00, 7.01, 6.30], 2, 0.02));
    }
}
