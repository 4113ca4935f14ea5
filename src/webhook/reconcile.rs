// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Comparison of paid amounts against the expected order total.

use crate::config::AMOUNT_TOLERANCE_PERCENT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Within tolerance of the expected amount.
    Matched { difference: i64 },
    /// More than the tolerance above expected. Accepted, flagged for review.
    Overpaid { excess: i64 },
    /// More than the tolerance below expected. Rejected.
    Underpaid { shortfall: i64 },
}

impl Reconciliation {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Reconciliation::Underpaid { .. })
    }
}

/// Absolute tolerance for `expected`, in minor units.
pub fn tolerance(expected: i64) -> i64 {
    expected.saturating_mul(AMOUNT_TOLERANCE_PERCENT) / 100
}

pub fn reconcile(expected: i64, paid: i64) -> Reconciliation {
    let tolerance = tolerance(expected);
    let difference = paid.saturating_sub(expected);
    if difference < -tolerance {
        Reconciliation::Underpaid {
            shortfall: -difference,
        }
    } else if difference > tolerance {
        Reconciliation::Overpaid { excess: difference }
    } else {
        Reconciliation::Matched { difference }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_percent_boundaries() {
        assert_eq!(tolerance(10_000), 100);
        assert_eq!(
            reconcile(10_000, 10_000),
            Reconciliation::Matched { difference: 0 }
        );
        assert_eq!(
            reconcile(10_000, 9_900),
            Reconciliation::Matched { difference: -100 }
        );
        assert_eq!(
            reconcile(10_000, 9_899),
            Reconciliation::Underpaid { shortfall: 101 }
        );
        assert_eq!(
            reconcile(10_000, 10_100),
            Reconciliation::Matched { difference: 100 }
        );
        assert_eq!(
            reconcile(10_000, 10_500),
            Reconciliation::Overpaid { excess: 500 }
        );
    }

    #[test]
    fn small_amounts_have_zero_tolerance() {
        assert_eq!(tolerance(99), 0);
        assert!(!reconcile(99, 98).is_accepted());
        assert!(reconcile(99, 99).is_accepted());
    }

    #[test]
    fn overpayment_is_accepted() {
        assert!(reconcile(10_000, 20_000).is_accepted());
    }
}
