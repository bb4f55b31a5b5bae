//! Utilities to approximate equality of floating point values.
//!
//! Used to compare results of the CPU and GPU execution paths, which agree
//! only up to rounding.

use crate::Real;
use crate::tensors::BatchArray;

/// The max epsilon accepted.
pub const MAX_ERROR: Real = 1e-3;

/// The epsilon expected between the CPU and GPU paths.
pub const AVG_ERROR: Real = 1e-5;

/// The best expected epsilon.
pub const MIN_ERROR: Real = 1e-6;

/// The approximated equality enumerated.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,

    /// Good epsilon.
    Partial = 1,

    /// Acceptable epsilon
    Relative = 2,

    /// No relative equality.
    Scarce = 3,
}

/// Checks the distance between values based off epsilon.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    /// Enumerates the equality of `self` and `rhs`; for collections, the worst element wins.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq for Real {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        // identical values, including matching infinities
        if self == rhs {
            return ApproxEquality::Precise;
        }
        let dif = (self - rhs).abs();

        if dif < MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl RelativeEq for [Real] {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (a, b) in self.iter().zip(rhs) {
            eq = eq.max(a.approx_eq(b));
            if eq == ApproxEquality::Scarce {
                break; // can't improve from here
            }
        }
        eq
    }
}

impl RelativeEq for BatchArray {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if !self.same_layout(rhs) {
            return ApproxEquality::Scarce;
        }
        self.data().approx_eq(rhs.data())
    }
}

/// Returns `true` if `a` and `b` agree within [`AVG_ERROR`] everywhere.
pub fn approx_eq<T: RelativeEq + ?Sized>(a: &T, b: &T) -> bool {
    a.approx_eq(b) <= ApproxEquality::Partial
}

/// Index, left and right value of the first pair differing by `tolerance` or more.
pub fn first_difference(a: &[Real], b: &[Real], tolerance: Real) -> Option<(usize, Real, Real)> {
    a.iter()
        .zip(b)
        .enumerate()
        .find(|&(_, (x, y))| x != y && !((x - y).abs() < tolerance))
        .map(|(i, (&x, &y))| (i, x, y))
}
