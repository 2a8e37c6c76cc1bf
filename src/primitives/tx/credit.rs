use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul};

use serde::{Deserialize, Serialize};

/// Upper bound on the capacity an operation may consume inside a transaction.
///
/// `reg_nr` counts capture calls, `reg_size` counts captured bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    /// Number of regions.
    pub reg_nr: u64,
    /// Total bytes across all regions.
    pub reg_size: u64,
}

impl Credit {
    /// Empty credit.
    pub const ZERO: Credit = Credit::new(0, 0);

    /// Builds a credit from its parts.
    pub const fn new(reg_nr: u64, reg_size: u64) -> Self {
        Self { reg_nr, reg_size }
    }

    /// Credit of a single region of `len` bytes.
    pub const fn region(len: u64) -> Self {
        Self::new(1, len)
    }

    /// Returns `self + other * n`.
    pub fn mac(self, other: Credit, n: u64) -> Self {
        self + other * n
    }

    /// Component-wise maximum.
    pub fn max(self, other: Credit) -> Self {
        Self::new(
            self.reg_nr.max(other.reg_nr),
            self.reg_size.max(other.reg_size),
        )
    }

    /// Reports whether `self` fits inside `budget`.
    pub fn fits(&self, budget: &Credit) -> bool {
        self.reg_nr <= budget.reg_nr && self.reg_size <= budget.reg_size
    }
}

impl Add for Credit {
    type Output = Credit;

    fn add(self, rhs: Credit) -> Credit {
        Credit::new(
            self.reg_nr.saturating_add(rhs.reg_nr),
            self.reg_size.saturating_add(rhs.reg_size),
        )
    }
}

impl AddAssign for Credit {
    fn add_assign(&mut self, rhs: Credit) {
        *self = *self + rhs;
    }
}

impl Mul<u64> for Credit {
    type Output = Credit;

    fn mul(self, n: u64) -> Credit {
        Credit::new(
            self.reg_nr.saturating_mul(n),
            self.reg_size.saturating_mul(n),
        )
    }
}

impl Sum for Credit {
    fn sum<I: Iterator<Item = Credit>>(iter: I) -> Credit {
        iter.fold(Credit::ZERO, Add::add)
    }
}
