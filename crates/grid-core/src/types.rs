//! Shared identifiers and capacity accounting used across grid crates.

use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Identifier of a compute node on the grid.
pub type NodeId = u32;

/// Identifier of an on-chain contract. `0` means "no contract yet".
pub type ContractId = u64;

/// Identifier of a twin (an on-chain account identity).
pub type TwinId = u32;

/// Identifier of a farm (a group of nodes sharing a public IP pool).
pub type FarmId = u32;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Resource quadruple: compute units, memory, SSD storage, HDD storage.
///
/// Memory and storage are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub cru: u64,
    pub mru: u64,
    pub sru: u64,
    pub hru: u64,
}

impl Capacity {
    pub fn new(cru: u64, mru: u64, sru: u64, hru: u64) -> Self {
        Self { cru, mru, sru, hru }
    }

    /// Component-wise subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            cru: self.cru.saturating_sub(other.cru),
            mru: self.mru.saturating_sub(other.mru),
            sru: self.sru.saturating_sub(other.sru),
            hru: self.hru.saturating_sub(other.hru),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Capacity::default()
    }
}

impl Add for Capacity {
    type Output = Capacity;

    fn add(self, rhs: Capacity) -> Capacity {
        Capacity {
            cru: self.cru + rhs.cru,
            mru: self.mru + rhs.mru,
            sru: self.sru + rhs.sru,
            hru: self.hru + rhs.hru,
        }
    }
}

impl AddAssign for Capacity {
    fn add_assign(&mut self, rhs: Capacity) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cru: {}, mru: {:.2} GB, sru: {:.2} GB, hru: {:.2} GB",
            self.cru,
            self.mru as f64 / GIB as f64,
            self.sru as f64 / GIB as f64,
            self.hru as f64 / GIB as f64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_sub_clamps() {
        let a = Capacity::new(2, 4 * GIB, 10 * GIB, 0);
        let b = Capacity::new(4, GIB, 0, 5);
        assert_eq!(a.saturating_sub(&b), Capacity::new(0, 3 * GIB, 10 * GIB, 0));
    }

    #[test]
    fn add_assign_sums_components() {
        let mut total = Capacity::default();
        total += Capacity::new(1, MIB, 0, 0);
        total += Capacity::new(1, MIB, GIB, 2);
        assert_eq!(total, Capacity::new(2, 2 * MIB, GIB, 2));
        assert!(!total.is_zero());
    }

    #[test]
    fn display_is_human_readable() {
        let cap = Capacity::new(2, 2 * GIB, GIB / 2, 0);
        assert_eq!(cap.to_string(), "cru: 2, mru: 2.00 GB, sru: 0.50 GB, hru: 0.00 GB");
    }
}
