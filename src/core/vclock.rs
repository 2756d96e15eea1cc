//! Vector clock over instance ids.
//!
//! Each contributing instance owns one monotone LSN counter. Clocks are
//! partially ordered; the component sum acts as a total-order signature
//! for naming segments and reporting write results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::row::Row;

/// Instance identifier contributing one vclock coordinate. Zero is reserved
/// for "not assigned yet" (rows produced locally before LSN assignment).
pub type InstanceId = u32;

/// Sentinel for an unassigned instance id.
pub const INSTANCE_ID_NIL: InstanceId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrder {
    Less,
    Equal,
    Greater,
    /// Neither clock dominates the other componentwise.
    Incomparable,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("non-monotonic lsn for instance {instance}: current {current}, got {attempted}")]
    NonMonotonic {
        instance: InstanceId,
        current: i64,
        attempted: i64,
    },
}

/// Sparse map from instance id to the last known LSN of that instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VClock {
    map: BTreeMap<InstanceId, i64>,
}

impl VClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// LSN of `instance`, zero when the component is absent.
    pub fn get(&self, instance: InstanceId) -> i64 {
        self.map.get(&instance).copied().unwrap_or(0)
    }

    /// True when at least one component is set.
    pub fn is_set(&self) -> bool {
        !self.map.is_empty()
    }

    /// Sum of all components. Used as a single-number signature: segment
    /// directory order and journal write results are expressed in it.
    pub fn sum(&self) -> i64 {
        self.map.values().sum()
    }

    /// Advance one component to `lsn`. Fails unless `lsn` is strictly
    /// greater than the current value.
    pub fn follow(&mut self, instance: InstanceId, lsn: i64) -> Result<(), ClockError> {
        let current = self.get(instance);
        if lsn <= current {
            return Err(ClockError::NonMonotonic {
                instance,
                current,
                attempted: lsn,
            });
        }
        self.map.insert(instance, lsn);
        Ok(())
    }

    /// Advance one component by the identity of a row that has an assigned
    /// `(replica_id, lsn)` pair.
    pub fn follow_row(&mut self, row: &Row) -> Result<(), ClockError> {
        self.follow(row.replica_id, row.lsn)
    }

    /// Increment one component and return the new value.
    pub fn inc(&mut self, instance: InstanceId) -> i64 {
        let slot = self.map.entry(instance).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Componentwise add of a diff produced during batch LSN assignment.
    pub fn merge(&mut self, diff: &VClock) {
        for (&instance, &delta) in &diff.map {
            *self.map.entry(instance).or_insert(0) += delta;
        }
    }

    /// Componentwise partial order.
    pub fn compare(&self, other: &VClock) -> ClockOrder {
        let mut le = true;
        let mut ge = true;
        let instances = self.map.keys().chain(other.map.keys());
        for &instance in instances {
            let a = self.get(instance);
            let b = other.get(instance);
            if a < b {
                ge = false;
            }
            if a > b {
                le = false;
            }
        }
        match (le, ge) {
            (true, true) => ClockOrder::Equal,
            (true, false) => ClockOrder::Less,
            (false, true) => ClockOrder::Greater,
            (false, false) => ClockOrder::Incomparable,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, i64)> + '_ {
        self.map.iter().map(|(&id, &lsn)| (id, lsn))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// True when the frontier `target` was crossed by moving from `old` to
/// `new`: `old` had not reached it and `new` has. Used to decide when a
/// consumer update makes garbage collection worthwhile.
pub fn order_crossed(old: &VClock, target: &VClock, new: &VClock) -> bool {
    if old.compare(target) == ClockOrder::Greater {
        return false;
    }
    matches!(new.compare(target), ClockOrder::Greater | ClockOrder::Equal)
}

impl fmt::Display for VClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (id, lsn)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}: {lsn}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(InstanceId, i64)]) -> VClock {
        let mut v = VClock::new();
        for &(id, lsn) in pairs {
            v.follow(id, lsn).expect("test clock is monotone");
        }
        v
    }

    #[test]
    fn follow_rejects_non_monotonic() {
        let mut v = clock(&[(1, 5)]);
        assert_eq!(
            v.follow(1, 5),
            Err(ClockError::NonMonotonic {
                instance: 1,
                current: 5,
                attempted: 5,
            })
        );
        assert_eq!(v.get(1), 5);
        v.follow(1, 6).unwrap();
        assert_eq!(v.get(1), 6);
    }

    #[test]
    fn inc_and_sum() {
        let mut v = VClock::new();
        assert_eq!(v.inc(1), 1);
        assert_eq!(v.inc(1), 2);
        assert_eq!(v.inc(3), 1);
        assert_eq!(v.sum(), 3);
        assert!(v.is_set());
    }

    #[test]
    fn compare_covers_all_orders() {
        let a = clock(&[(1, 2), (2, 3)]);
        let b = clock(&[(1, 2), (2, 3)]);
        assert_eq!(a.compare(&b), ClockOrder::Equal);

        let c = clock(&[(1, 1)]);
        assert_eq!(c.compare(&a), ClockOrder::Less);
        assert_eq!(a.compare(&c), ClockOrder::Greater);

        let d = clock(&[(1, 5), (2, 1)]);
        assert_eq!(a.compare(&d), ClockOrder::Incomparable);
    }

    #[test]
    fn merge_is_componentwise_add() {
        let mut base = clock(&[(1, 5)]);
        let mut diff = VClock::new();
        diff.inc(1);
        diff.inc(1);
        diff.inc(2);
        base.merge(&diff);
        assert_eq!(base.get(1), 7);
        assert_eq!(base.get(2), 1);
    }

    #[test]
    fn merge_empty_is_identity() {
        let mut a = clock(&[(1, 4), (7, 2)]);
        let before = a.clone();
        a.merge(&VClock::new());
        assert_eq!(a, before);
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let x = clock(&[(1, 1), (2, 2)]);
        let y = clock(&[(2, 3), (4, 1)]);
        let z = clock(&[(1, 2)]);

        let mut ab = x.clone();
        ab.merge(&y);
        let mut ba = y.clone();
        ba.merge(&x);
        assert_eq!(ab, ba);

        let mut left = x.clone();
        left.merge(&y);
        left.merge(&z);
        let mut yz = y.clone();
        yz.merge(&z);
        let mut right = x.clone();
        right.merge(&yz);
        assert_eq!(left, right);
    }

    #[test]
    fn order_crossed_detects_frontier() {
        let target = clock(&[(1, 5)]);
        let old = clock(&[(1, 3)]);
        let new = clock(&[(1, 5)]);
        assert!(order_crossed(&old, &target, &new));
        assert!(!order_crossed(&clock(&[(1, 6)]), &target, &clock(&[(1, 9)])));
        assert!(!order_crossed(&old, &target, &clock(&[(1, 4)])));
    }
}
