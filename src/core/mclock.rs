//! Matrix clock: the last acknowledged vector clock of every log consumer.
//!
//! The pointwise minimum across consumers is the retention pin used by WAL
//! garbage collection. The minimum is cached and invalidated on update.

use std::collections::BTreeMap;

use super::vclock::{InstanceId, VClock};

#[derive(Debug, Default)]
pub struct MClock {
    consumers: BTreeMap<InstanceId, VClock>,
    min_cache: Option<VClock>,
}

impl MClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, consumer: InstanceId) -> Option<&VClock> {
        self.consumers.get(&consumer)
    }

    /// Replace a consumer's acknowledged clock.
    pub fn update(&mut self, consumer: InstanceId, vclock: VClock) {
        self.consumers.insert(consumer, vclock);
        self.min_cache = None;
    }

    /// Drop a consumer from retention accounting (replica deleted).
    pub fn remove(&mut self, consumer: InstanceId) {
        if self.consumers.remove(&consumer).is_some() {
            self.min_cache = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Pointwise minimum across all consumers, `None` when there are none.
    ///
    /// A component missing from any consumer counts as zero, so it is
    /// absent from the minimum as well.
    pub fn min(&mut self) -> Option<&VClock> {
        if self.consumers.is_empty() {
            return None;
        }
        if self.min_cache.is_none() {
            self.min_cache = Some(self.compute_min());
        }
        self.min_cache.as_ref()
    }

    fn compute_min(&self) -> VClock {
        let mut instances: Vec<InstanceId> = Vec::new();
        for clock in self.consumers.values() {
            for (instance, _) in clock.iter() {
                if !instances.contains(&instance) {
                    instances.push(instance);
                }
            }
        }
        let mut min = VClock::new();
        for instance in instances {
            let lsn = self
                .consumers
                .values()
                .map(|c| c.get(instance))
                .min()
                .unwrap_or(0);
            if lsn > 0 {
                // follow from zero cannot fail for a positive lsn
                let _ = min.follow(instance, lsn);
            }
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(InstanceId, i64)]) -> VClock {
        let mut v = VClock::new();
        for &(id, lsn) in pairs {
            v.follow(id, lsn).unwrap();
        }
        v
    }

    #[test]
    fn min_of_empty_is_none() {
        let mut m = MClock::new();
        assert!(m.min().is_none());
    }

    #[test]
    fn min_is_pointwise() {
        let mut m = MClock::new();
        m.update(7, clock(&[(1, 10), (2, 4)]));
        m.update(9, clock(&[(1, 6), (2, 8)]));
        let min = m.min().unwrap();
        assert_eq!(min.get(1), 6);
        assert_eq!(min.get(2), 4);
    }

    #[test]
    fn missing_component_pins_to_zero() {
        let mut m = MClock::new();
        m.update(7, clock(&[(1, 10)]));
        m.update(9, clock(&[(1, 6), (2, 8)]));
        let min = m.min().unwrap();
        assert_eq!(min.get(1), 6);
        // consumer 7 never acked anything from instance 2
        assert_eq!(min.get(2), 0);
    }

    #[test]
    fn update_invalidates_cache() {
        let mut m = MClock::new();
        m.update(7, clock(&[(1, 3)]));
        assert_eq!(m.min().unwrap().get(1), 3);
        m.update(7, clock(&[(1, 5)]));
        assert_eq!(m.min().unwrap().get(1), 5);
    }

    #[test]
    fn remove_releases_pin() {
        let mut m = MClock::new();
        m.update(7, clock(&[(1, 2)]));
        m.update(9, clock(&[(1, 9)]));
        assert_eq!(m.min().unwrap().get(1), 2);
        m.remove(7);
        assert_eq!(m.min().unwrap().get(1), 9);
        m.remove(9);
        assert!(m.min().is_none());
    }
}
