//! Row transformation at the relay edge.
//!
//! Replica-local rows must not replay verbatim on followers: they are
//! rewritten into vclock-advancing no-ops, or dropped entirely when they
//! predate instance registration (nil origin). A subscribe session also
//! drops the replica's own rows, except those the replica lost to a
//! power failure after this instance had already received them.

use crate::core::{GroupId, INSTANCE_ID_NIL, InstanceId, Row, VClock};

pub enum FilterVerdict {
    /// Send the row unchanged.
    Pass,
    /// Send the substituted row; LSN accounting still uses the original.
    Rewrite(Row),
    /// Do not send, do not advance the relay clock.
    Skip,
}

pub struct RelayFilter {
    /// `None` for a final join, which must relay every row, including
    /// the peer's own (rebootstrap).
    bound_replica: Option<InstanceId>,
    local_vclock_at_subscribe: VClock,
}

impl RelayFilter {
    pub fn subscribe(replica_id: InstanceId, local_vclock_at_subscribe: VClock) -> Self {
        Self {
            bound_replica: Some(replica_id),
            local_vclock_at_subscribe,
        }
    }

    pub fn final_join() -> Self {
        Self {
            bound_replica: None,
            local_vclock_at_subscribe: VClock::new(),
        }
    }

    pub fn apply(&self, row: &Row) -> FilterVerdict {
        if let Some(bound) = self.bound_replica
            && row.replica_id == bound
            && row.lsn > self.local_vclock_at_subscribe.get(bound)
        {
            // the replica's own row; it only needs it back when it was
            // written here before the replica lost it (power loss), in
            // which case its lsn is within the subscribe-time snapshot
            return FilterVerdict::Skip;
        }
        if row.group_id == GroupId::Local {
            if row.replica_id == INSTANCE_ID_NIL {
                // generated while the replica was anonymous; no vclock
                // coordinate to promote
                return FilterVerdict::Skip;
            }
            return FilterVerdict::Rewrite(Row::nop_of(row));
        }
        FilterVerdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::RowType;

    fn row(replica: u32, lsn: i64, group: GroupId) -> Row {
        let mut row = Row::new_dml(RowType::Replace, Bytes::from_static(b"b"));
        row.replica_id = replica;
        row.lsn = lsn;
        row.tsn = lsn;
        row.group_id = group;
        row
    }

    fn clock(pairs: &[(u32, i64)]) -> VClock {
        let mut v = VClock::new();
        for &(id, lsn) in pairs {
            v.follow(id, lsn).unwrap();
        }
        v
    }

    #[test]
    fn own_rows_are_dropped_past_the_snapshot() {
        let filter = RelayFilter::subscribe(7, clock(&[(7, 40)]));
        assert!(matches!(
            filter.apply(&row(7, 42, GroupId::Default)),
            FilterVerdict::Skip
        ));
        // power-loss exception: the replica lost this row
        assert!(matches!(
            filter.apply(&row(7, 40, GroupId::Default)),
            FilterVerdict::Pass
        ));
        assert!(matches!(
            filter.apply(&row(1, 42, GroupId::Default)),
            FilterVerdict::Pass
        ));
    }

    #[test]
    fn local_rows_become_nops_for_other_replicas() {
        let filter = RelayFilter::subscribe(9, VClock::new());
        match filter.apply(&row(7, 42, GroupId::Local)) {
            FilterVerdict::Rewrite(nop) => {
                assert_eq!(nop.row_type, RowType::Nop);
                assert_eq!(nop.group_id, GroupId::Default);
                assert_eq!(nop.replica_id, 7);
                assert_eq!(nop.lsn, 42);
                assert!(nop.body.is_empty());
            }
            _ => panic!("expected a nop rewrite"),
        }
    }

    #[test]
    fn own_local_rows_are_dropped() {
        let filter = RelayFilter::subscribe(7, VClock::new());
        assert!(matches!(
            filter.apply(&row(7, 42, GroupId::Local)),
            FilterVerdict::Skip
        ));
    }

    #[test]
    fn anonymous_local_rows_are_dropped() {
        let filter = RelayFilter::subscribe(9, VClock::new());
        assert!(matches!(
            filter.apply(&row(0, 0, GroupId::Local)),
            FilterVerdict::Skip
        ));
    }

    #[test]
    fn final_join_relays_everything() {
        let filter = RelayFilter::final_join();
        assert!(matches!(
            filter.apply(&row(7, 42, GroupId::Default)),
            FilterVerdict::Pass
        ));
        assert!(matches!(
            filter.apply(&row(7, 42, GroupId::Local)),
            FilterVerdict::Rewrite(_)
        ));
    }
}
