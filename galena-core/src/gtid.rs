// galena-core/src/gtid.rs
// Global transaction identifiers for the replication pipeline and the
// manager that tracks which of them are in flight, committed, or applied.
// Both 64-bit halves encode big-endian so the 16-byte form compares
// bytewise in the same order as the numeric pair; that is what lets GTID
// bytes serve as oplog primary keys.

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::collections::BTreeSet;

pub const GTID_BINARY_SIZE: usize = 16;

/// A replication identifier: (primary sequence, transaction sequence).
/// Total order is lexicographic on the pair; zero is a valid sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gtid {
    primary_seq: u64,
    gt_seq: u64,
}

impl Gtid {
    pub const ZERO: Gtid = Gtid {
        primary_seq: 0,
        gt_seq: 0,
    };

    pub fn new(primary_seq: u64, gt_seq: u64) -> Gtid {
        Gtid {
            primary_seq,
            gt_seq,
        }
    }

    pub fn primary_seq(&self) -> u64 {
        self.primary_seq
    }

    pub fn gt_seq(&self) -> u64 {
        self.gt_seq
    }

    /// The next identifier on the same primary term.
    #[must_use]
    pub fn inc(self) -> Gtid {
        Gtid {
            primary_seq: self.primary_seq,
            gt_seq: self.gt_seq + 1,
        }
    }

    /// The first identifier of the next primary term. Used on step-up.
    #[must_use]
    pub fn inc_primary(self) -> Gtid {
        Gtid {
            primary_seq: self.primary_seq + 1,
            gt_seq: 0,
        }
    }

    pub fn to_bytes(self) -> [u8; GTID_BINARY_SIZE] {
        let mut buf = [0u8; GTID_BINARY_SIZE];
        BigEndian::write_u64(&mut buf[0..8], self.primary_seq);
        BigEndian::write_u64(&mut buf[8..16], self.gt_seq);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Gtid {
        assert_eq!(bytes.len(), GTID_BINARY_SIZE, "GTID must be 16 bytes");
        Gtid {
            primary_seq: BigEndian::read_u64(&bytes[0..8]),
            gt_seq: BigEndian::read_u64(&bytes[8..16]),
        }
    }
}

impl std::fmt::Display for Gtid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.primary_seq, self.gt_seq)
    }
}

#[derive(Debug, Default)]
struct GtidState {
    // Primary side: identifiers handed out for transactions applying new
    // writes to the replica set.
    next_live: Gtid,
    min_live: Gtid,
    live: BTreeSet<Gtid>,
    // Secondary side: identifiers read from the oplog and being applied.
    next_unapplied: Gtid,
    min_unapplied: Gtid,
    unapplied: BTreeSet<Gtid>,
}

/// Tracks live and unapplied GTIDs under a single mutex. The preconditions
/// asserted here are the manager's invariants; violating them is programmer
/// error, so they are fatal rather than recoverable.
pub struct GtidManager {
    state: Mutex<GtidState>,
}

impl GtidManager {
    pub fn new(last_gtid: Gtid) -> GtidManager {
        let next_live = last_gtid.inc();
        GtidManager {
            state: Mutex::new(GtidState {
                next_live,
                min_live: next_live,
                live: BTreeSet::new(),
                next_unapplied: Gtid::ZERO,
                min_unapplied: Gtid::ZERO,
                unapplied: BTreeSet::new(),
            }),
        }
    }

    /// Hand out the next identifier on a primary and note it as in flight.
    pub fn get_gtid_for_primary(&self) -> Gtid {
        let mut state = self.state.lock();
        let ret = state.next_live;
        state.live.insert(ret);
        state.next_live = ret.inc();
        ret
    }

    /// The transaction holding `gtid` has committed or aborted. Primary only.
    pub fn note_live_gtid_done(&self, gtid: Gtid) {
        let mut state = self.state.lock();
        assert!(gtid >= state.min_live, "completed GTID below min live");
        assert!(!state.live.is_empty(), "no live GTIDs to complete");
        state.live.remove(&gtid);
        if state.min_live == gtid {
            state.min_live = match state.live.iter().next() {
                Some(min) => *min,
                None => state.next_live,
            };
            // On a primary these watermarks are equivalent.
            state.min_unapplied = state.min_live;
        }
    }

    /// A secondary committed a GTID from the primary into its oplog.
    pub fn note_gtid_added(&self, gtid: Gtid) {
        let mut state = self.state.lock();
        assert_eq!(
            state.next_live, state.min_live,
            "secondaries have no in-flight GTIDs"
        );
        assert!(state.next_live <= gtid, "added GTID moves backwards");
        state.next_live = gtid;
        state.min_live = gtid;
    }

    /// A secondary is starting to apply an oplog entry it read.
    pub fn note_applying_gtid(&self, gtid: Gtid) {
        let mut state = self.state.lock();
        assert!(gtid > state.min_unapplied, "applying GTID at or below min");
        assert!(gtid >= state.next_unapplied, "applying GTID out of order");
        if state.unapplied.is_empty() {
            state.min_unapplied = gtid;
        }
        state.unapplied.insert(gtid);
        state.next_unapplied = gtid.inc();
    }

    /// A secondary finished applying `gtid`.
    pub fn note_gtid_applied(&self, gtid: Gtid) {
        let mut state = self.state.lock();
        assert!(gtid >= state.min_unapplied, "applied GTID below min");
        assert!(!state.unapplied.is_empty(), "no unapplied GTIDs to finish");
        state.unapplied.remove(&gtid);
        if state.min_unapplied == gtid {
            state.min_unapplied = match state.unapplied.iter().next() {
                Some(min) => *min,
                None => state.next_unapplied,
            };
        }
    }

    /// Consistent snapshot of (min live, min unapplied).
    pub fn get_mins(&self) -> (Gtid, Gtid) {
        let state = self.state.lock();
        (state.min_live, state.min_unapplied)
    }

    pub fn min_live_gtid(&self) -> Gtid {
        self.state.lock().min_live
    }

    /// Primary step-up: future allocations advance the primary half.
    /// Requires no GTIDs in flight. Unapplied bookkeeping is intentionally
    /// left alone; it is orthogonal across step-up events.
    pub fn reset_manager(&self, last_gtid: Gtid) {
        let mut state = self.state.lock();
        assert!(state.live.is_empty(), "reset with GTIDs in flight");
        state.next_live = last_gtid.inc_primary();
        state.min_live = state.next_live;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_order_on_allocations() {
        let mgr = GtidManager::new(Gtid::ZERO);
        let mut prev = mgr.get_gtid_for_primary();
        for _ in 0..100 {
            let next = mgr.get_gtid_for_primary();
            assert!(prev < next);
            prev = next;
        }
    }

    #[test]
    fn test_primary_allocation_and_watermarks() {
        let mgr = GtidManager::new(Gtid::new(5, 7));

        let a = mgr.get_gtid_for_primary();
        assert_eq!(a, Gtid::new(5, 8));
        let b = mgr.get_gtid_for_primary();
        assert_eq!(b, Gtid::new(5, 9));

        assert_eq!(mgr.get_mins().0, Gtid::new(5, 8));

        mgr.note_live_gtid_done(a);
        assert_eq!(mgr.get_mins().0, Gtid::new(5, 9));
        mgr.note_live_gtid_done(b);
        // Nothing in flight: min collapses to next.
        assert_eq!(mgr.get_mins().0, Gtid::new(5, 10));

        mgr.reset_manager(Gtid::new(5, 9));
        assert_eq!(mgr.get_gtid_for_primary(), Gtid::new(6, 0));
    }

    #[test]
    fn test_out_of_order_completion() {
        let mgr = GtidManager::new(Gtid::ZERO);
        let a = mgr.get_gtid_for_primary();
        let b = mgr.get_gtid_for_primary();
        let c = mgr.get_gtid_for_primary();

        // Completing b leaves a as the minimum.
        mgr.note_live_gtid_done(b);
        assert_eq!(mgr.get_mins().0, a);
        mgr.note_live_gtid_done(a);
        assert_eq!(mgr.get_mins().0, c);
    }

    #[test]
    fn test_min_live_bounds_all_live() {
        let mgr = GtidManager::new(Gtid::ZERO);
        let ids: Vec<Gtid> = (0..10).map(|_| mgr.get_gtid_for_primary()).collect();
        let min = mgr.get_mins().0;
        for id in &ids {
            assert!(min <= *id);
        }
        for id in ids {
            mgr.note_live_gtid_done(id);
        }
        // Empty live set: min == next.
        assert_eq!(mgr.get_mins().0, mgr.get_gtid_for_primary());
    }

    #[test]
    fn test_secondary_apply_tracking() {
        let mgr = GtidManager::new(Gtid::ZERO);

        mgr.note_applying_gtid(Gtid::new(1, 1));
        mgr.note_applying_gtid(Gtid::new(1, 2));
        assert_eq!(mgr.get_mins().1, Gtid::new(1, 1));

        mgr.note_gtid_applied(Gtid::new(1, 1));
        assert_eq!(mgr.get_mins().1, Gtid::new(1, 2));
        mgr.note_gtid_applied(Gtid::new(1, 2));
        assert_eq!(mgr.get_mins().1, Gtid::new(1, 3));
    }

    #[test]
    fn test_note_gtid_added_advances_both() {
        let mgr = GtidManager::new(Gtid::ZERO);
        mgr.note_gtid_added(Gtid::new(3, 4));
        let state = mgr.get_mins();
        assert_eq!(state.0, Gtid::new(3, 4));
    }

    #[test]
    #[should_panic(expected = "reset with GTIDs in flight")]
    fn test_reset_requires_empty_live() {
        let mgr = GtidManager::new(Gtid::ZERO);
        let _a = mgr.get_gtid_for_primary();
        mgr.reset_manager(Gtid::new(1, 0));
    }

    #[test]
    fn test_encoding_round_trip() {
        let g = Gtid::new(1, 2);
        let bytes = g.to_bytes();
        let mut expected = [0u8; 16];
        expected[7] = 1;
        expected[15] = 2;
        assert_eq!(bytes, expected);
        assert_eq!(Gtid::from_bytes(&bytes), g);
    }

    #[test]
    fn test_encoding_preserves_order() {
        let ids = [
            Gtid::ZERO,
            Gtid::new(0, 1),
            Gtid::new(0, u64::MAX),
            Gtid::new(1, 0),
            Gtid::new(1, 1),
            Gtid::new(u64::MAX, 0),
        ];
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].to_bytes() < pair[1].to_bytes());
        }
        for g in ids {
            assert_eq!(Gtid::from_bytes(&g.to_bytes()), g);
        }
    }

    #[test]
    fn test_inc_primary_resets_seq() {
        let g = Gtid::new(2, 9).inc_primary();
        assert_eq!(g, Gtid::new(3, 0));
        assert_eq!(Gtid::new(2, 9).inc(), Gtid::new(2, 10));
    }
}
