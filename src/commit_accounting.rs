//! Commitment accounting: the `memAcct` interval set tracking, per
//! offset range, which accounting kind/memcg owns it and whether the
//! host kernel actually has it committed.
//!
//! The interval-set bookkeeping itself is the same `BTreeMap`-based range
//! map as `interval_set.rs`, generalized from `debug_arange_map.rs`'s
//! predecessor-lookup pattern. The `commit_seq` race-detection protocol
//! (§4.5 of the allocator design) has no teacher analog; it's implemented
//! directly from the allocator's described semantics.
use std::ops::Range;

use crate::interval_set::{IntervalSet, Segment};
use crate::options::MemoryKind;

/// Whether the host kernel is known to have committed a range's backing
/// pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommittedState {
    False,
    True,
    /// Not scanned (or invalidated by a race) since the range last
    /// changed; `commit_seq` records `MemoryFile`'s sequence number at
    /// the moment it became `Unknown`, to detect a decommit racing a
    /// usage scan.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEntry {
    pub kind: MemoryKind,
    pub memcg_id: u32,
    pub committed: CommittedState,
    pub commit_seq: u64,
}

impl Default for CommitEntry {
    fn default() -> Self {
        CommitEntry {
            kind: MemoryKind::System,
            memcg_id: 0,
            committed: CommittedState::False,
            commit_seq: 0,
        }
    }
}

/// The whole offset space, less the unrepresentable final byte of a
/// `u64` range (an immaterial simplification: no backing file will ever
/// reach `u64::MAX`).
const FULL_DOMAIN: Range<u64> = 0..u64::MAX;

pub struct CommitAccounting {
    set: IntervalSet<CommitEntry>,
    known_committed_bytes: u64,
    commit_seq: u64,
}

impl CommitAccounting {
    pub fn new() -> Self {
        let mut set = IntervalSet::new();
        set.insert(FULL_DOMAIN, CommitEntry::default());
        CommitAccounting {
            set,
            known_committed_bytes: 0,
            commit_seq: 0,
        }
    }

    pub fn known_committed_bytes(&self) -> u64 {
        self.known_committed_bytes
    }

    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    /// Free -> Used. `committing` selects between `AndCommit`/
    /// `CallerCommit`/`AndWritePopulate` (commits in advance) and
    /// `Uncommitted` (state becomes `Unknown`).
    pub fn alloc_from_free(&mut self, range: Range<u64>, kind: MemoryKind, memcg_id: u32, committing: bool) {
        let committed = if committing {
            // Reconcile against whatever `True` coverage the range
            // already has rather than adding its full length: a range
            // can already be partly `True` (e.g. a caller re-committing
            // over ground this accounting has already counted), and
            // double-counting would desync `known_committed_bytes` from
            // the sum of `True` segments (invariant 6).
            let already_true: u64 = self
                .set
                .segments_in(range.clone())
                .into_iter()
                .filter(|s| s.value.committed == CommittedState::True)
                .map(|s| s.range.end - s.range.start)
                .sum();
            self.known_committed_bytes += (range.end - range.start) - already_true;
            CommittedState::True
        } else {
            CommittedState::Unknown
        };
        self.set.insert(
            range,
            CommitEntry {
                kind,
                memcg_id,
                committed,
                commit_seq: self.commit_seq,
            },
        );
    }

    /// Waste -> Used (the recycle path). Waste ranges are always
    /// accounted to `MemoryKind::System`; sub-segments may individually
    /// be `True` (committed, content must be zeroed by the caller) or
    /// `Unknown` (treated as if newly committed, since recycling implies
    /// the allocator will zero it).
    pub fn recycle_waste_to_used(&mut self, range: Range<u64>, kind: MemoryKind, memcg_id: u32) {
        let mut added = 0u64;
        for seg in self.set.segments_in(range.clone()) {
            match seg.value.committed {
                CommittedState::Unknown => added += seg.range.end - seg.range.start,
                CommittedState::True => {
                    log::debug!(
                        "recycle: transferring {} committed bytes at {:?} from System to {:?} (memcg {})",
                        seg.range.end - seg.range.start,
                        seg.range,
                        kind,
                        memcg_id,
                    );
                }
                CommittedState::False => {
                    log::debug!("recycle: waste segment at {:?} was never committed", seg.range);
                }
            }
        }
        self.known_committed_bytes += added;
        self.set.update(range, |entry| {
            entry.committed = CommittedState::True;
            entry.kind = kind;
            entry.memcg_id = memcg_id;
        });
    }

    /// Used -> Waste (refcount dropped to 0 on `decref`). Accounted to
    /// `System`; committed state is left as-is.
    pub fn decref_to_waste(&mut self, range: Range<u64>) {
        self.set.update(range, |entry| {
            entry.kind = MemoryKind::System;
        });
    }

    /// Explicit `decommit` on a live Used range.
    pub fn explicit_decommit(&mut self, range: Range<u64>) {
        self.commit_seq += 1;
        let new_seq = self.commit_seq;

        let mut subtracted = 0u64;
        for seg in self.set.segments_in(range.clone()) {
            if seg.value.committed == CommittedState::True {
                subtracted += seg.range.end - seg.range.start;
            }
        }
        self.known_committed_bytes -= subtracted;

        self.set.update(range, |entry| {
            entry.committed = CommittedState::Unknown;
            entry.commit_seq = new_seq;
        });
    }

    /// The reclaimer just decommitted `range`: collapse it to the
    /// default (System, not committed) accounting state.
    pub fn reclaim(&mut self, range: Range<u64>) {
        let mut subtracted = 0u64;
        for seg in self.set.segments_in(range.clone()) {
            if seg.value.committed == CommittedState::True {
                subtracted += seg.range.end - seg.range.start;
            }
        }
        self.known_committed_bytes -= subtracted;
        self.set.insert(range, CommitEntry::default());
    }

    /// Segments currently `Unknown`, optionally filtered to one memcg.
    /// Used by `update_usage` to pick scan targets.
    pub fn unknown_segments(&self, memcg_filter: Option<u32>) -> Vec<Segment<CommitEntry>> {
        self.set
            .segments_in(FULL_DOMAIN)
            .into_iter()
            .filter(|s| s.value.committed == CommittedState::Unknown)
            .filter(|s| memcg_filter.map_or(true, |m| s.value.memcg_id == m))
            .collect()
    }

    /// Snapshots and bumps `commit_seq`, returning the pre-bump value a
    /// caller should compare its scan results against.
    pub fn snapshot_and_bump_commit_seq(&mut self) -> u64 {
        let seq = self.commit_seq;
        self.commit_seq += 1;
        seq
    }

    /// Promotes one contiguous run of pages that `checkCommitted`
    /// reported resident, unless a decommit raced the scan (detected via
    /// `commit_seq`). `range` must be a sub-range of a single segment
    /// still `Unknown`; the caller re-derives these ranges from the
    /// freshly re-read segment after reacquiring the lock.
    pub fn promote_committed_run(&mut self, range: Range<u64>, scan_started_at_seq: u64) {
        for seg in self.set.segments_in(range.clone()) {
            if seg.value.committed != CommittedState::Unknown {
                continue;
            }
            if seg.value.commit_seq > scan_started_at_seq {
                // A decommit happened during our scan; discard this
                // segment's result rather than risk double-accounting.
                continue;
            }
            let len = seg.range.end - seg.range.start;
            self.known_committed_bytes += len;
            self.set.update(seg.range, |entry| {
                entry.committed = CommittedState::True;
            });
        }
    }
}

impl Default for CommitAccounting {
    fn default() -> Self {
        Self::new()
    }
}

/// Injected by the collaborator; on Linux implemented via `mincore`.
/// `out_bits`'s low bit of each byte is set iff the corresponding page is
/// resident.
pub trait CommitQuery {
    fn check_committed(&self, addr: *const u8, len: usize, out_bits: &mut [u8]) -> std::io::Result<()>;
}

/// The Linux implementation, backed directly by `mincore(2)`.
pub struct MincoreQuery;

impl CommitQuery for MincoreQuery {
    fn check_committed(&self, addr: *const u8, len: usize, out_bits: &mut [u8]) -> std::io::Result<()> {
        let page_size = crate::page_size::page_size();
        let needed = (len + page_size - 1) / page_size;
        assert!(out_bits.len() >= needed, "out_bits too small for mincore");

        let ret = unsafe { libc::mincore(addr as *mut libc::c_void, len, out_bits.as_mut_ptr()) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Converts a `mincore`-style bitmap (low bit of each byte set iff the
/// page is resident) covering `range` into the contiguous byte ranges
/// that were reported committed.
pub fn committed_runs_from_bits(bits: &[u8], range: Range<u64>, page_size: u64) -> Vec<Range<u64>> {
    let mut runs = Vec::new();
    let mut run_start: Option<u64> = None;

    for (i, &byte) in bits.iter().enumerate() {
        let page_start = range.start + (i as u64) * page_size;
        let page_end = (page_start + page_size).min(range.end);
        let resident = byte & 1 != 0;

        match (resident, run_start) {
            (true, None) => run_start = Some(page_start),
            (false, Some(start)) => {
                runs.push(start..page_start);
                run_start = None;
            }
            _ => {}
        }

        if page_end >= range.end {
            break;
        }
    }

    if let Some(start) = run_start {
        runs.push(start..range.end);
    }

    runs
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_from_free_committing_increments_known_bytes() {
        let mut acct = CommitAccounting::new();
        acct.alloc_from_free(0..4096, MemoryKind::Application, 0, true);
        assert_eq!(acct.known_committed_bytes(), 4096);
    }

    #[test]
    fn alloc_from_free_uncommitted_leaves_unknown() {
        let mut acct = CommitAccounting::new();
        acct.alloc_from_free(0..4096, MemoryKind::Application, 0, false);
        assert_eq!(acct.known_committed_bytes(), 0);
        assert_eq!(acct.unknown_segments(None).len(), 1);
    }

    #[test]
    fn decref_to_waste_reassigns_kind_not_committed_state() {
        let mut acct = CommitAccounting::new();
        acct.alloc_from_free(0..4096, MemoryKind::Application, 0, true);
        acct.decref_to_waste(0..4096);
        let segs = acct.set.segments_in(0..4096);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].value.kind, MemoryKind::System);
        assert_eq!(segs[0].value.committed, CommittedState::True);
        assert_eq!(acct.known_committed_bytes(), 4096);
    }

    #[test]
    fn recycle_from_unknown_waste_adds_known_bytes() {
        let mut acct = CommitAccounting::new();
        acct.alloc_from_free(0..4096, MemoryKind::Application, 0, false);
        acct.decref_to_waste(0..4096);
        assert_eq!(acct.known_committed_bytes(), 0);
        acct.recycle_waste_to_used(0..4096, MemoryKind::Application, 1);
        assert_eq!(acct.known_committed_bytes(), 4096);
    }

    #[test]
    fn explicit_decommit_subtracts_known_bytes_and_bumps_seq() {
        let mut acct = CommitAccounting::new();
        acct.alloc_from_free(0..4096, MemoryKind::Application, 0, true);
        let seq_before = acct.commit_seq();
        acct.explicit_decommit(0..4096);
        assert_eq!(acct.known_committed_bytes(), 0);
        assert!(acct.commit_seq() > seq_before);
    }

    #[test]
    fn reclaim_collapses_to_default() {
        let mut acct = CommitAccounting::new();
        acct.alloc_from_free(0..4096, MemoryKind::Application, 0, true);
        acct.reclaim(0..4096);
        let seg = acct.set.segment_at(0).unwrap();
        assert_eq!(seg.value.kind, MemoryKind::System);
        assert_eq!(seg.value.committed, CommittedState::False);
        assert_eq!(acct.known_committed_bytes(), 0);
    }

    #[test]
    fn promote_committed_run_respects_race_detection() {
        let mut acct = CommitAccounting::new();
        acct.alloc_from_free(0..4096, MemoryKind::Application, 0, false);
        let scan_seq = acct.snapshot_and_bump_commit_seq();

        // Simulate a concurrent explicit decommit bumping commit_seq
        // past our scan's snapshot before we get to promote.
        acct.explicit_decommit(0..4096);
        acct.promote_committed_run(0..4096, scan_seq);
        // The segment's commit_seq now exceeds scan_seq, so the promotion
        // must have been discarded.
        assert_eq!(acct.known_committed_bytes(), 0);
    }

    #[test]
    fn committed_runs_from_bits_finds_contiguous_runs() {
        let bits = [1u8, 1, 0, 1];
        let runs = committed_runs_from_bits(&bits, 0..(4 * 4096), 4096);
        assert_eq!(runs, vec![0..8192, 12288..16384]);
    }

    #[test]
    fn committed_runs_from_bits_trailing_run_to_range_end() {
        let bits = [0u8, 1, 1];
        let runs = committed_runs_from_bits(&bits, 0..(3 * 4096), 4096);
        assert_eq!(runs, vec![4096..12288]);
    }

    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        AllocCommitted(u64, u64),
        AllocUncommitted(u64, u64),
        DecrefToWaste(u64, u64),
        ExplicitDecommit(u64, u64),
        Reclaim(u64, u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let range = (0u64..64, 0u64..64).prop_map(|(a, b)| (a.min(b) * 4096, (a.max(b) + 1) * 4096));
        prop_oneof![
            range.clone().prop_map(|(s, e)| Op::AllocCommitted(s, e)),
            range.clone().prop_map(|(s, e)| Op::AllocUncommitted(s, e)),
            range.clone().prop_map(|(s, e)| Op::DecrefToWaste(s, e)),
            range.clone().prop_map(|(s, e)| Op::ExplicitDecommit(s, e)),
            range.prop_map(|(s, e)| Op::Reclaim(s, e)),
        ]
    }

    proptest! {
        // `knownCommittedBytes` must always equal the sum of segment
        // lengths whose committed state is True (spec §8 property 4), and
        // `memAcct` must never develop a gap over its domain (property 1),
        // across any sequence of the transitions §4.5 describes.
        #[test]
        fn known_committed_bytes_matches_true_segments(ops in proptest::collection::vec(op_strategy(), 0..50)) {
            let mut acct = CommitAccounting::new();
            for op in ops {
                match op {
                    Op::AllocCommitted(s, e) => acct.alloc_from_free(s..e, MemoryKind::Application, 0, true),
                    Op::AllocUncommitted(s, e) => acct.alloc_from_free(s..e, MemoryKind::Application, 0, false),
                    Op::DecrefToWaste(s, e) => acct.decref_to_waste(s..e),
                    Op::ExplicitDecommit(s, e) => acct.explicit_decommit(s..e),
                    Op::Reclaim(s, e) => acct.reclaim(s..e),
                }

                let expected: u64 = acct
                    .set
                    .segments_in(0..(64 * 4096))
                    .into_iter()
                    .filter(|s| s.value.committed == CommittedState::True)
                    .map(|s| s.range.end - s.range.start)
                    .sum();
                prop_assert_eq!(acct.known_committed_bytes(), expected);

                let gaps = acct.set.gaps_in(0..(64 * 4096));
                prop_assert!(gaps.is_empty(), "memAcct must not develop gaps: {:?}", gaps);
            }
        }
    }
}
