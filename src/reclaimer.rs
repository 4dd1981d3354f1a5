//! Reclaim policy and the background reclaimer thread harness.
//!
//! The teacher has no background reclaimer (slitter's magazines are
//! reclaimed synchronously by callers), so this is built directly from
//! the allocator design's described loop, in the idiom the pack's other
//! systems-allocator repos use for background workers: a plain
//! `std::thread` coordinated with mutators via `Mutex` + `Condvar`
//! (`n1ght-hunter-rtmalloc`, `Shadlock0133-mimalloc-rs`). The
//! range-selection and huge-page sub-reclaim planning are kept as pure
//! functions over `IntervalSet`/`SubReclaimed` so they're testable
//! without standing up a whole `MemoryFile`; `memory_file.rs` supplies
//! the locking and syscalls around them.
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use crate::interval_set::IntervalSet;

/// Per-iteration cap on reclaimed bytes, so a long-running decommit
/// doesn't starve concurrent callers (the host serializes `fallocate`
/// per file).
pub const MAX_RECLAIM_BYTES: u64 = 128 << 20;

/// Tracks, per huge-page-aligned offset, how many of its constituent
/// small pages have already been individually decommitted
/// ("sub-reclaimed") while siblings remain committed. Entries are
/// created and deleted; never set to 0 or `pages_per_huge_page`.
#[derive(Debug, Default, Clone)]
pub struct SubReclaimed {
    map: HashMap<u64, usize>,
}

impl SubReclaimed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, huge_page_offset: u64) -> usize {
        *self.map.get(&huge_page_offset).unwrap_or(&0)
    }

    pub fn set(&mut self, huge_page_offset: u64, count: usize, pages_per_huge_page: usize) {
        assert!(
            count > 0 && count < pages_per_huge_page,
            "sub-reclaimed count {} out of range (pages_per_huge_page={})",
            count,
            pages_per_huge_page
        );
        self.map.insert(huge_page_offset, count);
    }

    pub fn clear(&mut self, huge_page_offset: u64) {
        self.map.remove(&huge_page_offset);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Picks the next waste range to reclaim: small-page waste is preferred
/// over huge-page waste (small pages are expected to be newer), and
/// within a size class the *last* (highest-offset) waste gap is chosen.
/// The chosen range is capped to `MAX_RECLAIM_BYTES`, keeping the
/// highest-offset portion of the gap.
pub fn pick_waste_range(
    unwaste_small: &IntervalSet<()>,
    unwaste_huge: &IntervalSet<()>,
    domain: Range<u64>,
) -> Option<(bool, Range<u64>)> {
    if let Some(gap) = last_waste_gap(unwaste_small, domain.clone()) {
        return Some((false, cap_to_last(gap)));
    }
    if let Some(gap) = last_waste_gap(unwaste_huge, domain) {
        return Some((true, cap_to_last(gap)));
    }
    None
}

fn last_waste_gap(unwaste: &IntervalSet<()>, domain: Range<u64>) -> Option<Range<u64>> {
    unwaste.gaps_in(domain).into_iter().next_back()
}

fn cap_to_last(gap: Range<u64>) -> Range<u64> {
    if gap.end - gap.start > MAX_RECLAIM_BYTES {
        (gap.end - MAX_RECLAIM_BYTES)..gap.end
    } else {
        gap
    }
}

/// What to do with a huge-page reclaim range: which sub-ranges to
/// `decommit`, which (whole huge page) ranges to free in `unfreeHuge`,
/// and how `SubReclaimed` bookkeeping should change.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HugeReclaimPlan {
    pub decommit_ranges: Vec<Range<u64>>,
    pub free_ranges: Vec<Range<u64>>,
    /// `(huge_page_offset, new_count)`; `new_count == None` clears the
    /// entry (the whole huge page was reclaimed).
    pub sub_reclaimed_updates: Vec<(u64, Option<usize>)>,
}

/// Resolves huge-page sub-reclamation for `range` against the current
/// `sub_reclaimed` bookkeeping. Interior huge pages fully spanned by
/// `range` are always decommitted and freed outright; only the two
/// (possibly equal) endpoint huge pages need the partial-overlap logic.
pub fn plan_huge_reclaim(
    range: Range<u64>,
    page_size: u64,
    pages_per_huge_page: u64,
    sub_reclaimed: &SubReclaimed,
) -> HugeReclaimPlan {
    assert!(range.start < range.end);
    let huge_bytes = page_size * pages_per_huge_page;
    let mut plan = HugeReclaimPlan::default();

    let first_huge = range.start - (range.start % huge_bytes);
    let last_huge = (range.end - 1) - ((range.end - 1) % huge_bytes);

    let mut huge_offset = first_huge;
    while huge_offset <= last_huge {
        let huge_range = huge_offset..(huge_offset + huge_bytes);
        let overlap_start = range.start.max(huge_range.start);
        let overlap_end = range.end.min(huge_range.end);
        let covers_whole = overlap_start == huge_range.start && overlap_end == huge_range.end;

        if covers_whole {
            plan.decommit_ranges.push(huge_range.clone());
            plan.free_ranges.push(huge_range);
            if sub_reclaimed.get(huge_offset) != 0 {
                plan.sub_reclaimed_updates.push((huge_offset, None));
            }
        } else {
            let s_pages = (overlap_end - overlap_start) / page_size;
            let old_sub = sub_reclaimed.get(huge_offset) as u64;

            if old_sub + s_pages >= pages_per_huge_page {
                // Reclaiming the final pages of this huge page (or, if
                // `range`'s endpoint overlap is wider than what's left,
                // more than the final pages): decommit and free the
                // *whole* huge page, since khugepaged may have
                // re-collapsed earlier sub-reclaimed pages in the
                // meantime.
                plan.decommit_ranges.push(huge_range.clone());
                plan.free_ranges.push(huge_range);
                plan.sub_reclaimed_updates.push((huge_offset, None));
            } else {
                plan.decommit_ranges.push(overlap_start..overlap_end);
                plan.sub_reclaimed_updates
                    .push((huge_offset, Some((old_sub + s_pages) as usize)));
            }
        }

        huge_offset += huge_bytes;
    }

    plan
}

/// Spawns the background reclaimer thread. `mf` must support the
/// crate-internal reclaim protocol (`crate::memory_file::MemoryFile`);
/// kept generic over a trait so this module doesn't need to know
/// `MemoryFile`'s internals.
pub trait ReclaimHost: Send + Sync + 'static {
    /// Blocks until there's waste to reclaim or the file is being
    /// destroyed. Returns `false` if destroyed (caller should tear down
    /// and exit).
    fn wait_for_work(&self) -> bool;

    /// Performs one reclaim iteration (steps 3-7 of the design). Called
    /// with no lock held; the implementation manages its own locking.
    fn reclaim_one_iteration(&self);

    /// Tears down the backing file (only reachable once `wait_for_work`
    /// returns `false`).
    fn teardown(&self);
}

pub fn spawn<H: ReclaimHost>(host: Arc<H>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        if !host.wait_for_work() {
            host.teardown();
            return;
        }
        host.reclaim_one_iteration();
    })
}
