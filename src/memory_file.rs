//! `MemoryFile`: the public object tying the backing-file manager,
//! interval sets, allocator, reclaimer, commitment accounting, and
//! evictable registry together.
//!
//! Shaped like the teacher's `ClassInfo` (one struct holding its
//! sub-resources, constructed by a single `new`), generalized from
//! "one struct per allocation class" to "one struct per backing file";
//! the `Mutex`+`Condvar` coordination with the background reclaimer
//! thread has no teacher analog and follows §5 of the allocator design
//! directly.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use std::fs::File;
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backing_file::{self, BackingFile, CHUNK_SIZE};
use crate::commit_accounting::{committed_runs_from_bits, CommitAccounting, CommitQuery, MincoreQuery};
use crate::error::{MemoryFileError, Result};
use crate::evictable::{EvictableRegistry, EvictableUser};
use crate::interval_set::IntervalSet;
use crate::options::{AccessType, AllocMode, AllocOpts, DelayedEviction, Direction, Options};
use crate::page_size::{page_size, pages_per_huge_page};
use crate::reclaimer::{self, ReclaimHost, SubReclaimed};

/// `updateUsage` is throttled to at most once per this interval (the
/// spec's "1/CLOCKS_PER_SEC"; Linux's default `CLK_TCK` is 100).
const UPDATE_USAGE_MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Non-empty and page-aligned at both ends. Shared by the `#[requires]`
/// contracts below and by the plain-assert fallback used outside them.
fn page_range_aligned(range: &Range<u64>) -> bool {
    let p = page_size() as u64;
    range.start < range.end && range.start % p == 0 && range.end % p == 0
}

struct Inner {
    unwaste_small: IntervalSet<()>,
    unwaste_huge: IntervalSet<()>,
    unfree_small: IntervalSet<u32>,
    unfree_huge: IntervalSet<u32>,
    commit: CommitAccounting,
    sub_reclaimed: SubReclaimed,
    reclaimable: bool,
    evictions_requested: bool,
    destroyed: bool,
}

impl Inner {
    fn unwaste_mut(&mut self, huge: bool) -> &mut IntervalSet<()> {
        if huge {
            &mut self.unwaste_huge
        } else {
            &mut self.unwaste_small
        }
    }

    fn unfree_mut(&mut self, huge: bool) -> &mut IntervalSet<u32> {
        if huge {
            &mut self.unfree_huge
        } else {
            &mut self.unfree_small
        }
    }

    fn unfree(&self, huge: bool) -> &IntervalSet<u32> {
        if huge {
            &self.unfree_huge
        } else {
            &self.unfree_small
        }
    }
}

pub struct MemoryFile {
    backing: BackingFile,
    evictable: Arc<EvictableRegistry>,
    opts: Options,
    inner: Mutex<Inner>,
    reclaim_cond: Condvar,
    last_update_usage: Mutex<Option<Instant>>,
    query: Box<dyn CommitQuery + Send + Sync>,
    reclaimer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryFile {
    /// Truncates `file` to zero, then launches the background reclaimer.
    pub fn new(file: File, opts: Options) -> Result<Arc<Self>> {
        let backing = BackingFile::new(file, opts.disable_ima_workaround)?;

        let mf = Arc::new(MemoryFile {
            backing,
            evictable: Arc::new(EvictableRegistry::new()),
            opts,
            inner: Mutex::new(Inner {
                unwaste_small: IntervalSet::new(),
                unwaste_huge: IntervalSet::new(),
                unfree_small: IntervalSet::new(),
                unfree_huge: IntervalSet::new(),
                commit: CommitAccounting::new(),
                sub_reclaimed: SubReclaimed::new(),
                reclaimable: false,
                evictions_requested: false,
                destroyed: false,
            }),
            reclaim_cond: Condvar::new(),
            last_update_usage: Mutex::new(None),
            query: Box::new(MincoreQuery),
            reclaimer_thread: Mutex::new(None),
        });

        let handle = reclaimer::spawn(Arc::clone(&mf));
        *mf.reclaimer_thread.lock().unwrap() = Some(handle);

        Ok(mf)
    }

    fn huge_for(&self, offset: u64) -> bool {
        self.backing.chunk_huge_at(offset)
    }

    /// §4.2: finds a best-fit range, extending the file as needed.
    #[requires(length > 0, "allocate: length must be positive")]
    #[requires(length % page_size() as u64 == 0, "allocate: length must be page-aligned")]
    #[requires(
        !opts.huge || length % (page_size() as u64 * pages_per_huge_page() as u64) == 0,
        "allocate: huge length must be hugepage-aligned"
    )]
    pub fn allocate(&self, length: u64, mut opts: AllocOpts) -> Result<Range<u64>> {
        let committing = !matches!(opts.mode, AllocMode::Uncommitted);

        loop {
            let mut inner = self.inner.lock().unwrap();
            let total_size = self.backing.total_size();

            if committing {
                let gap = {
                    let unwaste = inner.unwaste_mut(opts.huge);
                    match opts.dir {
                        Direction::BottomUp => unwaste.first_gap_at_least(length, 0..total_size),
                        Direction::TopDown => unwaste.last_gap_at_least(length, 0..total_size),
                    }
                };
                if let Some(range) = gap {
                    inner.unwaste_mut(opts.huge).insert(range.clone(), ());
                    inner.unfree_mut(opts.huge).update(range.clone(), |rc| {
                        assert_eq!(*rc, 0, "recycle: waste range {:?} had nonzero refcount", range);
                        *rc = 1;
                    });
                    inner
                        .commit
                        .recycle_waste_to_used(range.clone(), opts.kind, opts.memcg_id);
                    drop(inner);
                    return self.finish_allocate(range, &mut opts, /*recycled=*/ true);
                }
            }

            let gap = {
                let unfree = inner.unfree_mut(opts.huge);
                match opts.dir {
                    Direction::BottomUp => unfree.first_gap_at_least(length, 0..total_size),
                    Direction::TopDown => unfree.last_gap_at_least(length, 0..total_size),
                }
            };
            if let Some(range) = gap {
                inner.unfree_mut(opts.huge).insert(range.clone(), 1);
                inner
                    .commit
                    .alloc_from_free(range.clone(), opts.kind, opts.memcg_id, committing);
                drop(inner);
                return self.finish_allocate(range, &mut opts, /*recycled=*/ false);
            }

            drop(inner);
            let by_chunks = ((length + CHUNK_SIZE - 1) / CHUNK_SIZE).max(1);
            self.extend_locked(by_chunks, opts.huge)?;
        }
    }

    /// Extends the backing file and publishes the new range into the
    /// interval sets of both size classes (§3, invariant 3's
    /// "cross-size chunk coverage"): the new range is always non-waste
    /// in both `unwaste` sets (so neither reclaimer ever treats foreign
    /// chunks as waste), free only in its own `unfree`, and permanently
    /// non-free in the other size's `unfree`.
    fn extend_locked(&self, by_chunks: u64, huge: bool) -> Result<()> {
        let new_range = self
            .backing
            .extend(by_chunks, huge, self.opts.advise_hugepage, self.opts.advise_no_hugepage)?;

        let mut inner = self.inner.lock().unwrap();
        inner.unwaste_mut(huge).insert(new_range.clone(), ());
        inner.unwaste_mut(!huge).insert(new_range.clone(), ());
        inner.unfree_mut(!huge).insert(new_range, 0);
        Ok(())
    }

    /// Realizes commit/populate/reader-fill for a freshly reserved
    /// `range`. On any host-call failure here the reservation is rolled
    /// back (SPEC_FULL §7: "the allocator rolls back (decrements refs)
    /// on failure after reservation") rather than leaking the range as
    /// permanently Used.
    fn finish_allocate(&self, mut range: Range<u64>, opts: &mut AllocOpts, recycled: bool) -> Result<Range<u64>> {
        match opts.mode {
            AllocMode::Uncommitted | AllocMode::CallerCommit => {}
            AllocMode::AndCommit => {
                if let Err(e) = self.backing.commit(range.clone()) {
                    self.decref(range);
                    return Err(e);
                }
            }
            AllocMode::AndWritePopulate => {
                if let Err(e) = self.backing.commit(range.clone()) {
                    self.decref(range);
                    return Err(e);
                }
                self.backing.populate_write(range.clone());
            }
        }

        if recycled {
            self.backing.zero(range.clone());
        }

        if opts.huge && !matches!(opts.mode, AllocMode::Uncommitted) {
            let populated_by_advice = matches!(opts.mode, AllocMode::AndWritePopulate)
                && !backing_file::write_populate_disabled();
            if !(self.opts.advise_hugepage && populated_by_advice) {
                self.touch_huge_pages(range.clone());
            }
        }

        if let Some(reader) = opts.reader.take() {
            let filled = match self.backing.fill_from_reader(range.clone(), reader) {
                Ok(filled) => filled,
                Err(e) => {
                    self.decref(range);
                    return Err(e);
                }
            };
            let p = page_size() as u64;
            let filled_aligned = (filled / p) * p;
            if filled_aligned < (range.end - range.start) {
                let tail = (range.start + filled_aligned)..range.end;
                self.decref(tail);
                range = range.start..(range.start + filled_aligned);
            }
        }

        Ok(range)
    }

    /// Touches the first byte of each huge page in `range` to force
    /// huge-page backing when populate-write advice wasn't applied (or
    /// failed). A no-op read-then-write of the same byte, not an actual
    /// content change.
    fn touch_huge_pages(&self, range: Range<u64>) {
        let huge_bytes = page_size() as u64 * pages_per_huge_page() as u64;
        let mut offset = range.start - (range.start % huge_bytes);
        while offset < range.end {
            let byte = self.backing.map_slice_mut(offset..(offset + 1));
            byte[0] = byte[0];
            offset += huge_bytes;
        }
    }

    /// §4.3: all pages in `range` must currently be Used.
    #[requires(page_range_aligned(&range), "incref: range not page-aligned or empty")]
    pub fn incref(&self, range: Range<u64>) {
        let huge = self.huge_for(range.start);
        let mut inner = self.inner.lock().unwrap();
        let unfree = inner.unfree_mut(huge);
        for seg in unfree.segments_in(range.clone()) {
            assert!(seg.value > 0, "incref: range {:?} is not Used", seg.range);
        }
        unfree.update(range, |rc| *rc += 1);
    }

    /// §4.3: all pages must be Used; pages reaching refcount 0 become
    /// Waste and wake the reclaimer.
    #[requires(page_range_aligned(&range), "decref: range not page-aligned or empty")]
    pub fn decref(&self, range: Range<u64>) {
        let huge = self.huge_for(range.start);
        let mut inner = self.inner.lock().unwrap();

        {
            let unfree = inner.unfree_mut(huge);
            for seg in unfree.segments_in(range.clone()) {
                assert!(seg.value > 0, "decref: range {:?} is not Used", seg.range);
            }
            unfree.update(range.clone(), |rc| *rc -= 1);
        }

        let newly_waste: Vec<Range<u64>> = inner
            .unfree_mut(huge)
            .segments_in(range)
            .into_iter()
            .filter(|s| s.value == 0)
            .map(|s| s.range)
            .collect();

        if newly_waste.is_empty() {
            return;
        }

        for r in &newly_waste {
            inner.unwaste_mut(huge).remove(r.clone());
        }
        for r in newly_waste {
            inner.commit.decref_to_waste(r);
        }
        inner.reclaimable = true;
        self.reclaim_cond.notify_one();
    }

    /// Explicit decommit of a live Used range; caller must hold >= 1 ref
    /// on every page.
    #[requires(page_range_aligned(&range), "decommit: range not page-aligned or empty")]
    pub fn decommit(&self, range: Range<u64>) -> Result<()> {
        let huge = self.huge_for(range.start);

        {
            let mut inner = self.inner.lock().unwrap();
            for seg in inner.unfree_mut(huge).segments_in(range.clone()) {
                assert!(seg.value > 0, "decommit: range {:?} is not Used", seg.range);
            }
        }

        self.backing.decommit(range.clone())?;

        let mut inner = self.inner.lock().unwrap();
        inner.commit.explicit_decommit(range);
        Ok(())
    }

    /// Rejects `Execute` access; otherwise returns one slice per chunk
    /// `range` straddles.
    pub fn map_internal(&self, range: Range<u64>, access: AccessType) -> Result<Vec<&[u8]>> {
        if access == AccessType::Execute {
            return Err(MemoryFileError::InvalidAccess);
        }

        let mut slices = Vec::new();
        let mut offset = range.start;
        while offset < range.end {
            let chunk_end = (offset / CHUNK_SIZE + 1) * CHUNK_SIZE;
            let end = chunk_end.min(range.end);
            slices.push(self.backing.map_slice(offset..end));
            offset = end;
        }
        Ok(slices)
    }

    /// True iff every page in `range` has refcount exactly 1. Racy
    /// unless the caller otherwise prevents concurrent sharing.
    #[requires(page_range_aligned(&range), "has_unique_ref: range not page-aligned or empty")]
    pub fn has_unique_ref(&self, range: Range<u64>) -> bool {
        let huge = self.huge_for(range.start);
        let inner = self.inner.lock().unwrap();
        inner.unfree(huge).segments_in(range).into_iter().all(|s| s.value == 1)
    }

    pub fn mark_evictable(&self, user: &Arc<dyn EvictableUser>, range: Range<u64>) {
        self.evictable.mark_evictable(user, range);
        match self.opts.resolved_delayed_eviction() {
            DelayedEviction::Disabled => EvictableRegistry::start_evictions(&self.evictable),
            DelayedEviction::Enabled if !self.opts.use_host_memcg_pressure => {
                let mut inner = self.inner.lock().unwrap();
                inner.evictions_requested = true;
                self.reclaim_cond.notify_one();
            }
            _ => {}
        }
    }

    pub fn mark_unevictable(&self, user: &Arc<dyn EvictableUser>, range: Range<u64>) {
        self.evictable.mark_unevictable(user, range);
    }

    pub fn mark_all_unevictable(&self, user: &Arc<dyn EvictableUser>) {
        self.evictable.mark_all_unevictable(user);
    }

    pub fn start_evictions(&self) {
        EvictableRegistry::start_evictions(&self.evictable);
    }

    pub fn wait_for_evictions(&self) {
        self.evictable.wait_for_evictions();
    }

    /// §4.5.
    pub fn update_usage(&self, memcg_filter: Option<u32>) -> Result<()> {
        let total = self.backing.total_usage()?;
        {
            let inner = self.inner.lock().unwrap();
            if total == inner.commit.known_committed_bytes() {
                return Ok(());
            }
        }

        {
            let mut last = self.last_update_usage.lock().unwrap();
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < UPDATE_USAGE_MIN_INTERVAL {
                    return Ok(());
                }
            }
            *last = Some(now);
        }

        let targets = {
            let inner = self.inner.lock().unwrap();
            inner.commit.unknown_segments(memcg_filter)
        };

        for seg in targets {
            let scan_seq = {
                let mut inner = self.inner.lock().unwrap();
                inner.commit.snapshot_and_bump_commit_seq()
            };

            let len = (seg.range.end - seg.range.start) as usize;
            let ps = page_size();
            let npages = (len + ps - 1) / ps;
            let mut bits = vec![0u8; npages];
            let addr = self.backing.map_slice(seg.range.clone()).as_ptr();

            match self.query.check_committed(addr, len, &mut bits) {
                Ok(()) => {
                    let runs = committed_runs_from_bits(&bits, seg.range.clone(), ps as u64);
                    let mut inner = self.inner.lock().unwrap();
                    for run in runs {
                        inner.commit.promote_committed_run(run, scan_seq);
                    }
                }
                Err(e) => {
                    log::warn!("updateUsage: checkCommitted failed for {:?}: {}", seg.range, e);
                }
            }
        }

        Ok(())
    }

    pub fn total_usage(&self) -> Result<u64> {
        self.backing.total_usage()
    }

    pub fn total_size(&self) -> u64 {
        self.backing.total_size()
    }

    #[cfg(test)]
    fn known_committed_bytes_for_test(&self) -> u64 {
        self.inner.lock().unwrap().commit.known_committed_bytes()
    }

    /// Flags the file as destroyed and wakes the reclaimer, which tears
    /// it down on its next loop iteration. Preconditions: all
    /// allocations must already be freed.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.destroyed = true;
        self.reclaim_cond.notify_all();
    }
}

impl ReclaimHost for MemoryFile {
    fn wait_for_work(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while !inner.reclaimable && !inner.evictions_requested && !inner.destroyed {
            inner = self.reclaim_cond.wait(inner).unwrap();
        }
        !inner.destroyed
    }

    fn reclaim_one_iteration(&self) {
        let start_evictions_first = {
            let mut inner = self.inner.lock().unwrap();
            let should = inner.evictions_requested;
            inner.evictions_requested = false;
            should
        };
        if start_evictions_first {
            EvictableRegistry::start_evictions(&self.evictable);
        }

        let picked = {
            let inner = self.inner.lock().unwrap();
            reclaimer::pick_waste_range(&inner.unwaste_small, &inner.unwaste_huge, 0..self.backing.total_size())
        };

        let (huge, range) = match picked {
            Some(v) => v,
            None => {
                let mut inner = self.inner.lock().unwrap();
                inner.reclaimable = false;
                return;
            }
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.unwaste_mut(huge).insert(range.clone(), ());
            inner.commit.reclaim(range.clone());
        }

        if !huge {
            if let Err(e) = self.backing.decommit(range.clone()) {
                log::warn!("reclaimer: decommit failed for {:?}: {}", range, e);
                return;
            }
            let mut inner = self.inner.lock().unwrap();
            inner.unfree_mut(false).remove(range);
            return;
        }

        let plan = {
            let inner = self.inner.lock().unwrap();
            reclaimer::plan_huge_reclaim(
                range,
                page_size() as u64,
                pages_per_huge_page() as u64,
                &inner.sub_reclaimed,
            )
        };

        for r in &plan.decommit_ranges {
            if let Err(e) = self.backing.decommit(r.clone()) {
                log::warn!("reclaimer: huge decommit failed for {:?}: {}", r, e);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        for r in &plan.free_ranges {
            inner.unfree_mut(true).remove(r.clone());
        }
        for (huge_offset, update) in plan.sub_reclaimed_updates {
            match update {
                Some(count) => inner.sub_reclaimed.set(huge_offset, count, pages_per_huge_page()),
                None => inner.sub_reclaimed.clear(huge_offset),
            }
        }
    }

    fn teardown(&self) {
        if self.opts.decommit_on_destroy {
            let size = self.backing.total_size();
            if size > 0 {
                if let Err(e) = self.backing.decommit(0..size) {
                    log::warn!("teardown: decommit failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::MemoryKind;

    fn new_mf(opts: Options) -> Arc<MemoryFile> {
        let file = tempfile::tempfile().unwrap();
        MemoryFile::new(file, opts).unwrap()
    }

    #[test]
    fn allocate_bottom_up_from_empty_returns_offset_zero() {
        let mf = new_mf(Options::default());
        let p = page_size() as u64;
        let opts = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let range = mf.allocate(p, opts).unwrap();
        assert_eq!(range, 0..p);
        assert_eq!(mf.known_committed_bytes_for_test(), p);
        assert_eq!(mf.total_size(), CHUNK_SIZE);
    }

    #[test]
    fn allocate_top_down_from_empty_returns_last_page() {
        let mf = new_mf(Options::default());
        let p = page_size() as u64;
        let opts = AllocOpts::new(MemoryKind::Application, AllocMode::Uncommitted, Direction::TopDown);
        let range = mf.allocate(p, opts).unwrap();
        assert_eq!(range, (CHUNK_SIZE - p)..CHUNK_SIZE);
    }

    #[test]
    fn sequential_bottom_up_allocations_pack_upward() {
        let mf = new_mf(Options::default());
        let p = page_size() as u64;
        let opts1 = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let r1 = mf.allocate(p, opts1).unwrap();
        assert_eq!(r1, 0..p);

        let opts2 = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let r2 = mf.allocate(p, opts2).unwrap();
        assert_eq!(r2, p..(2 * p));
    }

    #[test]
    fn decref_then_allocate_recycles_and_zeroes() {
        let mf = new_mf(Options::default());
        let p = page_size() as u64;
        let opts = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let r1 = mf.allocate(p, opts).unwrap();

        mf.backing.map_slice_mut(r1.clone()).fill(0xAA);

        mf.decref(r1.clone());

        let opts2 = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let r2 = mf.allocate(p, opts2).unwrap();
        assert_eq!(r2, r1);

        let slice = mf.map_internal(r2, AccessType::Read).unwrap();
        assert!(slice[0].iter().all(|&b| b == 0));
    }

    #[test]
    fn decref_then_allocate_uncommitted_skips_waste() {
        let mf = new_mf(Options::default());
        let p = page_size() as u64;
        let opts = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let r1 = mf.allocate(p, opts).unwrap();
        mf.decref(r1.clone());

        let opts2 = AllocOpts::new(MemoryKind::Application, AllocMode::Uncommitted, Direction::BottomUp);
        let r2 = mf.allocate(p, opts2).unwrap();
        assert_eq!(r2, p..(2 * p));
    }

    #[test]
    fn incref_decref_round_trip_preserves_refcount() {
        let mf = new_mf(Options::default());
        let p = page_size() as u64;
        let opts = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let r1 = mf.allocate(p, opts).unwrap();

        assert!(mf.has_unique_ref(r1.clone()));
        mf.incref(r1.clone());
        assert!(!mf.has_unique_ref(r1.clone()));
        mf.decref(r1.clone());
        assert!(mf.has_unique_ref(r1));
    }

    #[test]
    fn map_internal_rejects_execute() {
        let mf = new_mf(Options::default());
        let p = page_size() as u64;
        let opts = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let r = mf.allocate(p, opts).unwrap();
        assert!(matches!(
            mf.map_internal(r, AccessType::Execute),
            Err(MemoryFileError::InvalidAccess)
        ));
    }

    #[test]
    fn allocate_with_reader_fills_bytes() {
        let mf = new_mf(Options::default());
        let p = page_size() as u64;
        let mut data: &[u8] = &[1, 2, 3, 4];
        let opts = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp)
            .with_reader(&mut data);
        let r = mf.allocate(p, opts).unwrap();
        let slice = mf.map_internal(r, AccessType::Read).unwrap();
        assert_eq!(&slice[0][0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn huge_allocation_lands_in_its_own_chunk_after_a_small_one() {
        let mf = new_mf(Options::default().with_expect_hugepages(true));
        let p = page_size() as u64;
        let huge_bytes = p * pages_per_huge_page() as u64;

        let small = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
        let r1 = mf.allocate(p, small).unwrap();
        assert_eq!(r1, 0..p);

        let huge = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp)
            .with_huge(true);
        let r2 = mf.allocate(huge_bytes, huge).unwrap();
        assert_eq!(r2, CHUNK_SIZE..(CHUNK_SIZE + huge_bytes));
    }

    use proptest::prelude::*;

    proptest! {
        // `incref` then an equal number of `decref` calls on the same
        // range must restore the original refcount (spec §8 property 2),
        // whatever that number of round trips.
        #[test]
        fn incref_decref_round_trips_restore_refcount(n in 0usize..20) {
            let mf = new_mf(Options::default());
            let p = page_size() as u64;
            let opts = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::BottomUp);
            let r = mf.allocate(p, opts).unwrap();

            for _ in 0..n {
                mf.incref(r.clone());
            }
            for _ in 0..n {
                mf.decref(r.clone());
            }

            prop_assert!(mf.has_unique_ref(r));
        }
    }
}
