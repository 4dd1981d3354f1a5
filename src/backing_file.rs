//! Owns the host-file side of a `MemoryFile`: the descriptor, its
//! chunk-granular mappings, and the `commit`/`decommit`/`mapSlice`
//! syscalls.
//!
//! Grounded on the teacher's `file_backed_mapper.rs` (temp-file-backed
//! shared mappings) and `map.rs` (page-size-aware mmap wrapper), ported
//! from the teacher's C glue to direct `libc` calls in the style of
//! `other_examples`' `scottlamb-page-primer` `linux.rs` (raw `libc::mmap`,
//! `errno()` via `std::io::Error::last_os_error`, `MAP_FIXED` remap over an
//! anonymous reservation for huge pages).
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{MemoryFileError, Result};
use crate::page_size::{page_size, pages_per_huge_page};
use crate::seqlock::SeqLock;

/// Chunks are extended this many bytes at a time.
pub const CHUNK_SIZE: u64 = 1 << 30;

/// A chunk's page-size attribute and its live mapping. Mapping addresses
/// are immutable once published: once a `ChunkInfo` lands in `chunks`, its
/// `addr`/`len` never change, so `map_slice` may read them without the MF
/// lock.
#[derive(Clone, Copy)]
pub struct ChunkInfo {
    pub addr: usize,
    pub len: usize,
    pub huge: bool,
}

static WRITE_POPULATE_DISABLED: AtomicBool = AtomicBool::new(false);
static MLOCK_DISABLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn write_populate_disabled() -> bool {
    WRITE_POPULATE_DISABLED.load(Ordering::Relaxed)
}

pub(crate) fn mlock_disabled() -> bool {
    MLOCK_DISABLED.load(Ordering::Relaxed)
}

/// The backing-file manager. `chunks` is published through a `SeqLock` so
/// hot readers (`map_internal`) can observe it without taking the MF's
/// main mutex; all mutation still happens under that mutex.
pub struct BackingFile {
    file: File,
    pub chunks: SeqLock<ChunkInfo>,
}

impl BackingFile {
    /// Truncates `file` to zero length and prepares it for chunked
    /// extension. Runs the IMA pre-map workaround unless disabled.
    pub fn new(file: File, disable_ima_workaround: bool) -> Result<Self> {
        file.set_len(0)
            .map_err(|e| MemoryFileError::host("ftruncate", e))?;

        let backing = BackingFile {
            file,
            chunks: SeqLock::new(),
        };

        if !disable_ima_workaround {
            backing.run_ima_workaround();
        }

        Ok(backing)
    }

    /// Maps one page `PROT_EXEC` and immediately unmaps it, so the host's
    /// integrity subsystem pre-registers the file instead of doing a full
    /// scan on the first real executable mapping. Best-effort: failures
    /// are logged and otherwise ignored.
    fn run_ima_workaround(&self) {
        let len = page_size();
        if let Err(e) = self.file.set_len(len as u64) {
            log::warn!("IMA workaround: failed to grow file: {}", e);
            return;
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_EXEC,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            log::warn!(
                "IMA workaround: PROT_EXEC mmap failed: {}",
                std::io::Error::last_os_error()
            );
        } else {
            unsafe {
                libc::munmap(addr, len);
            }
        }

        if let Err(e) = self.file.set_len(0) {
            log::warn!("IMA workaround: failed to shrink file back: {}", e);
        }
    }

    /// `fstat`-based total usage: includes swap and page cache, matching
    /// the host's own view of how much of the file is actually backed.
    pub fn total_usage(&self) -> Result<u64> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(self.file.as_raw_fd(), &mut stat) };
        if ret != 0 {
            return MemoryFileError::last_os_error("fstat");
        }
        Ok((stat.st_blocks as u64) * 512)
    }

    pub fn total_size(&self) -> u64 {
        self.chunks
            .len()
            .checked_mul(CHUNK_SIZE as usize)
            .expect("chunk count overflow") as u64
    }

    /// Extends the file by `chunks` chunks, each `huge` or not, mapping
    /// the incremental region and publishing new `ChunkInfo` entries.
    /// Caller must hold the MF lock. `advise_hugepage`/`advise_no_hugepage`
    /// mirror the `Options` of the same name.
    pub fn extend(
        &self,
        by_chunks: u64,
        huge: bool,
        advise_hugepage: bool,
        advise_no_hugepage: bool,
    ) -> Result<Range<u64>> {
        let old_chunk_count = self.chunks.len() as u64;
        let new_chunk_count = old_chunk_count
            .checked_add(by_chunks)
            .filter(|c| *c <= (i64::MAX as u64) / CHUNK_SIZE)
            .ok_or(MemoryFileError::OutOfSpace {
                attempted_chunks: old_chunk_count + by_chunks,
            })?;

        let old_size = old_chunk_count * CHUNK_SIZE;
        let new_size = new_chunk_count * CHUNK_SIZE;
        let added_len = (new_size - old_size) as usize;

        self.file
            .set_len(new_size)
            .map_err(|e| MemoryFileError::host("ftruncate", e))?;

        let addr = if huge {
            self.map_huge(old_size, added_len)?
        } else {
            self.map_plain(old_size, added_len)?
        };

        if advise_hugepage {
            if unsafe { libc::madvise(addr as *mut libc::c_void, added_len, libc::MADV_HUGEPAGE) } != 0 {
                log::warn!(
                    "madvise(MADV_HUGEPAGE) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        } else if advise_no_hugepage
            && unsafe { libc::madvise(addr as *mut libc::c_void, added_len, libc::MADV_NOHUGEPAGE) } != 0
        {
            log::warn!(
                "madvise(MADV_NOHUGEPAGE) failed: {}",
                std::io::Error::last_os_error()
            );
        }

        let mut new_chunks = Vec::with_capacity(by_chunks as usize);
        for i in 0..by_chunks {
            new_chunks.push(ChunkInfo {
                addr: addr + (i as usize) * (CHUNK_SIZE as usize),
                len: CHUNK_SIZE as usize,
                huge,
            });
        }
        self.chunks.extend(new_chunks);

        Ok(old_size..new_size)
    }

    fn map_plain(&self, offset: u64, len: usize) -> Result<usize> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return MemoryFileError::last_os_error("mmap");
        }
        Ok(addr as usize)
    }

    /// Reserves a hugepage-aligned anonymous region, then remaps the
    /// file over it with `MAP_FIXED` so the resulting mapping is
    /// huge-page-aligned regardless of where the host happened to place
    /// it.
    fn map_huge(&self, offset: u64, len: usize) -> Result<usize> {
        let reservation = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reservation == libc::MAP_FAILED {
            return MemoryFileError::last_os_error("mmap(reserve huge)");
        }

        let addr = unsafe {
            libc::mmap(
                reservation,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            let e = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(reservation, len);
            }
            return Err(MemoryFileError::host("mmap(remap huge)", e));
        }

        Ok(addr as usize)
    }

    fn chunk_for(&self, offset: u64) -> ChunkInfo {
        let idx = (offset / CHUNK_SIZE) as usize;
        let chunks = self.chunks.load();
        chunks[idx]
    }

    /// Whether the chunk covering `offset` was mapped huge.
    pub fn chunk_huge_at(&self, offset: u64) -> bool {
        self.chunk_for(offset).huge
    }

    /// Returns a `&[u8]` view into the mapping backing `range`. `range`
    /// must not straddle a chunk boundary.
    pub fn map_slice(&self, range: Range<u64>) -> &[u8] {
        let chunk = self.chunk_for(range.start);
        let chunk_offset = range.start % CHUNK_SIZE;
        let within = (range.end - range.start) as usize;
        debug_assert!(chunk_offset + within as u64 <= CHUNK_SIZE as u64);

        unsafe {
            std::slice::from_raw_parts((chunk.addr + chunk_offset as usize) as *const u8, within)
        }
    }

    /// Returns a mutable `&mut [u8]` view into the mapping backing
    /// `range`. Safe because the MF lock serializes all writers and the
    /// mapping is `MAP_SHARED` (no aliasing-through-host-page-cache UB
    /// concern beyond what any mmap-based allocator already accepts).
    #[allow(clippy::mut_from_ref)]
    pub fn map_slice_mut(&self, range: Range<u64>) -> &mut [u8] {
        let chunk = self.chunk_for(range.start);
        let chunk_offset = range.start % CHUNK_SIZE;
        let within = (range.end - range.start) as usize;
        debug_assert!(chunk_offset + within as u64 <= CHUNK_SIZE as u64);

        unsafe {
            std::slice::from_raw_parts_mut((chunk.addr + chunk_offset as usize) as *mut u8, within)
        }
    }

    pub fn commit(&self, range: Range<u64>) -> Result<()> {
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                0,
                range.start as libc::off_t,
                (range.end - range.start) as libc::off_t,
            )
        };
        if ret != 0 {
            return MemoryFileError::last_os_error("fallocate(commit)");
        }
        Ok(())
    }

    pub fn decommit(&self, range: Range<u64>) -> Result<()> {
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                range.start as libc::off_t,
                (range.end - range.start) as libc::off_t,
            )
        };
        if ret != 0 {
            return MemoryFileError::last_os_error("fallocate(decommit)");
        }
        Ok(())
    }

    /// Write-populates `range` via `MADV_POPULATE_WRITE`, falling back to
    /// `mlock`+`munlock` on hugepage-aligned sub-ranges. Each mechanism
    /// permanently disables itself after its first `EINVAL`/`ENOMEM`/
    /// `EPERM`, per the spec's "disable and never retry" policy. Skips
    /// populate entirely for single-page touches (not worth a syscall).
    pub fn populate_write(&self, range: Range<u64>) {
        let len = (range.end - range.start) as usize;
        if len <= page_size() {
            return;
        }

        if !write_populate_disabled() {
            let chunk = self.chunk_for(range.start);
            let chunk_offset = range.start % CHUNK_SIZE;
            let addr = (chunk.addr + chunk_offset as usize) as *mut libc::c_void;
            let ret = unsafe { libc::madvise(addr, len, libc::MADV_POPULATE_WRITE) };
            if ret == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if matches!(
                err.raw_os_error(),
                Some(libc::EINVAL) | Some(libc::ENOMEM) | Some(libc::EPERM)
            ) {
                log::warn!("MADV_POPULATE_WRITE disabled after failure: {}", err);
                WRITE_POPULATE_DISABLED.store(true, Ordering::Relaxed);
            }
        }

        if mlock_disabled() {
            return;
        }

        let huge = pages_per_huge_page() as u64 * page_size() as u64;
        let mut offset = range.start - (range.start % huge);
        while offset < range.end {
            let sub_end = (offset + huge).min(range.end).max(range.start);
            if sub_end > offset.max(range.start) {
                let sub_start = offset.max(range.start);
                let chunk = self.chunk_for(sub_start);
                let chunk_offset = sub_start % CHUNK_SIZE;
                let addr = (chunk.addr + chunk_offset as usize) as *const libc::c_void;
                let sub_len = (sub_end - sub_start) as usize;

                if unsafe { libc::mlock(addr, sub_len) } != 0 {
                    let err = std::io::Error::last_os_error();
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EINVAL) | Some(libc::ENOMEM) | Some(libc::EPERM)
                    ) {
                        log::warn!("mlock populate fallback disabled after failure: {}", err);
                        MLOCK_DISABLED.store(true, Ordering::Relaxed);
                        return;
                    }
                } else {
                    unsafe {
                        libc::munlock(addr, sub_len);
                    }
                }
            }
            offset += huge;
        }
    }

    /// Zeroes `range` in the mapping (recycled pages have unknown prior
    /// contents and must read back as zero).
    pub fn zero(&self, range: Range<u64>) {
        self.map_slice_mut(range).fill(0);
    }

    /// Copies bytes from `reader` into `range`, returning the number of
    /// bytes actually filled. Shorter-than-requested reads are reported
    /// to the caller, who truncates the allocation accordingly.
    pub fn fill_from_reader(&self, range: Range<u64>, reader: &mut dyn Read) -> Result<u64> {
        let dst = self.map_slice_mut(range.clone());
        let mut filled = 0usize;
        while filled < dst.len() {
            match reader.read(&mut dst[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    return Err(MemoryFileError::ShortRead {
                        range,
                        wanted: dst.len() as u64,
                        got: filled as u64,
                        source: Some(e),
                    })
                }
            }
        }
        Ok(filled as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_backing() -> BackingFile {
        let file = tempfile::tempfile().unwrap();
        BackingFile::new(file, /*disable_ima_workaround=*/ true).unwrap()
    }

    #[test]
    fn extend_publishes_chunk_and_grows_size() {
        let backing = new_backing();
        assert_eq!(backing.total_size(), 0);

        let range = backing.extend(1, false, false, false).unwrap();
        assert_eq!(range, 0..CHUNK_SIZE);
        assert_eq!(backing.total_size(), CHUNK_SIZE);
        assert_eq!(backing.chunks.len(), 1);
    }

    #[test]
    fn commit_decommit_round_trip() {
        let backing = new_backing();
        backing.extend(1, false, false, false).unwrap();
        backing.commit(0..(page_size() as u64)).unwrap();
        backing.decommit(0..(page_size() as u64)).unwrap();
    }

    #[test]
    fn map_slice_reads_zero_initially() {
        let backing = new_backing();
        backing.extend(1, false, false, false).unwrap();
        let slice = backing.map_slice(0..(page_size() as u64));
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_clears_written_bytes() {
        let backing = new_backing();
        backing.extend(1, false, false, false).unwrap();
        let len = page_size() as u64;
        backing.map_slice_mut(0..len).fill(0xAA);
        backing.zero(0..len);
        assert!(backing.map_slice(0..len).iter().all(|&b| b == 0));
    }

    #[test]
    fn fill_from_reader_reports_short_read() {
        let backing = new_backing();
        backing.extend(1, false, false, false).unwrap();
        let len = page_size() as u64;
        let mut data: &[u8] = &[1, 2, 3];
        let filled = backing.fill_from_reader(0..len, &mut data).unwrap();
        assert_eq!(filled, 3);
        assert_eq!(&backing.map_slice(0..4)[0..3], &[1, 2, 3]);
    }
}
