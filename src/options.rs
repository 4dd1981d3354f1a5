//! Configuration surface: the `Options` a `MemoryFile` is created with,
//! and the per-call `AllocOpts` an `allocate()` takes.
//!
//! Shaped like the teacher's `ClassConfig` (a plain struct set up once at
//! construction time, no FFI mirror tier since this crate exposes no C
//! ABI) plus builder-style `with_*` setters for the options that are
//! usually left at their default.

use std::io::Read;

/// Governs when pages a user marks evictable are actually evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedEviction {
    /// Resolves to `Enabled`.
    Default,
    /// Evict immediately on `markEvictable`.
    Disabled,
    /// Defer eviction until the reclaimer is idle or host memcg pressure
    /// fires (if `use_host_memcg_pressure` is set).
    Enabled,
    /// Defer eviction until a caller explicitly calls `start_evictions`.
    Manual,
}

/// Accounting category a range of pages is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    System,
    Application,
    PageCache,
    /// Catch-all for collaborator-defined categories not named above.
    Other(u16),
}

/// Gap-selection preference for `allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Prefer the lowest-offset gap.
    BottomUp,
    /// Prefer the highest-offset gap.
    TopDown,
}

/// Determines whether, and how, `allocate` must return committed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Leave the range's commitment state as found (`Unknown` unless
    /// recycled into a known state).
    Uncommitted,
    /// Commit via `fallocate` before returning.
    AndCommit,
    /// The caller takes responsibility for committing; accounted as
    /// committed without touching the host.
    CallerCommit,
    /// Commit and write-populate (`MADV_POPULATE_WRITE`, or `mlock`+
    /// `munlock` on hugepage-aligned sub-ranges as a fallback).
    AndWritePopulate,
}

/// Access intent for `map_internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    /// Always rejected with `MemoryFileError::InvalidAccess`.
    Execute,
}

/// Per-`allocate` options.
pub struct AllocOpts<'a> {
    pub kind: MemoryKind,
    pub memcg_id: u32,
    pub mode: AllocMode,
    pub huge: bool,
    pub dir: Direction,
    /// Optional byte source filling the allocation. A short read
    /// truncates the returned range.
    pub reader: Option<&'a mut dyn Read>,
}

impl<'a> AllocOpts<'a> {
    pub fn new(kind: MemoryKind, mode: AllocMode, dir: Direction) -> Self {
        AllocOpts {
            kind,
            memcg_id: 0,
            mode,
            huge: false,
            dir,
            reader: None,
        }
    }

    pub fn with_memcg_id(mut self, memcg_id: u32) -> Self {
        self.memcg_id = memcg_id;
        self
    }

    pub fn with_huge(mut self, huge: bool) -> Self {
        self.huge = huge;
        self
    }

    pub fn with_reader(mut self, reader: &'a mut dyn Read) -> Self {
        self.reader = Some(reader);
        self
    }
}

/// Construction-time configuration for a `MemoryFile`.
#[derive(Debug, Clone)]
pub struct Options {
    pub delayed_eviction: DelayedEviction,
    /// Only meaningful with `delayed_eviction == Enabled`: installs a
    /// host cgroup low-pressure callback that calls `start_evictions`.
    pub use_host_memcg_pressure: bool,
    /// Decommit the whole file during `destroy`'s teardown.
    pub decommit_on_destroy: bool,
    /// Informational: surfaced to callers, does not change behavior.
    pub disk_backed_file: bool,
    /// Enables huge-page chunks and the huge-page interval sets.
    pub expect_hugepages: bool,
    pub advise_hugepage: bool,
    pub advise_no_hugepage: bool,
    /// Skip all `memAcct` bookkeeping (the commitment-accounting
    /// interval set is still created empty but never updated).
    pub disable_memory_accounting: bool,
    /// Skip the startup `PROT_EXEC` pre-map IMA workaround.
    pub disable_ima_workaround: bool,
}

impl Options {
    pub fn with_delayed_eviction(mut self, delayed_eviction: DelayedEviction) -> Self {
        self.delayed_eviction = delayed_eviction;
        self
    }

    pub fn with_use_host_memcg_pressure(mut self, v: bool) -> Self {
        self.use_host_memcg_pressure = v;
        self
    }

    pub fn with_decommit_on_destroy(mut self, v: bool) -> Self {
        self.decommit_on_destroy = v;
        self
    }

    pub fn with_expect_hugepages(mut self, v: bool) -> Self {
        self.expect_hugepages = v;
        self
    }

    pub fn with_advise_hugepage(mut self, v: bool) -> Self {
        self.advise_hugepage = v;
        self
    }

    pub fn with_advise_no_hugepage(mut self, v: bool) -> Self {
        self.advise_no_hugepage = v;
        self
    }

    pub fn with_disable_memory_accounting(mut self, v: bool) -> Self {
        self.disable_memory_accounting = v;
        self
    }

    pub fn with_disable_ima_workaround(mut self, v: bool) -> Self {
        self.disable_ima_workaround = v;
        self
    }

    /// Resolves `DelayedEviction::Default` to the concrete policy it
    /// stands for, and checks `use_host_memcg_pressure`'s precondition.
    pub(crate) fn resolved_delayed_eviction(&self) -> DelayedEviction {
        match self.delayed_eviction {
            DelayedEviction::Default => DelayedEviction::Enabled,
            other => other,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            delayed_eviction: DelayedEviction::Default,
            use_host_memcg_pressure: false,
            decommit_on_destroy: false,
            disk_backed_file: false,
            expect_hugepages: false,
            advise_hugepage: false,
            advise_no_hugepage: false,
            disable_memory_accounting: false,
            disable_ima_workaround: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_delayed_eviction_resolves_to_enabled() {
        let opts = Options::default();
        assert_eq!(opts.resolved_delayed_eviction(), DelayedEviction::Enabled);
    }

    #[test]
    fn builder_overrides_defaults() {
        let opts = Options::default()
            .with_expect_hugepages(true)
            .with_decommit_on_destroy(true);
        assert!(opts.expect_hugepages);
        assert!(opts.decommit_on_destroy);
        assert!(!opts.disable_memory_accounting);
    }

    #[test]
    fn alloc_opts_builder() {
        let opts = AllocOpts::new(MemoryKind::Application, AllocMode::AndCommit, Direction::TopDown)
            .with_huge(true)
            .with_memcg_id(7);
        assert!(opts.huge);
        assert_eq!(opts.memcg_id, 7);
        assert_eq!(opts.dir, Direction::TopDown);
    }
}
