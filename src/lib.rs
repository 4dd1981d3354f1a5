mod backing_file;
mod commit_accounting;
mod error;
mod evictable;
mod interval_set;
mod memory_file;
mod options;
mod page_size;
mod reclaimer;
mod seqlock;

pub use error::{MemoryFileError, Result};
pub use evictable::{EvictableRegistry, EvictableUser};
pub use memory_file::MemoryFile;
pub use options::{
    AccessType, AllocMode, AllocOpts, DelayedEviction, Direction, MemoryKind, Options,
};
pub use page_size::{huge_page_size, page_size, pages_per_huge_page};
