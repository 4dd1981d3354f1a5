//! A small sequence-counter–guarded cell, used to publish the chunk table
//! to hot readers without making them contend on `MemoryFile`'s main lock.
//!
//! This plays the same role as the teacher's `MagazineStack`: a lock-free
//! structure (there, an `AtomicPtr` stack guarded by a generation counter
//! for ABA-safety; here, a `Vec` snapshot guarded by a generation counter
//! for torn-read-safety) that a writer publishes under the real lock, and
//! that readers consult without taking it.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Publishes snapshots of a `Vec<T>` so that readers needn't hold
/// `MemoryFile`'s mutex. Writers must still hold that mutex (this type adds
/// no mutual exclusion of its own); it only makes torn reads detectable.
pub struct SeqLock<T> {
    seq: AtomicU64,
    data: Mutex<Vec<T>>,
}

impl<T: Clone> SeqLock<T> {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            data: Mutex::new(Vec::new()),
        }
    }

    /// Appends `items` to the table. Caller must already hold
    /// `MemoryFile`'s mutex; this only manages the sequence counter.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        // Odd sequence = writer in progress; readers must retry.
        self.seq.fetch_add(1, Ordering::AcqRel);
        {
            let mut data = self.data.lock().unwrap();
            data.extend(items);
        }
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns a consistent clone of the current table. May retry
    /// internally if it observes a writer in progress.
    pub fn load(&self) -> Vec<T> {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let snapshot = self.data.lock().unwrap().clone();
            let after = self.seq.load(Ordering::Acquire);
            if before == after {
                return snapshot;
            }
        }
    }

    /// Returns the number of published entries. Caller must hold
    /// `MemoryFile`'s mutex for this to be meaningful as a precise count.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl<T: Clone> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn smoke_test() {
        let lock: SeqLock<u32> = SeqLock::new();
        assert_eq!(lock.load(), Vec::<u32>::new());
        lock.extend([1, 2, 3]);
        assert_eq!(lock.load(), vec![1, 2, 3]);
        lock.extend([4]);
        assert_eq!(lock.load(), vec![1, 2, 3, 4]);
        assert_eq!(lock.len(), 4);
    }
}
