//! The evictable-user registry: tracks, per registered user, which
//! ranges it has volunteered as evictable, and drives eviction tasks
//! that hand those ranges back via `user.evict(range)`.
//!
//! The registry-of-caller-owned-resources shape follows the teacher's
//! `rack.rs` (a table the allocator core owns on behalf of its callers);
//! unlike the rack, entries here come and go with caller traffic rather
//! than being a fixed global, so the table is a `HashMap` keyed by
//! identity rather than a `'static` singleton. The wait-group (in-flight
//! eviction task count, `Mutex` + `Condvar`) has no teacher analog and is
//! built directly from the concurrency model the spec describes.
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex};

use crate::interval_set::IntervalSet;

/// A collaborator that can give back previously volunteered ranges when
/// asked. Identity is by `Arc` pointer, per the spec's "registered by
/// identity only" note: the registry never needs `Eq`/`Hash` on the user
/// itself.
pub trait EvictableUser: Send + Sync {
    fn evict(&self, range: Range<u64>);
}

pub type UserId = usize;

/// Derives the identity the registry uses for `user`.
pub fn user_id(user: &Arc<dyn EvictableUser>) -> UserId {
    Arc::as_ptr(user) as *const () as UserId
}

struct UserEntry {
    user: Arc<dyn EvictableUser>,
    ranges: IntervalSet<()>,
    evicting: bool,
}

pub struct EvictableRegistry {
    users: Mutex<HashMap<UserId, UserEntry>>,
    in_flight: Mutex<usize>,
    in_flight_cond: Condvar,
}

impl EvictableRegistry {
    pub fn new() -> Self {
        EvictableRegistry {
            users: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(0),
            in_flight_cond: Condvar::new(),
        }
    }

    pub fn mark_evictable(&self, user: &Arc<dyn EvictableUser>, range: Range<u64>) {
        let id = user_id(user);
        let mut users = self.users.lock().unwrap();
        let entry = users.entry(id).or_insert_with(|| UserEntry {
            user: Arc::clone(user),
            ranges: IntervalSet::new(),
            evicting: false,
        });
        entry.ranges.insert(range, ());
    }

    pub fn mark_unevictable(&self, user: &Arc<dyn EvictableUser>, range: Range<u64>) {
        let id = user_id(user);
        let mut users = self.users.lock().unwrap();
        if let Some(entry) = users.get_mut(&id) {
            entry.ranges.remove(range);
            if entry.ranges.is_empty() && !entry.evicting {
                users.remove(&id);
            }
        }
    }

    pub fn mark_all_unevictable(&self, user: &Arc<dyn EvictableUser>) {
        let id = user_id(user);
        let mut users = self.users.lock().unwrap();
        if let Some(entry) = users.get_mut(&id) {
            entry.ranges = IntervalSet::new();
            if !entry.evicting {
                users.remove(&id);
            }
        }
    }

    /// Spawns an eviction task for every registered user that isn't
    /// already being evicted and has at least one evictable range.
    /// Takes `self` wrapped in its own `Arc` because eviction tasks run
    /// on detached `std::thread`s that must own a handle past this call.
    pub fn start_evictions(registry: &Arc<Self>) {
        let mut users = registry.users.lock().unwrap();
        let to_start: Vec<UserId> = users
            .iter()
            .filter(|(_, e)| !e.evicting && !e.ranges.is_empty())
            .map(|(&id, _)| id)
            .collect();

        for id in to_start {
            if let Some(entry) = users.get_mut(&id) {
                entry.evicting = true;
            }
            let registry = Arc::clone(registry);
            *registry.in_flight.lock().unwrap() += 1;
            std::thread::spawn(move || registry.run_eviction_task(id));
        }
    }

    /// Repeatedly pops the highest-offset range (reuse is more likely
    /// near the beginning of a user's range) and calls `evict` on it
    /// with the registry lock dropped. Cleans up the entry once its
    /// ranges are exhausted.
    fn run_eviction_task(self: Arc<Self>, id: UserId) {
        loop {
            let (user, range) = {
                let mut users = self.users.lock().unwrap();
                let entry = match users.get_mut(&id) {
                    Some(e) => e,
                    None => break,
                };
                match entry.ranges.last_segment() {
                    Some(seg) => {
                        entry.ranges.remove(seg.range.clone());
                        (Arc::clone(&entry.user), seg.range)
                    }
                    None => {
                        users.remove(&id);
                        break;
                    }
                }
            };

            user.evict(range);
        }

        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.in_flight_cond.notify_all();
        }
    }

    /// Blocks until every in-flight eviction task has completed. Used by
    /// tests and by callers that need a synchronization point, not by
    /// normal operation.
    pub fn wait_for_evictions(&self) {
        let guard = self.in_flight.lock().unwrap();
        let _unused = self
            .in_flight_cond
            .wait_while(guard, |count| *count > 0)
            .unwrap();
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().unwrap().is_empty()
    }
}

impl Default for EvictableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingUser {
        evicted: Mutex<Vec<Range<u64>>>,
        calls: AtomicUsize,
    }

    impl EvictableUser for RecordingUser {
        fn evict(&self, range: Range<u64>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.evicted.lock().unwrap().push(range);
        }
    }

    #[test]
    fn mark_evictable_then_unevictable_drops_entry() {
        let registry = Arc::new(EvictableRegistry::new());
        let user: Arc<dyn EvictableUser> = Arc::new(RecordingUser {
            evicted: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });

        registry.mark_evictable(&user, 0..4096);
        assert!(!registry.is_empty());

        registry.mark_unevictable(&user, 0..4096);
        assert!(registry.is_empty());
    }

    #[test]
    fn start_evictions_calls_evict_and_drains_registry() {
        let registry = Arc::new(EvictableRegistry::new());
        let user = Arc::new(RecordingUser {
            evicted: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let dyn_user: Arc<dyn EvictableUser> = user.clone();

        registry.mark_evictable(&dyn_user, 0..4096);
        registry.mark_evictable(&dyn_user, 8192..12288);

        EvictableRegistry::start_evictions(&registry);
        registry.wait_for_evictions();

        assert_eq!(user.calls.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());

        let evicted = user.evicted.lock().unwrap();
        // Highest offset is popped first.
        assert_eq!(evicted[0], 8192..12288);
        assert_eq!(evicted[1], 0..4096);
    }

    #[test]
    fn mark_all_unevictable_clears_every_range() {
        let registry = Arc::new(EvictableRegistry::new());
        let user: Arc<dyn EvictableUser> = Arc::new(RecordingUser {
            evicted: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });

        registry.mark_evictable(&user, 0..4096);
        registry.mark_evictable(&user, 8192..12288);
        registry.mark_all_unevictable(&user);
        assert!(registry.is_empty());
    }
}
