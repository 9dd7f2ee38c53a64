//! Bounded cache of recently seen delivery ids.

use std::collections::HashSet;

/// Default number of ids remembered
pub const DEFAULT_DEDUP_CAPACITY: usize = 2000;

/// Fixed-capacity set with insertion-order eviction.
///
/// Membership lives in a `HashSet`; a ring of slots records insertion order so
/// the oldest id is evicted in O(1) once the ring is full.
#[derive(Debug)]
pub struct DedupCache {
    seen: HashSet<String>,
    ring: Vec<Option<String>>,
    next: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            ring: vec![None; capacity],
            next: 0,
        }
    }

    /// Returns `true` if `id` was already seen. Otherwise records it and
    /// returns `false`.
    pub fn check(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }

        if let Some(evicted) = self.ring[self.next].take() {
            self.seen.remove(&evicted);
        }
        self.ring[self.next] = Some(id.to_string());
        self.seen.insert(id.to_string());
        self.next = (self.next + 1) % self.ring.len();

        debug_assert!(self.seen.len() <= self.ring.len());
        false
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.ring.iter_mut().for_each(|slot| *slot = None);
        self.next = 0;
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::DedupCache;

    #[test]
    fn drops_duplicates() {
        let mut dedup = DedupCache::new(100);
        assert!(!dedup.check("id1"));
        assert!(dedup.check("id1"));
        assert!(dedup.check("id1"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn remains_bounded() {
        let mut dedup = DedupCache::new(2);
        dedup.check("a");
        dedup.check("b");
        dedup.check("c");
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.contains("a"));
        assert!(dedup.contains("b"));
        assert!(dedup.contains("c"));
    }

    #[test]
    fn evicted_id_is_new_again() {
        let mut dedup = DedupCache::new(3);
        for id in ["a", "b", "c", "d"] {
            assert!(!dedup.check(id));
        }
        // "a" was the oldest and fell out of the window
        assert!(!dedup.check("a"));
        // "b" was evicted by "a" re-entering
        assert!(!dedup.check("b"));
        assert!(dedup.check("d"));
    }

    #[test]
    fn duplicate_check_does_not_advance_ring() {
        let mut dedup = DedupCache::new(2);
        dedup.check("a");
        for _ in 0..10 {
            assert!(dedup.check("a"));
        }
        dedup.check("b");
        assert!(dedup.contains("a"));
        assert!(dedup.contains("b"));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut dedup = DedupCache::default();
        assert_eq!(dedup.capacity(), 2000);
        dedup.check("x");
        dedup.clear();
        assert!(dedup.is_empty());
        assert!(!dedup.check("x"));
    }
}
