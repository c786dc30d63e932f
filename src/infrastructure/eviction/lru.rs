//! Least-recently-used eviction for the in-process rate-limit store.

use crate::application::ports::{EvictionCandidate, EvictionPolicy};

/// Evicts the key whose state was touched longest ago once `max_entries`
/// keys are tracked.
///
/// Ties go to the first candidate in iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruEviction {
    max_entries: usize,
}

impl LruEviction {
    /// Policy bounding the store at `max_entries` keys.
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }

    /// Tracked-key bound.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

impl<K: Clone> EvictionPolicy<K> for LruEviction {
    fn select_victim(&self, candidates: &[EvictionCandidate<K>]) -> Option<K> {
        let mut oldest: Option<&EvictionCandidate<K>> = None;
        for candidate in candidates {
            if oldest.map_or(true, |o| candidate.last_access < o.last_access) {
                oldest = Some(candidate);
            }
        }
        oldest.map(|c| c.key.clone())
    }

    fn should_evict(&self, current_entries: usize) -> bool {
        current_entries >= self.max_entries
    }
}
