//! Checkpoint manager — tracks which WAL sequences recovery still needs.
//!
//! A checkpoint is a named sequence number. The engine registers one per
//! immutable memtable at rotation (named after the memtable's highest
//! sequence) and removes it once the flushed SSTable is durably published.
//! WAL cleanup may only delete segments whose contents are at or below
//! `min(requested bound, minimum registered checkpoint)` — as long as a
//! checkpoint is registered, the records behind it must stay replayable.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Thread-safe named map `name → seq`.
#[derive(Debug, Default)]
pub struct CheckpointManager {
    inner: Mutex<HashMap<String, u64>>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or moves) a checkpoint at the given sequence.
    pub fn register(&self, name: &str, seq: u64) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug!(name, seq, "checkpoint registered");
        map.insert(name.to_string(), seq);
    }

    /// Removes a checkpoint. Removing an unknown name is a no-op.
    pub fn remove(&self, name: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.remove(name).is_some() {
            debug!(name, "checkpoint removed");
        }
    }

    /// The lowest registered sequence, or `None` when no checkpoint exists.
    pub fn min_seq(&self) -> Option<u64> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().copied().min()
    }

    /// Number of registered checkpoints.
    pub fn len(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clamps a requested cleanup bound by the registered checkpoints:
    /// nothing above the minimum checkpoint may be reclaimed.
    pub fn clamp(&self, requested: u64) -> u64 {
        match self.min_seq() {
            Some(min) => requested.min(min),
            None => requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_min() {
        let checkpoints = CheckpointManager::new();
        assert_eq!(checkpoints.min_seq(), None);

        checkpoints.register("memtable-10", 10);
        checkpoints.register("memtable-4", 4);
        checkpoints.register("memtable-25", 25);
        assert_eq!(checkpoints.min_seq(), Some(4));
        assert_eq!(checkpoints.len(), 3);
    }

    #[test]
    fn remove_advances_min() {
        let checkpoints = CheckpointManager::new();
        checkpoints.register("a", 4);
        checkpoints.register("b", 10);

        checkpoints.remove("a");
        assert_eq!(checkpoints.min_seq(), Some(10));

        checkpoints.remove("b");
        assert_eq!(checkpoints.min_seq(), None);
        assert!(checkpoints.is_empty());
    }

    #[test]
    fn clamp_respects_min_checkpoint() {
        let checkpoints = CheckpointManager::new();
        assert_eq!(checkpoints.clamp(100), 100);

        checkpoints.register("pending", 40);
        assert_eq!(checkpoints.clamp(100), 40);
        assert_eq!(checkpoints.clamp(7), 7);
    }

    #[test]
    fn reregistering_moves_the_checkpoint() {
        let checkpoints = CheckpointManager::new();
        checkpoints.register("x", 5);
        checkpoints.register("x", 50);
        assert_eq!(checkpoints.min_seq(), Some(50));
        assert_eq!(checkpoints.len(), 1);
    }
}
