use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

/// In-flight delivery offsets per topic partition.
///
/// Committed offsets are cumulative, so a partition's commit point only moves
/// past an offset once it and every earlier tracked offset completed. An offset
/// that never completes holds its partition back until the consumer restarts
/// and the broker redelivers from there.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), BTreeMap<i64, bool>>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a delivered offset as in flight.
    pub fn track(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .insert(offset, false);
    }

    /// Marks `offset` done. Returns the highest offset whose predecessors are all
    /// done when the commit point advanced, `None` otherwise.
    pub fn complete(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (topic.to_string(), partition);
        let offsets = partitions.get_mut(&key)?;
        if let Some(done) = offsets.get_mut(&offset) {
            *done = true;
        }

        let mut committed = None;
        while let Some(entry) = offsets.first_entry() {
            if !*entry.get() {
                break;
            }
            committed = Some(*entry.key());
            entry.remove();
        }
        if offsets.is_empty() {
            partitions.remove(&key);
        }
        committed
    }

    /// Offsets still waiting on this partition, completed or not.
    pub fn in_flight(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(topic.to_string(), partition))
            .map_or(0, BTreeMap::len)
    }
}
