//! Recent-`(from, seq)` loop/duplicate suppression: a frame already
//! seen from the same sender with the same sequence number within a
//! recent-ids LRU is dropped as a repeat.

use linked_hash_map::LinkedHashMap;

use crate::identifiers::NodeId;

/// A capacity-bounded LRU set of recently observed `(from, seq)`
/// pairs. Insertion evicts the least-recently-inserted entry once the
/// cache is at capacity.
pub struct RecentIds {
    capacity: usize,
    seen: LinkedHashMap<(NodeId, u32), ()>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: LinkedHashMap::new(),
        }
    }

    /// Records `(from, seq)` as seen, returning `true` if it had
    /// already been observed (i.e. this frame is a duplicate/replay
    /// and should be dropped).
    pub fn check_and_insert(&mut self, from: NodeId, seq: u32) -> bool {
        if self.seen.contains_key(&(from, seq)) {
            // touch it so it doesn't get evicted ahead of genuinely
            // older entries
            self.seen.get_refresh(&(from, seq));
            return true;
        }
        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.insert((from, seq), ());
        false
    }
}
