//! One hash shard of the buffer cache.

use arrayvec::ArrayVec;

use super::BlockId;

/// The cache's bookkeeping for one buffer slot.
///
/// Every slot has exactly one entry, and the entry lives in exactly one bucket. Moving a buffer to
/// another bucket moves its entry, under both buckets' locks.
#[derive(Debug, Clone, Copy)]
pub(super) struct Entry {
    /// Index of the slot holding the data.
    pub slot: usize,
    /// The block cached in the slot, or `None` if the slot was never assigned.
    pub block: Option<BlockId>,
    /// Holders plus pins. Nonzero means the slot must not be evicted.
    pub refcnt: u32,
    /// Logical time at which `refcnt` last dropped to zero.
    pub last_release: u64,
}
impl Entry {
    pub const fn unassigned(slot: usize) -> Self {
        Self {
            slot,
            block: None,
            refcnt: 0,
            last_release: 0,
        }
    }
}

/// An eviction candidate remembered after its bucket lock was dropped.
///
/// Has to be re-validated with [`Bucket::take`] before use.
#[derive(Debug, Clone, Copy)]
pub(super) struct Victim {
    pub bucket: usize,
    pub slot: usize,
    pub last_release: u64,
}

/// The entries currently hashed to one bucket, in insertion order.
pub(super) struct Bucket<const NBUF: usize> {
    entries: ArrayVec<Entry, NBUF>,
}
impl<const NBUF: usize> Bucket<NBUF> {
    pub const fn new() -> Self {
        Self {
            entries: ArrayVec::new_const(),
        }
    }

    /// Find the entry caching `block`.
    pub fn find_mut(&mut self, block: BlockId) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.block == Some(block))
    }

    /// Find the entry for `slot`, provided it still caches `block`.
    pub fn entry_mut(&mut self, slot: usize, block: BlockId) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.slot == slot && entry.block == Some(block))
    }

    /// The unreferenced entry released longest ago, the first such one on ties.
    pub fn oldest_unused(&self) -> Option<&Entry> {
        self.entries
            .iter()
            .filter(|entry| entry.refcnt == 0)
            .min_by_key(|entry| entry.last_release)
    }

    /// Get whether any entry here could be evicted.
    pub fn has_unused(&self) -> bool {
        self.entries.iter().any(|entry| entry.refcnt == 0)
    }

    /// Unlink the victim's entry, if it is still here, still unreferenced, and hasn't been
    /// released again since it was picked.
    pub fn take(&mut self, victim: &Victim) -> Option<Entry> {
        let idx = self.entries.iter().position(|entry| {
            entry.slot == victim.slot
                && entry.refcnt == 0
                && entry.last_release == victim.last_release
        })?;
        Some(self.entries.remove(idx))
    }

    /// Append an entry to the end of the bucket.
    ///
    /// There are exactly `NBUF` entries across all buckets, so this can't overflow.
    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}
