//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents in a fixed pool of buffers.
//! Caching disk blocks in memory reduces the number of disk reads and also provides a
//! synchronization point for disk blocks used by multiple processes.
//!
//! Interface:
//! - To get a buffer for a particular disk block, call [`BufferCache::read`].
//! - After changing buffer data, call [`BufGuard::write`] to write it to disk.
//! - When done with the buffer, call [`BufGuard::release`] (or drop the guard).
//! - Only one process at a time can use a buffer, so do not keep them longer than necessary.
//! - To keep a block resident without holding it, [`BufferCache::pin`] its [`BufHandle`].
//!
//! The pool is split into `NBUCKET` buckets by block number, each with its own spin lock, so
//! lookups for different blocks rarely contend. When a block isn't cached, the buffer released
//! longest ago anywhere in the pool is recycled.
//!
//! # Lock order
//! A bucket lock is never held while waiting for a buffer's sleep lock. Whenever more than one
//! bucket lock is held, they were acquired in increasing bucket index order, which rules out a
//! cycle of waiting CPUs.

mod bucket;

use core::{
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use arrayvec::ArrayVec;
use hex_display::HexDisplayExt as _;

use crate::{
    error::Result,
    param,
    sync::{KSleepLock, KSleepLockGuard, KSpinLock, KSpinLockGuard, Scheduler},
};
use bucket::{Bucket, Entry, Victim};

/// The contents of one disk block.
pub type BlockData = [u8; param::BSIZE];

/// Names a disk block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    /// The device the block lives on.
    pub dev: u32,
    /// The block's index on that device.
    pub blockno: u32,
}
impl BlockId {
    /// Name block `blockno` of device `dev`.
    #[must_use]
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }
}
impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.blockno)
    }
}

/// A device the cache reads blocks from and writes them back to.
///
/// Both transfers are synchronous: they return once the data has moved or the device failed.
pub trait BlockDevice: Sync {
    /// Fill `data` with the contents of `block`.
    fn read_block(&self, block: BlockId, data: &mut BlockData) -> Result<()>;

    /// Store `data` as the contents of `block`.
    fn write_block(&self, block: BlockId, data: &BlockData) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn read_block(&self, block: BlockId, data: &mut BlockData) -> Result<()> {
        (**self).read_block(block, data)
    }

    fn write_block(&self, block: BlockId, data: &BlockData) -> Result<()> {
        (**self).write_block(block, data)
    }
}

/// Identifies a cached buffer without holding it, for [`BufferCache::pin`] and
/// [`BufferCache::unpin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufHandle {
    slot: usize,
    block: BlockId,
}
impl BufHandle {
    /// The block the buffer was caching when the handle was taken.
    #[must_use]
    pub fn block(&self) -> BlockId {
        self.block
    }
}

/// The data side of a buffer.
struct BufSlot {
    /// Whether `data` holds the block's on-disk contents.
    ///
    /// Written by the holder of `data`, or under the bucket locks while the buffer is unreferenced
    /// (so nobody holds `data`). Either way the locks order the accesses, so relaxed atomics
    /// suffice.
    valid: AtomicBool,
    data: KSleepLock<BlockData>,
}

/// What the locked half of an eviction ended up with.
enum Claim {
    /// The block is cached in this slot and we hold a reference to it.
    Ready(usize),
    /// The victim was taken or used by someone else in the meantime.
    Stale,
}

/// A fixed pool of `NBUF` disk-block buffers, sharded into `NBUCKET` buckets.
pub struct BufferCache<
    D,
    S,
    const NBUF: usize = { param::NBUF },
    const NBUCKET: usize = { param::NBUCKET },
> {
    device: D,
    scheduler: S,
    buckets: [KSpinLock<Bucket<NBUF>>; NBUCKET],
    slots: [BufSlot; NBUF],
    /// Logical time, ticked whenever a buffer becomes unreferenced.
    clock: AtomicU64,
}

impl<D: BlockDevice, S: Scheduler, const NBUF: usize, const NBUCKET: usize>
    BufferCache<D, S, NBUF, NBUCKET>
{
    /// Create the cache with every buffer unassigned.
    ///
    /// All buffers start out in bucket 0; evictions spread them out as blocks are cached.
    pub fn new(device: D, scheduler: S) -> Self {
        assert!(NBUF > 0, "binit: no buffers");
        assert!(NBUCKET > 0, "binit: no buckets");
        let mut buckets: [KSpinLock<Bucket<NBUF>>; NBUCKET] =
            core::array::from_fn(|_| KSpinLock::new(Bucket::new()));
        for slot in 0..NBUF {
            buckets[0].get_mut().push(Entry::unassigned(slot));
        }
        log::info!("binit: {NBUF} buffers in {NBUCKET} buckets");
        Self {
            device,
            scheduler,
            buckets,
            slots: core::array::from_fn(|_| BufSlot {
                valid: AtomicBool::new(false),
                data: KSleepLock::new([0; param::BSIZE]),
            }),
            clock: AtomicU64::new(0),
        }
    }

    /// Look through the buffer cache for `block`, recycling the least recently used unused
    /// buffer if it isn't there.
    ///
    /// In either case, return the buffer locked. Its contents are only meaningful if it was
    /// already valid; [`Self::read`] takes care of that.
    ///
    /// # Panics
    /// Panics if every buffer is in use. The pool is sized so this only happens when a reference
    /// is leaked somewhere.
    pub fn get(&self, block: BlockId) -> BufGuard<'_, D, S, NBUF, NBUCKET> {
        let home = self.bucket_of(block);
        loop {
            {
                let mut bucket = self.buckets[home].lock();
                if let Some(entry) = bucket.find_mut(block) {
                    entry.refcnt += 1;
                    let slot = entry.slot;
                    drop(bucket);
                    log::trace!("bget {block}: cached in slot {slot}");
                    return self.acquire(slot, block);
                }
            }
            let victim = self.find_victim();
            match self.claim(home, block, victim) {
                Claim::Ready(slot) => return self.acquire(slot, block),
                Claim::Stale => {
                    log::trace!("bget {block}: slot {} was reused, rescanning", victim.slot);
                }
            }
        }
    }

    /// Return a locked buffer with the contents of `block`.
    ///
    /// If the device fails, the buffer is released again and the error returned.
    pub fn read(&self, block: BlockId) -> Result<BufGuard<'_, D, S, NBUF, NBUCKET>> {
        let mut buf = self.get(block);
        let valid = &self.slots[buf.slot].valid;
        if !valid.load(Ordering::Relaxed) {
            self.device.read_block(block, &mut buf)?;
            valid.store(true, Ordering::Relaxed);
            let prefix: &[u8] = &buf[..16];
            log::trace!("bread {block}: read from disk, starts {}", prefix.hex());
        }
        Ok(buf)
    }

    /// Increment the buffer's reference count so it stays cached after being released.
    ///
    /// # Panics
    /// Panics if the handle's buffer no longer caches the handle's block.
    pub fn pin(&self, buf: BufHandle) {
        let mut bucket = self.buckets[self.bucket_of(buf.block)].lock();
        let Some(entry) = bucket.entry_mut(buf.slot, buf.block) else {
            panic!("bpin: block {} not cached in slot {}", buf.block, buf.slot);
        };
        entry.refcnt += 1;
    }

    /// Undo a [`Self::pin`].
    ///
    /// # Panics
    /// Panics if the handle's buffer no longer caches the handle's block, or isn't referenced.
    pub fn unpin(&self, buf: BufHandle) {
        self.unref(buf.slot, buf.block, "bunpin");
    }

    /// Call `f` with every cached block and its reference count.
    ///
    /// Buckets are visited one at a time with their lock held, so `f` must not block, and the
    /// result is not a snapshot of the whole cache at a single instant.
    pub fn for_each_cached(&self, mut f: impl FnMut(BlockId, u32)) {
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            for entry in bucket.iter() {
                if let Some(block) = entry.block {
                    f(block, entry.refcnt);
                }
            }
        }
    }

    fn bucket_of(&self, block: BlockId) -> usize {
        block.blockno as usize % NBUCKET
    }

    /// Advance the logical clock, returning the new time.
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Wait for the buffer's sleep lock. No bucket lock may be held.
    fn acquire(&self, slot: usize, block: BlockId) -> BufGuard<'_, D, S, NBUF, NBUCKET> {
        let data = self.slots[slot].data.lock(&self.scheduler);
        BufGuard {
            cache: self,
            slot,
            block,
            data: ManuallyDrop::new(data),
        }
    }

    /// Find the unreferenced buffer released longest ago.
    ///
    /// This holds only one bucket lock at a time, so what it finds may be stale by the time it
    /// returns.
    fn find_victim(&self) -> Victim {
        loop {
            let mut best: Option<Victim> = None;
            for (idx, bucket) in self.buckets.iter().enumerate() {
                let bucket = bucket.lock();
                if let Some(entry) = bucket.oldest_unused() {
                    // Strictly older, so earlier buckets win ties.
                    if best.is_none_or(|best| entry.last_release < best.last_release) {
                        best = Some(Victim {
                            bucket: idx,
                            slot: entry.slot,
                            last_release: entry.last_release,
                        });
                    }
                }
            }
            if let Some(victim) = best {
                return victim;
            }
            // Buffers can move between buckets behind the scan, so only give up once every
            // bucket agrees at the same instant.
            assert!(!self.all_referenced(), "bget: no buffers");
        }
    }

    /// Lock every bucket and check whether any buffer is unreferenced.
    fn all_referenced(&self) -> bool {
        let mut held: ArrayVec<KSpinLockGuard<'_, Bucket<NBUF>>, NBUCKET> = ArrayVec::new();
        for bucket in &self.buckets {
            held.push(bucket.lock());
        }
        !held.iter().any(|bucket| bucket.has_unused())
    }

    /// Move `victim` into the home bucket as the buffer for `block`.
    ///
    /// Both buckets are locked in index order, then everything the unlocked scan saw is checked
    /// again: `block` may have been cached by someone else, and the victim may have been taken.
    fn claim(&self, home: usize, block: BlockId, victim: Victim) -> Claim {
        let (mut home_bucket, mut victim_bucket) = if victim.bucket == home {
            (self.buckets[home].lock(), None)
        } else if victim.bucket < home {
            let victim_bucket = self.buckets[victim.bucket].lock();
            (self.buckets[home].lock(), Some(victim_bucket))
        } else {
            let home_bucket = self.buckets[home].lock();
            (home_bucket, Some(self.buckets[victim.bucket].lock()))
        };

        if let Some(entry) = home_bucket.find_mut(block) {
            entry.refcnt += 1;
            let slot = entry.slot;
            drop(home_bucket);
            drop(victim_bucket);
            log::trace!("bget {block}: cached by another CPU during the scan");
            return Claim::Ready(slot);
        }

        let taken = match victim_bucket.as_mut() {
            Some(victim_bucket) => victim_bucket.take(&victim),
            None => home_bucket.take(&victim),
        };
        let Some(mut entry) = taken else {
            return Claim::Stale;
        };
        let evicted = entry.block;
        entry.block = Some(block);
        entry.refcnt = 1;
        self.slots[entry.slot].valid.store(false, Ordering::Relaxed);
        home_bucket.push(entry);
        drop(home_bucket);
        drop(victim_bucket);

        log::debug!(
            "bget {block}: recycling slot {} (was {evicted:?}, released at {})",
            entry.slot,
            entry.last_release,
        );
        Claim::Ready(entry.slot)
    }

    /// Drop one reference, stamping the release time if it was the last one.
    fn unref(&self, slot: usize, block: BlockId, op: &str) {
        let mut bucket = self.buckets[self.bucket_of(block)].lock();
        let Some(entry) = bucket.entry_mut(slot, block) else {
            panic!("{op}: block {block} not cached in slot {slot}");
        };
        let Some(refcnt) = entry.refcnt.checked_sub(1) else {
            panic!("{op}: block {block} is not referenced");
        };
        entry.refcnt = refcnt;
        if refcnt == 0 {
            entry.last_release = self.tick();
        }
    }
}

/// A locked buffer, returned by [`BufferCache::get`] and [`BufferCache::read`].
///
/// Dereferences to the block's bytes. Dropping the guard releases the buffer.
pub struct BufGuard<'a, D: BlockDevice, S: Scheduler, const NBUF: usize, const NBUCKET: usize> {
    cache: &'a BufferCache<D, S, NBUF, NBUCKET>,
    slot: usize,
    block: BlockId,
    /// Always initialized until the guard is dropped.
    data: ManuallyDrop<KSleepLockGuard<'a, BlockData>>,
}
impl<D: BlockDevice, S: Scheduler, const NBUF: usize, const NBUCKET: usize>
    BufGuard<'_, D, S, NBUF, NBUCKET>
{
    /// The block this buffer caches.
    #[must_use]
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// A handle for pinning this buffer.
    #[must_use]
    pub fn handle(&self) -> BufHandle {
        BufHandle {
            slot: self.slot,
            block: self.block,
        }
    }

    /// Write the buffer's contents to disk.
    ///
    /// # Panics
    /// Panics if the current context doesn't hold the buffer.
    pub fn write(&self) -> Result<()> {
        self.assert_held("bwrite");
        self.cache.device.write_block(self.block, &self.data)
    }

    /// Release the buffer.
    ///
    /// This is the same as dropping the guard.
    ///
    /// # Panics
    /// Panics if the current context doesn't hold the buffer.
    pub fn release(self) {
        drop(self);
    }

    fn assert_held(&self, op: &str) {
        let current = self.cache.scheduler.current();
        assert!(
            self.cache.slots[self.slot].data.holding(current),
            "{op}: buffer for block {} not held by {current}",
            self.block,
        );
    }
}
impl<D: BlockDevice, S: Scheduler, const NBUF: usize, const NBUCKET: usize> Deref
    for BufGuard<'_, D, S, NBUF, NBUCKET>
{
    type Target = BlockData;
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
impl<D: BlockDevice, S: Scheduler, const NBUF: usize, const NBUCKET: usize> DerefMut
    for BufGuard<'_, D, S, NBUF, NBUCKET>
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}
impl<D: BlockDevice, S: Scheduler, const NBUF: usize, const NBUCKET: usize> fmt::Debug
    for BufGuard<'_, D, S, NBUF, NBUCKET>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufGuard")
            .field("slot", &self.slot)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}
impl<D: BlockDevice, S: Scheduler, const NBUF: usize, const NBUCKET: usize> Drop
    for BufGuard<'_, D, S, NBUF, NBUCKET>
{
    fn drop(&mut self) {
        self.assert_held("brelse");
        // The sleep lock goes first, so we never wait on it with the bucket lock held.
        // SAFETY:
        // `data` is not used again after this.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.unref(self.slot, self.block, "brelse");
    }
}
