/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Cache of clean device blocks, shared by a tree of layers.

use crate::device::Device;
use crate::layout::BLOCK_SIZE;
use crate::layout::BlockBuf;
use crate::layout::INVALID_BLOCK;
use crate::layout::new_block;
use crate::memory::MemTracker;
use std::io;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Nominal number of hash buckets of a base layer cache.
pub const PCACHE_SIZE: u32 = 128 * 1024;
/// Nominal number of hash buckets of the root mount cache.
pub const PCACHE_SIZE_MIN: u32 = 1024;
/// Number of locks sharding the cache.
pub const PCLOCK_COUNT: u32 = 1024;

/// A block-sized data buffer whose lifetime is tracked by the memory
/// tracker.
#[derive(Debug)]
pub struct PageData {
    buf: BlockBuf,
    mem: Arc<MemTracker>,
}

impl PageData {
    /// Allocates a zeroed, tracked buffer.
    pub fn new(mem: &Arc<MemTracker>) -> Self {
        mem.page_allocated();
        Self {
            buf: new_block(),
            mem: mem.clone(),
        }
    }
}

impl Deref for PageData {
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PageData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PageData {
    fn drop(&mut self) {
        self.mem.page_freed();
    }
}

/// A cached device block.
pub struct Page {
    /// The device block held.
    block: u64,
    /// Number of lookups which hit this page.
    hits: AtomicU32,
    /// Set when the page should be dropped on release.
    nocache: AtomicU32,
    /// The block contents, filled on first read. The mutex serialises the
    /// in-flight read so a block is read once however many threads want it.
    data: Mutex<Option<Arc<PageData>>>,
}

impl Page {
    fn new(block: u64) -> Self {
        Self {
            block,
            hits: AtomicU32::new(0),
            nocache: AtomicU32::new(0),
            data: Mutex::new(None),
        }
    }

    /// The device block this page caches.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Returns the page contents if present.
    pub fn data(&self) -> Option<Arc<PageData>> {
        self.data.lock().unwrap().clone()
    }

    /// Marks the page as drop-on-release.
    pub fn set_nocache(&self) {
        self.nocache.store(1, Ordering::Relaxed);
    }

    /// Returns the contents, reading the block from the device if the page
    /// is not filled yet.
    fn fill(&self, dev: &Device, mem: &Arc<MemTracker>) -> io::Result<Arc<PageData>> {
        let mut data = self.data.lock().unwrap();
        if let Some(data) = data.as_ref() {
            return Ok(data.clone());
        }
        let mut buf = PageData::new(mem);
        dev.read_block(self.block, &mut *buf)?;
        let buf = Arc::new(buf);
        *data = Some(buf.clone());
        Ok(buf)
    }
}

/// One shard of the cache.
type Shard = Mutex<Vec<Arc<Page>>>;

/// Cache of clean blocks for one tree of layers.
pub struct BlockCache {
    /// The sharded hash table.
    shards: Vec<Shard>,
    /// Largest population of a shard before release starts evicting.
    shard_max: usize,
    /// Count of pages held.
    pcount: AtomicU64,
    /// Lookups which found the block cached.
    hits: AtomicU64,
    /// Lookups which had to read the device.
    missed: AtomicU64,
    /// Pages evicted.
    recycled: AtomicU64,
    /// Next shard the cleaner sweeps.
    purge_index: AtomicUsize,
    /// Device-wide memory tracker.
    mem: Arc<MemTracker>,
}

impl BlockCache {
    /// Creates a cache with `count` nominal hash buckets sharded over
    /// `lock_count` locks.
    pub fn new(count: u32, lock_count: u32, mem: Arc<MemTracker>) -> Self {
        let shards = (0..lock_count).map(|_| Mutex::new(Vec::new())).collect();
        let budget_pages = count as usize;
        Self {
            shards,
            shard_max: (budget_pages / lock_count as usize).max(8),
            pcount: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            purge_index: AtomicUsize::new(0),
            mem,
        }
    }

    fn shard(&self, block: u64) -> &Shard {
        &self.shards[(block % self.shards.len() as u64) as usize]
    }

    /// Looks up the page caching `block`, instantiating one if missing.
    /// When `read` is set the page contents are made valid, reading the
    /// device if needed.
    pub fn get(&self, dev: &Device, block: u64, read: bool) -> io::Result<Arc<Page>> {
        assert!(block != 0 && block != INVALID_BLOCK);
        let (page, hit) = {
            let mut shard = self.shard(block).lock().unwrap();
            match shard.iter().find(|p| p.block == block) {
                Some(page) => (page.clone(), true),
                None => {
                    let page = Arc::new(Page::new(block));
                    shard.push(page.clone());
                    self.pcount.fetch_add(1, Ordering::Relaxed);
                    (page, false)
                }
            }
        };
        if read {
            page.fill(dev, &self.mem)?;
            if hit {
                self.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.missed.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(page)
    }

    /// Installs freshly written contents for `block`, invalidating any
    /// previous page cached under the same block number.
    pub fn insert_written(&self, block: u64, data: Arc<PageData>) {
        assert!(block != 0 && block != INVALID_BLOCK);
        let page = Arc::new(Page::new(block));
        *page.data.lock().unwrap() = Some(data);
        let mut shard = self.shard(block).lock().unwrap();
        if let Some(pos) = shard.iter().position(|p| p.block == block) {
            shard.remove(pos);
            self.pcount.fetch_sub(1, Ordering::Relaxed);
        }
        shard.push(page);
        self.pcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops the page cached under `block`, if any.
    pub fn invalidate(&self, block: u64) {
        let mut shard = self.shard(block).lock().unwrap();
        if let Some(pos) = shard.iter().position(|p| p.block == block) {
            shard.remove(pos);
            self.pcount.fetch_sub(1, Ordering::Relaxed);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases a page obtained from [`Self::get`]. `read` marks a use
    /// which should raise the page's standing in the cache.
    ///
    /// If the page was tagged nocache, or the shard outgrew its bound, or
    /// the device is low on memory, the least-hit unreferenced page of the
    /// shard is dropped.
    pub fn release(&self, page: Arc<Page>, read: bool) {
        if read {
            page.hits.fetch_add(1, Ordering::Relaxed);
        }
        let block = page.block;
        let nocache = page.nocache.load(Ordering::Relaxed) != 0;
        let hits = page.hits.load(Ordering::Relaxed);
        let mut shard = self.shard(block).lock().unwrap();
        drop(page);
        let mut victim: Option<usize> = None;
        if nocache {
            victim = shard
                .iter()
                .position(|p| p.block == block && Arc::strong_count(p) == 1);
        } else if self.mem.low() || shard.len() > self.shard_max {
            // Evict the least-hit page nobody holds
            let mut best = hits;
            for (i, p) in shard.iter().enumerate() {
                let phits = p.hits.load(Ordering::Relaxed);
                if Arc::strong_count(p) == 1 && phits <= best {
                    best = phits;
                    victim = Some(i);
                    if phits == 0 {
                        break;
                    }
                }
            }
        }
        if let Some(i) = victim {
            shard.remove(i);
            self.pcount.fetch_sub(1, Ordering::Relaxed);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops unreferenced pages, sweeping shards round-robin until memory
    /// recovers or the whole cache was visited. Returns the count purged.
    pub fn purge(&self, force: bool) -> u64 {
        let mut purged = 0;
        for _ in 0..self.shards.len() {
            let i = self.purge_index.fetch_add(1, Ordering::Relaxed) % self.shards.len();
            {
                let mut shard = self.shards[i].lock().unwrap();
                let before = shard.len();
                shard.retain(|p| Arc::strong_count(p) > 1);
                purged += (before - shard.len()) as u64;
            }
            if !force && !self.mem.low() {
                break;
            }
        }
        if purged > 0 {
            self.pcount.fetch_sub(purged, Ordering::Relaxed);
            self.recycled.fetch_add(purged, Ordering::Relaxed);
            self.mem.wakeup();
        }
        purged
    }

    /// Count of pages held.
    pub fn pcount(&self) -> u64 {
        self.pcount.load(Ordering::Relaxed)
    }

    /// Cache hits and misses so far.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.missed.load(Ordering::Relaxed),
            self.recycled.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test::test_device;

    fn setup() -> (Device, BlockCache) {
        let path = test_device(64);
        let dev = Device::open(&path).unwrap();
        let cache = BlockCache::new(PCACHE_SIZE_MIN, 16, Arc::new(MemTracker::default()));
        (dev, cache)
    }

    #[test]
    fn single_read_per_block() {
        let (dev, cache) = setup();
        let mut buf = new_block();
        buf[0] = 0x5a;
        dev.write_block(&buf[..], 7).unwrap();
        let p1 = cache.get(&dev, 7, true).unwrap();
        let p2 = cache.get(&dev, 7, true).unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(p1.data().unwrap()[0], 0x5a);
        let (_, missed, _) = cache.counters();
        assert_eq!(missed, 1);
        let (reads, _) = dev.counters();
        assert_eq!(reads, 1);
        cache.release(p1, true);
        cache.release(p2, true);
    }

    #[test]
    fn insert_written_replaces_stale_page() {
        let (dev, cache) = setup();
        let buf = new_block();
        dev.write_block(&buf[..], 9).unwrap();
        let stale = cache.get(&dev, 9, true).unwrap();
        cache.release(stale, false);
        let mem = Arc::new(MemTracker::default());
        let mut data = PageData::new(&mem);
        data[0] = 0x77;
        cache.insert_written(9, Arc::new(data));
        let page = cache.get(&dev, 9, true).unwrap();
        assert_eq!(page.data().unwrap()[0], 0x77);
        cache.release(page, false);
    }

    #[test]
    fn nocache_page_dropped_on_release() {
        let (dev, cache) = setup();
        let buf = new_block();
        dev.write_block(&buf[..], 3).unwrap();
        let page = cache.get(&dev, 3, true).unwrap();
        page.set_nocache();
        cache.release(page, false);
        assert_eq!(cache.pcount(), 0);
    }

    #[test]
    fn purge_keeps_referenced_pages() {
        let (dev, cache) = setup();
        let buf = new_block();
        dev.write_block(&buf[..], 4).unwrap();
        dev.write_block(&buf[..], 5).unwrap();
        let held = cache.get(&dev, 4, true).unwrap();
        let dropped = cache.get(&dev, 5, true).unwrap();
        cache.release(dropped, false);
        cache.purge(true);
        assert_eq!(cache.pcount(), 1);
        cache.release(held, false);
    }
}
