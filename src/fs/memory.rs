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

//! Memory accounting and low-memory backpressure.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Default budget for data pages, in bytes.
pub const PCACHE_MEMORY: u64 = 512 * 1024 * 1024;

/// Percentage above the budget at which write paths are blocked until the
/// cleaner returns memory.
pub const PURGE_TARGET: u64 = 20;

/// Kind of a tracked allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemType {
    /// Global structures.
    Gfs = 0,
    /// Directory entries.
    Dirent,
    /// Directory hash tables.
    Dcache,
    /// Inode cache tables.
    Icache,
    /// Inodes.
    Inode,
    /// Extent list entries.
    Extent,
    /// Metadata blocks.
    Block,
    /// Clean page headers.
    Page,
    /// Data pages.
    Data,
    /// Dirty page tables.
    Dpage,
    /// Extended attributes.
    Xattr,
    /// Extended attribute buffers.
    XattrBuf,
    /// File change records.
    Cfile,
    /// Directory change records.
    Cdir,
    /// Paths of changed directories.
    Path,
    /// Request statistics.
    Stats,
}

/// Number of allocation kinds.
pub const MEMTYPE_MAX: usize = MemType::Stats as usize + 1;

/// Names of the allocation kinds, for display.
const MEM_NAMES: [&str; MEMTYPE_MAX] = [
    "GFS", "DIRENT", "DCACHE", "ICACHE", "INODE", "EXTENT", "BLOCK", "PAGE", "DATA", "DPAGE",
    "XATTR", "XATTRBUF", "CFILE", "CDIR", "PATH", "STATS",
];

/// Per-layer allocation accounting.
#[derive(Default)]
pub struct MemStats {
    /// Bytes currently accounted to the layer.
    memory: AtomicU64,
    /// Count of allocations, by kind.
    mallocs: [AtomicU64; MEMTYPE_MAX],
    /// Count of releases, by kind.
    frees: [AtomicU64; MEMTYPE_MAX],
}

impl MemStats {
    /// Accounts an allocation of `size` bytes of kind `mtype`.
    pub fn alloc(&self, size: usize, mtype: MemType) {
        self.memory.fetch_add(size as u64, Ordering::Relaxed);
        self.mallocs[mtype as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Accounts the release of `size` bytes of kind `mtype`.
    pub fn free(&self, size: usize, mtype: MemType) {
        let prev = self.memory.fetch_sub(size as u64, Ordering::Relaxed);
        assert!(prev >= size as u64);
        self.frees[mtype as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Moves `size` accounted bytes of kind `mtype` to another layer.
    pub fn transfer(&self, to: &MemStats, size: usize, mtype: MemType) {
        self.free(size, mtype);
        to.alloc(size, mtype);
    }

    /// Returns the bytes currently accounted.
    pub fn bytes(&self) -> u64 {
        self.memory.load(Ordering::Relaxed)
    }

    /// Displays the per-kind counters.
    pub fn display(&self, name: &str) {
        let bytes = self.bytes();
        if bytes == 0 {
            return;
        }
        eprintln!("{name}: {bytes} bytes in use");
        for i in 0..MEMTYPE_MAX {
            let mallocs = self.mallocs[i].load(Ordering::Relaxed);
            let frees = self.frees[i].load(Ordering::Relaxed);
            if mallocs != 0 || frees != 0 {
                eprintln!("\t{:<10} allocated {mallocs} freed {frees}", MEM_NAMES[i]);
            }
        }
    }

    /// Checks that every allocation was matched by a release.
    ///
    /// Returns false when the layer still accounts memory.
    pub fn balanced(&self) -> bool {
        if self.bytes() != 0 {
            return false;
        }
        (0..MEMTYPE_MAX).all(|i| {
            self.mallocs[i].load(Ordering::Relaxed) == self.frees[i].load(Ordering::Relaxed)
        })
    }
}

/// Device-wide memory tracker driving the cleaner.
#[derive(Debug)]
pub struct MemTracker {
    /// Budget for data pages, in bytes.
    limit: AtomicU64,
    /// Bytes of data pages currently allocated.
    data: AtomicU64,
    /// Set while the cleaner is purging pages.
    cleaning: AtomicBool,
    /// Wakes threads blocked on memory.
    lock: Mutex<()>,
    /// Condition signalled when memory is returned.
    cond: Condvar,
}

impl MemTracker {
    /// Creates a tracker with the given data page budget.
    pub fn new(limit: u64) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            data: AtomicU64::new(0),
            cleaning: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Adjusts the data page budget.
    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
        self.wakeup();
    }

    /// Accounts a data page allocation.
    pub fn page_allocated(&self) {
        self.data
            .fetch_add(crate::layout::BLOCK_SIZE as u64, Ordering::Relaxed);
    }

    /// Accounts a data page release.
    pub fn page_freed(&self) {
        let prev = self
            .data
            .fetch_sub(crate::layout::BLOCK_SIZE as u64, Ordering::Relaxed);
        assert!(prev >= crate::layout::BLOCK_SIZE as u64);
    }

    /// Tells whether data pages exceed the budget.
    pub fn low(&self) -> bool {
        self.data.load(Ordering::Relaxed) > self.limit.load(Ordering::Relaxed)
    }

    /// Tells whether data pages exceed the budget by more than the purge
    /// target, requiring write paths to wait.
    pub fn must_wait(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        self.data.load(Ordering::Relaxed) > limit + (limit * PURGE_TARGET) / 100
    }

    /// Marks the cleaner running. Returns false if it was running already.
    pub fn start_cleaning(&self) -> bool {
        !self.cleaning.swap(true, Ordering::AcqRel)
    }

    /// Marks the cleaner idle and wakes any waiters.
    pub fn stop_cleaning(&self) {
        self.cleaning.store(false, Ordering::Release);
        self.wakeup();
    }

    /// Blocks the caller until memory drops below the wait threshold.
    ///
    /// The wait is bounded so a stalled cleaner cannot wedge write paths
    /// forever.
    pub fn wait_memory(&self) {
        let mut guard = self.lock.lock().unwrap();
        while self.must_wait() {
            let (g, timeout) = self
                .cond
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap();
            guard = g;
            if timeout.timed_out() {
                break;
            }
        }
    }

    /// Wakes threads blocked on memory.
    pub fn wakeup(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }
}

impl Default for MemTracker {
    fn default() -> Self {
        Self::new(PCACHE_MEMORY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stats_balance() {
        let stats = MemStats::default();
        stats.alloc(100, MemType::Inode);
        stats.alloc(50, MemType::Dirent);
        assert_eq!(stats.bytes(), 150);
        assert!(!stats.balanced());
        stats.free(100, MemType::Inode);
        stats.free(50, MemType::Dirent);
        assert!(stats.balanced());
    }

    #[test]
    fn tracker_thresholds() {
        let tracker = MemTracker::new(2 * crate::layout::BLOCK_SIZE as u64);
        assert!(!tracker.low());
        tracker.page_allocated();
        tracker.page_allocated();
        tracker.page_allocated();
        assert!(tracker.low());
        // 3 pages over a 2 page budget is 50% over, past the purge target
        assert!(tracker.must_wait());
        tracker.page_freed();
        assert!(!tracker.low());
        assert!(!tracker.must_wait());
    }
}
