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

//! Layers and the global filesystem state.
//!
//! A layer is a complete filesystem view sharing unchanged blocks with its
//! parent. Layers form a tree held by index in the global table; parent,
//! child and sibling links are indices, never owning references.

use crate::alloc::GlobalAlloc;
use crate::alloc::LayerAlloc;
use crate::bcache::BlockCache;
use crate::device::Device;
use crate::dir::Directory;
use crate::inode;
use crate::inode::InodeCache;
use crate::inode::InodeFlags;
use crate::inode::InodeRef;
use crate::layout::*;
use crate::memory::MemStats;
use crate::memory::MemTracker;
use crate::memory::MemType;
use crate::rwlock::RwLock;
use crate::stats::Stats;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Seconds between checkpoints of dirty layers.
pub const SYNC_INTERVAL: u64 = 60;

/// Suffix tagging init layers at creation.
pub const INIT_SUFFIX: &str = "-init";

/// Builds a file handle from a layer index and an inode number.
pub fn set_handle(gindex: u32, ino: u64) -> u64 {
    assert!((gindex as usize) < LAYER_MAX);
    ((gindex as u64) << FH_LAYER_SHIFT) | (ino & FH_INODE_MASK)
}

/// Extracts the layer index from a file handle.
pub fn handle_layer(handle: u64) -> u32 {
    let gindex = (handle >> FH_LAYER_SHIFT) as u32;
    assert!((gindex as usize) < LAYER_MAX);
    gindex
}

/// Extracts the inode number from a file handle.
pub fn handle_ino(handle: u64) -> u64 {
    if handle <= ROOT_INODE {
        return ROOT_INODE;
    }
    handle & FH_INODE_MASK
}

/// Startup options of a mount.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// Print per-request debug traces.
    pub debug: bool,
    /// Print verbose messages.
    pub verbose: bool,
    /// Track per-layer memory statistics.
    pub memstats: bool,
    /// Track per-layer request statistics.
    pub request_stats: bool,
    /// Track per-layer file type counters.
    pub ftype_stats: bool,
    /// Profiling requested.
    pub profiling: bool,
    /// Swap layers when committing.
    pub swap_commit: bool,
    /// Format the device before mounting.
    pub format: bool,
}

/// Tree links of a layer, all indices into the global table.
#[derive(Clone, Copy, Debug, Default)]
pub struct Links {
    /// Parent layer.
    pub parent: Option<u32>,
    /// First child layer.
    pub child: Option<u32>,
    /// Next sibling.
    pub next: Option<u32>,
    /// Previous sibling.
    pub prev: Option<u32>,
    /// Zombie layer to be removed along with this one.
    pub zombie: Option<u32>,
}

/// A layer: one logical filesystem of the mounted device.
pub struct Layer {
    /// In-core superblock. The root layer shares the global superblock.
    pub sb: Arc<Mutex<Super>>,
    /// Device block the superblock is written at.
    pub sblock: AtomicU64,
    /// Root inode number.
    pub root: AtomicU64,
    /// Index in the global table. Changes only on commit.
    pub gindex: AtomicU32,
    /// Held shared by every operation on the layer, exclusive for layer
    /// administration.
    pub rwlock: RwLock,
    /// Cached inodes of the layer.
    pub icache: InodeCache,
    /// The layer's root inode.
    pub root_inode: Mutex<Option<InodeRef>>,
    /// Tree links.
    pub links: Mutex<Links>,
    /// Allocator state.
    pub alloc: Mutex<LayerAlloc>,
    /// Serialises cloning of parent inodes into this layer.
    pub ilock: Mutex<()>,
    /// Pages assigned blocks, waiting for the cluster writeback.
    pub pending: Mutex<Vec<(u64, Arc<crate::bcache::PageData>)>>,
    /// Inode flushing machinery.
    pub iflush: Mutex<inode::InodeFlushState>,
    /// Block cache shared by the layer tree.
    pub bcache: Arc<BlockCache>,
    /// Request statistics.
    pub stats: Stats,
    /// Memory accounting.
    pub mem: MemStats,

    /// Superblock needs writing.
    dirty: AtomicBool,
    /// Inodes need flushing.
    inodes_dirty: AtomicBool,
    /// Extent lists need flushing.
    extents_dirty: AtomicBool,
    /// The layer rejects modifications.
    pub read_only: AtomicBool,
    /// The layer has a child and is immutable.
    frozen: AtomicBool,
    /// The layer is being removed.
    pub removed: AtomicBool,
    /// The layer was loaded from disk at mount.
    pub restarted: AtomicBool,
    /// A commit is running against this layer.
    pub commit_in_progress: AtomicBool,
    /// Single init child of a base layer.
    pub single: AtomicBool,
    /// The layer has extended attributes.
    pub xattr_enabled: AtomicBool,

    /// Count of in-core inodes.
    pub icount: AtomicU64,
    /// Count of dirty pages.
    pub pcount: AtomicU64,
    /// Blocks allocated by the layer.
    pub blocks: AtomicU64,
    /// Blocks freed by the layer.
    pub freed: AtomicU64,
    /// Block reads issued for the layer.
    pub reads: AtomicU64,
    /// Block writes issued for the layer.
    pub writes: AtomicU64,
    /// Inodes written out.
    pub iwrite: AtomicU64,
}

impl Layer {
    /// Creates an in-core layer around the given superblock.
    fn new(
        config: &Config,
        sb: Arc<Mutex<Super>>,
        sblock: u64,
        root: u64,
        icache_size: usize,
        bcache: Arc<BlockCache>,
    ) -> Arc<Layer> {
        let read_only = sb.lock().unwrap().flags & SUPER_RDWR == 0;
        Arc::new(Layer {
            sb,
            sblock: AtomicU64::new(sblock),
            root: AtomicU64::new(root),
            gindex: AtomicU32::new(0),
            rwlock: RwLock::new(),
            icache: InodeCache::new(icache_size),
            root_inode: Mutex::new(None),
            links: Mutex::new(Links::default()),
            alloc: Mutex::new(LayerAlloc::default()),
            ilock: Mutex::new(()),
            pending: Mutex::new(Vec::new()),
            iflush: Mutex::new(inode::InodeFlushState::default()),
            bcache,
            stats: Stats::new(config.request_stats),
            mem: MemStats::default(),
            dirty: AtomicBool::new(false),
            inodes_dirty: AtomicBool::new(false),
            extents_dirty: AtomicBool::new(false),
            read_only: AtomicBool::new(read_only),
            frozen: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            restarted: AtomicBool::new(false),
            commit_in_progress: AtomicBool::new(false),
            single: AtomicBool::new(false),
            xattr_enabled: AtomicBool::new(false),
            icount: AtomicU64::new(0),
            pcount: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            iwrite: AtomicU64::new(0),
        })
    }

    /// Tells whether this is the root layer.
    pub fn is_root(&self) -> bool {
        self.gindex.load(Ordering::Relaxed) == 0
    }

    /// Tells whether the layer is frozen.
    pub fn frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    /// Marks the superblock dirty.
    pub fn mark_super_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Tells whether the superblock needs writing.
    pub fn super_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clears the superblock dirty flag.
    pub fn clear_super_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Marks the layer's inodes dirty.
    pub fn mark_inodes_dirty(&self) {
        self.inodes_dirty.store(true, Ordering::Release);
        self.mark_super_dirty();
    }

    /// Tells whether inodes need flushing.
    pub fn inodes_dirty(&self) -> bool {
        self.inodes_dirty.load(Ordering::Acquire)
    }

    /// Clears the inode dirty flag.
    pub fn clear_inodes_dirty(&self) {
        self.inodes_dirty.store(false, Ordering::Release);
    }

    /// Marks the layer's extent lists dirty.
    pub fn mark_extents_dirty(&self) {
        self.extents_dirty.store(true, Ordering::Release);
        self.mark_super_dirty();
    }

    /// Tells whether extent lists need flushing.
    pub fn extents_dirty(&self) -> bool {
        self.extents_dirty.load(Ordering::Acquire)
    }

    /// Clears the extent dirty flag.
    pub fn clear_extents_dirty(&self) {
        self.extents_dirty.store(false, Ordering::Release);
    }

    /// Reads a block, counted against the layer.
    pub fn read_block(&self, gfs: &Gfs, block: u64, buf: &mut [u8]) -> io::Result<()> {
        gfs.device.read_block(block, buf)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a block, counted against the layer.
    pub fn write_block(&self, gfs: &Gfs, buf: &[u8], block: u64) -> io::Result<()> {
        gfs.device.write_block(buf, block)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a contiguous scatter/gather run, counted against the layer.
    pub fn write_blocks(&self, gfs: &Gfs, bufs: &[&[u8]], block: u64) -> io::Result<()> {
        gfs.device.write_blocks(bufs, block)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Updates the per-type file counters of the layer.
    pub fn update_ftype_stats(&self, gfs: &Gfs, mode: u32, incr: bool) {
        if !gfs.config.ftype_stats {
            return;
        }
        let ftype = match mode & libc::S_IFMT {
            libc::S_IFREG => FTYPE_REGULAR,
            libc::S_IFDIR => FTYPE_DIRECTORY,
            libc::S_IFLNK => FTYPE_SYMLINK,
            _ => FTYPE_OTHER,
        };
        let mut sb = self.sb.lock().unwrap();
        if incr {
            sb.ftypes[ftype] += 1;
        } else {
            assert!(sb.ftypes[ftype] > 0);
            sb.ftypes[ftype] -= 1;
        }
    }
}

/// The table of layers, indexed by layer number.
#[derive(Default)]
pub struct LayerTable {
    /// The layers. Slot 0 is the root layer.
    pub layers: Vec<Option<Arc<Layer>>>,
    /// Root inode of each slot, for resolving layer roots.
    pub roots: Vec<u64>,
    /// Highest slot in use.
    pub scount: usize,
    /// Highest slot ever used. Slots are not reused within a mount so
    /// stale client handles never alias a new layer.
    pub hgindex: usize,
}

impl LayerTable {
    fn slot(&mut self, index: usize) -> &mut Option<Arc<Layer>> {
        if self.layers.len() <= index {
            self.layers.resize_with(index + 1, || None);
            self.roots.resize(index + 1, 0);
        }
        &mut self.layers[index]
    }
}

/// A condition the background threads sleep on.
#[derive(Default)]
pub struct WaitChannel {
    lock: Mutex<bool>,
    cond: Condvar,
}

impl WaitChannel {
    /// Wakes the sleeping thread.
    pub fn signal(&self) {
        let mut signalled = self.lock.lock().unwrap();
        *signalled = true;
        self.cond.notify_all();
    }

    /// Sleeps until signalled or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) {
        let mut signalled = self.lock.lock().unwrap();
        if !*signalled {
            let (guard, _) = self.cond.wait_timeout(signalled, timeout).unwrap();
            signalled = guard;
        }
        *signalled = false;
    }
}

/// Global state of a mounted device.
pub struct Gfs {
    /// The device.
    pub device: Device,
    /// Startup options.
    pub config: Config,
    /// The global superblock, shared with the root layer.
    pub sb: Arc<Mutex<Super>>,
    /// Device-wide allocator state.
    pub galloc: Mutex<GlobalAlloc>,
    /// The layer table.
    pub layers: Mutex<LayerTable>,
    /// Data page budget tracking.
    pub mem: Arc<MemTracker>,
    /// Inode of the layer root directory.
    pub layer_root: AtomicU64,
    /// Inode of the tmp directory.
    pub tmp_root: AtomicU64,
    /// Blocks kept in reserve, a fixed share of the device.
    blocks_reserved: AtomicU64,
    /// Count of dirty pages across all layers.
    pub dirty_pages: AtomicU64,
    /// Count of inodes cloned between layers.
    pub clones: AtomicU64,
    /// Seconds between syncer runs.
    pub sync_interval: AtomicU64,
    /// Set when layers are pending a checkpoint.
    pub sync_required: AtomicU64,
    /// Set when the mount is going away.
    pub unmounting: AtomicBool,
    /// Set once any layer carries extended attributes.
    pub xattr_enabled: AtomicBool,
    /// Wakes the syncer.
    pub syncer_wait: WaitChannel,
    /// Wakes the flusher.
    pub flusher_wait: WaitChannel,
    /// Wakes the cleaner.
    pub cleaner_wait: WaitChannel,
}

impl Gfs {
    /// Returns the layer at `gindex`, if present.
    pub fn layer(&self, gindex: u32) -> Option<Arc<Layer>> {
        let table = self.layers.lock().unwrap();
        table.layers.get(gindex as usize).cloned().flatten()
    }

    /// Returns the root layer.
    pub fn global(&self) -> Arc<Layer> {
        self.layer(0).expect("root layer")
    }

    /// Returns every live layer, in index order.
    pub fn layers_snapshot(&self) -> Vec<Arc<Layer>> {
        let table = self.layers.lock().unwrap();
        table.layers.iter().flatten().cloned().collect()
    }

    /// Locks the layer a file handle points into. Retries when a commit
    /// moved the layer, or gives up when a delete beat the lock.
    pub fn lock_layer(&self, handle: u64, exclusive: bool) -> io::Result<Arc<Layer>> {
        let gindex = handle_layer(handle);
        loop {
            let fs = self
                .layer(gindex)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
            fs.rwlock.lock(exclusive);
            if fs.gindex.load(Ordering::Acquire) == gindex
                && !fs.removed.load(Ordering::Acquire)
            {
                return Ok(fs);
            }
            fs.rwlock.unlock(exclusive);
        }
    }

    /// Blocks kept in reserve.
    pub fn blocks_reserved(&self) -> u64 {
        self.blocks_reserved.load(Ordering::Relaxed)
    }

    /// Lets the syncer know something changed; a checkpoint may be due.
    pub fn layer_changed(&self, new: bool, wakeup: bool) {
        if new || self.sync_required.load(Ordering::Relaxed) == 0 {
            self.sync_required.fetch_add(1, Ordering::Relaxed);
        }
        if wakeup {
            self.syncer_wait.signal();
        }
    }

    /// Flips the global and per-layer xattr flags on first use.
    pub fn enable_xattrs(&self, fs: &Layer) {
        self.xattr_enabled.store(true, Ordering::Relaxed);
        fs.xattr_enabled.store(true, Ordering::Relaxed);
    }

    /// Maps a directory entry of the layer root directory to the index of
    /// the layer rooted at it. Falls back to `gindex` for ordinary
    /// entries.
    pub fn get_index(&self, gindex: u32, parent: u64, ino: u64) -> u32 {
        if gindex == 0 && parent == self.layer_root.load(Ordering::Relaxed) {
            let root = handle_ino(ino);
            let table = self.layers.lock().unwrap();
            for (i, r) in table.roots.iter().enumerate() {
                if *r == root && i > 0 {
                    return i as u32;
                }
            }
        }
        gindex
    }

    /// The layer root directory inode, in the root layer.
    pub fn layer_root_inode(&self) -> io::Result<InodeRef> {
        let root = self.global();
        inode::get_inode(self, &root, self.layer_root.load(Ordering::Relaxed), None, false)
    }
}

/// Current time in seconds since the Epoch.
fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Adds a layer to the table and links it into the tree.
///
/// Returns `EOVERFLOW` when the table is full.
fn add_layer(gfs: &Gfs, fs: &Arc<Layer>, pfs: Option<&Arc<Layer>>) -> io::Result<()> {
    let sblock = crate::alloc::block_alloc_exact(gfs, fs, 1)?;
    fs.sblock.store(sblock, Ordering::Relaxed);
    let mut table = gfs.layers.lock().unwrap();
    let start = table.hgindex + 1;
    let mut index = None;
    for i in start..LAYER_MAX {
        if table.slot(i).is_none() {
            index = Some(i);
            break;
        }
    }
    let Some(index) = index else {
        return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
    };
    fs.gindex.store(index as u32, Ordering::Release);
    fs.sb.lock().unwrap().index = index as u32;
    let root = fs.root.load(Ordering::Relaxed);
    *table.slot(index) = Some(fs.clone());
    table.roots[index] = root;
    if index > table.scount {
        table.scount = index;
    }
    table.hgindex = index;
    add_child(gfs, &mut table, pfs, fs);
    Ok(())
}

/// Links a layer under its parent, or as a sibling of the base tree.
fn add_child(gfs: &Gfs, table: &mut LayerTable, pfs: Option<&Arc<Layer>>, fs: &Arc<Layer>) {
    let index = fs.gindex.load(Ordering::Relaxed);
    let first = match pfs {
        Some(pfs) => pfs.links.lock().unwrap().child,
        None => Some(0),
    };
    match first {
        Some(child_index) => {
            // Insert after the first existing child/root sibling
            let child = table.layers[child_index as usize].clone().expect("sibling");
            child.single.store(false, Ordering::Relaxed);
            let mut clinks = child.links.lock().unwrap();
            let mut flinks = fs.links.lock().unwrap();
            flinks.prev = Some(child_index);
            flinks.next = clinks.next;
            if let Some(next) = clinks.next {
                let next = table.layers[next as usize].clone().expect("sibling");
                next.links.lock().unwrap().prev = Some(index);
            }
            clinks.next = Some(index);
            flinks.parent = pfs.map(|p| p.gindex.load(Ordering::Relaxed));
            drop(flinks);
            drop(clinks);
            {
                let mut csb = child.sb.lock().unwrap();
                let mut fsb = fs.sb.lock().unwrap();
                fsb.next_layer = csb.next_layer;
                csb.next_layer = fs.sblock.load(Ordering::Relaxed);
            }
            child.mark_super_dirty();
        }
        None => {
            let pfs = pfs.expect("first child has a parent");
            // The very first init child of a base layer may cache shared
            // data in the kernel page cache
            if fs.sb.lock().unwrap().flags & SUPER_INIT != 0 {
                fs.single.store(true, Ordering::Relaxed);
            }
            fs.links.lock().unwrap().parent = Some(pfs.gindex.load(Ordering::Relaxed));
            pfs.links.lock().unwrap().child = Some(index);
            pfs.sb.lock().unwrap().child_layer = fs.sblock.load(Ordering::Relaxed);
            pfs.mark_super_dirty();
        }
    }
    let _ = gfs;
}

/// Takes a layer out of the tree, patching sibling and parent links.
fn remove_child(table: &mut LayerTable, fs: &Arc<Layer>) {
    let flinks = *fs.links.lock().unwrap();
    let parent = flinks.parent.and_then(|p| table.layers[p as usize].clone());
    let parent_child = parent.as_ref().and_then(|p| p.links.lock().unwrap().child);
    let index = fs.gindex.load(Ordering::Relaxed);
    if let (Some(pfs), Some(child)) = (&parent, parent_child) {
        if child == index {
            // The parent points at this layer
            pfs.links.lock().unwrap().child = flinks.next;
            if let Some(next) = flinks.next {
                table.layers[next as usize]
                    .as_ref()
                    .expect("sibling")
                    .links
                    .lock()
                    .unwrap()
                    .prev = None;
            }
            pfs.sb.lock().unwrap().child_layer = fs.sb.lock().unwrap().next_layer;
            pfs.mark_super_dirty();
            clear_zombie_mark(parent.as_ref(), index);
            return;
        }
    }
    // Unlink from the sibling chain
    if let Some(prev) = flinks.prev {
        let prev = table.layers[prev as usize].clone().expect("sibling");
        prev.links.lock().unwrap().next = flinks.next;
        prev.sb.lock().unwrap().next_layer = fs.sb.lock().unwrap().next_layer;
        prev.mark_super_dirty();
    }
    if let Some(next) = flinks.next {
        table.layers[next as usize]
            .as_ref()
            .expect("sibling")
            .links
            .lock()
            .unwrap()
            .prev = flinks.prev;
    }
    clear_zombie_mark(parent.as_ref(), index);
}

/// Clears the parent's zombie record when its zombie child goes away.
fn clear_zombie_mark(parent: Option<&Arc<Layer>>, index: u32) {
    if let Some(pfs) = parent {
        let mut sb = pfs.sb.lock().unwrap();
        if sb.zombie == index as u64 {
            sb.zombie = 0;
            drop(sb);
            pfs.mark_super_dirty();
        }
    }
}

/// Takes a layer (and any zombie chain behind it) off the table for
/// removal.
///
/// Returns the victims, or `None` when the layer became a zombie kept
/// alive by a committed child.
fn get_layers_for_removal(gfs: &Gfs, root: u64) -> io::Result<Option<Vec<Arc<Layer>>>> {
    let ino = handle_ino(root);
    let gindex = handle_layer(root);
    let mut table = gfs.layers.lock().unwrap();
    let fs = table
        .layers
        .get(gindex as usize)
        .cloned()
        .flatten()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EBUSY))?;
    assert_eq!(fs.gindex.load(Ordering::Relaxed), gindex);
    if fs.root.load(Ordering::Relaxed) != ino {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    let child = fs.links.lock().unwrap().child;
    if let Some(child_index) = child {
        let child = table.layers[child_index as usize].clone().expect("child");
        let zombie_child = fs.sb.lock().unwrap().zombie == child_index as u64
            && child.links.lock().unwrap().next.is_none();
        if zombie_child {
            // A committed child still builds on this layer: keep it around
            // as a zombie until the child goes away
            fs.sb.lock().unwrap().flags |= SUPER_ZOMBIE;
            fs.mark_super_dirty();
            let mut clinks = child.links.lock().unwrap();
            assert!(clinks.zombie.is_none());
            clinks.zombie = Some(gindex);
            return Ok(None);
        }
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }

    let mut victims = Vec::new();
    let mut target = Some(fs.clone());
    // A read-write layer drags its init parent along; zombie parents
    // chain behind whichever layer they were recorded on
    {
        let sb = fs.sb.lock().unwrap();
        if sb.flags & SUPER_RDWR != 0 && sb.flags & SUPER_INIT == 0 {
            let parent = fs.links.lock().unwrap().parent;
            if let Some(pindex) = parent {
                let pfs = table.layers[pindex as usize].clone().expect("parent");
                if pfs.sb.lock().unwrap().flags & SUPER_INIT != 0 {
                    let mut flinks = fs.links.lock().unwrap();
                    if flinks.zombie.is_none() {
                        flinks.zombie = Some(pindex);
                    }
                }
            }
        }
    }
    while let Some(fs) = target {
        let index = fs.gindex.load(Ordering::Relaxed);
        fs.removed.store(true, Ordering::Release);
        remove_child(&mut table, &fs);
        table.layers[index as usize] = None;
        table.roots[index as usize] = 0;
        let zombie = fs.links.lock().unwrap().zombie;
        victims.push(fs);
        target = zombie.map(|z| table.layers[z as usize].clone().expect("zombie"));
    }
    while table.scount > 0 && table.layers[table.scount].is_none() {
        table.scount -= 1;
    }
    Ok(Some(victims))
}

/// Freezes a layer: no modification may target it from now on.
pub fn freeze_layer(gfs: &Gfs, fs: &Layer) {
    if fs.frozen() {
        return;
    }
    let ninode = gfs.sb.lock().unwrap().ninode;
    fs.sb.lock().unwrap().last_inode = ninode;
    fs.frozen.store(true, Ordering::Release);
    fs.commit_in_progress.store(false, Ordering::Relaxed);
    fs.mark_super_dirty();
}

/// Resolves a layer name to its root inode handle via the layer root
/// directory.
pub fn get_root_ino(gfs: &Gfs, name: &str) -> io::Result<u64> {
    let layer_root = gfs.layer_root.load(Ordering::Relaxed);
    if layer_root == 0 {
        return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }
    let pdir = gfs.layer_root_inode()?;
    let guard = pdir.read().unwrap();
    let ino = guard
        .dir()
        .lookup(name)
        .map(|d| d.ino)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
    drop(guard);
    let gindex = gfs.get_index(0, layer_root, ino);
    if gindex == 0 {
        return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }
    Ok(set_handle(gindex, ino))
}

/// Creates a new layer.
///
/// Arguments:
/// - `name` is the name of the layer, created under the layer root
///   directory.
/// - `parent` is the parent layer name; an empty name creates a base
///   layer.
/// - `rw` makes the layer writable. Writable layers whose name ends in
///   `-init` become init layers.
pub fn create_layer(gfs: &Gfs, name: &str, parent: &str, rw: bool) -> io::Result<()> {
    let rfs = gfs.lock_layer(set_handle(0, ROOT_INODE), false)?;
    let result = create_layer_locked(gfs, &rfs, name, parent, rw);
    rfs.rwlock.unlock_shared();
    result
}

fn create_layer_locked(
    gfs: &Gfs,
    rfs: &Arc<Layer>,
    name: &str,
    parent: &str,
    rw: bool,
) -> io::Result<()> {
    if gfs.layer_root.load(Ordering::Relaxed) == 0 {
        return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }
    if !crate::alloc::has_space(gfs, true) {
        return Err(io::Error::from_raw_os_error(libc::ENOSPC));
    }
    let init = rw && name.ends_with(INIT_SUFFIX);
    let base = parent.is_empty();
    if base && init {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    let flags = SUPER_DIRTY
        | SUPER_MOUNTED
        | if rw { SUPER_RDWR } else { 0 }
        | if init { SUPER_INIT } else { 0 };
    let icsize = if base {
        inode::ICACHE_SIZE_MAX
    } else if init {
        inode::ICACHE_SIZE_MIN
    } else {
        inode::ICACHE_SIZE
    };

    // Resolve the parent layer before touching anything
    let pfs = if base {
        None
    } else {
        let phandle = get_root_ino(gfs, parent)?;
        Some(gfs.lock_layer(phandle, false)?)
    };

    let root = inode::inode_alloc(gfs);
    let pdir = match gfs.layer_root_inode() {
        Ok(pdir) => pdir,
        Err(err) => {
            if let Some(pfs) = pfs {
                pfs.rwlock.unlock_shared();
            }
            return Err(err);
        }
    };

    // Register the new root in the layer root directory
    {
        let mut guard = pdir.write().unwrap();
        guard.dir_mut().add(root, libc::S_IFDIR, name);
        guard.dino.nlink += 1;
        guard.update_times(true, true);
        guard.mark_dirty(InodeFlags::DIRDIRTY);
    }

    let bcache = match &pfs {
        Some(pfs) => pfs.bcache.clone(),
        None => Arc::new(BlockCache::new(
            crate::bcache::PCACHE_SIZE,
            crate::bcache::PCLOCK_COUNT,
            gfs.mem.clone(),
        )),
    };
    let mut sb = Super::init(root, 0, flags, false);
    sb.ctime = now_secs();
    sb.atime = sb.ctime;
    let sb = Arc::new(Mutex::new(sb));
    let fs = Layer::new(&gfs.config, sb, INVALID_BLOCK, root, icsize, bcache);
    fs.rwlock.lock_exclusive();

    if let Some(pfs) = &pfs {
        assert_eq!(pfs.pcount.load(Ordering::Relaxed), 0);
        // The parent becomes immutable with its first child
        freeze_layer(gfs, pfs);
    }
    if let Err(err) = add_layer(gfs, &fs, pfs.as_ref()) {
        // Undo the directory entry and return the blocks taken so far
        let mut guard = pdir.write().unwrap();
        guard.dir_mut().remove(name);
        guard.dino.nlink -= 1;
        guard.mark_dirty(InodeFlags::DIRDIRTY);
        drop(guard);
        let sblock = fs.sblock.swap(INVALID_BLOCK, Ordering::Relaxed);
        if sblock != INVALID_BLOCK {
            crate::alloc::free_super_block(gfs, &fs, sblock);
        }
        let _ = crate::alloc::process_layer_blocks(gfs, &fs, true, true);
        fs.rwlock.unlock_exclusive();
        if let Some(pfs) = pfs {
            pfs.rwlock.unlock_shared();
        }
        return Err(err);
    }
    inode::root_init(&fs, root);
    if let Some(pfs) = &pfs {
        // Start from the parent's root directory
        let pdir = pfs.root_inode.lock().unwrap().clone().expect("parent root");
        let pguard = pdir.read().unwrap();
        let entries: Directory = (**pguard.dir()).clone();
        let nlink = pguard.dino.nlink;
        drop(pguard);
        let root_inode = fs.root_inode.lock().unwrap().clone().unwrap();
        let mut guard = root_inode.write().unwrap();
        guard.data = crate::inode::InodeData::Dir(Arc::new(entries));
        guard.dino.nlink = nlink;
        guard.mark_dirty(InodeFlags::DIRDIRTY);
    }
    rfs.mark_inodes_dirty();
    gfs.layer_changed(true, false);
    if gfs.config.verbose {
        eprintln!(
            "Created layer {name} root {root} index {} block {}",
            fs.gindex.load(Ordering::Relaxed),
            fs.sblock.load(Ordering::Relaxed)
        );
    }
    fs.rwlock.unlock_exclusive();
    if let Some(pfs) = pfs {
        pfs.rwlock.unlock_shared();
    }
    Ok(())
}

/// Tears the in-core state of a removed layer down, returning its blocks.
fn destroy_layer(gfs: &Gfs, fs: &Arc<Layer>, remove: bool) -> io::Result<()> {
    // Dirty state dies with the layer
    fs.pending.lock().unwrap().clear();
    *fs.iflush.lock().unwrap() = inode::InodeFlushState::default();
    let sblock = fs.sblock.swap(INVALID_BLOCK, Ordering::Relaxed);
    if remove && sblock != INVALID_BLOCK {
        crate::alloc::free_super_block(gfs, fs, sblock);
    }
    crate::alloc::process_layer_blocks(gfs, fs, true, remove)?;

    // Drop the inodes; their dirty pages go with them
    let mut removed_inodes = 0u64;
    let mut live = 0u64;
    let mut dropped_pages = 0u64;
    for iref in fs.icache.drain() {
        let mut inode = iref.write().unwrap();
        dropped_pages += inode.pages_count() as u64;
        if let crate::inode::InodeData::File { pages, .. } = &mut inode.data {
            *pages = crate::page::DirtyPages::new();
        }
        if inode.flags.contains(InodeFlags::REMOVED) {
            removed_inodes += 1;
        } else {
            live += 1;
        }
        fs.mem.free(std::mem::size_of::<crate::inode::Inode>(), MemType::Inode);
    }
    *fs.root_inode.lock().unwrap() = None;
    if dropped_pages > 0 {
        fs.pcount.fetch_sub(dropped_pages, Ordering::Relaxed);
        gfs.dirty_pages.fetch_sub(dropped_pages, Ordering::Relaxed);
    }
    let _ = removed_inodes;
    if remove && live > 0 {
        let mut sb = gfs.sb.lock().unwrap();
        assert!(sb.inodes >= live);
        sb.inodes -= live;
    }
    fs.icount.store(0, Ordering::Relaxed);
    if gfs.config.memstats {
        fs.mem.display("removed layer");
    }
    Ok(())
}

/// Deletes a layer by name. The layer must have no children; a layer kept
/// alive by a committed child turns into a zombie instead.
pub fn delete_layer(gfs: &Gfs, name: &str) -> io::Result<()> {
    let rfs = gfs.lock_layer(set_handle(0, ROOT_INODE), false)?;
    let result = delete_layer_locked(gfs, &rfs, name);
    rfs.rwlock.unlock_shared();
    result
}

fn delete_layer_locked(gfs: &Gfs, rfs: &Arc<Layer>, name: &str) -> io::Result<()> {
    let root = get_root_ino(gfs, name)?;
    let victims = get_layers_for_removal(gfs, root)?;

    // Drop the name regardless; a zombie only lingers in the tree
    {
        let pdir = gfs.layer_root_inode()?;
        let mut guard = pdir.write().unwrap();
        guard.dir_mut().remove(name);
        assert!(guard.dino.nlink > 2);
        guard.dino.nlink -= 1;
        guard.update_times(false, true);
        guard.mark_dirty(InodeFlags::DIRDIRTY);
    }
    rfs.mark_inodes_dirty();

    let Some(victims) = victims else {
        if gfs.config.verbose {
            eprintln!("Converted layer {name} to a zombie layer");
        }
        return Ok(());
    };
    for fs in victims {
        fs.rwlock.lock_exclusive();
        let result = destroy_layer(gfs, &fs, true);
        fs.rwlock.unlock_exclusive();
        result?;
    }
    gfs.layer_changed(true, true);
    if gfs.config.verbose {
        eprintln!("Removed layer {name}");
    }
    Ok(())
}

/// Promotes the writable layer `name` to a read-only image, continuing
/// work under the fresh writable layer `new_name`.
///
/// The committed content keeps the layer's numeric index, so clients
/// holding handles into it keep seeing the same data; the empty working
/// layer takes over the new name.
pub fn commit_layer(gfs: &Gfs, name: &str, new_name: &str) -> io::Result<()> {
    // The fresh container layer starts as an ordinary child of the layer
    // being committed's parent; the swap below moves it into place
    let (parent_name, fs_handle) = {
        let rfs = gfs.lock_layer(set_handle(0, ROOT_INODE), false)?;
        let result = (|| {
            let fs_handle = get_root_ino(gfs, name)?;
            let fs = gfs
                .layer(handle_layer(fs_handle))
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
            if fs.read_only.load(Ordering::Relaxed) || fs.frozen() {
                return Err(io::Error::from_raw_os_error(libc::EROFS));
            }
            let parent = fs.links.lock().unwrap().parent;
            let pname = match parent {
                Some(pindex) => {
                    let pfs = gfs
                        .layer(pindex)
                        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
                    let proot = pfs.root.load(Ordering::Relaxed);
                    let pdir = gfs.layer_root_inode()?;
                    let guard = pdir.read().unwrap();
                    guard
                        .dir()
                        .iter()
                        .find(|d| d.ino == proot)
                        .map(|d| d.name.to_string())
                        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?
                }
                None => String::new(),
            };
            Ok((pname, fs_handle))
        })();
        rfs.rwlock.unlock_shared();
        result?
    };
    create_layer(gfs, new_name, &parent_name, true)?;

    let rfs = gfs.lock_layer(set_handle(0, ROOT_INODE), false)?;
    let result = commit_swap(gfs, fs_handle, name, new_name);
    rfs.rwlock.unlock_shared();
    result
}

/// The commit swap itself: exchanges content, roots, indices and tree
/// position between the writable layer and the fresh container layer.
fn commit_swap(gfs: &Gfs, fs_handle: u64, name: &str, new_name: &str) -> io::Result<()> {
    let cfs_handle = get_root_ino(gfs, new_name)?;
    let cfs = gfs.lock_layer(cfs_handle, true)?;
    let gindex_new = cfs.gindex.load(Ordering::Relaxed);
    let parent = cfs.links.lock().unwrap().parent;
    let pfs = parent.and_then(|p| gfs.layer(p));
    if let Some(pfs) = &pfs {
        pfs.rwlock.lock_exclusive();
    }
    let fs = match gfs.lock_layer(fs_handle, true) {
        Ok(fs) => fs,
        Err(err) => {
            if let Some(pfs) = &pfs {
                pfs.rwlock.unlock_exclusive();
            }
            cfs.rwlock.unlock_exclusive();
            return Err(err);
        }
    };
    let gindex_old = fs.gindex.load(Ordering::Relaxed);

    // Nothing in the fresh container may alias content that moves
    for iref in cfs.icache.snapshot() {
        let mut guard = iref.write().unwrap();
        if guard.flags.contains(InodeFlags::SHARED) {
            match &mut guard.data {
                crate::inode::InodeData::Dir(dir) => {
                    Arc::make_mut(dir);
                }
                crate::inode::InodeData::File { emap: Some(emap), .. } => {
                    Arc::make_mut(emap);
                }
                _ => (),
            }
            guard.flags.remove(InodeFlags::SHARED);
        }
    }

    let fs_root_ino = fs.root.load(Ordering::Relaxed);
    let cfs_root_ino = cfs.root.load(Ordering::Relaxed);

    // Move the written content, root inode included, into the container
    let fs_root = fs.root_inode.lock().unwrap().take().expect("root inode");
    let cfs_root = cfs.root_inode.lock().unwrap().take().expect("root inode");
    for iref in fs.icache.drain() {
        let ino = iref.read().unwrap().dino.ino;
        if ino == fs_root_ino {
            continue;
        }
        cfs.icache.insert(ino, iref);
    }
    cfs.icache.remove(cfs_root_ino);
    cfs.icache.insert(fs_root_ino, fs_root.clone());
    *cfs.root_inode.lock().unwrap() = Some(fs_root);
    cfs.root.store(fs_root_ino, Ordering::Relaxed);

    // The old slot starts over from its parent's root directory
    {
        let entries = match &pfs {
            Some(pfs) => {
                let proot = pfs.root_inode.lock().unwrap().clone().expect("parent root");
                let guard = proot.read().unwrap();
                let dir: Directory = (**guard.dir()).clone();
                let nlink = guard.dino.nlink;
                (dir, nlink)
            }
            None => (Directory::new(), 2),
        };
        let mut guard = cfs_root.write().unwrap();
        guard.data = crate::inode::InodeData::Dir(Arc::new(entries.0));
        guard.dino.nlink = entries.1;
        guard.mark_dirty(InodeFlags::DIRDIRTY);
    }
    fs.icache.insert(cfs_root_ino, cfs_root.clone());
    *fs.root_inode.lock().unwrap() = Some(cfs_root);
    fs.root.store(cfs_root_ino, Ordering::Relaxed);

    // Counters and accounting follow the content
    let moved = fs.icount.swap(1, Ordering::Relaxed);
    cfs.icount.store(moved.max(1), Ordering::Relaxed);
    for _ in 1..moved {
        fs.mem
            .transfer(&cfs.mem, std::mem::size_of::<crate::inode::Inode>(), MemType::Inode);
    }

    // The on-disk inode chains describe the content, which just switched
    // owners; the in-flight flushing state goes with them
    {
        let mut fsb = fs.sb.lock().unwrap();
        let mut csb = cfs.sb.lock().unwrap();
        std::mem::swap(&mut fsb.inode_block, &mut csb.inode_block);
    }
    {
        let mut fflush = fs.iflush.lock().unwrap();
        let mut cflush = cfs.iflush.lock().unwrap();
        std::mem::swap(&mut *fflush, &mut *cflush);
    }

    {
        let mut table = gfs.layers.lock().unwrap();

        // Out of the tree first, while every link still names the old
        // indices
        remove_child(&mut table, &cfs);
        remove_child(&mut table, &fs);

        // Swap table slots, indices and root records
        fs.gindex.store(gindex_new, Ordering::Release);
        cfs.gindex.store(gindex_old, Ordering::Release);
        table.layers[gindex_new as usize] = Some(fs.clone());
        table.layers[gindex_old as usize] = Some(cfs.clone());
        table.roots[gindex_old as usize] = fs_root_ino;
        table.roots[gindex_new as usize] = cfs_root_ino;

        // The committed layer takes the writable one's place in the tree
        {
            let mut clinks = cfs.links.lock().unwrap();
            clinks.prev = None;
            clinks.next = None;
            clinks.parent = parent;
            clinks.child = Some(gindex_new);
        }
        cfs.sb.lock().unwrap().next_layer = 0;
        match &pfs {
            Some(pfs) => {
                let old_child = pfs.links.lock().unwrap().child;
                match old_child {
                    None => {
                        pfs.links.lock().unwrap().child = Some(gindex_old);
                        pfs.sb.lock().unwrap().child_layer =
                            cfs.sblock.load(Ordering::Relaxed);
                    }
                    Some(first) => {
                        let sibling =
                            table.layers[first as usize].clone().expect("sibling");
                        let mut slinks = sibling.links.lock().unwrap();
                        let mut clinks = cfs.links.lock().unwrap();
                        clinks.prev = Some(first);
                        clinks.next = slinks.next;
                        slinks.next = Some(gindex_old);
                        drop(clinks);
                        drop(slinks);
                        let mut ssb = sibling.sb.lock().unwrap();
                        let mut csb = cfs.sb.lock().unwrap();
                        csb.next_layer = ssb.next_layer;
                        ssb.next_layer = cfs.sblock.load(Ordering::Relaxed);
                        drop(csb);
                        drop(ssb);
                        sibling.mark_super_dirty();
                    }
                }
                pfs.mark_super_dirty();
            }
            None => {
                // Committing a base layer: the committed image joins the
                // base sibling chain
                let rfs = table.layers[0].clone().expect("root layer");
                let mut rlinks = rfs.links.lock().unwrap();
                let mut clinks = cfs.links.lock().unwrap();
                clinks.prev = Some(0);
                clinks.next = rlinks.next;
                rlinks.next = Some(gindex_old);
                drop(clinks);
                drop(rlinks);
                rfs.mark_super_dirty();
            }
        }

        // The fresh writable layer continues on top of the committed image
        {
            let mut flinks = fs.links.lock().unwrap();
            flinks.prev = None;
            flinks.next = None;
            flinks.parent = Some(gindex_old);
        }
        fs.sb.lock().unwrap().next_layer = 0;
        cfs.sb.lock().unwrap().child_layer = fs.sblock.load(Ordering::Relaxed);
    }

    // Flags and superblock bookkeeping: the image is sealed read-only and
    // remembers the working child whose removal releases it
    {
        let ninode = gfs.sb.lock().unwrap().ninode;
        let mut csb = cfs.sb.lock().unwrap();
        csb.root = fs_root_ino;
        csb.index = gindex_old;
        csb.last_inode = ninode;
        csb.flags &= !SUPER_RDWR;
        csb.flags |= SUPER_DIRTY;
        csb.zombie = gindex_new as u64;
        csb.commit_time = now_secs();
    }
    {
        let mut fsb = fs.sb.lock().unwrap();
        fsb.root = cfs_root_ino;
        fsb.index = gindex_new;
        fsb.flags |= SUPER_RDWR | SUPER_DIRTY;
    }
    cfs.read_only.store(true, Ordering::Relaxed);
    cfs.frozen.store(true, Ordering::Relaxed);
    cfs.commit_in_progress.store(true, Ordering::Relaxed);
    fs.read_only.store(false, Ordering::Relaxed);
    fs.frozen.store(false, Ordering::Relaxed);
    cfs.mark_super_dirty();
    cfs.mark_inodes_dirty();
    fs.mark_super_dirty();
    fs.mark_inodes_dirty();
    {
        let mut sb = gfs.sb.lock().unwrap();
        sb.ncommitted += 1;
    }
    gfs.layer_changed(true, true);
    if gfs.config.verbose {
        eprintln!("Committed layer {name} as index {gindex_old}, work continues in {new_name}");
    }
    fs.rwlock.unlock_exclusive();
    if let Some(pfs) = &pfs {
        pfs.rwlock.unlock_exclusive();
    }
    cfs.rwlock.unlock_exclusive();
    Ok(())
}

/// Reads a superblock from the device.
pub fn super_read(gfs: &Gfs, block: u64) -> io::Result<Super> {
    let mut buf = new_block();
    gfs.device.read_block(block, &mut buf[..])?;
    let sb: Super = read_struct(&buf[..]);
    if sb.valid() {
        crate::crc32::verify_block_crc(&buf[..], SUPER_CRC_OFFSET)?;
    }
    Ok(sb)
}

/// Writes a layer's superblock with a fresh checksum.
pub fn super_write(gfs: &Gfs, fs: &Layer) -> io::Result<()> {
    let mut buf = new_block();
    {
        let sb = fs.sb.lock().unwrap();
        write_struct(&mut buf[..], &*sb);
    }
    crate::crc32::update_block_crc(&mut buf[..], SUPER_CRC_OFFSET);
    fs.write_block(gfs, &buf[..], fs.sblock.load(Ordering::Relaxed))?;
    fs.clear_super_dirty();
    Ok(())
}

/// Loads one layer from its superblock at mount.
fn init_layer(
    gfs: &Gfs,
    pfs: &Arc<Layer>,
    block: u64,
    child: bool,
) -> io::Result<Arc<Layer>> {
    let sb = super_read(gfs, block)?;
    if !sb.valid() {
        return Err(io::Error::from_raw_os_error(libc::EIO));
    }
    let icsize = InodeCache::size_for(&sb);
    let bcache = if child || pfs.links.lock().unwrap().parent.is_some() {
        pfs.bcache.clone()
    } else {
        Arc::new(BlockCache::new(
            crate::bcache::PCACHE_SIZE,
            crate::bcache::PCLOCK_COUNT,
            gfs.mem.clone(),
        ))
    };
    let root = sb.root;
    let index = sb.index as usize;
    let fs = Layer::new(
        &gfs.config,
        Arc::new(Mutex::new(sb)),
        block,
        root,
        icsize,
        bcache,
    );
    fs.restarted.store(true, Ordering::Relaxed);
    fs.gindex.store(index as u32, Ordering::Relaxed);
    let read_only = fs.read_only.load(Ordering::Relaxed);
    let init = fs.sb.lock().unwrap().flags & SUPER_INIT != 0;
    if child {
        assert!(pfs.links.lock().unwrap().child.is_none());
        pfs.links.lock().unwrap().child = Some(index as u32);
        fs.links.lock().unwrap().parent = Some(pfs.gindex.load(Ordering::Relaxed));
        fs.frozen.store(read_only || init, Ordering::Relaxed);
        if pfs.sb.lock().unwrap().flags & SUPER_ZOMBIE != 0 {
            fs.links.lock().unwrap().zombie = Some(pfs.gindex.load(Ordering::Relaxed));
        }
    } else {
        // Sibling of pfs, under the same parent
        let parent = pfs.links.lock().unwrap().parent;
        assert!(pfs.links.lock().unwrap().next.is_none());
        pfs.links.lock().unwrap().next = Some(index as u32);
        fs.links.lock().unwrap().prev = Some(pfs.gindex.load(Ordering::Relaxed));
        fs.links.lock().unwrap().parent = parent;
        fs.frozen.store(true, Ordering::Relaxed);
    }
    {
        let frozen = fs.frozen();
        let mut sb = fs.sb.lock().unwrap();
        if frozen && sb.last_inode == 0 {
            sb.last_inode = gfs.sb.lock().unwrap().ninode;
        }
    }
    let mut table = gfs.layers.lock().unwrap();
    assert!(table.slot(index).is_none());
    *table.slot(index) = Some(fs.clone());
    table.roots[index] = root;
    if index > table.scount {
        table.scount = index;
    }
    if index > table.hgindex {
        table.hgindex = index;
    }
    Ok(fs)
}

/// Loads the whole layer tree below `pfs` from the superblock chains.
fn init_layers(gfs: &Gfs, pfs: &Arc<Layer>) -> io::Result<()> {
    // Layers sharing the parent first
    let mut siblings = vec![pfs.clone()];
    let mut nfs = pfs.clone();
    let mut block = nfs.sb.lock().unwrap().next_layer;
    while block != 0 {
        let fs = init_layer(gfs, &nfs, block, false)?;
        block = fs.sb.lock().unwrap().next_layer;
        siblings.push(fs.clone());
        nfs = fs;
    }
    // Then every child tree
    for fs in siblings {
        let block = fs.sb.lock().unwrap().child_layer;
        if block != 0 {
            let child = init_layer(gfs, &fs, block, true)?;
            init_layers(gfs, &child)?;
        }
    }
    Ok(())
}

/// Finds the well-known directories in the root layer after a restart.
fn setup_special_inodes(gfs: &Gfs, rfs: &Arc<Layer>) -> io::Result<()> {
    let root_inode = rfs.root_inode.lock().unwrap().clone().expect("root inode");
    let guard = root_inode.read().unwrap();
    if let Some(dirent) = guard.dir().lookup(LAYER_TMP_DIR) {
        gfs.tmp_root.store(dirent.ino, Ordering::Relaxed);
    }
    let layer_root = guard.dir().lookup(LAYER_ROOT_DIR).map(|d| d.ino);
    drop(guard);
    if let Some(ino) = layer_root {
        gfs.layer_root.store(ino, Ordering::Relaxed);
        let dir = inode::get_inode(gfs, rfs, ino, None, false)?;
        let mut guard = dir.write().unwrap();
        if !guard.dir().hashed() {
            guard.dir_mut().convert_hashed();
        }
    }
    Ok(())
}

/// Formats the device: a fresh global superblock, the free pool covering
/// the device, an empty root directory.
fn format(gfs: &Gfs, rfs: &Arc<Layer>, size: u64) {
    *gfs.sb.lock().unwrap() = Super::init(ROOT_INODE, size, SUPER_RDWR, true);
    crate::alloc::format_init(gfs);
    inode::root_init(rfs, ROOT_INODE);
    rfs.mark_super_dirty();
}

/// Mounts the device, formatting it when requested or when no clean
/// filesystem is found.
pub fn mount(device_path: &Path, config: Config) -> io::Result<Arc<Gfs>> {
    let device = Device::open(device_path)?;
    let size = device.size_blocks();
    if size < MIN_BLOCKS {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    let mem = Arc::new(MemTracker::default());
    let gfs = Arc::new(Gfs {
        device,
        config,
        sb: Arc::new(Mutex::new(Super::init(ROOT_INODE, 0, 0, false))),
        galloc: Mutex::new(GlobalAlloc::default()),
        layers: Mutex::new(LayerTable::default()),
        mem: mem.clone(),
        layer_root: AtomicU64::new(0),
        tmp_root: AtomicU64::new(0),
        blocks_reserved: AtomicU64::new(0),
        dirty_pages: AtomicU64::new(0),
        clones: AtomicU64::new(0),
        sync_interval: AtomicU64::new(SYNC_INTERVAL),
        sync_required: AtomicU64::new(0),
        unmounting: AtomicBool::new(false),
        xattr_enabled: AtomicBool::new(false),
        syncer_wait: WaitChannel::default(),
        flusher_wait: WaitChannel::default(),
        cleaner_wait: WaitChannel::default(),
    });

    let bcache = Arc::new(BlockCache::new(
        crate::bcache::PCACHE_SIZE_MIN,
        crate::bcache::PCLOCK_COUNT,
        mem,
    ));
    let sb = super_read(&gfs, SUPER_BLOCK)?;
    *gfs.sb.lock().unwrap() = sb;
    let rfs = Layer::new(
        &gfs.config,
        gfs.sb.clone(),
        SUPER_BLOCK,
        ROOT_INODE,
        inode::ICACHE_SIZE_MAX,
        bcache,
    );
    {
        let mut table = gfs.layers.lock().unwrap();
        *table.slot(0) = Some(rfs.clone());
        table.roots[0] = ROOT_INODE;
    }
    rfs.rwlock.lock_exclusive();
    let clean = sb.valid() && sb.flags & SUPER_DIRTY == 0;
    if config.format || !clean {
        // An unclean device is reformatted: crash consistency here is
        // "clean if unmounted cleanly, reformat otherwise"
        eprintln!(
            "Formatting {}, size {}",
            device_path.display(),
            size * BLOCK_SIZE as u64
        );
        format(&gfs, &rfs, size * BLOCK_SIZE as u64);
    } else {
        {
            let mut gsb = gfs.sb.lock().unwrap();
            gsb.mounts += 1;
            assert_eq!(size, gsb.tblocks);
        }
        init_layers(&gfs, &rfs)?;
        for fs in gfs.layers_snapshot() {
            crate::alloc::read_extents(&gfs, &fs)?;
            inode::read_inodes(&gfs, &fs)?;
        }
        setup_special_inodes(&gfs, &rfs)?;
    }
    let tblocks = gfs.sb.lock().unwrap().tblocks;
    gfs.blocks_reserved.store(
        tblocks * crate::alloc::RESERVED_BLOCKS_PCT / 100,
        Ordering::Relaxed,
    );
    gfs.sb.lock().unwrap().flags |= SUPER_DIRTY | SUPER_MOUNTED;
    rfs.mark_super_dirty();
    super_write(&gfs, &rfs)?;
    rfs.mark_super_dirty();
    rfs.rwlock.unlock_exclusive();
    Ok(gfs)
}
