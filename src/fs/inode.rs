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

//! In-core inodes and the per-layer inode cache.

use crate::dir::Directory;
use crate::emap;
use crate::extent::ExtentList;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::layout::*;
use crate::memory::MemType;
use crate::page::DirtyPages;
use crate::xattr;
use crate::xattr::IXattrs;
use bitflags::bitflags;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Smallest inode cache, used for init layers.
pub const ICACHE_SIZE_MIN: usize = 8;
/// Inode cache size of read-write layers.
pub const ICACHE_SIZE: usize = 1024;
/// Largest inode cache, used for the root layer.
pub const ICACHE_SIZE_MAX: usize = 8192;
/// Ratio of inode count to cache size when sizing from a superblock.
pub const ICACHE_TARGET: u64 = 2;

/// Number of contiguous blocks grabbed when a layer starts flushing inodes.
pub const INODE_CLUSTER_SIZE: u64 = 32;

bitflags! {
    /// State bits of an in-core inode.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InodeFlags: u32 {
        /// The disk inode must be written out.
        const DIRTY = 0x0001;
        /// Dirty pages and emap must be flushed.
        const EMAPDIRTY = 0x0002;
        /// Directory entries must be flushed.
        const DIRDIRTY = 0x0004;
        /// Extended attributes must be flushed.
        const XATTRDIRTY = 0x0008;
        /// The file was removed.
        const REMOVED = 0x0010;
        /// Emap/directory/target alias a parent layer inode's payload.
        const SHARED = 0x0020;
        /// Created under the tmp directory; exempt from forced flushes.
        const TMP = 0x0040;
    }
}

/// Payload of an inode, by file type.
#[derive(Debug)]
pub enum InodeData {
    /// A regular file: extent map and dirty pages.
    File {
        /// Extent map, when the file is fragmented. `None` with a non-zero
        /// `extent_length` in the disk inode means a single direct extent;
        /// `None` otherwise means no data blocks.
        emap: Option<Arc<ExtentList>>,
        /// Dirty page table.
        pages: DirtyPages,
    },
    /// A directory and its entries.
    Dir(Arc<Directory>),
    /// A symbolic link and its target.
    Symlink(Arc<str>),
    /// Device nodes, fifos, sockets.
    Special,
}

/// An in-core inode. Owned by exactly one layer at any time.
#[derive(Debug)]
pub struct Inode {
    /// The on-disk part.
    pub dino: DInode,
    /// Locator of the disk copy: block number in the low bits, slot index
    /// above [`DINODE_INDEX_SHIFT`]. [`INVALID_BLOCK`] when never flushed.
    pub block: u64,
    /// State bits.
    pub flags: InodeFlags,
    /// Open handles on the inode.
    pub ocount: u32,
    /// Type specific payload.
    pub data: InodeData,
    /// Extended attributes, if any were ever set.
    pub xattrs: Option<Box<IXattrs>>,
    /// Blocks holding the flushed emap/directory chain, freed on rewrite.
    pub meta_extents: ExtentList,
}

/// A shared, lockable inode.
pub type InodeRef = Arc<RwLock<Inode>>;

impl Inode {
    /// Tells whether this is a regular file.
    pub fn is_reg(&self) -> bool {
        self.dino.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// Tells whether this is a directory.
    pub fn is_dir(&self) -> bool {
        self.dino.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Tells whether this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.dino.mode & libc::S_IFMT == libc::S_IFLNK
    }

    /// Returns the directory payload.
    pub fn dir(&self) -> &Arc<Directory> {
        match &self.data {
            InodeData::Dir(dir) => dir,
            _ => panic!("not a directory"),
        }
    }

    /// Returns the directory payload for modification, copying it first if
    /// it is still shared with a parent layer inode.
    pub fn dir_mut(&mut self) -> &mut Directory {
        if self.flags.contains(InodeFlags::SHARED) {
            self.flags.remove(InodeFlags::SHARED);
        }
        match &mut self.data {
            InodeData::Dir(dir) => Arc::make_mut(dir),
            _ => panic!("not a directory"),
        }
    }

    /// Returns the dirty page table of a regular file.
    pub fn pages_mut(&mut self) -> &mut DirtyPages {
        match &mut self.data {
            InodeData::File { pages, .. } => pages,
            _ => panic!("not a regular file"),
        }
    }

    /// Marks the inode dirty, recording which parts must be flushed.
    pub fn mark_dirty(&mut self, flags: InodeFlags) {
        assert!(!flags.contains(InodeFlags::DIRDIRTY) || self.is_dir());
        assert!(!flags.contains(InodeFlags::EMAPDIRTY) || self.is_reg());
        self.flags |= flags | InodeFlags::DIRTY;
    }

    /// Tells whether any part of the inode needs flushing.
    pub fn dirty(&self) -> bool {
        self.flags.intersects(
            InodeFlags::DIRTY
                | InodeFlags::DIRDIRTY
                | InodeFlags::EMAPDIRTY
                | InodeFlags::XATTRDIRTY,
        )
    }

    /// Updates modification and/or change times to the current time.
    pub fn update_times(&mut self, mtime: bool, ctime: bool) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        if mtime {
            self.dino.mtime_sec = now.as_secs() as i64;
            self.dino.mtime_nsec = now.subsec_nanos() as i64;
        }
        if ctime {
            self.dino.ctime_sec = now.as_secs() as i64;
            self.dino.ctime_nsec = now.subsec_nanos() as i64;
        }
    }
}

/// Per-layer cache of in-core inodes, sharded by inode number.
pub struct InodeCache {
    shards: Vec<Mutex<HashMap<u64, InodeRef>>>,
}

impl InodeCache {
    /// Creates a cache with `size` shards.
    pub fn new(size: usize) -> Self {
        Self {
            shards: (0..size).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Cache size to use for a layer with the given superblock.
    pub fn size_for(sb: &Super) -> usize {
        if sb.flags & SUPER_INIT != 0 {
            return ICACHE_SIZE_MIN;
        }
        if sb.flags & SUPER_RDWR != 0 {
            return ICACHE_SIZE;
        }
        let icount = sb.icount / ICACHE_TARGET;
        icount
            .next_power_of_two()
            .clamp(ICACHE_SIZE_MIN as u64, ICACHE_SIZE_MAX as u64) as usize
    }

    fn shard(&self, ino: u64) -> &Mutex<HashMap<u64, InodeRef>> {
        &self.shards[(ino % self.shards.len() as u64) as usize]
    }

    /// Looks up an inode by number.
    pub fn get(&self, ino: u64) -> Option<InodeRef> {
        self.shard(ino).lock().unwrap().get(&ino).cloned()
    }

    /// Adds an inode to the cache.
    pub fn insert(&self, ino: u64, inode: InodeRef) {
        let prev = self.shard(ino).lock().unwrap().insert(ino, inode);
        assert!(prev.is_none());
    }

    /// Removes an inode from the cache.
    pub fn remove(&self, ino: u64) -> Option<InodeRef> {
        self.shard(ino).lock().unwrap().remove(&ino)
    }

    /// Collects all cached inodes. The cache keeps them.
    pub fn snapshot(&self) -> Vec<InodeRef> {
        let mut all = Vec::new();
        for shard in &self.shards {
            all.extend(shard.lock().unwrap().values().cloned());
        }
        all
    }

    /// Empties the cache, returning every inode.
    pub fn drain(&self) -> Vec<InodeRef> {
        let mut all = Vec::new();
        for shard in &self.shards {
            all.extend(shard.lock().unwrap().drain().map(|(_, v)| v));
        }
        all
    }

    /// Count of cached inodes.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    /// Tells whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Initializes the disk part of a new inode.
fn dinode_init(
    dino: &mut DInode,
    ino: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    size: u64,
    parent: u64,
) {
    dino.ino = ino;
    dino.mode = mode;
    dino.nlink = if mode & libc::S_IFMT == libc::S_IFDIR {
        2
    } else {
        1
    };
    dino.uid = uid;
    dino.gid = gid;
    dino.rdev = rdev;
    dino.size = size;
    dino.blocks = 0;
    dino.extent_length = 0;
    dino.emapdir = INVALID_BLOCK;
    dino.xattr = INVALID_BLOCK;
    dino.set_parent(parent & FH_INODE_MASK);
    dino.set_private(mode & libc::S_IFMT == libc::S_IFREG);
}

/// Builds the in-core payload for a fresh inode of the given mode.
fn new_data(mode: u32, target: Option<&str>) -> InodeData {
    match mode & libc::S_IFMT {
        libc::S_IFREG => InodeData::File {
            emap: None,
            pages: DirtyPages::new(),
        },
        libc::S_IFDIR => InodeData::Dir(Arc::new(Directory::new())),
        libc::S_IFLNK => InodeData::Symlink(Arc::from(target.unwrap_or(""))),
        _ => InodeData::Special,
    }
}

/// Allocates a new inode number from the global counter.
pub fn inode_alloc(gfs: &Gfs) -> u64 {
    let mut sb = gfs.sb.lock().unwrap();
    sb.ninode += 1;
    sb.ninode
}

/// Creates a new inode in the layer, locked into the cache and marked
/// dirty.
///
/// Arguments:
/// - `mode`, `uid`, `gid`, `rdev` describe the file.
/// - `parent` is the parent directory inode number.
/// - `target` is the symbolic link target, when creating one.
pub fn inode_init(
    gfs: &Gfs,
    fs: &Layer,
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    parent: u64,
    target: Option<&str>,
) -> InodeRef {
    let ino = inode_alloc(gfs);
    let mut inode = Inode {
        dino: unsafe { std::mem::zeroed() },
        block: INVALID_BLOCK,
        flags: InodeFlags::empty(),
        ocount: 0,
        data: new_data(mode, target),
        xattrs: None,
        meta_extents: ExtentList::new(),
    };
    let size = target.map(|t| t.len() as u64).unwrap_or(0);
    dinode_init(&mut inode.dino, ino, mode, uid, gid, rdev, size, parent);
    inode.update_times(true, true);
    inode.mark_dirty(InodeFlags::DIRTY);
    {
        let mut sb = gfs.sb.lock().unwrap();
        sb.inodes += 1;
    }
    fs.update_ftype_stats(gfs, mode, true);
    fs.icount.fetch_add(1, Ordering::Relaxed);
    fs.mem.alloc(std::mem::size_of::<Inode>(), MemType::Inode);
    let inode = Arc::new(RwLock::new(inode));
    fs.icache.insert(ino, inode.clone());
    fs.mark_inodes_dirty();
    inode
}

/// Instantiates the root inode of a new layer.
pub fn root_init(fs: &Layer, root: u64) {
    let mut inode = Inode {
        dino: unsafe { std::mem::zeroed() },
        block: INVALID_BLOCK,
        flags: InodeFlags::empty(),
        ocount: 0,
        data: InodeData::Dir(Arc::new(Directory::new())),
        xattrs: None,
        meta_extents: ExtentList::new(),
    };
    dinode_init(&mut inode.dino, root, libc::S_IFDIR | 0o755, 0, 0, 0, 0, root);
    inode.update_times(true, true);
    inode.mark_dirty(InodeFlags::DIRTY);
    fs.icount.fetch_add(1, Ordering::Relaxed);
    fs.mem.alloc(std::mem::size_of::<Inode>(), MemType::Inode);
    let inode = Arc::new(RwLock::new(inode));
    fs.icache.insert(root, inode.clone());
    *fs.root_inode.lock().unwrap() = Some(inode);
    fs.mark_inodes_dirty();
}

/// Clones the parent layer's inode into `fs` for modification. The clone
/// shares the parent's emap/directory/target payload until first write.
/// `pfs_root` is the root inode of the layer owning `parent`.
fn clone_inode(gfs: &Gfs, fs: &Layer, parent: &Inode, pfs_root: u64, ino: u64) -> InodeRef {
    let mut inode = Inode {
        dino: parent.dino,
        block: INVALID_BLOCK,
        flags: InodeFlags::empty(),
        ocount: 0,
        data: InodeData::Special,
        xattrs: None,
        meta_extents: ExtentList::new(),
    };
    let mut flags = InodeFlags::DIRTY;
    match &parent.data {
        InodeData::File { emap, .. } => {
            assert_eq!(parent.pages_count(), 0);
            let mut shared = None;
            if parent.dino.blocks > 0 {
                if parent.dino.extent_length == 0 {
                    shared = emap.clone();
                    inode.flags |= InodeFlags::SHARED;
                    flags |= InodeFlags::EMAPDIRTY;
                }
                // A single direct extent travels in the disk inode itself.
                // Either way the blocks are inherited, never this layer's
                // to reuse.
                inode.dino.set_private(false);
            } else {
                inode.dino.set_private(true);
            }
            inode.data = InodeData::File {
                emap: shared,
                pages: DirtyPages::new(),
            };
        }
        InodeData::Dir(dir) => {
            inode.data = InodeData::Dir(dir.clone());
            inode.flags |= InodeFlags::SHARED;
            flags |= InodeFlags::DIRDIRTY;
        }
        InodeData::Symlink(target) => {
            inode.data = InodeData::Symlink(target.clone());
            inode.flags |= InodeFlags::SHARED;
        }
        InodeData::Special => (),
    }
    // A file sitting in the parent layer's root directory now sits in ours
    if parent.dino.parent_ino() == pfs_root {
        inode.dino.set_parent(fs.root.load(Ordering::Relaxed));
    }
    let xattr = xattr::xattr_copy(&mut inode, parent);
    if xattr {
        flags |= InodeFlags::XATTRDIRTY;
    }
    inode.mark_dirty(flags);
    fs.icount.fetch_add(1, Ordering::Relaxed);
    fs.mem.alloc(std::mem::size_of::<Inode>(), MemType::Inode);
    fs.update_ftype_stats(gfs, inode.dino.mode, true);
    let inode = Arc::new(RwLock::new(inode));
    fs.icache.insert(ino, inode.clone());
    fs.mark_inodes_dirty();
    gfs.clones.fetch_add(1, Ordering::Relaxed);
    inode
}

impl Inode {
    /// Count of dirty pages, zero for non-regular files.
    pub fn pages_count(&self) -> u32 {
        match &self.data {
            InodeData::File { pages, .. } => pages.dirty_count(),
            _ => 0,
        }
    }
}

/// Looks up the inode in the layer's parent chain. On the write path
/// (`copy`), the parent inode is cloned into the layer; on the read path
/// the parent's inode is returned as is.
fn get_inode_parent(gfs: &Gfs, fs: &Layer, ino: u64, copy: bool) -> Option<InodeRef> {
    // The clone lock serialises concurrent cloners of the same inode
    let _ilock = fs.ilock.lock().unwrap();
    if let Some(inode) = fs.icache.get(ino) {
        return Some(inode);
    }
    let mut next = fs.links.lock().unwrap().parent;
    while let Some(pindex) = next {
        let pfs = gfs.layer(pindex)?;
        if let Some(parent) = pfs.icache.get(ino) {
            let guard = parent.read().unwrap();
            // A file removed in the parent chain does not exist here
            if guard.flags.contains(InodeFlags::REMOVED) {
                return None;
            }
            if copy {
                let pfs_root = pfs.root.load(Ordering::Relaxed);
                let cloned = clone_inode(gfs, fs, &guard, pfs_root, ino);
                drop(guard);
                return Some(cloned);
            }
            drop(guard);
            return Some(parent);
        }
        next = pfs.links.lock().unwrap().parent;
    }
    None
}

/// Finds the inode `ino` for an operation in the layer `fs`.
///
/// Arguments:
/// - `handle` is an inode already resolved at open time, if the request
///   carried one.
/// - `copy` is set on modifying operations, cloning the inode into this
///   layer if it is still owned by an ancestor.
pub fn get_inode(
    gfs: &Gfs,
    fs: &Layer,
    ino: u64,
    handle: Option<&InodeRef>,
    copy: bool,
) -> io::Result<InodeRef> {
    assert!(!fs.removed.load(Ordering::Relaxed));
    let ino = ino & FH_INODE_MASK;
    if let Some(handle) = handle {
        let owned = {
            let guard = handle.read().unwrap();
            assert_eq!(guard.dino.ino, ino);
            !copy || fs.icache.get(ino).map(|i| Arc::ptr_eq(&i, handle)) == Some(true)
        };
        if owned {
            return Ok(handle.clone());
        }
    }
    if ino == fs.root.load(Ordering::Relaxed) {
        if let Some(root) = fs.root_inode.lock().unwrap().clone() {
            return Ok(root);
        }
    }
    if let Some(inode) = fs.icache.get(ino) {
        return Ok(inode);
    }
    if fs.links.lock().unwrap().parent.is_some() {
        if let Some(inode) = get_inode_parent(gfs, fs, ino, copy) {
            return Ok(inode);
        }
    }
    Err(io::Error::from_raw_os_error(libc::ENOENT))
}

/// Reads one block of packed inodes, materialising every live inode into
/// the layer's cache. Returns true when the block holds no live inode.
fn read_inodes_block(gfs: &Gfs, fs: &Layer, block: u64) -> io::Result<bool> {
    let mut buf = new_block();
    fs.read_block(gfs, block, &mut buf[..])?;
    crate::crc32::verify_block_crc(&buf[..], INODE_BLOCK_CRC_OFFSET)?;
    let mut empty = true;
    for slot in 0..INODE_BLOCK_MAX {
        let offset = slot * DINODE_SIZE;
        let dino: DInode = read_struct(&buf[offset..]);
        // Skip unused and removed slots
        if dino.nlink == 0 {
            continue;
        }
        empty = false;
        let target = if dino.mode & libc::S_IFMT == libc::S_IFLNK {
            // The link target is stored inline after the disk inode
            let len = dino.size as usize;
            let raw = &buf[offset + std::mem::size_of::<DInode>()..][..len];
            Some(String::from_utf8_lossy(raw).into_owned())
        } else {
            None
        };
        let mut inode = Inode {
            dino,
            block: ((slot as u64) << DINODE_INDEX_SHIFT) | block,
            flags: InodeFlags::empty(),
            ocount: 0,
            data: new_data(dino.mode, target.as_deref()),
            xattrs: None,
            meta_extents: ExtentList::new(),
        };
        if inode.is_reg() {
            emap::emap_read(gfs, fs, &mut inode)?;
        } else if inode.is_dir() {
            crate::dir::dir_read(gfs, fs, &mut inode)?;
        }
        xattr::xattr_read(gfs, fs, &mut inode)?;
        let ino = dino.ino;
        fs.icount.fetch_add(1, Ordering::Relaxed);
        fs.mem.alloc(std::mem::size_of::<Inode>(), MemType::Inode);
        let inode = Arc::new(RwLock::new(inode));
        if ino == fs.root.load(Ordering::Relaxed) {
            *fs.root_inode.lock().unwrap() = Some(inode.clone());
        }
        fs.icache.insert(ino, inode);
        if dino.mode & libc::S_IFMT == libc::S_IFLNK {
            // Symbolic links use a whole block
            break;
        }
    }
    Ok(empty)
}

/// Loads the layer's inodes from its inode index chain. Index blocks whose
/// inode blocks all turned out empty are compacted in place and the empty
/// blocks are returned to the layer.
pub fn read_inodes(gfs: &Gfs, fs: &Layer) -> io::Result<()> {
    let mut block = fs.sb.lock().unwrap().inode_block;
    let mut buf = new_block();
    while block != INVALID_BLOCK {
        fs.read_block(gfs, block, &mut buf[..])?;
        let iblock: IBlock = read_struct(&buf[..]);
        if iblock.magic != INODE_MAGIC {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        crate::crc32::verify_block_crc(&buf[..], CHAIN_CRC_OFFSET)?;
        let mut live = Vec::new();
        let mut changed = false;
        for i in 0..IBLOCK_ENTRIES {
            let iblk = iblock.blocks[i];
            if iblk == 0 {
                break;
            }
            if read_inodes_block(gfs, fs, iblk)? {
                // All inodes in the block were removed; free it
                crate::alloc::add_freed_blocks(fs, iblk, 1);
                changed = true;
            } else {
                live.push(iblk);
            }
        }
        if changed {
            // Compact the index block in place
            let mut out: IBlock = iblock;
            out.blocks = [0; IBLOCK_ENTRIES];
            out.blocks[..live.len()].copy_from_slice(&live);
            write_struct(&mut buf[..], &out);
            crate::crc32::update_block_crc(&mut buf[..], CHAIN_CRC_OFFSET);
            fs.write_block(gfs, &buf[..], block)?;
        }
        block = iblock.next;
    }
    assert!(fs.root_inode.lock().unwrap().is_some());
    Ok(())
}

/// Allocates the disk slot for an inode which was never flushed. Inodes
/// pack [`INODE_BLOCK_MAX`] to a block; blocks come from a contiguous
/// cluster grabbed [`INODE_CLUSTER_SIZE`] at a time; symbolic links take a
/// whole block for their inline target.
fn alloc_inode_slot(gfs: &Gfs, fs: &Layer, inode: &mut Inode) -> io::Result<bool> {
    let mut state = fs.iflush.lock().unwrap();
    if inode.is_symlink() {
        state.slot = INODE_BLOCK_MAX;
    }
    let fresh = state.slot == 0 || state.slot >= INODE_BLOCK_MAX;
    if fresh {
        if state.cluster_left == 0 {
            let block = crate::alloc::block_alloc_exact(gfs, fs, INODE_CLUSTER_SIZE)?;
            state.cluster_next = block;
            state.cluster_left = INODE_CLUSTER_SIZE;
        }
        let block = state.cluster_next;
        state.cluster_next += 1;
        state.cluster_left -= 1;
        state.index_entries.push(block);
        inode.block = block;
        state.slot = 1;
    } else {
        let block = state.cluster_next - 1;
        inode.block = ((state.slot as u64) << DINODE_INDEX_SHIFT) | block;
        state.slot += 1;
    }
    if inode.is_symlink() {
        state.slot = INODE_BLOCK_MAX;
    }
    Ok(fresh)
}

/// Writes a dirty inode out: flushes its xattrs, then its emap or
/// directory, then the disk inode itself, so the inode block never points
/// at unwritten metadata. Returns true when the disk inode was written.
pub fn flush_inode(gfs: &Gfs, fs: &Layer, iref: &InodeRef) -> io::Result<bool> {
    let mut inode = iref.write().unwrap();
    if inode.flags.contains(InodeFlags::XATTRDIRTY) {
        xattr::xattr_flush(gfs, fs, &mut inode)?;
    }
    if inode.flags.contains(InodeFlags::EMAPDIRTY) {
        emap::emap_flush(gfs, fs, &mut inode)?;
    } else if inode.flags.contains(InodeFlags::DIRDIRTY) {
        crate::dir::dir_flush(gfs, fs, &mut inode)?;
    }
    if !inode.flags.contains(InodeFlags::DIRTY) {
        return Ok(false);
    }
    if inode.flags.contains(InodeFlags::REMOVED) {
        assert_eq!(inode.dino.extent_length, 0);
        // Free metadata chains of the removed inode
        let extents = inode.meta_extents.take();
        for e in extents {
            crate::alloc::add_freed_blocks(fs, e.start, e.count);
        }
        inode.dino.emapdir = INVALID_BLOCK;
        if let Some(x) = inode.xattrs.as_mut() {
            for e in x.extents.take() {
                crate::alloc::add_freed_blocks(fs, e.start, e.count);
            }
        }
        inode.dino.xattr = INVALID_BLOCK;
        inode.dino.nlink = 0;
        // A removed inode without a disk copy needs no write at all
        if inode.block == INVALID_BLOCK {
            inode.flags.remove(InodeFlags::DIRTY);
            return Ok(false);
        }
    }
    let fresh = if inode.block == INVALID_BLOCK {
        alloc_inode_slot(gfs, fs, &mut inode)?
    } else {
        false
    };
    let block = inode.block & DINODE_BLOCK_MASK;
    let offset = ((inode.block >> DINODE_INDEX_SHIFT) as usize) * DINODE_SIZE;
    assert!(offset < BLOCK_SIZE);
    {
        let mut state = fs.iflush.lock().unwrap();
        if !state.inode_pages.contains_key(&block) {
            let mut buf = new_block();
            if !fresh {
                // Other slots of the block carry live inodes on disk
                fs.read_block(gfs, block, &mut buf[..])?;
            }
            state.inode_pages.insert(block, buf);
        }
        let buf = state.inode_pages.get_mut(&block).unwrap();
        write_struct(&mut buf[offset..], &inode.dino);
        if let InodeData::Symlink(target) = &inode.data {
            assert_eq!(offset, 0);
            let start = std::mem::size_of::<DInode>();
            buf[start..start + target.len()].copy_from_slice(target.as_bytes());
        }
        let full = state.inode_pages.len() >= crate::page::WRITE_CLUSTER_SIZE;
        if full {
            flush_inode_pages_locked(gfs, fs, &mut state)?;
        }
    }
    inode.flags.remove(InodeFlags::DIRTY);
    Ok(true)
}

/// Writes out the buffered inode blocks, largest runs first.
fn flush_inode_pages_locked(
    gfs: &Gfs,
    fs: &Layer,
    state: &mut InodeFlushState,
) -> io::Result<()> {
    let mut blocks: Vec<(u64, BlockBuf)> = state.inode_pages.drain().collect();
    blocks.sort_by_key(|(block, _)| *block);
    for (_, buf) in blocks.iter_mut() {
        crate::crc32::update_block_crc(&mut buf[..], INODE_BLOCK_CRC_OFFSET);
    }
    let mut i = 0;
    while i < blocks.len() {
        let mut j = i + 1;
        while j < blocks.len() && blocks[j].0 == blocks[j - 1].0 + 1 {
            j += 1;
        }
        let bufs: Vec<&[u8]> = blocks[i..j].iter().map(|(_, b)| &b[..]).collect();
        fs.write_blocks(gfs, &bufs, blocks[i].0)?;
        i = j;
    }
    Ok(())
}

/// Writes out the inode index chain, linking new index blocks in front of
/// the chain already on disk.
pub fn flush_inode_blocks(gfs: &Gfs, fs: &Layer) -> io::Result<()> {
    let mut state = fs.iflush.lock().unwrap();
    flush_inode_pages_locked(gfs, fs, &mut state)?;
    if state.index_entries.is_empty() {
        return Ok(());
    }
    let entries = std::mem::take(&mut state.index_entries);
    let count = entries.len().div_ceil(IBLOCK_ENTRIES) as u64;
    let start = crate::alloc::block_alloc_exact(gfs, fs, count)?;
    let old_head = fs.sb.lock().unwrap().inode_block;
    let mut buf = new_block();
    for (i, chunk) in entries.chunks(IBLOCK_ENTRIES).enumerate() {
        let mut iblock: IBlock = unsafe { std::mem::zeroed() };
        iblock.magic = INODE_MAGIC;
        iblock.blocks[..chunk.len()].copy_from_slice(chunk);
        iblock.next = if i as u64 == count - 1 {
            old_head
        } else {
            start + i as u64 + 1
        };
        write_struct(&mut buf[..], &iblock);
        crate::crc32::update_block_crc(&mut buf[..], CHAIN_CRC_OFFSET);
        fs.write_block(gfs, &buf[..], start + i as u64)?;
    }
    fs.sb.lock().unwrap().inode_block = start;
    fs.mark_super_dirty();
    state.slot = 0;
    Ok(())
}

/// State of the inode flushing machinery of a layer.
#[derive(Default)]
pub struct InodeFlushState {
    /// Inode block numbers to be recorded in new index blocks.
    pub index_entries: Vec<u64>,
    /// Next block of the current inode cluster.
    pub cluster_next: u64,
    /// Blocks left in the current inode cluster.
    pub cluster_left: u64,
    /// Next free slot in the inode block being filled.
    pub slot: usize,
    /// Buffered inode blocks being updated, by block number.
    pub inode_pages: HashMap<u64, BlockBuf>,
}

/// Flushes every dirty inode of the layer. Removed regular files release
/// their data first.
pub fn sync_inodes(gfs: &Gfs, fs: &Layer) -> io::Result<()> {
    if fs.removed.load(Ordering::Relaxed) {
        return Ok(());
    }
    let mut count = 0u64;
    for iref in fs.icache.snapshot() {
        {
            let mut inode = iref.write().unwrap();
            if inode.flags.contains(InodeFlags::REMOVED) && inode.is_reg() && inode.dino.size > 0
            {
                crate::page::trunc_pages(gfs, fs, &mut inode, 0, true);
                inode.dino.size = 0;
            }
        }
        if iref.read().unwrap().dirty() {
            if flush_inode(gfs, fs, &iref)? {
                count += 1;
            }
        }
    }
    flush_inode_blocks(gfs, fs)?;
    if count > 0 {
        fs.iwrite.fetch_add(count, Ordering::Relaxed);
    }
    Ok(())
}

/// Copies the attributes of an inode into a stat-like reply.
pub fn copy_attr(inode: &Inode, gindex: u32) -> crate::proto::Attr {
    crate::proto::Attr {
        ino: crate::layer::set_handle(gindex, inode.dino.ino),
        mode: inode.dino.mode,
        nlink: inode.dino.nlink,
        uid: inode.dino.uid,
        gid: inode.dino.gid,
        rdev: inode.dino.rdev,
        size: inode.dino.size,
        blocks: inode.dino.blocks as u64,
        mtime_sec: inode.dino.mtime_sec,
        mtime_nsec: inode.dino.mtime_nsec,
        ctime_sec: inode.dino.ctime_sec,
        ctime_nsec: inode.dino.ctime_nsec,
    }
}
