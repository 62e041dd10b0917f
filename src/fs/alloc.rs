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

//! Block allocation: a device-wide free pool, per-layer reservations and
//! deferred freeing tied to checkpoints.

use crate::crc32;
use crate::extent::ExtentList;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::layout::*;
use std::io;
use std::sync::atomic::Ordering;

/// Space kept in reserve as a percentage of the device. New writes and new
/// layers fail once free space falls to this threshold.
pub const RESERVED_BLOCKS_PCT: u64 = 10;

/// Number of blocks a layer reserves from the global pool at a time.
pub const BLOCK_RESERVE: u64 = 8192;

/// Minimum number of blocks a reclaim pass tries to recover.
pub const RECLAIM_BLOCKS: u64 = 10;

/// Device-wide allocator state.
#[derive(Default)]
pub struct GlobalAlloc {
    /// Extents tracking unused device blocks.
    pub extents: ExtentList,
    /// Extents freed from layers, unavailable until the next checkpoint.
    pub fextents: ExtentList,
}

/// Per-layer allocator state.
#[derive(Default)]
pub struct LayerAlloc {
    /// Unused blocks reserved from the global pool.
    pub extents: ExtentList,
    /// Blocks allocated to this layer. Not kept for the root layer.
    pub aextents: ExtentList,
    /// Blocks freed in the layer, pending deferred release.
    pub fextents: ExtentList,
    /// Count of blocks in the reservation.
    pub reserved: u64,
}

/// Seeds the free pool with the whole device at format time.
pub fn format_init(gfs: &Gfs) {
    let tblocks = gfs.sb.lock().unwrap().tblocks;
    let mut ga = gfs.galloc.lock().unwrap();
    assert!(ga.extents.is_empty());
    ga.extents.add(START_BLOCK, 0, tblocks - START_BLOCK);
}

/// Returns unused reserved blocks of a layer to the global pool.
fn release_reserved_blocks(gfs: &Gfs, fs: &Layer) -> u64 {
    let (extents, count) = {
        let mut la = fs.alloc.lock().unwrap();
        let count = la.reserved;
        la.reserved = 0;
        (la.extents.take(), count)
    };
    let mut freed = 0;
    for e in &extents {
        freed += e.count;
    }
    if freed > 0 {
        {
            let mut ga = gfs.galloc.lock().unwrap();
            for e in extents {
                ga.extents.add(e.start, 0, e.count);
            }
            let mut sb = gfs.sb.lock().unwrap();
            assert!(sb.blocks >= freed);
            sb.blocks -= freed;
        }
        gfs.global().mark_extents_dirty();
    }
    assert_eq!(count, freed);
    freed
}

/// Walks the layers dropping unused reservations back into the global
/// pool. A checkpoint is queued when deferred frees are waiting.
fn reclaim_space(gfs: &Gfs) -> u64 {
    let mut count = 0;
    let mut queued = false;
    for fs in gfs.layers_snapshot() {
        let has_freed = {
            let la = fs.alloc.lock().unwrap();
            (!queued && !la.fextents.is_empty(), la.reserved > 0)
        };
        if has_freed.0 {
            gfs.layer_changed(false, true);
            queued = true;
        }
        if has_freed.1 && fs.rwlock.try_lock_shared() {
            count += release_reserved_blocks(gfs, fs.as_ref());
            fs.rwlock.unlock_shared();
            if count >= RECLAIM_BLOCKS {
                break;
            }
        }
    }
    count
}

/// Checks that enough free space remains for an operation to proceed,
/// reclaiming layer reservations when the pool runs dry. With `layer` set
/// the check additionally demands room for a new layer.
pub fn has_space(gfs: &Gfs, layer: bool) -> bool {
    loop {
        let (tblocks, blocks) = {
            let sb = gfs.sb.lock().unwrap();
            (sb.tblocks, sb.blocks)
        };
        let used =
            blocks + gfs.blocks_reserved() + gfs.dirty_pages.load(Ordering::Relaxed);
        if tblocks > used {
            break;
        }
        if reclaim_space(gfs) == 0 {
            break;
        }
    }
    let (tblocks, blocks) = {
        let sb = gfs.sb.lock().unwrap();
        (sb.tblocks, sb.blocks)
    };
    tblocks
        > blocks
            + gfs.blocks_reserved()
            + gfs.dirty_pages.load(Ordering::Relaxed)
            + if layer { LAYER_MIN_BLOCKS } else { 0 }
}

/// Carves `count` contiguous blocks from the global pool, preferring a
/// carve of `rsize` to refill the caller's reservation.
fn carve_global(gfs: &Gfs, count: u64, rsize: u64) -> Option<(u64, u64)> {
    let mut ga = gfs.galloc.lock().unwrap();
    let (block, got) = match ga.extents.carve(rsize) {
        Some(block) => (block, rsize),
        None => (ga.extents.carve(count)?, count),
    };
    let mut sb = gfs.sb.lock().unwrap();
    sb.blocks += got;
    assert!(sb.tblocks > sb.blocks);
    Some((block, got))
}

/// Allocates `count` contiguous blocks for the layer.
///
/// The layer's reservation is tried first; on a miss, a larger chunk is
/// carved from the global pool (when `reserve` allows) and the leftover
/// feeds the reservation. Returns `None` when no contiguous run exists.
pub fn block_alloc(gfs: &Gfs, fs: &Layer, count: u64, reserve: bool) -> Option<u64> {
    let root = fs.is_root();
    {
        let mut la = fs.alloc.lock().unwrap();
        if let Some(block) = la.extents.carve(count) {
            assert!(la.reserved >= count);
            la.reserved -= count;
            if !root {
                la.aextents.add(block, 0, count);
            }
            fs.blocks.fetch_add(count, Ordering::Relaxed);
            fs.mark_extents_dirty();
            return Some(block);
        }
    }
    let rsize = if !reserve || count > BLOCK_RESERVE {
        count
    } else {
        BLOCK_RESERVE
    };
    let (block, got) = carve_global(gfs, count, rsize)?;
    let mut la = fs.alloc.lock().unwrap();
    if !root {
        la.aextents.add(block, 0, count);
    }
    fs.blocks.fetch_add(count, Ordering::Relaxed);
    if got > count {
        la.extents.add(block + count, 0, got - count);
        la.reserved += got - count;
    }
    drop(la);
    fs.mark_extents_dirty();
    gfs.global().mark_extents_dirty();
    Some(block)
}

/// Like [`block_alloc`], failing with `ENOSPC` when nothing fits.
pub fn block_alloc_exact(gfs: &Gfs, fs: &Layer, count: u64) -> io::Result<u64> {
    block_alloc(gfs, fs, count, true).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSPC))
}

/// Returns blocks to the global pool. With `reuse` they rejoin the free
/// pool immediately; otherwise they wait on the deferred list until the
/// next checkpoint.
fn global_free(gfs: &Gfs, block: u64, count: u64, reuse: bool) {
    {
        let mut ga = gfs.galloc.lock().unwrap();
        if reuse {
            ga.extents.add(block, 0, count);
        } else {
            ga.fextents.add(block, 0, count);
        }
        let mut sb = gfs.sb.lock().unwrap();
        assert!(sb.blocks >= count);
        sb.blocks -= count;
    }
    // The on-disk free pool no longer matches
    gfs.global().mark_extents_dirty();
}

/// Frees blocks in a layer, honoring its allocated-extent bookkeeping.
/// Portions of the range not allocated by this layer belong to an
/// ancestor and are left alone.
fn block_free_layer(gfs: &Gfs, fs: &Layer, mut block: u64, mut count: u64) -> u64 {
    let mut total = 0;
    while count > 0 {
        let freed = {
            let mut la = fs.alloc.lock().unwrap();
            la.aextents.remove(block, count)
        };
        if freed > 0 {
            global_free(gfs, block, freed, false);
            total += freed;
            block += freed;
            count -= freed;
        } else {
            block += 1;
            count -= 1;
        }
    }
    total
}

/// Frees filesystem blocks.
///
/// Arguments:
/// - `layer` routes the free through the layer's bookkeeping.
/// - `reuse` keeps the blocks in the layer's reservation for immediate
///   reuse instead of deferring them to the next checkpoint.
pub fn block_free(gfs: &Gfs, fs: &Layer, block: u64, count: u64, layer: bool, reuse: bool) {
    assert!(block != 0 && block != INVALID_BLOCK);
    if layer {
        if reuse {
            // Back into the reservation, keeping the allocated list
            // accurate; anything not allocated here belongs to an
            // ancestor and must not be pooled
            let mut la = fs.alloc.lock().unwrap();
            let mut block = block;
            let mut count = count;
            let mut pooled = 0;
            while count > 0 {
                if fs.is_root() {
                    la.extents.add(block, 0, count);
                    pooled += count;
                    break;
                }
                let taken = la.aextents.remove(block, count);
                if taken > 0 {
                    la.extents.add(block, 0, taken);
                    pooled += taken;
                    block += taken;
                    count -= taken;
                } else {
                    block += 1;
                    count -= 1;
                }
            }
            la.reserved += pooled;
            fs.freed.fetch_add(pooled, Ordering::Relaxed);
            return;
        }
        let freed = if fs.is_root() {
            global_free(gfs, block, count, false);
            count
        } else {
            block_free_layer(gfs, fs, block, count)
        };
        fs.freed.fetch_add(freed, Ordering::Relaxed);
        fs.mark_extents_dirty();
    } else {
        global_free(gfs, block, count, reuse);
        if !reuse {
            gfs.global().mark_extents_dirty();
        }
    }
}

/// Frees a file's data blocks. Blocks private to the layer go back to its
/// reservation; inherited blocks take the deferred path.
pub fn free_inode_data_blocks(gfs: &Gfs, fs: &Layer, private: bool, freed: ExtentList) {
    for e in freed.iter() {
        block_free(gfs, fs, e.start, e.count, true, private && !fs.frozen());
    }
}

/// Tracks blocks freed in the layer for deferred release.
pub fn add_freed_blocks(fs: &Layer, block: u64, count: u64) {
    let mut la = fs.alloc.lock().unwrap();
    la.fextents.add(block, 0, count);
    drop(la);
    fs.mark_extents_dirty();
}

/// Swaps a metadata chain: the old blocks tracked in `extents` join the
/// layer's deferred free list and the new chain takes their place.
pub fn replace_meta_blocks(fs: &Layer, extents: &mut ExtentList, block: u64, count: u64) {
    for e in extents.take() {
        add_freed_blocks(fs, e.start, e.count);
    }
    if count > 0 && block != INVALID_BLOCK {
        extents.add(block, 0, count);
    }
}

/// Frees the superblock location of a layer, wherever it is accounted.
pub fn free_super_block(gfs: &Gfs, fs: &Layer, block: u64) {
    if block == INVALID_BLOCK {
        return;
    }
    let freed = if fs.is_root() {
        0
    } else {
        block_free_layer(gfs, fs, block, 1)
    };
    if freed == 0 {
        // Reallocated by the root layer at some checkpoint
        global_free(gfs, block, 1, false);
    }
}

/// Writes an extent list as a chain of extent blocks starting at `start`.
fn write_extent_chain(
    gfs: &Gfs,
    fs: &Layer,
    extents: &[crate::extent::Extent],
    start: u64,
    pcount: u64,
) -> io::Result<()> {
    let mut buf = new_block();
    let chunks: Vec<&[crate::extent::Extent]> = if extents.is_empty() {
        vec![&[]]
    } else {
        extents.chunks(EXTENT_BLOCK_ENTRIES).collect()
    };
    assert!(chunks.len() as u64 <= pcount);
    for i in 0..pcount {
        let mut eblock: DExtentBlock = unsafe { std::mem::zeroed() };
        eblock.magic = EXTENT_MAGIC;
        eblock.next = if i == pcount - 1 {
            INVALID_BLOCK
        } else {
            start + i + 1
        };
        if let Some(chunk) = chunks.get(i as usize) {
            for (j, e) in chunk.iter().enumerate() {
                eblock.extents[j] = DExtent {
                    start: e.start,
                    count: e.count,
                };
            }
        }
        write_struct(&mut buf[..], &eblock);
        crc32::update_block_crc(&mut buf[..], CHAIN_CRC_OFFSET);
        fs.write_block(gfs, &buf[..], start + i)?;
    }
    Ok(())
}

/// Flushes the layer's allocated-extent list to disk, replacing its old
/// chain.
pub fn flush_layer_extents(gfs: &Gfs, fs: &Layer) -> io::Result<()> {
    assert!(!fs.is_root());
    let rfs = gfs.global();
    let extents: Vec<crate::extent::Extent> = {
        let la = fs.alloc.lock().unwrap();
        la.aextents.iter().copied().collect()
    };
    let (old_block, old_count) = {
        let sb = fs.sb.lock().unwrap();
        (sb.extent_block, sb.extent_count)
    };
    if old_block != INVALID_BLOCK && old_count > 0 {
        global_free(gfs, old_block, old_count, false);
    }
    let pcount = (extents.len().div_ceil(EXTENT_BLOCK_ENTRIES) as u64).max(1);
    // No reservation refill: this may run after the root layer already
    // dropped its reservation for the checkpoint
    let block = block_alloc(gfs, &rfs, pcount, false)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSPC))?;
    write_extent_chain(gfs, fs, &extents, block, pcount)?;
    let mut sb = fs.sb.lock().unwrap();
    sb.extent_block = block;
    sb.extent_count = pcount;
    drop(sb);
    fs.mark_super_dirty();
    Ok(())
}

/// Processes the blocks a layer allocated and freed, at checkpoint,
/// unmount or removal.
///
/// Arguments:
/// - `unmount` releases the in-core lists after flushing.
/// - `remove` discards the layer: everything it allocated returns to the
///   pool and nothing is written.
pub fn process_layer_blocks(gfs: &Gfs, fs: &Layer, unmount: bool, remove: bool) -> io::Result<()> {
    release_reserved_blocks(gfs, fs);

    // Blocks freed in the layer; they may or may not be allocated in it
    let fextents = {
        let mut la = fs.alloc.lock().unwrap();
        la.fextents.take()
    };
    if !remove {
        for e in fextents {
            block_free(gfs, fs, e.start, e.count, true, false);
        }
    }

    if !fs.is_root() {
        if remove {
            // Return every block the layer owns, and the chain which
            // recorded them (that one was carved by the root layer)
            let aextents = {
                let mut la = fs.alloc.lock().unwrap();
                la.aextents.take()
            };
            let mut freed = 0;
            for e in aextents {
                global_free(gfs, e.start, e.count, false);
                freed += e.count;
            }
            fs.freed.fetch_add(freed, Ordering::Relaxed);
            let (old_block, old_count) = {
                let sb = fs.sb.lock().unwrap();
                (sb.extent_block, sb.extent_count)
            };
            if old_block != INVALID_BLOCK && old_count > 0 {
                global_free(gfs, old_block, old_count, false);
            }
        } else if fs.extents_dirty() || unmount {
            flush_layer_extents(gfs, fs)?;
            fs.clear_extents_dirty();
        }
    }
    Ok(())
}

/// Flushes the global free pool to disk at checkpoint, first folding in
/// every deferred free. With `umount` the in-core list is dropped after
/// the write.
pub fn process_free_extents(gfs: &Gfs, umount: bool) -> io::Result<()> {
    let rfs = gfs.global();
    let flush = rfs.extents_dirty();
    if flush {
        let (count, old_block, old_count) = {
            let ga = gfs.galloc.lock().unwrap();
            let count = ga.extents.len() + ga.fextents.len();
            let sb = gfs.sb.lock().unwrap();
            (count, sb.extent_block, sb.extent_count)
        };
        // The carve below may split an extent and freeing the old chain may
        // add one more entry
        let pcount = ((count + 2).div_ceil(EXTENT_BLOCK_ENTRIES) as u64).max(1);

        // Carve the chain blocks straight out of the pool
        let block = {
            let mut ga = gfs.galloc.lock().unwrap();
            let block = ga
                .extents
                .carve(pcount)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSPC))?;
            let mut sb = gfs.sb.lock().unwrap();
            sb.blocks += pcount;
            block
        };
        if old_block != INVALID_BLOCK && old_count > 0 {
            global_free(gfs, old_block, old_count, false);
        }

        // Everything deferred becomes free space now
        let extents: Vec<crate::extent::Extent> = {
            let mut ga = gfs.galloc.lock().unwrap();
            let fextents = ga.fextents.take();
            for e in fextents {
                ga.extents.add(e.start, 0, e.count);
            }
            ga.extents.iter().copied().collect()
        };
        write_extent_chain(gfs, &rfs, &extents, block, pcount)?;
        let mut sb = gfs.sb.lock().unwrap();
        sb.extent_block = block;
        sb.extent_count = pcount;
        drop(sb);
        rfs.clear_extents_dirty();
        rfs.mark_super_dirty();
    } else {
        assert!(gfs.galloc.lock().unwrap().fextents.is_empty());
    }
    if umount {
        let mut ga = gfs.galloc.lock().unwrap();
        ga.extents.take();
    }
    Ok(())
}

/// Reads a layer's extent chain at mount: the free pool for the root
/// layer, the allocated list for everyone else.
pub fn read_extents(gfs: &Gfs, fs: &Layer) -> io::Result<()> {
    let (block, expected) = {
        let sb = fs.sb.lock().unwrap();
        (sb.extent_block, sb.extent_count)
    };
    if block == INVALID_BLOCK {
        // The layer crashed before it was ever checkpointed
        assert!(!fs.is_root());
        return Ok(());
    }
    let root = fs.is_root();
    let mut list = ExtentList::new();
    let mut blocks = 0u64;
    let mut chain = block;
    let mut ecount = 0u64;
    let mut buf = new_block();
    while chain != INVALID_BLOCK {
        fs.read_block(gfs, chain, &mut buf[..])?;
        let eblock: DExtentBlock = read_struct(&buf[..]);
        if eblock.magic != EXTENT_MAGIC {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        crc32::verify_block_crc(&buf[..], CHAIN_CRC_OFFSET)?;
        for i in 0..EXTENT_BLOCK_ENTRIES {
            let e = eblock.extents[i];
            let estart = e.start;
            let ecnt = e.count;
            if estart == 0 || ecnt == 0 {
                break;
            }
            list.add(estart, 0, ecnt);
            blocks += ecnt;
        }
        chain = eblock.next;
        ecount += 1;
    }
    assert_eq!(ecount, expected);
    if root {
        let sb = gfs.sb.lock().unwrap();
        assert_eq!(blocks + sb.blocks, sb.tblocks);
        drop(sb);
        gfs.galloc.lock().unwrap().extents = list;
    } else {
        fs.alloc.lock().unwrap().aextents = list;
        fs.blocks.store(blocks, Ordering::Relaxed);
    }
    Ok(())
}
