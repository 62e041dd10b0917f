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

//! Checkpoints and the background flusher, cleaner and syncer threads.
//!
//! A checkpoint flushes dirty state in a fixed order: data pages before a
//! file's emap blocks, emap blocks before its inode block, inode blocks
//! before the inode index, all of it before the layer superblocks, and
//! every layer superblock before the global superblock drops its dirty
//! flag.

use crate::inode;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::layout::*;
use crate::page;
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Seconds between background flusher passes.
pub const FLUSH_INTERVAL: u64 = 120;

/// Seconds between background cleaner passes.
pub const CLEAN_INTERVAL: u64 = 60;

/// Flushes a layer's dirty data and metadata, without touching its
/// superblock.
fn sync_layer_data(gfs: &Gfs, fs: &Arc<Layer>) -> io::Result<()> {
    if fs.removed.load(Ordering::Relaxed) {
        return Ok(());
    }
    if fs.inodes_dirty() {
        inode::sync_inodes(gfs, fs)?;
        fs.clear_inodes_dirty();
    }
    page::flush_dirty_pages(gfs, fs)?;
    crate::alloc::process_layer_blocks(gfs, fs, false, false)?;
    Ok(())
}

/// Gives every dirty layer a fresh superblock location and rewires the
/// on-disk chain pointers from the in-core tree.
fn allocate_super_blocks(gfs: &Gfs) -> io::Result<()> {
    let rfs = gfs.global();
    let layers = gfs.layers_snapshot();
    let others: Vec<&Arc<Layer>> = layers.iter().filter(|fs| !fs.is_root()).collect();
    if !others.is_empty() && (others.iter().any(|fs| fs.super_dirty()) || rfs.super_dirty()) {
        rfs.mark_super_dirty();
        // No reservation refill here: the root layer's reservation was
        // already released for this checkpoint
        let block = crate::alloc::block_alloc(gfs, &rfs, others.len() as u64, false)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSPC))?;
        for (i, fs) in others.iter().enumerate() {
            let old = fs.sblock.swap(block + i as u64, Ordering::Relaxed);
            if old != INVALID_BLOCK {
                crate::alloc::add_freed_blocks(&rfs, old, 1);
            }
            fs.mark_super_dirty();
        }
    }
    // The tree links dictate the on-disk chains
    for fs in &layers {
        let links = *fs.links.lock().unwrap();
        let sblock_of = |index: Option<u32>| -> u64 {
            index
                .and_then(|i| gfs.layer(i))
                .map(|l| l.sblock.load(Ordering::Relaxed))
                .unwrap_or(0)
        };
        let mut sb = fs.sb.lock().unwrap();
        sb.next_layer = sblock_of(links.next);
        sb.child_layer = sblock_of(links.child);
    }
    Ok(())
}

/// Checkpoints the filesystem.
///
/// With `umount` the global superblock is also marked cleanly unmounted.
pub fn checkpoint(gfs: &Gfs, umount: bool) -> io::Result<()> {
    let rfs = gfs.global();
    let layers = gfs.layers_snapshot();

    // Data and metadata of every layer first
    for fs in &layers {
        if fs.is_root() {
            continue;
        }
        if fs.rwlock.try_lock_shared() {
            let result = sync_layer_data(gfs, fs);
            fs.rwlock.unlock_shared();
            result?;
        }
    }
    rfs.rwlock.lock_shared();
    let result = (|| {
        sync_layer_data(gfs, &rfs)?;
        allocate_super_blocks(gfs)?;
        crate::alloc::process_free_extents(gfs, umount)?;

        // Everything must be stable before any superblock points at it
        gfs.device.sync()?;

        // Children precede parents so a superblock never references an
        // unwritten child
        for fs in layers.iter().rev() {
            if fs.is_root() || !fs.super_dirty() {
                continue;
            }
            {
                let mut sb = fs.sb.lock().unwrap();
                sb.flags &= !(SUPER_DIRTY | SUPER_MOUNTED);
                sb.atime = now_secs();
                sb.icount = fs.icount.load(Ordering::Relaxed);
            }
            crate::layer::super_write(gfs, fs)?;
        }

        // The global superblock seals the checkpoint
        {
            let mut sb = gfs.sb.lock().unwrap();
            sb.flags &= !(SUPER_DIRTY | SUPER_MOUNTED);
            if umount {
                sb.unmount_time = now_secs();
            }
        }
        crate::layer::super_write(gfs, &rfs)?;
        gfs.device.sync()?;
        Ok(())
    })();
    rfs.rwlock.unlock_shared();
    gfs.sync_required.store(0, Ordering::Relaxed);
    result
}

/// Current time in seconds since the Epoch.
fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Checkpoints on request from the control plane.
pub fn sync_all_layers(gfs: &Gfs) -> io::Result<()> {
    checkpoint(gfs, false)
}

/// Flushes the dirty files of a layer.
///
/// Files still growing into a partial tail page are left alone unless
/// `all` is set, so sequential writers are not cut mid-page.
pub fn flush_dirty_inode_list(gfs: &Gfs, fs: &Arc<Layer>, all: bool) -> io::Result<()> {
    if fs.removed.load(Ordering::Relaxed) {
        return Ok(());
    }
    for iref in fs.icache.snapshot() {
        if fs.removed.load(Ordering::Relaxed) {
            break;
        }
        let Ok(mut guard) = iref.try_write() else {
            continue;
        };
        if guard.pages_count() == 0 || guard.flags.contains(crate::inode::InodeFlags::REMOVED) {
            continue;
        }
        if !all {
            let lp = guard.dino.size / BLOCK_SIZE as u64;
            let partial_tail = guard
                .pages_mut()
                .get(lp)
                .map(|d| d.poffset != 0 || (d.psize as usize) != BLOCK_SIZE)
                .unwrap_or(false);
            if partial_tail {
                continue;
            }
        }
        page::flush_pages(gfs, fs, &mut guard, true)?;
    }
    page::flush_dirty_pages(gfs, fs)?;
    Ok(())
}

/// The background syncer: checkpoints dirty layers every sync interval.
pub fn syncer(gfs: &Gfs) {
    loop {
        let interval = gfs.sync_interval.load(Ordering::Relaxed).max(1);
        gfs.syncer_wait.wait(Duration::from_secs(interval));
        if gfs.unmounting.load(Ordering::Acquire) {
            break;
        }
        let dirty = gfs.layers_snapshot().iter().any(|fs| fs.super_dirty())
            || gfs.sync_required.load(Ordering::Relaxed) > 0;
        if dirty {
            if let Err(err) = checkpoint(gfs, false) {
                eprintln!("layerfs: checkpoint failed: {err}");
            }
        }
    }
}

/// The background flusher: writes out layers sitting on too many dirty
/// pages.
pub fn flusher(gfs: &Gfs) {
    loop {
        gfs.flusher_wait.wait(Duration::from_secs(FLUSH_INTERVAL));
        if gfs.unmounting.load(Ordering::Acquire) {
            break;
        }
        for fs in gfs.layers_snapshot() {
            let pcount = fs.pcount.load(Ordering::Relaxed);
            if pcount == 0 {
                continue;
            }
            let force = pcount >= page::MAX_LAYER_DIRTYPAGES;
            if fs.rwlock.try_lock_shared() {
                let result = flush_dirty_inode_list(gfs, &fs, force);
                fs.rwlock.unlock_shared();
                if let Err(err) = result {
                    eprintln!("layerfs: flusher failed: {err}");
                }
            }
        }
    }
}

/// The background cleaner: purges clean pages under memory pressure and
/// wakes stalled writers.
pub fn cleaner(gfs: &Gfs) {
    loop {
        gfs.cleaner_wait.wait(Duration::from_secs(CLEAN_INTERVAL));
        if gfs.unmounting.load(Ordering::Acquire) {
            break;
        }
        if !gfs.mem.low() {
            continue;
        }
        if !gfs.mem.start_cleaning() {
            continue;
        }
        let force = gfs.mem.must_wait();
        for fs in gfs.layers_snapshot() {
            // Heavy dirty layers are flushed so their pages can go
            if fs.pcount.load(Ordering::Relaxed) > 0 && fs.rwlock.try_lock_shared() {
                let _ = flush_dirty_inode_list(gfs, &fs, force);
                fs.rwlock.unlock_shared();
            }
            // One purge per tree root
            if fs.links.lock().unwrap().parent.is_none() {
                fs.bcache.purge(force);
            }
            if !gfs.mem.low() {
                break;
            }
        }
        gfs.mem.stop_cleaning();
    }
}

/// Unmounts the filesystem: final checkpoint, then teardown.
pub fn unmount(gfs: &Gfs) -> io::Result<()> {
    gfs.unmounting.store(true, Ordering::Release);
    gfs.syncer_wait.signal();
    gfs.flusher_wait.signal();
    gfs.cleaner_wait.signal();
    checkpoint(gfs, true)?;
    if gfs.config.memstats {
        for fs in gfs.layers_snapshot() {
            fs.mem
                .display(&format!("layer {}", fs.gindex.load(Ordering::Relaxed)));
        }
    }
    Ok(())
}
