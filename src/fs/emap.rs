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

//! Extent maps of regular files.
//!
//! Short, contiguous files keep a single `(block, length)` pair inline in
//! the disk inode. Fragmented files carry a list of `(page, block, count)`
//! extents, flushed as a chain of emap blocks.

use crate::crc32;
use crate::extent::ExtentList;
use crate::inode::Inode;
use crate::inode::InodeData;
use crate::inode::InodeFlags;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::layout::*;
use std::io;
use std::sync::Arc;

/// Looks up the device block holding the file page `page`. `None` is a
/// hole.
pub fn emap_lookup(inode: &Inode, page: u64) -> Option<u64> {
    // A file with a single direct extent occupies consecutive blocks
    if inode.dino.extent_length > 0 {
        if page < inode.dino.extent_length as u64 {
            return Some(inode.dino.emapdir + page);
        }
        return None;
    }
    match &inode.data {
        InodeData::File { emap: Some(emap), .. } => emap.lookup(page),
        _ => None,
    }
}

/// Converts the single direct extent into an emap list, so individual
/// pages can be remapped.
pub fn expand_emap(inode: &mut Inode) {
    assert!(inode.is_reg());
    assert_eq!(inode.dino.blocks, inode.dino.extent_length);
    let start = inode.dino.emapdir;
    let length = inode.dino.extent_length as u64;
    let InodeData::File { emap, .. } = &mut inode.data else {
        panic!("not a regular file");
    };
    assert!(emap.is_none());
    let mut list = ExtentList::new();
    if length > 0 {
        list.add_emap(0, start, length);
    }
    *emap = Some(Arc::new(list));
    inode.dino.emapdir = INVALID_BLOCK;
    inode.dino.extent_length = 0;
    inode.mark_dirty(InodeFlags::EMAPDIRTY);
}

/// Unshares an emap inherited from a parent layer inode, cloning the
/// extents into this inode.
pub fn copy_emap(inode: &mut Inode) {
    assert!(inode.is_reg());
    assert_eq!(inode.dino.extent_length, 0);
    if !inode.flags.contains(InodeFlags::SHARED) {
        return;
    }
    let InodeData::File { emap, .. } = &mut inode.data else {
        panic!("not a regular file");
    };
    if let Some(shared) = emap {
        // Drops the alias; clones only if the parent still holds it
        Arc::make_mut(shared);
    }
    inode.flags.remove(InodeFlags::SHARED);
}

/// Returns the inode's own emap list, creating an empty one if needed.
/// The inode must not be in single-extent form and must not be shared.
fn own_emap(inode: &mut Inode) -> &mut ExtentList {
    assert!(!inode.flags.contains(InodeFlags::SHARED));
    assert_eq!(inode.dino.extent_length, 0);
    let InodeData::File { emap, .. } = &mut inode.data else {
        panic!("not a regular file");
    };
    Arc::make_mut(emap.get_or_insert_with(|| Arc::new(ExtentList::new())))
}

/// Maps `pcount` file pages starting at `pstart` to the freshly allocated
/// blocks starting at `bstart`. Blocks of overwritten older mappings are
/// collected into `freed`.
pub fn emap_update(
    inode: &mut Inode,
    pstart: u64,
    bstart: u64,
    pcount: u64,
    freed: &mut ExtentList,
) {
    assert!(pcount > 0);
    let emap = own_emap(inode);
    let mut removed = 0u64;
    for page in pstart..pstart + pcount {
        if let Some(old) = emap.lookup(page) {
            let taken = emap.remove(page, 1);
            assert_eq!(taken, 1);
            freed.add(old, 0, 1);
            removed += 1;
        }
    }
    emap.add_emap(pstart, bstart, pcount);
    inode.dino.blocks += (pcount - removed) as u32;
}

/// Truncates the emap to the new size `size`, returning the blocks now
/// past the end of the file.
///
/// With `remove` set, blocks past the new end are collected for freeing;
/// otherwise the mappings are dropped without freeing (used when the
/// blocks never belonged to this layer). The tail page of a partial
/// truncate stays mapped; the dirty page table zero-fills it beyond the
/// new end.
pub fn emap_truncate(inode: &mut Inode, size: u64, remove: bool) -> ExtentList {
    let partial = size % BLOCK_SIZE as u64 != 0;
    let pg = size / BLOCK_SIZE as u64;
    let keep = if partial { pg + 1 } else { pg };
    let mut freed = ExtentList::new();

    // A single direct extent is trimmed in place
    if remove && inode.dino.extent_length > 0 {
        let length = inode.dino.extent_length as u64;
        if length > keep {
            freed.add(inode.dino.emapdir + keep, 0, length - keep);
            inode.dino.extent_length = keep as u32;
            inode.dino.blocks -= (length - keep) as u32;
        }
        if inode.dino.extent_length == 0 {
            inode.dino.emapdir = INVALID_BLOCK;
        }
        return freed;
    }

    let has_list = matches!(&inode.data, InodeData::File { emap: Some(_), .. });
    if !has_list {
        return freed;
    }
    if !remove {
        // Drop the mappings without freeing the blocks
        let InodeData::File { emap, .. } = &mut inode.data else {
            unreachable!();
        };
        *emap = None;
        return freed;
    }
    let emap = own_emap(inode);
    let mut bcount = 0u32;
    let extents: Vec<_> = emap.iter().copied().collect();
    for e in extents {
        if e.end() <= keep {
            continue;
        }
        let from = e.start.max(keep);
        let count = e.end() - from;
        let taken = emap.remove(from, count);
        assert_eq!(taken, count);
        freed.add(e.block + (from - e.start), 0, count);
        bcount += count as u32;
    }
    assert!(inode.dino.blocks >= bcount);
    inode.dino.blocks -= bcount;
    if size == 0 {
        assert_eq!(inode.dino.blocks, 0);
        inode.dino.set_private(true);
    }
    freed
}

/// Flushes the emap of an inode, writing dirty pages first so the emap
/// never references unwritten data.
pub fn emap_flush(gfs: &Gfs, fs: &Layer, inode: &mut Inode) -> io::Result<()> {
    assert!(inode.is_reg());
    if inode.flags.contains(InodeFlags::REMOVED) {
        assert_eq!(inode.pages_count(), 0);
        inode.flags.remove(InodeFlags::EMAPDIRTY);
        return Ok(());
    }
    crate::page::flush_pages(gfs, fs, inode, true)?;
    let extents: Vec<crate::extent::Extent> = match &inode.data {
        InodeData::File { emap: Some(emap), .. } => emap.iter().copied().collect(),
        _ => Vec::new(),
    };
    if extents.is_empty() {
        // Single extent form, or an empty file: the disk inode carries it
        inode.flags.remove(InodeFlags::EMAPDIRTY);
        assert!(inode.flags.contains(InodeFlags::DIRTY));
        return Ok(());
    }
    let bcount: u64 = extents.iter().map(|e| e.count).sum();
    assert_eq!(inode.dino.blocks as u64, bcount);

    // Pack the extents into emap block images
    let count = extents.len().div_ceil(EMAP_BLOCK_ENTRIES) as u64;
    let start = crate::alloc::block_alloc_exact(gfs, fs, count)?;
    let mut buf = new_block();
    let mut bufs: Vec<BlockBuf> = Vec::new();
    for (i, chunk) in extents.chunks(EMAP_BLOCK_ENTRIES).enumerate() {
        let mut eblock: DEmapBlock = unsafe { std::mem::zeroed() };
        eblock.magic = EMAP_MAGIC;
        eblock.next = if i as u64 == count - 1 {
            INVALID_BLOCK
        } else {
            start + i as u64 + 1
        };
        for (j, e) in chunk.iter().enumerate() {
            eblock.emap[j] = DEmap {
                page: e.start,
                block: e.block,
                count: e.count as u32,
            };
        }
        write_struct(&mut buf[..], &eblock);
        crc32::update_block_crc(&mut buf[..], CHAIN_CRC_OFFSET);
        bufs.push(std::mem::replace(&mut buf, new_block()));
    }
    let slices: Vec<&[u8]> = bufs.iter().map(|b| &b[..]).collect();
    fs.write_blocks(gfs, &slices, start)?;
    crate::alloc::replace_meta_blocks(fs, &mut inode.meta_extents, start, count);
    inode.dino.emapdir = start;
    inode.flags.remove(InodeFlags::EMAPDIRTY);
    assert!(inode.flags.contains(InodeFlags::DIRTY));
    Ok(())
}

/// Rebuilds the in-core emap from the inode's emap chain.
pub fn emap_read(gfs: &Gfs, fs: &Layer, inode: &mut Inode) -> io::Result<()> {
    assert!(inode.is_reg());
    if inode.dino.size == 0 {
        assert_eq!(inode.dino.blocks, 0);
        assert_eq!(inode.dino.extent_length, 0);
        return Ok(());
    }
    // A single direct extent needs no chain
    if inode.dino.extent_length > 0 {
        assert_eq!(inode.dino.blocks, inode.dino.extent_length);
        assert!(inode.dino.emapdir != 0);
        return Ok(());
    }
    let bcount = inode.dino.blocks;
    let mut found = 0u32;
    let mut list = ExtentList::new();
    let mut block = inode.dino.emapdir;
    let mut buf = new_block();
    while block != INVALID_BLOCK {
        inode.meta_extents.add(block, 0, 1);
        fs.read_block(gfs, block, &mut buf[..])?;
        let eblock: DEmapBlock = read_struct(&buf[..]);
        if eblock.magic != EMAP_MAGIC {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        crc32::verify_block_crc(&buf[..], CHAIN_CRC_OFFSET)?;
        for i in 0..EMAP_BLOCK_ENTRIES {
            let e = eblock.emap[i];
            let eblk = e.block;
            if eblk == 0 {
                break;
            }
            let ecount = e.count;
            assert!(ecount > 0);
            list.add_emap(e.page, eblk, ecount as u64);
            found += ecount;
        }
        block = eblock.next;
    }
    assert_eq!(found, bcount);
    let InodeData::File { emap, .. } = &mut inode.data else {
        panic!("not a regular file");
    };
    *emap = Some(Arc::new(list));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page::DirtyPages;

    fn file_inode() -> Inode {
        let mut inode = Inode {
            dino: unsafe { std::mem::zeroed() },
            block: INVALID_BLOCK,
            flags: InodeFlags::empty(),
            ocount: 0,
            data: InodeData::File {
                emap: None,
                pages: DirtyPages::new(),
            },
            xattrs: None,
            meta_extents: ExtentList::new(),
        };
        inode.dino.mode = libc::S_IFREG | 0o644;
        inode.dino.ino = 20;
        inode.dino.emapdir = INVALID_BLOCK;
        inode
    }

    #[test]
    fn single_extent_lookup() {
        let mut inode = file_inode();
        inode.dino.emapdir = 100;
        inode.dino.extent_length = 4;
        inode.dino.blocks = 4;
        assert_eq!(emap_lookup(&inode, 0), Some(100));
        assert_eq!(emap_lookup(&inode, 3), Some(103));
        assert_eq!(emap_lookup(&inode, 4), None);
    }

    #[test]
    fn expand_turns_extent_into_list() {
        let mut inode = file_inode();
        inode.dino.emapdir = 100;
        inode.dino.extent_length = 4;
        inode.dino.blocks = 4;
        expand_emap(&mut inode);
        assert_eq!(inode.dino.extent_length, 0);
        assert_eq!(emap_lookup(&inode, 2), Some(102));
        assert!(inode.flags.contains(InodeFlags::EMAPDIRTY));
    }

    #[test]
    fn update_replaces_and_frees_overwritten_blocks() {
        let mut inode = file_inode();
        expand_emap(&mut inode);
        let mut freed = ExtentList::new();
        emap_update(&mut inode, 0, 500, 4, &mut freed);
        assert_eq!(inode.dino.blocks, 4);
        assert!(freed.is_empty());
        // Overwrite pages 1..3 with new blocks
        emap_update(&mut inode, 1, 600, 2, &mut freed);
        assert_eq!(inode.dino.blocks, 4);
        assert_eq!(freed.blocks(), 2);
        assert_eq!(emap_lookup(&inode, 0), Some(500));
        assert_eq!(emap_lookup(&inode, 1), Some(600));
        assert_eq!(emap_lookup(&inode, 2), Some(601));
        assert_eq!(emap_lookup(&inode, 3), Some(503));
    }

    #[test]
    fn partial_truncate_keeps_single_extent_form() {
        let mut inode = file_inode();
        inode.dino.emapdir = 1000;
        inode.dino.extent_length = 512;
        inode.dino.blocks = 512;
        inode.dino.size = 512 * BLOCK_SIZE as u64;
        // Truncate to 1 MiB + 100: 256 whole pages plus a partial one
        let size = 256 * BLOCK_SIZE as u64 + 100;
        let freed = emap_truncate(&mut inode, size, true);
        assert_eq!(inode.dino.extent_length, 257);
        assert_eq!(inode.dino.blocks, 257);
        assert_eq!(freed.blocks(), 512 - 257);
        assert_eq!(emap_lookup(&inode, 256), Some(1256));
        assert_eq!(emap_lookup(&inode, 257), None);
    }

    #[test]
    fn truncate_to_zero_frees_everything() {
        let mut inode = file_inode();
        expand_emap(&mut inode);
        let mut freed = ExtentList::new();
        emap_update(&mut inode, 0, 500, 4, &mut freed);
        inode.dino.size = 4 * BLOCK_SIZE as u64;
        let freed = emap_truncate(&mut inode, 0, true);
        assert_eq!(freed.blocks(), 4);
        assert_eq!(inode.dino.blocks, 0);
        assert!(inode.dino.private());
    }

    #[test]
    fn shared_emap_copy_is_idempotent() {
        let mut parent = file_inode();
        expand_emap(&mut parent);
        let mut freed = ExtentList::new();
        emap_update(&mut parent, 0, 500, 4, &mut freed);
        let InodeData::File { emap, .. } = &parent.data else {
            unreachable!();
        };
        let shared = emap.clone();
        let mut child = file_inode();
        child.data = InodeData::File {
            emap: shared,
            pages: DirtyPages::new(),
        };
        child.dino.blocks = 4;
        child.flags.insert(InodeFlags::SHARED);
        copy_emap(&mut child);
        assert!(!child.flags.contains(InodeFlags::SHARED));
        // The parent's map is untouched by child updates
        emap_update(&mut child, 0, 900, 1, &mut freed);
        assert_eq!(emap_lookup(&child, 0), Some(900));
        assert_eq!(emap_lookup(&parent, 0), Some(500));
    }
}
