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

//! Dirty pages of regular files and their writeback.

use crate::bcache::PageData;
use crate::emap;
use crate::extent::ExtentList;
use crate::inode::Inode;
use crate::inode::InodeData;
use crate::inode::InodeFlags;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::layout::BLOCK_SIZE;
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Maximum number of blocks grouped in a single write request.
pub const WRITE_CLUSTER_SIZE: usize = 256;

/// Maximum number of blocks grouped in a single read request.
pub const READ_CLUSTER_SIZE: usize = 32;

/// Initial size of a file's dirty page table.
pub const PAGECACHE_SIZE: usize = 32;

/// Dirty pages a single file may accumulate before a flush is forced.
pub const MAX_FILE_DIRTYPAGES: u32 = 131072;

/// Dirty pages a layer may accumulate before the flusher kicks in.
pub const MAX_LAYER_DIRTYPAGES: u64 = 524288;

/// A dirty page: a block-sized buffer of which `[poffset, poffset+psize)`
/// holds valid data.
#[derive(Debug)]
pub struct DPage {
    /// The page contents.
    pub data: PageData,
    /// Offset at which valid data starts.
    pub poffset: u16,
    /// Size of valid data starting at `poffset`.
    pub psize: u16,
}

/// Dirty page table of a file, indexed by file page number. Grown in
/// power-of-two steps.
#[derive(Debug, Default)]
pub struct DirtyPages {
    pages: Vec<Option<DPage>>,
    dcount: u32,
}

impl DirtyPages {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of dirty pages held.
    pub fn dirty_count(&self) -> u32 {
        self.dcount
    }

    /// Size of the table.
    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    /// Returns the dirty page `pg`, if present.
    pub fn get(&self, pg: u64) -> Option<&DPage> {
        self.pages.get(pg as usize).and_then(|p| p.as_ref())
    }

    fn get_mut(&mut self, pg: u64) -> Option<&mut DPage> {
        self.pages.get_mut(pg as usize).and_then(|p| p.as_mut())
    }

    /// Grows the table to cover page `lpage`.
    fn grow(&mut self, lpage: u64) {
        let needed = lpage as usize + 1;
        if self.pages.len() >= needed {
            return;
        }
        let mut count = if self.pages.is_empty() {
            PAGECACHE_SIZE
        } else {
            self.pages.len() * 2
        };
        while count < needed {
            count *= 2;
        }
        self.pages.resize_with(count, || None);
    }

    /// Installs a page into an empty slot.
    fn install(&mut self, pg: u64, page: DPage) {
        assert!(self.pages[pg as usize].is_none());
        self.pages[pg as usize] = Some(page);
        self.dcount += 1;
    }

    /// Takes the dirty page `pg` out of the table.
    fn take(&mut self, pg: u64) -> Option<DPage> {
        let page = self.pages.get_mut(pg as usize).and_then(|p| p.take());
        if page.is_some() {
            assert!(self.dcount > 0);
            self.dcount -= 1;
        }
        page
    }
}

/// Splits a write into per-page buffers. Runs without the inode lock, so
/// the expensive copies do not serialise writers.
pub fn copy_pages(gfs: &Gfs, off: u64, data: &[u8]) -> Vec<DPage> {
    let mut pages = Vec::with_capacity(data.len() / BLOCK_SIZE + 2);
    let mut pos = 0usize;
    while pos < data.len() {
        let poffset = if pos == 0 {
            (off % BLOCK_SIZE as u64) as usize
        } else {
            0
        };
        let psize = (BLOCK_SIZE - poffset).min(data.len() - pos);
        let mut buf = PageData::new(&gfs.mem);
        buf[poffset..poffset + psize].copy_from_slice(&data[pos..pos + psize]);
        pages.push(DPage {
            data: buf,
            poffset: poffset as u16,
            psize: psize as u16,
        });
        pos += psize;
    }
    pages
}

/// Completes a partial dirty page from the file's on-disk block, or zero
/// fills the missing ranges when the page is a hole.
fn fill_page(gfs: &Gfs, fs: &Layer, inode: &mut Inode, pg: u64) -> io::Result<()> {
    let (poffset, psize) = match inode.pages_mut().get(pg) {
        Some(p) => (p.poffset as usize, p.psize as usize),
        None => return Ok(()),
    };
    if poffset == 0 && psize == BLOCK_SIZE {
        return Ok(());
    }
    let size = inode.dino.size;
    // Only read the device when the page has disk data worth keeping
    let disk = if poffset != 0 || (pg * BLOCK_SIZE as u64 + psize as u64) < size {
        match emap_lookup_inode(inode, pg) {
            Some(block) => {
                let page = fs.bcache.get(&gfs.device, block, true)?;
                let data = page.data().unwrap();
                fs.bcache.release(page, true);
                Some(data)
            }
            None => None,
        }
    } else {
        None
    };
    let dpage = inode.pages_mut().get_mut(pg).unwrap();
    match &disk {
        Some(data) => {
            dpage.data[..poffset].copy_from_slice(&data[..poffset]);
            let tail = poffset + psize;
            let eof = if pg == size / BLOCK_SIZE as u64 {
                (size % BLOCK_SIZE as u64) as usize
            } else {
                0
            };
            if eof != 0 {
                // Beyond the end of the file the page reads as zeroes
                assert!(eof >= tail);
                dpage.data[eof..].fill(0);
                dpage.data[tail..eof].copy_from_slice(&data[tail..eof]);
            } else {
                dpage.data[tail..].copy_from_slice(&data[tail..]);
            }
        }
        None => {
            dpage.data[..poffset].fill(0);
            dpage.data[poffset + psize..].fill(0);
        }
    }
    dpage.poffset = 0;
    dpage.psize = BLOCK_SIZE as u16;
    Ok(())
}

/// Emap lookup helper usable while the page table is borrowed.
fn emap_lookup_inode(inode: &Inode, pg: u64) -> Option<u64> {
    emap::emap_lookup(inode, pg)
}

/// Merges the new page into the table, filling gaps from disk when the
/// write does not line up with what is already dirty. Returns 1 when a
/// new dirty page was installed.
fn merge_page(gfs: &Gfs, fs: &Layer, inode: &mut Inode, pg: u64, new: DPage) -> io::Result<u32> {
    let poffset = new.poffset as usize;
    let psize = new.psize as usize;
    assert!(poffset < BLOCK_SIZE);
    assert!(psize > 0 && psize <= BLOCK_SIZE);
    assert!(!inode.flags.contains(InodeFlags::SHARED));
    if inode.pages_mut().get(pg).is_none() {
        inode.pages_mut().install(pg, new);
        return Ok(1);
    }
    let (doffset, dsize) = {
        let d = inode.pages_mut().get(pg).unwrap();
        (d.poffset as usize, d.psize as usize)
    };
    let partial = doffset != 0 || dsize != BLOCK_SIZE;
    let same_range = poffset == doffset && poffset + psize == doffset + dsize;
    if partial && !same_range {
        // Disjoint ranges force a read-modify fill; overlapping or touching
        // ranges just widen the valid span
        let disjoint =
            poffset + psize < doffset || poffset > doffset + dsize;
        if disjoint {
            fill_page(gfs, fs, inode, pg)?;
        } else {
            let begin = poffset.min(doffset);
            let end = (poffset + psize).max(doffset + dsize);
            let dpage = inode.pages_mut().get_mut(pg).unwrap();
            dpage.poffset = begin as u16;
            dpage.psize = (end - begin) as u16;
        }
    }
    let dpage = inode.pages_mut().get_mut(pg).unwrap();
    dpage.data[poffset..poffset + psize].copy_from_slice(&new.data[poffset..poffset + psize]);
    Ok(0)
}

/// Links the copied-in pages of a write to the inode.
///
/// Arguments:
/// - `off` and `size` describe the write.
/// - `dpages` are the buffers produced by [`copy_pages`].
///
/// Returns the number of pages newly accounted dirty.
pub fn add_pages(
    gfs: &Gfs,
    fs: &Layer,
    inode: &mut Inode,
    off: u64,
    size: u64,
    dpages: Vec<DPage>,
) -> io::Result<u32> {
    assert!(inode.is_reg());
    let spage = off / BLOCK_SIZE as u64;
    if off + size > inode.dino.size {
        inode.dino.size = off + size;
    }
    if inode.flags.contains(InodeFlags::SHARED) {
        emap::copy_emap(inode);
    }
    let lpage = (inode.dino.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
    inode.pages_mut().grow(lpage);
    let mut added = 0;
    for (i, page) in dpages.into_iter().enumerate() {
        added += merge_page(gfs, fs, inode, spage + i as u64, page)?;
        if inode.pages_mut().dirty_count() >= MAX_FILE_DIRTYPAGES
            && !inode.flags.contains(InodeFlags::TMP)
        {
            flush_pages(gfs, fs, inode, false)?;
        }
    }
    if added > 0 {
        fs.pcount.fetch_add(added as u64, Ordering::Relaxed);
        gfs.dirty_pages.fetch_add(added as u64, Ordering::Relaxed);
    }
    Ok(added)
}

/// Returns a copy of the bytes of the dirty page `pg`, completing partial
/// pages first.
pub fn read_dirty_page(
    gfs: &Gfs,
    fs: &Layer,
    inode: &mut Inode,
    pg: u64,
) -> io::Result<Option<Arc<PageData>>> {
    if inode.pages_mut().get(pg).is_none() {
        return Ok(None);
    }
    fill_page(gfs, fs, inode, pg)?;
    let dpage = inode.pages_mut().get(pg).unwrap();
    let mut copy = PageData::new(&gfs.mem);
    copy.copy_from_slice(&dpage.data[..]);
    Ok(Some(Arc::new(copy)))
}

/// Queues written pages for the layer's cluster writeback, flushing when a
/// cluster accumulated.
pub fn add_pages_for_writeback(
    gfs: &Gfs,
    fs: &Layer,
    batch: Vec<(u64, Arc<PageData>)>,
) -> io::Result<()> {
    let flush = {
        let mut pending = fs.pending.lock().unwrap();
        pending.extend(batch);
        pending.len() >= WRITE_CLUSTER_SIZE
    };
    if flush {
        flush_dirty_pages(gfs, fs)?;
    }
    Ok(())
}

/// Writes out the layer's pending page cluster, in block order, grouping
/// contiguous runs into single scatter/gather writes. Written pages are
/// installed into the block cache.
pub fn flush_dirty_pages(gfs: &Gfs, fs: &Layer) -> io::Result<()> {
    let mut batch = {
        let mut pending = fs.pending.lock().unwrap();
        std::mem::take(&mut *pending)
    };
    if batch.is_empty() {
        return Ok(());
    }
    batch.sort_by_key(|(block, _)| *block);
    let mut i = 0;
    while i < batch.len() {
        let mut j = i + 1;
        while j < batch.len()
            && batch[j].0 == batch[j - 1].0 + 1
            && j - i < WRITE_CLUSTER_SIZE
        {
            j += 1;
        }
        let bufs: Vec<&[u8]> = batch[i..j].iter().map(|(_, d)| &d[..][..]).collect();
        fs.write_blocks(gfs, &bufs, batch[i].0)?;
        i = j;
    }
    for (block, data) in batch {
        fs.bcache.insert_written(block, data);
    }
    Ok(())
}

/// Flushes the dirty pages of a file.
///
/// Contiguously allocated files keep (or extend) the single-extent form;
/// everything else goes through the emap. With `release` set the page
/// table itself is freed afterwards.
pub fn flush_pages(gfs: &Gfs, fs: &Layer, inode: &mut Inode, release: bool) -> io::Result<()> {
    assert!(inode.is_reg());
    // A cloned file which was never written has no dirty pages; its
    // shared emap flushes as is
    if inode.pages_mut().dirty_count() == 0 || inode.dino.size == 0 {
        if release {
            *inode.pages_mut() = DirtyPages::new();
        }
        return Ok(());
    }
    assert!(!inode.flags.contains(InodeFlags::SHARED));
    let lpage = (inode.dino.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64 - 1;

    // Decide whether the whole file can sit in one run on disk
    let mut bcount = 0u64;
    let mut start = lpage;
    let mut end = 0u64;
    let mut single = true;
    let mut ended = false;
    for i in 0..=lpage {
        if inode.pages_mut().get(i).is_some() {
            if ended {
                single = false;
            }
            bcount += 1;
            start = start.min(i);
            end = i;
        } else {
            if single && emap::emap_lookup(inode, i).is_some() {
                single = false;
            }
            ended = true;
        }
    }
    assert!(bcount > 0);

    // Complete partial pages while the old mapping is still in place
    for i in start..=end {
        fill_page(gfs, fs, inode, i)?;
    }

    // Allocate, settling for smaller runs on fragmentation
    let mut rcount = bcount;
    let mut block = loop {
        match crate::alloc::block_alloc(gfs, fs, rcount, true) {
            Some(block) => break block,
            None => {
                rcount /= 2;
                if rcount == 0 {
                    return Err(io::Error::from_raw_os_error(libc::ENOSPC));
                }
            }
        }
    };
    if rcount != bcount {
        single = false;
    }

    let mut freed = ExtentList::new();
    if single {
        // The run replaces the whole mapping of the file
        assert_eq!(start, 0);
        if inode.dino.extent_length > 0 {
            freed.add(inode.dino.emapdir, 0, inode.dino.extent_length as u64);
        } else {
            let old: Vec<crate::extent::Extent> = match &inode.data {
                InodeData::File { emap: Some(emap), .. } => emap.iter().copied().collect(),
                _ => Vec::new(),
            };
            for e in old {
                freed.add(e.block, 0, e.count);
            }
            if let InodeData::File { emap, .. } = &mut inode.data {
                *emap = None;
            }
        }
        inode.dino.emapdir = block;
        inode.dino.extent_length = bcount as u32;
        inode.dino.blocks = bcount as u32;
    } else if start == inode.dino.extent_length as u64
        && bcount == rcount
        && start + bcount - 1 == end
        && inode.dino.extent_length > 0
        && block == inode.dino.emapdir + inode.dino.extent_length as u64
        && !matches!(&inode.data, InodeData::File { emap: Some(_), .. })
    {
        // The run landed right after the existing extent: the file stays
        // in single extent form
        single = true;
        inode.dino.extent_length += bcount as u32;
        inode.dino.blocks += bcount as u32;
    } else if inode.dino.extent_length > 0 {
        emap::expand_emap(inode);
    }

    // Hand the pages their blocks and queue the writes
    let mut count = 0u64;
    let mut tcount = 0u64;
    let mut batch: Vec<(u64, Arc<PageData>)> = Vec::new();
    for i in start..=end {
        if count == rcount && bcount > tcount {
            assert!(!single);
            add_pages_for_writeback(gfs, fs, std::mem::take(&mut batch))?;
            rcount = bcount - tcount;
            block = loop {
                match crate::alloc::block_alloc(gfs, fs, rcount, true) {
                    Some(block) => break block,
                    None => {
                        rcount /= 2;
                        if rcount == 0 {
                            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
                        }
                    }
                }
            };
            count = 0;
        }
        let Some(dpage) = inode.pages_mut().take(i) else {
            continue;
        };
        assert_eq!(dpage.poffset, 0);
        assert_eq!(dpage.psize as usize, BLOCK_SIZE);
        assert!(count < rcount);
        let target = block + count;
        if !single {
            emap::emap_update(inode, i, target, 1, &mut freed);
        }
        batch.push((target, Arc::new(dpage.data)));
        count += 1;
        tcount += 1;
        if batch.len() >= WRITE_CLUSTER_SIZE {
            add_pages_for_writeback(gfs, fs, std::mem::take(&mut batch))?;
        }
    }
    if !batch.is_empty() {
        add_pages_for_writeback(gfs, fs, batch)?;
    }
    assert_eq!(bcount, tcount);
    assert_eq!(inode.pages_mut().dirty_count(), 0);
    if release {
        *inode.pages_mut() = DirtyPages::new();
    }
    if !freed.is_empty() {
        crate::alloc::free_inode_data_blocks(gfs, fs, inode.dino.private(), freed);
    }
    fs.pcount.fetch_sub(tcount, Ordering::Relaxed);
    gfs.dirty_pages.fetch_sub(tcount, Ordering::Relaxed);
    inode.mark_dirty(InodeFlags::DIRTY);
    Ok(())
}

/// Truncates the file to `size`, dropping dirty pages past the new end and
/// zero-trimming a partial tail page. With `remove` set, disk blocks past
/// the end are freed.
pub fn trunc_pages(gfs: &Gfs, fs: &Layer, inode: &mut Inode, size: u64, remove: bool) {
    let pg = size / BLOCK_SIZE as u64;
    let poffset = (size % BLOCK_SIZE as u64) as usize;
    let had_blocks = inode.dino.extent_length > 0
        || matches!(&inode.data, InodeData::File { emap: Some(_), .. });
    if !had_blocks && inode.pages_mut().capacity() == 0 {
        assert!(!inode.flags.contains(InodeFlags::SHARED));
        if remove {
            assert_eq!(inode.dino.blocks, 0);
            inode.dino.set_private(true);
        }
        return;
    }
    if inode.flags.contains(InodeFlags::SHARED) {
        assert_eq!(inode.pages_mut().dirty_count(), 0);
        if size == 0 {
            // Nothing inherited survives; the layer starts from scratch
            if remove {
                inode.dino.blocks = 0;
                inode.dino.extent_length = 0;
                inode.dino.emapdir = crate::layout::INVALID_BLOCK;
                inode.flags.remove(InodeFlags::SHARED);
                inode.dino.set_private(true);
            }
            let InodeData::File { emap, pages } = &mut inode.data else {
                panic!("not a regular file");
            };
            *emap = None;
            *pages = DirtyPages::new();
            return;
        }
        emap::copy_emap(inode);
    }
    assert!(!inode.flags.contains(InodeFlags::SHARED));
    let freed = emap::emap_truncate(inode, size, remove);
    if !freed.is_empty() {
        crate::alloc::free_inode_data_blocks(gfs, fs, inode.dino.private(), freed);
    }

    // Drop dirty pages past the new end
    let mut dropped = 0u64;
    let capacity = inode.pages_mut().capacity() as u64;
    for i in pg..capacity {
        if i == pg && poffset != 0 {
            // Trim the partial tail page in place
            if let Some(dpage) = inode.pages_mut().get_mut(i) {
                let doffset = dpage.poffset as usize;
                let dend = doffset + dpage.psize as usize;
                if dend > poffset {
                    if doffset >= poffset {
                        dpage.poffset = 0;
                        dpage.psize = 0;
                    } else {
                        dpage.psize = (poffset - doffset) as u16;
                    }
                }
            }
            continue;
        }
        if inode.pages_mut().take(i).is_some() {
            dropped += 1;
        }
    }
    if dropped > 0 {
        fs.pcount.fetch_sub(dropped, Ordering::Relaxed);
        gfs.dirty_pages.fetch_sub(dropped, Ordering::Relaxed);
    }
    if size == 0 {
        assert_eq!(inode.pages_mut().dirty_count(), 0);
        *inode.pages_mut() = DirtyPages::new();
    }
}
