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

//! Directories: a linear entry list for small directories, a fixed-size
//! hash table keyed by a prefix of the name for large ones.

use crate::crc32;
use crate::inode::Inode;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::layout::*;
use std::io;

/// Directory size at which the linear list is converted to a hash table.
pub const DIRCACHE_MIN: u64 = 32;
/// Number of buckets of a hashed directory.
pub const DIRCACHE_SIZE: usize = 512;
/// Number of leading name bytes included in the hash.
pub const DIRHASH_LEN: usize = 10;

/// One directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    /// Inode number.
    pub ino: u64,
    /// File type bits of the entry.
    pub mode: u32,
    /// Position of the entry, used as the stable readdir cookie.
    pub index: u32,
    /// Name of the entry.
    pub name: Box<str>,
}

/// Hash of the first [`DIRHASH_LEN`] bytes of a name.
fn name_hash(name: &str) -> usize {
    let mut hash = 0u32;
    for b in name.bytes().take(DIRHASH_LEN) {
        hash = hash.wrapping_mul(31).wrapping_add(b as u32);
    }
    hash as usize % DIRCACHE_SIZE
}

/// In-core form of a directory.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    /// Entry lists. One list while linear, [`DIRCACHE_SIZE`] once hashed.
    buckets: Vec<Vec<Dirent>>,
    /// Count of entries.
    count: u64,
    /// Next readdir cookie to hand out.
    next_index: u32,
}

impl Directory {
    /// Creates an empty directory in linear form.
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new()],
            count: 0,
            next_index: 0,
        }
    }

    /// Tells whether the directory uses the hashed form.
    pub fn hashed(&self) -> bool {
        self.buckets.len() > 1
    }

    fn bucket(&self, name: &str) -> usize {
        if self.hashed() { name_hash(name) } else { 0 }
    }

    /// Converts the linear list into the hashed form.
    pub fn convert_hashed(&mut self) {
        if self.hashed() {
            return;
        }
        let entries = std::mem::take(&mut self.buckets[0]);
        self.buckets = (0..DIRCACHE_SIZE).map(|_| Vec::new()).collect();
        for dirent in entries {
            let bucket = name_hash(&dirent.name);
            self.buckets[bucket].push(dirent);
        }
    }

    /// Adds the entry `name` pointing at `ino`.
    pub fn add(&mut self, ino: u64, mode: u32, name: &str) {
        assert!(ino > ROOT_INODE);
        self.next_index += 1;
        let index = self.next_index;
        let bucket = self.bucket(name);
        self.buckets[bucket].push(Dirent {
            ino,
            mode: mode & libc::S_IFMT,
            index,
            name: Box::from(name),
        });
        self.count += 1;
        if !self.hashed() && self.count >= DIRCACHE_MIN {
            self.convert_hashed();
        }
    }

    /// Looks up the entry with the given name.
    pub fn lookup(&self, name: &str) -> Option<&Dirent> {
        let len = name.len();
        self.buckets[self.bucket(name)]
            .iter()
            .find(|d| d.name.len() == len && &*d.name == name)
    }

    /// Removes the entry with the given name and returns it.
    pub fn remove(&mut self, name: &str) -> Option<Dirent> {
        let bucket = self.bucket(name);
        let pos = self.buckets[bucket].iter().position(|d| &*d.name == name)?;
        self.count -= 1;
        Some(self.buckets[bucket].remove(pos))
    }

    /// Renames the entry of `ino` from `name` to `newname`, keeping its
    /// cookie.
    pub fn rename(&mut self, ino: u64, name: &str, newname: &str) {
        let bucket = self.bucket(name);
        let pos = self.buckets[bucket]
            .iter()
            .position(|d| d.ino == ino && &*d.name == name)
            .expect("renamed entry missing");
        let mut dirent = self.buckets[bucket].remove(pos);
        dirent.name = Box::from(newname);
        let bucket = self.bucket(newname);
        self.buckets[bucket].push(dirent);
    }

    /// Count of entries.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Iterates over all entries. Bucket-ordered in the hashed form.
    pub fn iter(&self) -> impl Iterator<Item = &Dirent> {
        self.buckets.iter().flatten()
    }

    /// Returns up to `max` entries with a cookie greater than `off`, in
    /// cookie order.
    pub fn read_from(&self, off: u64, max: usize) -> Vec<Dirent> {
        let mut entries: Vec<Dirent> = self
            .iter()
            .filter(|d| d.index as u64 > off)
            .cloned()
            .collect();
        entries.sort_by_key(|d| d.index);
        entries.truncate(max);
        entries
    }
}

/// Flushes a directory's entries as a chain of directory blocks. The
/// directory inode's chain start and size are updated.
pub fn dir_flush(gfs: &Gfs, fs: &Layer, dir: &mut Inode) -> io::Result<()> {
    use crate::inode::InodeFlags;
    assert!(dir.is_dir());
    if dir.flags.contains(InodeFlags::REMOVED) {
        dir.flags.remove(InodeFlags::DIRDIRTY);
        return Ok(());
    }
    // Pack entries densely into block images
    let mut blocks: Vec<BlockBuf> = Vec::new();
    let mut buf = new_block();
    let mut off = BLOCK_HEADER_SIZE;
    let mut subdirs = 2u32;
    for dirent in dir.dir().iter() {
        let dsize = MIN_DIRENT_SIZE + dirent.name.len();
        if off + dsize > BLOCK_SIZE {
            blocks.push(std::mem::replace(&mut buf, new_block()));
            off = BLOCK_HEADER_SIZE;
        }
        let head = DDirent {
            ino: dirent.ino,
            dtype: (dirent.mode >> 12) as u16,
            len: dirent.name.len() as u16,
        };
        write_struct(&mut buf[off..], &head);
        buf[off + MIN_DIRENT_SIZE..off + dsize].copy_from_slice(dirent.name.as_bytes());
        off += dsize;
        if dirent.mode & libc::S_IFMT == libc::S_IFDIR {
            subdirs += 1;
        }
    }
    if off > BLOCK_HEADER_SIZE {
        blocks.push(buf);
    }
    let count = blocks.len() as u64;
    let mut start = INVALID_BLOCK;
    if count > 0 {
        start = crate::alloc::block_alloc_exact(gfs, fs, count)?;
        for (i, block) in blocks.iter_mut().enumerate() {
            let header = DBlockHeader {
                magic: DIR_MAGIC,
                crc: 0,
                next: if i as u64 == count - 1 {
                    INVALID_BLOCK
                } else {
                    start + i as u64 + 1
                },
            };
            write_struct(&mut block[..], &header);
            crc32::update_block_crc(&mut block[..], CHAIN_CRC_OFFSET);
        }
        let bufs: Vec<&[u8]> = blocks.iter().map(|b| &b[..]).collect();
        fs.write_blocks(gfs, &bufs, start)?;
    }
    // Release the previous chain and remember the new one
    crate::alloc::replace_meta_blocks(fs, &mut dir.meta_extents, start, count);
    dir.dino.emapdir = start;
    assert_eq!(dir.dino.nlink, subdirs);
    dir.dino.blocks = count as u32;
    dir.dino.size = count * BLOCK_SIZE as u64;
    dir.flags.remove(InodeFlags::DIRDIRTY);
    dir.flags.insert(InodeFlags::DIRTY);
    Ok(())
}

/// Reads a directory's entries back from its block chain.
pub fn dir_read(gfs: &Gfs, fs: &Layer, dir: &mut Inode) -> io::Result<()> {
    assert!(dir.is_dir());
    let mut block = dir.dino.emapdir;
    let mut buf = new_block();
    let mut directory = Directory::new();
    let mut subdirs = 2u32;
    while block != INVALID_BLOCK {
        dir.meta_extents.add(block, 0, 1);
        fs.read_block(gfs, block, &mut buf[..])?;
        let header: DBlockHeader = read_struct(&buf[..]);
        if header.magic != DIR_MAGIC {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        crc32::verify_block_crc(&buf[..], CHAIN_CRC_OFFSET)?;
        let mut off = BLOCK_HEADER_SIZE;
        while off + MIN_DIRENT_SIZE <= BLOCK_SIZE {
            let head: DDirent = read_struct(&buf[off..]);
            if head.ino == 0 {
                break;
            }
            let len = head.len as usize;
            if off + MIN_DIRENT_SIZE + len > BLOCK_SIZE {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            let name = String::from_utf8_lossy(&buf[off + MIN_DIRENT_SIZE..][..len]).into_owned();
            let mode = (head.dtype as u32) << 12;
            directory.add(head.ino, mode, &name);
            if mode & libc::S_IFMT == libc::S_IFDIR {
                subdirs += 1;
            }
            off += MIN_DIRENT_SIZE + len;
        }
        block = header.next;
    }
    assert_eq!(dir.dino.nlink, subdirs);
    dir.data = crate::inode::InodeData::Dir(std::sync::Arc::new(directory));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_lookup_remove() {
        let mut dir = Directory::new();
        dir.add(10, libc::S_IFREG | 0o644, "a");
        dir.add(11, libc::S_IFDIR | 0o755, "b");
        assert_eq!(dir.count(), 2);
        assert_eq!(dir.lookup("a").unwrap().ino, 10);
        assert_eq!(dir.lookup("b").unwrap().mode, libc::S_IFDIR);
        assert!(dir.lookup("c").is_none());
        let removed = dir.remove("a").unwrap();
        assert_eq!(removed.ino, 10);
        assert!(dir.lookup("a").is_none());
        assert_eq!(dir.count(), 1);
    }

    #[test]
    fn conversion_to_hashed_keeps_entries() {
        let mut dir = Directory::new();
        for i in 0..DIRCACHE_MIN + 5 {
            dir.add(10 + i, libc::S_IFREG, &format!("file-{i}"));
        }
        assert!(dir.hashed());
        for i in 0..DIRCACHE_MIN + 5 {
            assert_eq!(dir.lookup(&format!("file-{i}")).unwrap().ino, 10 + i);
        }
    }

    #[test]
    fn rename_keeps_cookie() {
        let mut dir = Directory::new();
        dir.add(10, libc::S_IFREG, "old");
        let index = dir.lookup("old").unwrap().index;
        dir.rename(10, "old", "new-and-longer-name");
        let dirent = dir.lookup("new-and-longer-name").unwrap();
        assert_eq!(dirent.index, index);
        assert!(dir.lookup("old").is_none());
    }

    #[test]
    fn readdir_cookies_are_stable() {
        let mut dir = Directory::new();
        dir.add(10, libc::S_IFREG, "a");
        dir.add(11, libc::S_IFREG, "b");
        dir.add(12, libc::S_IFREG, "c");
        let first = dir.read_from(0, 2);
        assert_eq!(first.len(), 2);
        let rest = dir.read_from(first[1].index as u64, 10);
        assert_eq!(rest.len(), 1);
        assert_eq!(&*rest[0].name, "c");
        // Removal does not disturb remaining cookies
        dir.remove("b");
        let rest = dir.read_from(first[0].index as u64, 10);
        assert_eq!(rest.len(), 1);
        assert_eq!(&*rest[0].name, "c");
    }
}
