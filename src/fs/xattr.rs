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

//! Extended attributes.

use crate::crc32;
use crate::extent::ExtentList;
use crate::inode::Inode;
use crate::inode::InodeFlags;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::layout::*;
use std::io;

/// One extended attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Xattr {
    /// Name of the attribute.
    pub name: Box<str>,
    /// Value of the attribute, if one was given.
    pub value: Option<Box<[u8]>>,
}

/// Extended attribute state of an inode, allocated on first use.
#[derive(Debug, Default)]
pub struct IXattrs {
    /// The attributes.
    pub xattrs: Vec<Xattr>,
    /// Total length of all names with their terminators, for list replies.
    pub xsize: u32,
    /// Blocks of the flushed attribute chain, freed on rewrite.
    pub extents: ExtentList,
}

/// Result of a get/list request sized by the caller's buffer.
#[derive(Debug)]
pub enum XattrReply {
    /// The size a buffer must have, replied when the caller passed none.
    Size(u32),
    /// The attribute value or concatenated name list.
    Data(Vec<u8>),
}

/// Behaviour of [`xattr_add`] when the attribute exists or is missing.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Create or replace.
    Any,
    /// Fail with `EEXIST` if the attribute exists.
    Create,
    /// Fail with `ENODATA` if the attribute is missing.
    Replace,
}

/// Adds or replaces the attribute `name` on the inode.
pub fn xattr_add(
    inode: &mut Inode,
    name: &str,
    value: &[u8],
    mode: SetMode,
) -> io::Result<()> {
    if name.len() >= BLOCK_SIZE || value.len() >= BLOCK_SIZE {
        return Err(io::Error::from_raw_os_error(libc::ERANGE));
    }
    let xd = inode.xattrs.get_or_insert_with(Default::default);
    if let Some(xattr) = xd.xattrs.iter_mut().find(|x| &*x.name == name) {
        if mode == SetMode::Create {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        xattr.value = (!value.is_empty()).then(|| Box::from(value));
    } else {
        if mode == SetMode::Replace {
            return Err(io::Error::from_raw_os_error(libc::ENODATA));
        }
        xd.xattrs.push(Xattr {
            name: Box::from(name),
            value: (!value.is_empty()).then(|| Box::from(value)),
        });
        xd.xsize += name.len() as u32 + 1;
    }
    inode.update_times(false, true);
    inode.mark_dirty(InodeFlags::XATTRDIRTY);
    Ok(())
}

/// Returns the value of the attribute `name`. With `size` zero only the
/// value's size is replied; a too small `size` fails with `ERANGE`.
pub fn xattr_get(inode: &Inode, name: &str, size: usize) -> io::Result<XattrReply> {
    let xd = inode
        .xattrs
        .as_ref()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))?;
    let xattr = xd
        .xattrs
        .iter()
        .find(|x| &*x.name == name)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))?;
    let value = xattr.value.as_deref().unwrap_or(&[]);
    if size == 0 {
        return Ok(XattrReply::Size(value.len() as u32));
    }
    if size < value.len() {
        return Err(io::Error::from_raw_os_error(libc::ERANGE));
    }
    Ok(XattrReply::Data(value.to_vec()))
}

/// Returns the concatenated, null-terminated attribute names. With `size`
/// zero only the total size is replied.
pub fn xattr_list(inode: &Inode, size: usize) -> io::Result<XattrReply> {
    let xsize = inode.xattrs.as_ref().map(|x| x.xsize).unwrap_or(0);
    if size == 0 {
        return Ok(XattrReply::Size(xsize));
    }
    if xsize == 0 {
        return Err(io::Error::from_raw_os_error(libc::ENODATA));
    }
    if size < xsize as usize {
        return Err(io::Error::from_raw_os_error(libc::ERANGE));
    }
    let xd = inode.xattrs.as_ref().unwrap();
    let mut buf = Vec::with_capacity(xsize as usize);
    for xattr in &xd.xattrs {
        buf.extend_from_slice(xattr.name.as_bytes());
        buf.push(0);
    }
    assert_eq!(buf.len(), xsize as usize);
    Ok(XattrReply::Data(buf))
}

/// Removes the attribute `name` from the inode.
pub fn xattr_remove(inode: &mut Inode, name: &str) -> io::Result<()> {
    let xd = inode
        .xattrs
        .as_mut()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))?;
    let pos = xd
        .xattrs
        .iter()
        .position(|x| &*x.name == name)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))?;
    xd.xattrs.remove(pos);
    assert!(xd.xsize >= name.len() as u32 + 1);
    xd.xsize -= name.len() as u32 + 1;
    inode.update_times(false, true);
    inode.mark_dirty(InodeFlags::XATTRDIRTY);
    Ok(())
}

/// Copies the parent inode's attributes onto a freshly cloned inode.
/// Returns true when anything was copied.
pub fn xattr_copy(inode: &mut Inode, parent: &Inode) -> bool {
    let Some(pxd) = parent.xattrs.as_ref() else {
        return false;
    };
    assert!(inode.xattrs.is_none());
    inode.xattrs = Some(Box::new(IXattrs {
        xattrs: pxd.xattrs.clone(),
        xsize: pxd.xsize,
        extents: ExtentList::new(),
    }));
    true
}

/// Flushes the inode's attributes as a chain of xattr blocks.
pub fn xattr_flush(gfs: &Gfs, fs: &Layer, inode: &mut Inode) -> io::Result<()> {
    if inode.flags.contains(InodeFlags::REMOVED) {
        inode.flags.remove(InodeFlags::XATTRDIRTY);
        return Ok(());
    }
    let Some(xd) = inode.xattrs.as_ref() else {
        inode.flags.remove(InodeFlags::XATTRDIRTY);
        return Ok(());
    };
    // Pack attributes densely into block images
    let mut blocks: Vec<BlockBuf> = Vec::new();
    let mut buf = new_block();
    let mut off = BLOCK_HEADER_SIZE;
    for xattr in &xd.xattrs {
        let value = xattr.value.as_deref().unwrap_or(&[]);
        let dsize = std::mem::size_of::<DXattr>() + xattr.name.len() + value.len();
        if off + dsize > BLOCK_SIZE {
            blocks.push(std::mem::replace(&mut buf, new_block()));
            off = BLOCK_HEADER_SIZE;
        }
        let head = DXattr {
            nsize: xattr.name.len() as u16,
            vsize: value.len() as u16,
        };
        write_struct(&mut buf[off..], &head);
        let data = off + std::mem::size_of::<DXattr>();
        buf[data..data + xattr.name.len()].copy_from_slice(xattr.name.as_bytes());
        buf[data + xattr.name.len()..data + xattr.name.len() + value.len()]
            .copy_from_slice(value);
        off += dsize;
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
                magic: XATTR_MAGIC,
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
    let xd = inode.xattrs.as_mut().unwrap();
    crate::alloc::replace_meta_blocks(fs, &mut xd.extents, start, count);
    inode.dino.xattr = start;
    inode.flags.remove(InodeFlags::XATTRDIRTY);
    inode.flags.insert(InodeFlags::DIRTY);
    Ok(())
}

/// Reads the inode's attributes back from its xattr chain.
pub fn xattr_read(gfs: &Gfs, fs: &Layer, inode: &mut Inode) -> io::Result<()> {
    let mut block = inode.dino.xattr;
    if block == INVALID_BLOCK {
        return Ok(());
    }
    gfs.enable_xattrs(fs);
    let mut xd = Box::new(IXattrs::default());
    let mut buf = new_block();
    while block != INVALID_BLOCK {
        xd.extents.add(block, 0, 1);
        fs.read_block(gfs, block, &mut buf[..])?;
        let header: DBlockHeader = read_struct(&buf[..]);
        if header.magic != XATTR_MAGIC {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        crc32::verify_block_crc(&buf[..], CHAIN_CRC_OFFSET)?;
        let mut off = BLOCK_HEADER_SIZE;
        while off + std::mem::size_of::<DXattr>() <= BLOCK_SIZE {
            let head: DXattr = read_struct(&buf[off..]);
            if head.nsize == 0 {
                break;
            }
            let nsize = head.nsize as usize;
            let vsize = head.vsize as usize;
            let data = off + std::mem::size_of::<DXattr>();
            if data + nsize + vsize > BLOCK_SIZE {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            let name = String::from_utf8_lossy(&buf[data..data + nsize]).into_owned();
            let value = (vsize > 0).then(|| Box::from(&buf[data + nsize..data + nsize + vsize]));
            xd.xsize += nsize as u32 + 1;
            xd.xattrs.push(Xattr {
                name: name.into(),
                value,
            });
            off = data + nsize + vsize;
        }
        block = header.next;
    }
    inode.xattrs = Some(xd);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inode::InodeData;
    use crate::page::DirtyPages;

    fn test_inode() -> Inode {
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
        inode.dino.ino = 10;
        inode
    }

    #[test]
    fn create_replace_list_remove() {
        let mut inode = test_inode();
        xattr_add(&mut inode, "user.x", b"1", SetMode::Any).unwrap();
        xattr_add(&mut inode, "user.x", b"22", SetMode::Any).unwrap();
        match xattr_list(&inode, 64).unwrap() {
            XattrReply::Data(names) => assert_eq!(names, b"user.x\0"),
            _ => panic!("expected data"),
        }
        match xattr_get(&inode, "user.x", 16).unwrap() {
            XattrReply::Data(value) => assert_eq!(value, b"22"),
            _ => panic!("expected data"),
        }
        xattr_remove(&mut inode, "user.x").unwrap();
        let err = xattr_get(&inode, "user.x", 16).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
    }

    #[test]
    fn create_and_replace_modes() {
        let mut inode = test_inode();
        let err = xattr_add(&mut inode, "user.a", b"v", SetMode::Replace).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
        xattr_add(&mut inode, "user.a", b"v", SetMode::Create).unwrap();
        let err = xattr_add(&mut inode, "user.a", b"w", SetMode::Create).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
        xattr_add(&mut inode, "user.a", b"w", SetMode::Replace).unwrap();
    }

    #[test]
    fn sized_queries() {
        let mut inode = test_inode();
        xattr_add(&mut inode, "user.key", b"value", SetMode::Any).unwrap();
        match xattr_get(&inode, "user.key", 0).unwrap() {
            XattrReply::Size(size) => assert_eq!(size, 5),
            _ => panic!("expected size"),
        }
        let err = xattr_get(&inode, "user.key", 3).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ERANGE));
        match xattr_list(&inode, 0).unwrap() {
            XattrReply::Size(size) => assert_eq!(size, 9),
            _ => panic!("expected size"),
        }
    }
}
