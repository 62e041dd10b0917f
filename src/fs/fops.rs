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

//! The operation handlers of the filesystem protocol.
//!
//! Every handler follows the same shape: lock the layer shared, resolve
//! the inode (cloning it into the layer on modifying paths), mutate under
//! the inode lock, build the reply, record stats, unlock.

use crate::emap;
use crate::inode;
use crate::inode::InodeData;
use crate::inode::InodeFlags;
use crate::inode::InodeRef;
use crate::layer;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::layout::*;
use crate::page;
use crate::proto::*;
use crate::stats::Op;
use crate::xattr;
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// An open file or directory. Registered with the transport at open time
/// and passed back on every request carrying a file handle.
#[derive(Debug)]
pub struct OpenHandle {
    /// The resolved inode.
    pub inode: InodeRef,
    /// The layer the inode was opened in.
    pub gindex: u32,
    /// Whether the kernel may cache pages of the file across opens.
    pub keep_cache: bool,
}

/// Per-request debug trace.
fn trace(gfs: &Gfs, op: &str, parent: u64, ino: u64, name: &str) {
    if gfs.config.debug {
        eprintln!("layerfs: {op} parent {parent} ino {ino} {name}");
    }
}

/// Builds the attr reply of an inode under its lock.
fn attr_of(gfs: &Gfs, fs: &Layer, iref: &InodeRef) -> Attr {
    let guard = iref.read().unwrap();
    let gindex = fs.gindex.load(Ordering::Relaxed);
    let parent = guard.dino.parent_ino();
    let mut attr = inode::copy_attr(&guard, gindex);
    // A layer root resolved through the layer directory reports its own
    // layer's handle
    attr.ino = layer::set_handle(
        gfs.get_index(gindex, parent, guard.dino.ino),
        guard.dino.ino,
    );
    attr
}

/// Looks up `name` in the directory `parent`.
///
/// A missing name is a negative entry, not an error, so the kernel can
/// cache the miss. Looking up a layer root under the layer directory
/// re-targets the entry at that layer.
pub fn lookup(gfs: &Gfs, parent: u64, name: &str) -> io::Result<Entry> {
    trace(gfs, "lookup", parent, 0, name);
    let fs = gfs.lock_layer(parent, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        let dir = inode::get_inode(gfs, &fs, handle_pino(parent), None, false)?;
        let dirent = {
            let guard = dir.read().unwrap();
            if !guard.is_dir() {
                return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
            }
            guard.dir().lookup(name).map(|d| (d.ino, d.mode))
        };
        let Some((ino, _)) = dirent else {
            return Ok(Entry::negative());
        };
        let gindex = gfs.get_index(
            fs.gindex.load(Ordering::Relaxed),
            handle_pino(parent),
            ino,
        );
        let entry = if gindex != fs.gindex.load(Ordering::Relaxed) {
            // The entry roots another layer
            let nfs = gfs.lock_layer(layer::set_handle(gindex, ino), false)?;
            let result = inode::get_inode(gfs, &nfs, ino, None, false).map(|iref| {
                let guard = iref.read().unwrap();
                Entry::new(
                    layer::set_handle(gindex, ino),
                    inode::copy_attr(&guard, gindex),
                )
            });
            nfs.rwlock.unlock_shared();
            result?
        } else {
            let iref = inode::get_inode(gfs, &fs, ino, None, false)?;
            let guard = iref.read().unwrap();
            Entry::new(
                layer::set_handle(gindex, ino),
                inode::copy_attr(&guard, gindex),
            )
        };
        Ok(entry)
    })();
    fs.stats.add(Op::Lookup, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Strips a handle down to the inode number.
fn handle_pino(handle: u64) -> u64 {
    layer::handle_ino(handle)
}

/// Returns the attributes of an inode.
pub fn getattr(gfs: &Gfs, ino: u64) -> io::Result<Attr> {
    trace(gfs, "getattr", 0, ino, "");
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = inode::get_inode(gfs, &fs, handle_pino(ino), None, false)
        .map(|iref| attr_of(gfs, &fs, &iref));
    fs.stats.add(Op::Getattr, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Changes attributes of an inode; a shrinking size truncates the file.
pub fn setattr(
    gfs: &Gfs,
    ino: u64,
    sa: &SetAttr,
    handle: Option<&OpenHandle>,
) -> io::Result<Attr> {
    trace(gfs, "setattr", 0, ino, "");
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if fs.frozen() {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let iref = inode::get_inode(
            gfs,
            &fs,
            handle_pino(ino),
            handle.map(|h| &h.inode),
            true,
        )?;
        let mut guard = iref.write().unwrap();
        let mut ctime = false;
        let mut mtime = false;
        if let Some(mode) = sa.mode {
            assert_eq!(guard.dino.mode & libc::S_IFMT, mode & libc::S_IFMT);
            guard.dino.mode = mode;
            ctime = true;
        }
        if let Some(uid) = sa.uid {
            guard.dino.uid = uid;
            ctime = true;
        }
        if let Some(gid) = sa.gid {
            guard.dino.gid = gid;
            ctime = true;
        }
        if let Some(size) = sa.size {
            if !guard.is_reg() {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            truncate(gfs, &fs, &mut guard, size);
            guard.mark_dirty(InodeFlags::EMAPDIRTY);
            mtime = true;
            ctime = true;
        }
        if let Some((sec, nsec)) = sa.mtime {
            guard.dino.mtime_sec = sec;
            guard.dino.mtime_nsec = nsec;
        } else if sa.mtime_now {
            mtime = true;
            ctime = true;
        }
        if mtime || ctime {
            guard.update_times(mtime, ctime);
        }
        guard.mark_dirty(InodeFlags::DIRTY);
        let gindex = fs.gindex.load(Ordering::Relaxed);
        Ok(inode::copy_attr(&guard, gindex))
    })();
    fs.stats.add(Op::Setattr, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Truncates a regular file to `size`.
fn truncate(gfs: &Gfs, fs: &Layer, inode: &mut inode::Inode, size: u64) {
    assert!(inode.is_reg());
    if size < inode.dino.size {
        page::trunc_pages(gfs, fs, inode, size, true);
    }
    inode.dino.size = size;
}

/// Reads the target of a symbolic link.
pub fn readlink(gfs: &Gfs, ino: u64) -> io::Result<String> {
    trace(gfs, "readlink", 0, ino, "");
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        let iref = inode::get_inode(gfs, &fs, handle_pino(ino), None, false)?;
        let guard = iref.read().unwrap();
        match &guard.data {
            InodeData::Symlink(target) => Ok(target.to_string()),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    })();
    fs.stats.add(Op::Readlink, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// The shared create path: allocates the inode and adds the directory
/// entry.
fn create_inode(
    gfs: &Gfs,
    fs: &Arc<Layer>,
    parent: u64,
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    target: Option<&str>,
) -> io::Result<InodeRef> {
    if fs.frozen() {
        return Err(io::Error::from_raw_os_error(libc::EROFS));
    }
    if name.len() > FILENAME_MAX {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }
    let pino = handle_pino(parent);
    let dir = inode::get_inode(gfs, fs, pino, None, true)?;
    let mut dguard = dir.write().unwrap();
    if !dguard.is_dir() {
        return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
    }
    if dguard.dir().lookup(name).is_some() {
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }
    let iref = inode::inode_init(gfs, fs, mode, uid, gid, rdev, pino, target);
    let ino = iref.read().unwrap().dino.ino;
    dguard.dir_mut().add(ino, mode, name);
    if mode & libc::S_IFMT == libc::S_IFDIR {
        assert!(dguard.dino.nlink >= 2);
        dguard.dino.nlink += 1;
    }
    dguard.update_times(true, true);
    dguard.mark_dirty(InodeFlags::DIRDIRTY);
    // Files under the tmp directory skip forced flushes
    if pino == gfs.tmp_root.load(Ordering::Relaxed) && gfs.tmp_root.load(Ordering::Relaxed) != 0
    {
        iref.write().unwrap().flags.insert(InodeFlags::TMP);
    }
    Ok(iref)
}

/// Creates a special file.
pub fn mknod(
    gfs: &Gfs,
    parent: u64,
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
) -> io::Result<Entry> {
    trace(gfs, "mknod", parent, 0, name);
    let fs = gfs.lock_layer(parent, false)?;
    let start = fs.stats.begin();
    let result = create_inode(gfs, &fs, parent, name, mode, uid, gid, rdev, None).map(|iref| {
        let attr = attr_of(gfs, &fs, &iref);
        Entry::new(attr.ino, attr)
    });
    fs.stats.add(Op::Mknod, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Creates a directory. Creating the well-known layer root directory under
/// the filesystem root registers it with the control plane.
pub fn mkdir(
    gfs: &Gfs,
    parent: u64,
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
) -> io::Result<Entry> {
    trace(gfs, "mkdir", parent, 0, name);
    let fs = gfs.lock_layer(parent, false)?;
    let start = fs.stats.begin();
    let mode = libc::S_IFDIR | (mode & !libc::S_IFMT);
    let result = create_inode(gfs, &fs, parent, name, mode, uid, gid, 0, None).map(|iref| {
        let attr = attr_of(gfs, &fs, &iref);
        let global = fs.is_root() && handle_pino(parent) == ROOT_INODE;
        if global && name == LAYER_ROOT_DIR {
            let ino = iref.read().unwrap().dino.ino;
            gfs.layer_root.store(ino, Ordering::Relaxed);
            iref.write().unwrap().dir_mut().convert_hashed();
            if gfs.config.verbose {
                eprintln!("layer root inode {ino}");
            }
        } else if global && name == LAYER_TMP_DIR {
            gfs.tmp_root
                .store(iref.read().unwrap().dino.ino, Ordering::Relaxed);
        }
        Entry::new(attr.ino, attr)
    });
    fs.stats.add(Op::Mkdir, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Creates a symbolic link.
pub fn symlink(
    gfs: &Gfs,
    target: &str,
    parent: u64,
    name: &str,
    uid: u32,
    gid: u32,
) -> io::Result<Entry> {
    trace(gfs, "symlink", parent, 0, name);
    let fs = gfs.lock_layer(parent, false)?;
    let start = fs.stats.begin();
    let mode = libc::S_IFLNK | 0o777;
    let result = create_inode(gfs, &fs, parent, name, mode, uid, gid, 0, Some(target))
        .map(|iref| {
            let attr = attr_of(gfs, &fs, &iref);
            Entry::new(attr.ino, attr)
        });
    fs.stats.add(Op::Symlink, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Creates and opens a regular file.
pub fn create(
    gfs: &Gfs,
    parent: u64,
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
) -> io::Result<(Entry, OpenHandle)> {
    trace(gfs, "create", parent, 0, name);
    let fs = gfs.lock_layer(parent, false)?;
    let start = fs.stats.begin();
    let mode = libc::S_IFREG | (mode & !libc::S_IFMT);
    let result = create_inode(gfs, &fs, parent, name, mode, uid, gid, 0, None).map(|iref| {
        let attr = attr_of(gfs, &fs, &iref);
        iref.write().unwrap().ocount += 1;
        let handle = OpenHandle {
            inode: iref,
            gindex: fs.gindex.load(Ordering::Relaxed),
            keep_cache: true,
        };
        (Entry::new(attr.ino, attr), handle)
    });
    fs.stats.add(Op::Create, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Creates a new link to a regular file.
pub fn link(gfs: &Gfs, ino: u64, newparent: u64, newname: &str) -> io::Result<Entry> {
    trace(gfs, "link", newparent, ino, newname);
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if fs.frozen() {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let dir = inode::get_inode(gfs, &fs, handle_pino(newparent), None, true)?;
        let iref = inode::get_inode(gfs, &fs, handle_pino(ino), None, true)?;
        {
            let mut dguard = dir.write().unwrap();
            if !dguard.is_dir() {
                return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
            }
            if dguard.dir().lookup(newname).is_some() {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            let mut iguard = iref.write().unwrap();
            if !iguard.is_reg() {
                return Err(io::Error::from_raw_os_error(libc::EPERM));
            }
            dguard
                .dir_mut()
                .add(iguard.dino.ino, iguard.dino.mode, newname);
            dguard.update_times(true, true);
            dguard.mark_dirty(InodeFlags::DIRDIRTY);
            iguard.dino.nlink += 1;
            iguard.update_times(false, true);
            iguard.mark_dirty(InodeFlags::DIRTY);
        }
        let attr = attr_of(gfs, &fs, &iref);
        Ok(Entry::new(attr.ino, attr))
    })();
    fs.stats.add(Op::Link, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Removes the inode behind a directory entry being dropped.
fn remove_inode(
    gfs: &Gfs,
    fs: &Arc<Layer>,
    dir_ino: u64,
    ino: u64,
    rmdir: bool,
) -> io::Result<()> {
    let iref = inode::get_inode(gfs, fs, ino, None, true)?;
    let mut guard = iref.write().unwrap();
    assert!(guard.dino.nlink > 0);
    let mut removed = false;
    if rmdir {
        assert_eq!(guard.dino.parent_ino(), dir_ino & FH_INODE_MASK);
        if guard.dir().count() > 0 && fs.is_root() {
            // The root filesystem prunes whole trees, container images
            // delete layer directories wholesale
            remove_tree(gfs, fs, &mut guard)?;
        }
        if guard.dir().count() > 0 {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        assert_eq!(guard.dino.nlink, 2);
        guard.dino.nlink = 0;
        guard.flags.insert(InodeFlags::REMOVED);
        guard.mark_dirty(InodeFlags::DIRDIRTY);
        removed = true;
    } else {
        guard.dino.nlink -= 1;
        if guard.dino.nlink == 0 {
            if guard.ocount == 0 && guard.is_reg() {
                truncate(gfs, fs, &mut guard, 0);
            }
            guard.flags.insert(InodeFlags::REMOVED);
            removed = true;
        }
        let flags = if guard.is_reg() {
            InodeFlags::EMAPDIRTY
        } else {
            InodeFlags::DIRTY
        };
        guard.mark_dirty(flags);
    }
    if removed {
        fs.update_ftype_stats(gfs, guard.dino.mode, false);
        let mut sb = gfs.sb.lock().unwrap();
        assert!(sb.inodes > 0);
        sb.inodes -= 1;
    }
    Ok(())
}

/// Removes every entry under a directory, recursively.
fn remove_tree(gfs: &Gfs, fs: &Arc<Layer>, dir: &mut inode::Inode) -> io::Result<()> {
    let entries: Vec<(u64, u32)> = dir.dir().iter().map(|d| (d.ino, d.mode)).collect();
    let names: Vec<Box<str>> = dir.dir().iter().map(|d| d.name.clone()).collect();
    for ((ino, mode), name) in entries.into_iter().zip(names) {
        let rmdir = mode & libc::S_IFMT == libc::S_IFDIR;
        remove_inode(gfs, fs, dir.dino.ino, ino, rmdir)?;
        dir.dir_mut().remove(&name);
        if rmdir {
            assert!(dir.dino.nlink > 2);
            dir.dino.nlink -= 1;
        }
    }
    Ok(())
}

/// The shared unlink/rmdir path.
fn remove_name(gfs: &Gfs, fs: &Arc<Layer>, parent: u64, name: &str, rmdir: bool) -> io::Result<()> {
    if fs.frozen() {
        return Err(io::Error::from_raw_os_error(libc::EROFS));
    }
    let pino = handle_pino(parent);
    let dir = inode::get_inode(gfs, fs, pino, None, true)?;
    let mut dguard = dir.write().unwrap();
    if !dguard.is_dir() {
        return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
    }
    let dirent = dguard
        .dir()
        .lookup(name)
        .map(|d| (d.ino, d.mode))
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
    let (ino, mode) = dirent;
    if rmdir && mode & libc::S_IFMT != libc::S_IFDIR {
        return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
    }
    if !rmdir && mode & libc::S_IFMT == libc::S_IFDIR {
        return Err(io::Error::from_raw_os_error(libc::EISDIR));
    }
    // Layer roots leave through the control plane only
    if rmdir && fs.is_root() && pino == gfs.layer_root.load(Ordering::Relaxed) {
        let gindex = gfs.get_index(0, pino, ino);
        if gindex != 0 {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
    }
    remove_inode(gfs, fs, pino, ino, rmdir)?;
    dguard.dir_mut().remove(name);
    if rmdir {
        assert!(dguard.dino.nlink > 2);
        dguard.dino.nlink -= 1;
    }
    dguard.update_times(false, true);
    dguard.mark_dirty(InodeFlags::DIRDIRTY);
    Ok(())
}

/// Removes a file.
pub fn unlink(gfs: &Gfs, parent: u64, name: &str) -> io::Result<()> {
    trace(gfs, "unlink", parent, 0, name);
    let fs = gfs.lock_layer(parent, false)?;
    let start = fs.stats.begin();
    let result = remove_name(gfs, &fs, parent, name, false);
    fs.stats.add(Op::Unlink, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Removes a directory.
pub fn rmdir(gfs: &Gfs, parent: u64, name: &str) -> io::Result<()> {
    trace(gfs, "rmdir", parent, 0, name);
    let fs = gfs.lock_layer(parent, false)?;
    let start = fs.stats.begin();
    let result = remove_name(gfs, &fs, parent, name, true);
    fs.stats.add(Op::Rmdir, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Renames an entry, possibly across directories. Directories are locked
/// lower inode number first so concurrent renames cannot deadlock.
pub fn rename(
    gfs: &Gfs,
    parent: u64,
    name: &str,
    newparent: u64,
    newname: &str,
) -> io::Result<()> {
    trace(gfs, "rename", parent, newparent, name);
    let fs = gfs.lock_layer(parent, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if fs.frozen() {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        if layer::handle_layer(parent) != layer::handle_layer(newparent) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let spino = handle_pino(parent);
        let tpino = handle_pino(newparent);
        let sdir = inode::get_inode(gfs, &fs, spino, None, true)?;
        let tdir = if spino == tpino {
            None
        } else {
            Some(inode::get_inode(gfs, &fs, tpino, None, true)?)
        };

        // Lock order: lower inode number first
        let mut guards = Vec::new();
        match &tdir {
            None => guards.push(sdir.write().unwrap()),
            Some(tdir) => {
                if spino < tpino {
                    guards.push(sdir.write().unwrap());
                    guards.push(tdir.write().unwrap());
                } else {
                    guards.push(tdir.write().unwrap());
                    guards.push(sdir.write().unwrap());
                }
            }
        }
        let (sidx, tidx) = match &tdir {
            None => (0, 0),
            Some(_) if spino < tpino => (0, 1),
            Some(_) => (1, 0),
        };
        let ino = guards[sidx]
            .dir()
            .lookup(name)
            .map(|d| d.ino)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;

        // Drop an existing target first
        let existing = guards[tidx].dir().lookup(newname).map(|d| (d.ino, d.mode));
        if let Some((tino, tmode)) = existing {
            let rmdir = tmode & libc::S_IFMT == libc::S_IFDIR;
            remove_inode(gfs, &fs, tpino, tino, rmdir)?;
            guards[tidx].dir_mut().remove(newname);
            if rmdir {
                let nlink = &mut guards[tidx].dino.nlink;
                assert!(*nlink > 2);
                *nlink -= 1;
            }
        }

        if sidx != tidx {
            // Move between directories
            let mode = {
                let iref = inode::get_inode(gfs, &fs, ino, None, true)?;
                let mut iguard = iref.write().unwrap();
                iguard.dino.set_parent(tpino);
                iguard.update_times(false, true);
                iguard.mark_dirty(InodeFlags::DIRTY);
                iguard.dino.mode
            };
            guards[sidx].dir_mut().remove(name);
            guards[tidx].dir_mut().add(ino, mode, newname);
            if mode & libc::S_IFMT == libc::S_IFDIR {
                assert!(guards[sidx].dino.nlink > 2);
                guards[sidx].dino.nlink -= 1;
                guards[tidx].dino.nlink += 1;
            }
        } else {
            guards[sidx].dir_mut().rename(ino, name, newname);
        }
        for guard in guards.iter_mut() {
            guard.update_times(true, true);
            guard.mark_dirty(InodeFlags::DIRDIRTY);
        }
        Ok(())
    })();
    fs.stats.add(Op::Rename, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Opens a file or directory.
pub fn open(gfs: &Gfs, ino: u64, write: bool) -> io::Result<OpenHandle> {
    trace(gfs, "open", 0, ino, "");
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if write && fs.frozen() {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let iref = inode::get_inode(gfs, &fs, handle_pino(ino), None, write)?;
        let mut guard = iref.write().unwrap();
        // A removed inode may not be opened anew
        if guard.flags.contains(InodeFlags::REMOVED) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let owned = fs
            .icache
            .get(guard.dino.ino)
            .map(|i| Arc::ptr_eq(&i, &iref))
            == Some(true);
        let keep_cache = if owned {
            guard.ocount += 1;
            guard.dino.private()
        } else {
            false
        };
        drop(guard);
        Ok(OpenHandle {
            inode: iref,
            gindex: fs.gindex.load(Ordering::Relaxed),
            keep_cache,
        })
    })();
    fs.stats.add(Op::Open, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Releases an open handle. The last close of a removed file drops its
/// data.
pub fn release(gfs: &Gfs, ino: u64, handle: OpenHandle) -> io::Result<()> {
    trace(gfs, "release", 0, ino, "");
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    {
        let owned = {
            let guard = handle.inode.read().unwrap();
            fs.icache
                .get(guard.dino.ino)
                .map(|i| Arc::ptr_eq(&i, &handle.inode))
                == Some(true)
        };
        if owned {
            let mut guard = handle.inode.write().unwrap();
            assert!(guard.ocount > 0);
            guard.ocount -= 1;
            if guard.ocount == 0 && guard.flags.contains(InodeFlags::REMOVED) && guard.is_reg() {
                truncate(gfs, &fs, &mut guard, 0);
            }
        }
    }
    fs.stats.add(Op::Release, false, start);
    fs.rwlock.unlock_shared();
    Ok(())
}

/// Reads from a file. The reply references cache pages directly; holes
/// read as zeroes; reading past the end of the file is clamped.
pub fn read(
    gfs: &Gfs,
    ino: u64,
    handle: Option<&OpenHandle>,
    off: u64,
    size: u64,
) -> io::Result<ReadReply> {
    trace(gfs, "read", 0, ino, "");
    if size == 0 {
        return Ok(ReadReply { segs: Vec::new() });
    }
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        let iref = inode::get_inode(
            gfs,
            &fs,
            handle_pino(ino),
            handle.map(|h| &h.inode),
            false,
        )?;
        // Completing partial dirty pages mutates the page table, so the
        // inode lock is exclusive whenever dirty pages exist
        let mut guard = iref.write().unwrap();
        if !guard.is_reg() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let fsize = guard.dino.size;
        if off >= fsize {
            return Ok(ReadReply { segs: Vec::new() });
        }
        let end = (off + size).min(fsize);
        let mut segs = Vec::new();
        let mut pos = off;
        while pos < end {
            let pg = pos / BLOCK_SIZE as u64;
            let poffset = (pos % BLOCK_SIZE as u64) as usize;
            let psize = (BLOCK_SIZE - poffset).min((end - pos) as usize);
            if let Some(data) = page::read_dirty_page(gfs, &fs, &mut guard, pg)? {
                segs.push(ReadSeg::Data(data, poffset, psize));
            } else if let Some(block) = emap::emap_lookup(&guard, pg) {
                let cpage = fs.bcache.get(&gfs.device, block, true)?;
                let data = cpage.data().expect("filled page");
                fs.bcache.release(cpage, true);
                segs.push(ReadSeg::Data(data, poffset, psize));
            } else {
                segs.push(ReadSeg::Zero(psize));
            }
            pos += psize as u64;
        }
        Ok(ReadReply { segs })
    })();
    fs.stats.add(Op::Read, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Writes to a file. The payload is copied into page buffers before any
/// lock is taken.
pub fn write(
    gfs: &Gfs,
    ino: u64,
    handle: Option<&OpenHandle>,
    off: u64,
    data: &[u8],
) -> io::Result<u64> {
    trace(gfs, "write", 0, ino, "");
    let dpages = page::copy_pages(gfs, off, data);
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if fs.frozen() {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        if !crate::alloc::has_space(gfs, false) {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        if gfs.mem.must_wait() {
            // Push the cleaner and stall until memory comes back
            gfs.cleaner_wait.signal();
            gfs.mem.wait_memory();
        }
        let iref = inode::get_inode(
            gfs,
            &fs,
            handle_pino(ino),
            handle.map(|h| &h.inode),
            true,
        )?;
        let mut guard = iref.write().unwrap();
        if !guard.is_reg() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        page::add_pages(gfs, &fs, &mut guard, off, data.len() as u64, dpages)?;
        guard.update_times(true, true);
        guard.mark_dirty(InodeFlags::EMAPDIRTY);
        Ok(data.len() as u64)
    })();
    fs.stats.add(Op::Write, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Reads directory entries after the cookie `off`.
pub fn readdir(
    gfs: &Gfs,
    ino: u64,
    handle: Option<&OpenHandle>,
    off: u64,
    max: usize,
) -> io::Result<Vec<DirEntry>> {
    trace(gfs, "readdir", 0, ino, "");
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        let iref = inode::get_inode(
            gfs,
            &fs,
            handle_pino(ino),
            handle.map(|h| &h.inode),
            false,
        )?;
        let guard = iref.read().unwrap();
        if !guard.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        let gindex = fs.gindex.load(Ordering::Relaxed);
        let pino = guard.dino.ino;
        Ok(guard
            .dir()
            .read_from(off, max)
            .into_iter()
            .map(|d| DirEntry {
                ino: layer::set_handle(gfs.get_index(gindex, pino, d.ino), d.ino),
                mode: d.mode,
                off: d.index as u64,
                name: d.name.to_string(),
            })
            .collect())
    })();
    fs.stats.add(Op::Readdir, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Snapshot of the global counters.
pub fn statfs(gfs: &Gfs) -> StatFs {
    let sb = gfs.sb.lock().unwrap();
    StatFs::new(sb.tblocks, sb.blocks, sb.inodes)
}

/// Sets an extended attribute. Not allowed on the layer root directory.
pub fn setxattr(
    gfs: &Gfs,
    ino: u64,
    name: &str,
    value: &[u8],
    mode: xattr::SetMode,
) -> io::Result<()> {
    trace(gfs, "setxattr", 0, ino, name);
    if handle_pino(ino) == gfs.layer_root.load(Ordering::Relaxed) {
        return Err(io::Error::from_raw_os_error(libc::EPERM));
    }
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if fs.frozen() {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let iref = inode::get_inode(gfs, &fs, handle_pino(ino), None, true)?;
        let mut guard = iref.write().unwrap();
        gfs.enable_xattrs(&fs);
        xattr::xattr_add(&mut guard, name, value, mode)
    })();
    fs.stats.add(Op::Setxattr, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Gets an extended attribute. Filesystems that never saw an attribute
/// answer without touching the inode.
pub fn getxattr(gfs: &Gfs, ino: u64, name: &str, size: usize) -> io::Result<xattr::XattrReply> {
    trace(gfs, "getxattr", 0, ino, name);
    if !gfs.xattr_enabled.load(Ordering::Relaxed) {
        return Err(io::Error::from_raw_os_error(libc::ENODATA));
    }
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if !fs.xattr_enabled.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::ENODATA));
        }
        let iref = inode::get_inode(gfs, &fs, handle_pino(ino), None, false)?;
        let guard = iref.read().unwrap();
        xattr::xattr_get(&guard, name, size)
    })();
    fs.stats.add(Op::Getxattr, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Lists extended attribute names.
pub fn listxattr(gfs: &Gfs, ino: u64, size: usize) -> io::Result<xattr::XattrReply> {
    trace(gfs, "listxattr", 0, ino, "");
    if !gfs.xattr_enabled.load(Ordering::Relaxed) {
        return Err(io::Error::from_raw_os_error(libc::ENODATA));
    }
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if !fs.xattr_enabled.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::ENODATA));
        }
        let iref = inode::get_inode(gfs, &fs, handle_pino(ino), None, false)?;
        let guard = iref.read().unwrap();
        xattr::xattr_list(&guard, size)
    })();
    fs.stats.add(Op::Listxattr, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// Removes an extended attribute.
pub fn removexattr(gfs: &Gfs, ino: u64, name: &str) -> io::Result<()> {
    trace(gfs, "removexattr", 0, ino, name);
    if !gfs.xattr_enabled.load(Ordering::Relaxed) {
        return Err(io::Error::from_raw_os_error(libc::ENODATA));
    }
    let fs = gfs.lock_layer(ino, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        if fs.frozen() {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let iref = inode::get_inode(gfs, &fs, handle_pino(ino), None, true)?;
        let mut guard = iref.write().unwrap();
        xattr::xattr_remove(&mut guard, name)
    })();
    fs.stats.add(Op::Removexattr, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}

/// The control plane, multiplexed over the layer root directory.
///
/// Commands arrive with a length-prefixed `"name"` or `"parent\0name"`
/// payload; the reply is empty on success, a byte stream for queries.
pub fn ioctl(gfs: &Gfs, ino: u64, cmd: u32, payload: &[u8]) -> io::Result<Vec<u8>> {
    trace(gfs, "ioctl", 0, ino, "");
    let layer_root = gfs.layer_root.load(Ordering::Relaxed);
    if layer_root == 0 || handle_pino(ino) != layer_root {
        return Err(io::Error::from_raw_os_error(libc::ENOSYS));
    }
    let cmd = CtlCmd::from_u32(cmd).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSYS))?;
    let (parent, name) = decode_ctl_payload(payload)?;
    let parent = parent.unwrap_or_default();
    match cmd {
        CtlCmd::LayerCreate => {
            layer::create_layer(gfs, &name, &parent, false)?;
            Ok(Vec::new())
        }
        CtlCmd::LayerCreateRw => {
            layer::create_layer(gfs, &name, &parent, true)?;
            Ok(Vec::new())
        }
        CtlCmd::LayerRemove => {
            layer::delete_layer(gfs, &name)?;
            Ok(Vec::new())
        }
        CtlCmd::LayerCommit => {
            // Commit swaps layer identities; only honored when the mount
            // opted into that
            if !gfs.config.swap_commit {
                return Err(io::Error::from_raw_os_error(libc::ENOSYS));
            }
            if parent.is_empty() {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            layer::commit_layer(gfs, &parent, &name)?;
            Ok(Vec::new())
        }
        CtlCmd::LayerMount => {
            let root = layer::get_root_ino(gfs, &name)?;
            let fs = gfs.lock_layer(root, true)?;
            fs.sb.lock().unwrap().flags |= SUPER_DIRTY | SUPER_MOUNTED;
            fs.mark_super_dirty();
            fs.rwlock.unlock_exclusive();
            Ok(Vec::new())
        }
        CtlCmd::LayerUmount => {
            let root = layer::get_root_ino(gfs, &name)?;
            let fs = gfs.lock_layer(root, false)?;
            let freeze = !fs.frozen()
                && (fs.read_only.load(Ordering::Relaxed)
                    || fs.sb.lock().unwrap().flags & SUPER_INIT != 0);
            fs.rwlock.unlock_shared();
            if freeze {
                // Freeze image and init layers so children can stack on them
                let fs = gfs.lock_layer(root, true)?;
                layer::freeze_layer(gfs, &fs);
                fs.rwlock.unlock_exclusive();
                gfs.layer_changed(true, true);
            }
            Ok(Vec::new())
        }
        CtlCmd::LayerStat => {
            let mut out = String::new();
            match layer::get_root_ino(gfs, &name) {
                Ok(root) => {
                    let fs = gfs.lock_layer(root, false)?;
                    out.push_str(&format_layer_stats(gfs, &fs, &name));
                    fs.rwlock.unlock_shared();
                }
                Err(_) => {
                    // Display every layer
                    for fs in gfs.layers_snapshot() {
                        out.push_str(&format_layer_stats(gfs, &fs, ""));
                    }
                }
            }
            Ok(out.into_bytes())
        }
        CtlCmd::ClearStat => {
            let root = layer::get_root_ino(gfs, &name)?;
            let fs = gfs.lock_layer(root, true)?;
            fs.stats.clear();
            fs.rwlock.unlock_exclusive();
            Ok(Vec::new())
        }
        CtlCmd::UmountAll => {
            crate::flush::sync_all_layers(gfs)?;
            Ok(Vec::new())
        }
        CtlCmd::SyncerTime => {
            let secs: u64 = name
                .parse()
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            gfs.sync_interval.store(secs, Ordering::Relaxed);
            gfs.syncer_wait.signal();
            Ok(Vec::new())
        }
        CtlCmd::PcacheMemory => {
            let mb: u64 = name
                .parse()
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            if mb == 0 {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            gfs.mem.set_limit(mb * 1024 * 1024);
            gfs.cleaner_wait.signal();
            Ok(Vec::new())
        }
        CtlCmd::LayerDiff => {
            let changes = crate::diff::layer_diff(gfs, &name)?;
            Ok(encode_changes(&changes))
        }
    }
}

/// Formats the counters of one layer.
fn format_layer_stats(gfs: &Gfs, fs: &Layer, name: &str) -> String {
    let mut out = String::new();
    let (index, root) = (
        fs.gindex.load(Ordering::Relaxed),
        fs.root.load(Ordering::Relaxed),
    );
    out.push_str(&format!("Layer {name} index {index} root {root}\n"));
    out.push_str(&format!(
        "\tinodes {} dirty pages {} blocks {} freed {} reads {} writes {} iwrites {}\n",
        fs.icount.load(Ordering::Relaxed),
        fs.pcount.load(Ordering::Relaxed),
        fs.blocks.load(Ordering::Relaxed),
        fs.freed.load(Ordering::Relaxed),
        fs.reads.load(Ordering::Relaxed),
        fs.writes.load(Ordering::Relaxed),
        fs.iwrite.load(Ordering::Relaxed),
    ));
    let (hits, missed, recycled) = fs.bcache.counters();
    out.push_str(&format!(
        "\tcache pages {} hits {hits} missed {missed} recycled {recycled}\n",
        fs.bcache.pcount()
    ));
    if gfs.config.request_stats {
        out.push_str(&fs.stats.format());
    }
    out
}
