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

//! Change enumeration between a layer and its parent.

use crate::inode;
use crate::layer;
use crate::layer::Gfs;
use crate::layer::Layer;
use crate::proto::Change;
use crate::proto::ChangeKind;
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Classifies an inode of the layer against the parent's frozen
/// last-inode mark.
fn change_of(ino: u64, last_inode: u64) -> ChangeKind {
    if ino > last_inode {
        ChangeKind::Added
    } else {
        ChangeKind::Modified
    }
}

/// Walks a directory the layer touched, comparing it entry by entry with
/// the parent's view of the same directory.
///
/// Directories come before their contents and contents before removals,
/// so a consumer can replay the stream in order.
fn walk_dir(
    gfs: &Gfs,
    fs: &Arc<Layer>,
    pfs: Option<&Arc<Layer>>,
    dir_ino: u64,
    pdir_ino: Option<u64>,
    path: &str,
    last_inode: u64,
    out: &mut Vec<Change>,
) -> io::Result<()> {
    let dir = inode::get_inode(gfs, fs, dir_ino, None, false)?;
    let dguard = dir.read().unwrap();
    let entries: Vec<(u64, u32, String)> = dguard
        .dir()
        .iter()
        .map(|d| (d.ino, d.mode, d.name.to_string()))
        .collect();
    drop(dguard);

    // The parent's copy of this directory, if it has one. Cloned
    // directories keep their inode number; only the root differs.
    let pdir = match (pfs, pdir_ino) {
        (Some(pfs), Some(pino)) => inode::get_inode(gfs, pfs, pino, None, false).ok(),
        _ => None,
    };
    let pentries: Vec<(u64, String)> = match &pdir {
        Some(pdir) => {
            let guard = pdir.read().unwrap();
            guard
                .dir()
                .iter()
                .map(|d| (d.ino, d.name.to_string()))
                .collect()
        }
        None => Vec::new(),
    };

    for (ino, mode, name) in &entries {
        let full = if path == "/" {
            format!("/{name}")
        } else {
            format!("{path}/{name}")
        };
        let in_parent = pentries.iter().find(|(_, pname)| pname == name);
        let is_dir = mode & libc::S_IFMT == libc::S_IFDIR;
        let owned = fs.icache.get(*ino).is_some();
        match in_parent {
            Some((pino, _)) if *pino == *ino => {
                // Same entry; only report it if this layer touched it
                if owned {
                    out.push(Change {
                        kind: change_of(*ino, last_inode),
                        path: full.clone(),
                    });
                    if is_dir {
                        walk_dir(gfs, fs, pfs, *ino, Some(*ino), &full, last_inode, out)?;
                    }
                }
            }
            Some(_) => {
                // The name now points somewhere else
                out.push(Change {
                    kind: ChangeKind::Modified,
                    path: full.clone(),
                });
                if is_dir && owned {
                    walk_dir(gfs, fs, pfs, *ino, None, &full, last_inode, out)?;
                }
            }
            None => {
                out.push(Change {
                    kind: ChangeKind::Added,
                    path: full.clone(),
                });
                if is_dir && owned {
                    walk_dir(gfs, fs, pfs, *ino, None, &full, last_inode, out)?;
                }
            }
        }
    }

    // Entries the layer dropped
    for (_, pname) in &pentries {
        if !entries.iter().any(|(_, _, name)| name == pname) {
            let full = if path == "/" {
                format!("/{pname}")
            } else {
                format!("{path}/{pname}")
            };
            out.push(Change {
                kind: ChangeKind::Removed,
                path: full,
            });
        }
    }
    Ok(())
}

/// Enumerates the changes of the layer `name` relative to its parent as
/// an ordered `(change, path)` stream.
pub fn layer_diff(gfs: &Gfs, name: &str) -> io::Result<Vec<Change>> {
    let handle = layer::get_root_ino(gfs, name)?;
    let fs = gfs.lock_layer(handle, false)?;
    let start = fs.stats.begin();
    let result = (|| {
        let parent = fs.links.lock().unwrap().parent;
        let (pfs, last_inode) = match parent {
            Some(pindex) => {
                let pfs = gfs
                    .layer(pindex)
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
                let last = pfs.sb.lock().unwrap().last_inode;
                (Some(pfs), last)
            }
            None => (None, 0),
        };
        let mut out = Vec::new();
        let root = fs.root.load(Ordering::Relaxed);
        let proot = pfs.as_ref().map(|p| p.root.load(Ordering::Relaxed));
        walk_dir(gfs, &fs, pfs.as_ref(), root, proot, "/", last_inode, &mut out)?;
        Ok(out)
    })();
    fs.stats
        .add(crate::stats::Op::LayerDiff, result.is_err(), start);
    fs.rwlock.unlock_shared();
    result
}
