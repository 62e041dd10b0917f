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

//! End-to-end tests driving the operation handlers the way the kernel
//! transport would.

use crate::device::test::test_device;
use crate::flush;
use crate::fops;
use crate::inode::InodeFlags;
use crate::layer;
use crate::layer::Config;
use crate::layer::Gfs;
use crate::layout::*;
use crate::proto::ChangeKind;
use crate::proto::SetAttr;
use crate::proto::encode_ctl_payload;
use crate::xattr::XattrReply;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Formats and mounts a fresh test device.
fn mount_fresh(blocks: u64) -> (Arc<Gfs>, PathBuf) {
    let path = test_device(blocks);
    let config = Config {
        format: true,
        ..Default::default()
    };
    let gfs = layer::mount(&path, config).unwrap();
    (gfs, path)
}

/// The handle of the filesystem root directory.
fn root() -> u64 {
    layer::set_handle(0, ROOT_INODE)
}

/// Creates the layer root directory and returns its handle.
fn make_layer_root(gfs: &Gfs) -> u64 {
    let entry = fops::mkdir(gfs, root(), LAYER_ROOT_DIR, 0o755, 0, 0).unwrap();
    assert!(gfs.layer_root.load(Ordering::Relaxed) != 0);
    entry.ino
}

/// Issues a control command against the layer root directory.
fn ctl(gfs: &Gfs, cmd: crate::proto::CtlCmd, parent: Option<&str>, name: &str) -> std::io::Result<Vec<u8>> {
    let ino = layer::set_handle(0, gfs.layer_root.load(Ordering::Relaxed));
    fops::ioctl(gfs, ino, cmd as u32, &encode_ctl_payload(parent, name))
}

/// Resolves a layer name to its file handle.
fn layer_handle(gfs: &Gfs, name: &str) -> u64 {
    let lr = layer::set_handle(0, gfs.layer_root.load(Ordering::Relaxed));
    let entry = fops::lookup(gfs, lr, name).unwrap();
    assert!(entry.ino != 0);
    entry.ino
}

/// Flushes all dirty files of the layer holding `handle`.
fn flush_layer(gfs: &Gfs, handle: u64) {
    let fs = gfs.lock_layer(handle, false).unwrap();
    flush::flush_dirty_inode_list(gfs, &fs, true).unwrap();
    fs.rwlock.unlock_shared();
}

#[test]
fn create_write_remount_read() {
    let (gfs, path) = mount_fresh(16 * 1024);
    let a = fops::mkdir(&gfs, root(), "a", 0o755, 0, 0).unwrap();
    let b = fops::mkdir(&gfs, a.ino, "b", 0o755, 0, 0).unwrap();
    let (c, handle) = fops::create(&gfs, b.ino, "c", 0o644, 0, 0).unwrap();
    let bfree_before = fops::statfs(&gfs).bfree;
    fops::write(&gfs, c.ino, Some(&handle), 0, b"hello").unwrap();
    fops::release(&gfs, c.ino, handle).unwrap();
    flush::unmount(&gfs).unwrap();
    drop(gfs);

    let gfs = layer::mount(&path, Config::default()).unwrap();
    let a = fops::lookup(&gfs, root(), "a").unwrap();
    let b = fops::lookup(&gfs, a.ino, "b").unwrap();
    let c = fops::lookup(&gfs, b.ino, "c").unwrap();
    assert!(c.ino != 0);
    assert_eq!(c.attr.size, 5);
    assert_eq!(c.attr.blocks, 1);
    let reply = fops::read(&gfs, c.ino, None, 0, 5).unwrap();
    assert_eq!(reply.to_vec(), b"hello");
    // The write consumed space
    assert!(fops::statfs(&gfs).bfree < bfree_before);
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn layer_cow_isolation() {
    let (gfs, path) = mount_fresh(64 * 1024);
    make_layer_root(&gfs);
    ctl(&gfs, crate::proto::CtlCmd::LayerCreate, None, "l1").unwrap();

    // Populate the image layer before freezing it
    let l1 = layer_handle(&gfs, "l1");
    let (file, handle) = fops::create(&gfs, l1, "data", 0o644, 0, 0).unwrap();
    fops::write(&gfs, file.ino, Some(&handle), 0, b"original content").unwrap();
    fops::release(&gfs, file.ino, handle).unwrap();
    flush_layer(&gfs, l1);
    ctl(&gfs, crate::proto::CtlCmd::LayerUmount, None, "l1").unwrap();
    assert!(gfs.lock_layer(l1, false).map(|fs| { let f = fs.frozen(); fs.rwlock.unlock_shared(); f }).unwrap());

    let blocks_before = gfs.sb.lock().unwrap().blocks;
    ctl(&gfs, crate::proto::CtlCmd::LayerCreateRw, Some("l1"), "l2").unwrap();
    let l2 = layer_handle(&gfs, "l2");
    assert_ne!(layer::handle_layer(l1), layer::handle_layer(l2));

    // Overwriting in l2 clones the inode, l1 keeps its content
    let f2 = fops::lookup(&gfs, l2, "data").unwrap();
    fops::write(&gfs, f2.ino, None, 0, b"layer two wrote this").unwrap();
    flush_layer(&gfs, l2);
    let r2 = fops::read(&gfs, f2.ino, None, 0, 64).unwrap().to_vec();
    assert_eq!(&r2, b"layer two wrote this");
    let f1 = fops::lookup(&gfs, l1, "data").unwrap();
    let r1 = fops::read(&gfs, f1.ino, None, 0, 64).unwrap().to_vec();
    assert_eq!(&r1, b"original content");

    // Exactly one clone was created
    assert_eq!(gfs.clones.load(Ordering::Relaxed), 1);

    // Deleting l2 returns every block it allocated
    ctl(&gfs, crate::proto::CtlCmd::LayerRemove, None, "l2").unwrap();
    assert_eq!(gfs.sb.lock().unwrap().blocks, blocks_before);
    let r1 = fops::read(&gfs, f1.ino, None, 0, 64).unwrap().to_vec();
    assert_eq!(&r1, b"original content");
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn single_extent_and_truncate() {
    let (gfs, path) = mount_fresh(16 * 1024);
    let (file, handle) = fops::create(&gfs, root(), "big", 0o644, 0, 0).unwrap();
    let data: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| i as u8).collect();
    fops::write(&gfs, file.ino, Some(&handle), 0, &data).unwrap();
    flush_layer(&gfs, file.ino);
    {
        let fs = gfs.lock_layer(file.ino, false).unwrap();
        let iref = crate::inode::get_inode(&gfs, &fs, layer::handle_ino(file.ino), None, false)
            .unwrap();
        let guard = iref.read().unwrap();
        assert_eq!(guard.dino.extent_length, 512);
        assert!(matches!(
            &guard.data,
            crate::inode::InodeData::File { emap: None, .. }
        ));
        fs.rwlock.unlock_shared();
    }
    // Truncate to 1 MiB + 100
    let size = 1024 * 1024 + 100;
    let attr = fops::setattr(
        &gfs,
        file.ino,
        &SetAttr {
            size: Some(size),
            ..Default::default()
        },
        Some(&handle),
    )
    .unwrap();
    assert_eq!(attr.size, size);
    {
        let fs = gfs.lock_layer(file.ino, false).unwrap();
        let iref = crate::inode::get_inode(&gfs, &fs, layer::handle_ino(file.ino), None, false)
            .unwrap();
        let guard = iref.read().unwrap();
        assert_eq!(guard.dino.extent_length, 257);
        fs.rwlock.unlock_shared();
    }
    // The partial tail still reads back, and stops at the new end
    let tail_off = 1024 * 1024;
    let reply = fops::read(&gfs, file.ino, Some(&handle), tail_off, BLOCK_SIZE as u64).unwrap();
    let tail = reply.to_vec();
    assert_eq!(tail.len(), 100);
    assert_eq!(tail, data[tail_off as usize..tail_off as usize + 100]);
    fops::release(&gfs, file.ino, handle).unwrap();
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn xattr_lifecycle() {
    let (gfs, path) = mount_fresh(16 * 1024);
    let (file, _handle) = fops::create(&gfs, root(), "x", 0o644, 0, 0).unwrap();
    fops::setxattr(&gfs, file.ino, "user.x", b"1", crate::xattr::SetMode::Any).unwrap();
    fops::setxattr(&gfs, file.ino, "user.x", b"22", crate::xattr::SetMode::Any).unwrap();
    match fops::listxattr(&gfs, file.ino, 64).unwrap() {
        XattrReply::Data(names) => assert_eq!(names, b"user.x\0"),
        _ => panic!("expected names"),
    }
    match fops::getxattr(&gfs, file.ino, "user.x", 64).unwrap() {
        XattrReply::Data(value) => assert_eq!(value, b"22"),
        _ => panic!("expected value"),
    }
    fops::removexattr(&gfs, file.ino, "user.x").unwrap();
    let err = fops::getxattr(&gfs, file.ino, "user.x", 64).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn concurrent_writers_merge() {
    let (gfs, path) = mount_fresh(16 * 1024);
    let (file, _handle) = fops::create(&gfs, root(), "shared", 0o644, 0, 0).unwrap();
    let pages = 16u64;
    let mut threads = Vec::new();
    for t in 0..2u64 {
        let gfs = gfs.clone();
        let ino = file.ino;
        threads.push(std::thread::spawn(move || {
            // Even pages to one thread, odd pages to the other
            for pg in (t..pages).step_by(2) {
                let buf = vec![(pg + 1) as u8; BLOCK_SIZE];
                fops::write(&gfs, ino, None, pg * BLOCK_SIZE as u64, &buf).unwrap();
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }
    flush_layer(&gfs, file.ino);
    {
        let fs = gfs.lock_layer(file.ino, false).unwrap();
        let iref = crate::inode::get_inode(&gfs, &fs, layer::handle_ino(file.ino), None, false)
            .unwrap();
        assert_eq!(iref.read().unwrap().pages_count(), 0);
        fs.rwlock.unlock_shared();
    }
    let reply = fops::read(&gfs, file.ino, None, 0, pages * BLOCK_SIZE as u64).unwrap();
    let content = reply.to_vec();
    for pg in 0..pages {
        let expected = (pg + 1) as u8;
        let slice = &content[(pg as usize) * BLOCK_SIZE..][..BLOCK_SIZE];
        assert!(slice.iter().all(|b| *b == expected), "page {pg} corrupt");
    }
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn commit_preserves_index_and_content() {
    let path = test_device(64 * 1024);
    let config = Config {
        format: true,
        swap_commit: true,
        ..Default::default()
    };
    let gfs = layer::mount(&path, config).unwrap();
    make_layer_root(&gfs);
    ctl(&gfs, crate::proto::CtlCmd::LayerCreate, None, "base").unwrap();
    let base = layer_handle(&gfs, "base");
    let (seed, h) = fops::create(&gfs, base, "seed", 0o644, 0, 0).unwrap();
    fops::write(&gfs, seed.ino, Some(&h), 0, b"from base").unwrap();
    fops::release(&gfs, seed.ino, h).unwrap();
    flush_layer(&gfs, base);
    ctl(&gfs, crate::proto::CtlCmd::LayerUmount, None, "base").unwrap();

    ctl(&gfs, crate::proto::CtlCmd::LayerCreateRw, Some("base"), "c1").unwrap();
    let c1 = layer_handle(&gfs, "c1");
    let c1_index = layer::handle_layer(c1);
    let (work, h) = fops::create(&gfs, c1, "work", 0o644, 0, 0).unwrap();
    fops::write(&gfs, work.ino, Some(&h), 0, b"container data").unwrap();
    fops::release(&gfs, work.ino, h).unwrap();
    flush_layer(&gfs, c1);

    ctl(&gfs, crate::proto::CtlCmd::LayerCommit, Some("c1"), "c2").unwrap();

    // The committed content kept its index and became read-only
    let committed = layer_handle(&gfs, "c1");
    assert_eq!(layer::handle_layer(committed), c1_index);
    {
        let fs = gfs.lock_layer(committed, false).unwrap();
        assert!(fs.read_only.load(Ordering::Relaxed));
        assert!(fs.frozen());
        fs.rwlock.unlock_shared();
    }
    let got = fops::lookup(&gfs, committed, "work").unwrap();
    let content = fops::read(&gfs, got.ino, None, 0, 64).unwrap().to_vec();
    assert_eq!(&content, b"container data");

    // The fresh working layer starts from the base image's root directory
    let fresh = layer_handle(&gfs, "c2");
    assert_ne!(layer::handle_layer(fresh), c1_index);
    {
        let fs = gfs.lock_layer(fresh, false).unwrap();
        assert!(!fs.read_only.load(Ordering::Relaxed));
        assert!(!fs.frozen());
        fs.rwlock.unlock_shared();
    }
    let seeded = fops::lookup(&gfs, fresh, "seed").unwrap();
    assert!(seeded.ino != 0);
    // Content written before the commit is not visible in the fresh layer
    let stale = fops::lookup(&gfs, fresh, "work").unwrap();
    assert_eq!(stale.ino, 0);
    // And the fresh layer takes writes
    let (f, h) = fops::create(&gfs, fresh, "next", 0o644, 0, 0).unwrap();
    fops::write(&gfs, f.ino, Some(&h), 0, b"round two").unwrap();
    fops::release(&gfs, f.ino, h).unwrap();
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn unlink_rejects_new_opens_but_keeps_handles() {
    let (gfs, path) = mount_fresh(16 * 1024);
    let (file, handle) = fops::create(&gfs, root(), "f", 0o644, 0, 0).unwrap();
    fops::write(&gfs, file.ino, Some(&handle), 0, b"still here").unwrap();
    fops::unlink(&gfs, root(), "f").unwrap();
    // The old handle still reads
    let content = fops::read(&gfs, file.ino, Some(&handle), 0, 64).unwrap().to_vec();
    assert_eq!(&content, b"still here");
    // A new open is rejected
    let err = fops::open(&gfs, file.ino, false).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    // The last release drops the data
    fops::release(&gfs, file.ino, handle).unwrap();
    {
        let fs = gfs.lock_layer(file.ino, false).unwrap();
        let iref = fs.icache.get(layer::handle_ino(file.ino)).unwrap();
        let guard = iref.read().unwrap();
        assert!(guard.flags.contains(InodeFlags::REMOVED));
        assert_eq!(guard.dino.blocks, 0);
        fs.rwlock.unlock_shared();
    }
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn fragmented_file_round_trip() {
    let (gfs, path) = mount_fresh(16 * 1024);
    let (file, handle) = fops::create(&gfs, root(), "holes", 0o644, 0, 0).unwrap();
    // Pages 0 and 2 written, page 1 a hole
    fops::write(&gfs, file.ino, Some(&handle), 0, &vec![0x11u8; BLOCK_SIZE]).unwrap();
    fops::write(
        &gfs,
        file.ino,
        Some(&handle),
        2 * BLOCK_SIZE as u64,
        &vec![0x33u8; BLOCK_SIZE],
    )
    .unwrap();
    fops::release(&gfs, file.ino, handle).unwrap();
    flush::unmount(&gfs).unwrap();
    drop(gfs);

    let gfs = layer::mount(&path, Config::default()).unwrap();
    let file = fops::lookup(&gfs, root(), "holes").unwrap();
    assert_eq!(file.attr.size, 3 * BLOCK_SIZE as u64);
    let content = fops::read(&gfs, file.ino, None, 0, 3 * BLOCK_SIZE as u64)
        .unwrap()
        .to_vec();
    assert!(content[..BLOCK_SIZE].iter().all(|b| *b == 0x11));
    assert!(content[BLOCK_SIZE..2 * BLOCK_SIZE].iter().all(|b| *b == 0));
    assert!(content[2 * BLOCK_SIZE..].iter().all(|b| *b == 0x33));
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn rename_and_readdir() {
    let (gfs, path) = mount_fresh(16 * 1024);
    let dir1 = fops::mkdir(&gfs, root(), "d1", 0o755, 0, 0).unwrap();
    let dir2 = fops::mkdir(&gfs, root(), "d2", 0o755, 0, 0).unwrap();
    let (file, _h) = fops::create(&gfs, dir1.ino, "f", 0o644, 0, 0).unwrap();
    // Rename within a directory
    fops::rename(&gfs, dir1.ino, "f", dir1.ino, "g").unwrap();
    assert_eq!(fops::lookup(&gfs, dir1.ino, "f").unwrap().ino, 0);
    assert_eq!(fops::lookup(&gfs, dir1.ino, "g").unwrap().ino, file.ino);
    // Move across directories
    fops::rename(&gfs, dir1.ino, "g", dir2.ino, "h").unwrap();
    assert_eq!(fops::lookup(&gfs, dir1.ino, "g").unwrap().ino, 0);
    assert_eq!(fops::lookup(&gfs, dir2.ino, "h").unwrap().ino, file.ino);
    let entries = fops::readdir(&gfs, dir2.ino, None, 0, 100).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "h");
    // Paged reads resume from the cookie
    for i in 0..5 {
        fops::create(&gfs, dir2.ino, &format!("n{i}"), 0o644, 0, 0).unwrap();
    }
    let first = fops::readdir(&gfs, dir2.ino, None, 0, 3).unwrap();
    let rest = fops::readdir(&gfs, dir2.ino, None, first.last().unwrap().off, 100).unwrap();
    assert_eq!(first.len() + rest.len(), 6);
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn allocated_blocks_are_disjoint_across_layers() {
    let (gfs, path) = mount_fresh(64 * 1024);
    make_layer_root(&gfs);
    ctl(&gfs, crate::proto::CtlCmd::LayerCreate, None, "l1").unwrap();
    let l1 = layer_handle(&gfs, "l1");
    let (f, h) = fops::create(&gfs, l1, "f", 0o644, 0, 0).unwrap();
    fops::write(&gfs, f.ino, Some(&h), 0, &vec![1u8; 4 * BLOCK_SIZE]).unwrap();
    fops::release(&gfs, f.ino, h).unwrap();
    flush_layer(&gfs, l1);
    ctl(&gfs, crate::proto::CtlCmd::LayerUmount, None, "l1").unwrap();
    ctl(&gfs, crate::proto::CtlCmd::LayerCreateRw, Some("l1"), "l2").unwrap();
    let l2 = layer_handle(&gfs, "l2");
    let f2 = fops::lookup(&gfs, l2, "f").unwrap();
    fops::write(&gfs, f2.ino, None, 0, &vec![2u8; 2 * BLOCK_SIZE]).unwrap();
    flush_layer(&gfs, l2);

    // Every allocated block lives in exactly one layer, and never in the
    // free pool
    let mut seen = std::collections::HashSet::new();
    for fs in gfs.layers_snapshot() {
        let la = fs.alloc.lock().unwrap();
        for e in la.aextents.iter() {
            for b in e.start..e.end() {
                assert!(seen.insert(b), "block {b} in two layers");
            }
        }
    }
    let ga = gfs.galloc.lock().unwrap();
    for e in ga.extents.iter() {
        for b in e.start..e.end() {
            assert!(!seen.contains(&b), "allocated block {b} in free pool");
        }
    }
    drop(ga);
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn layer_diff_reports_changes() {
    let (gfs, path) = mount_fresh(64 * 1024);
    make_layer_root(&gfs);
    ctl(&gfs, crate::proto::CtlCmd::LayerCreate, None, "img").unwrap();
    let img = layer_handle(&gfs, "img");
    let (f, h) = fops::create(&gfs, img, "keep", 0o644, 0, 0).unwrap();
    fops::release(&gfs, f.ino, h).unwrap();
    let (f, h) = fops::create(&gfs, img, "gone", 0o644, 0, 0).unwrap();
    fops::release(&gfs, f.ino, h).unwrap();
    let (f, h) = fops::create(&gfs, img, "change", 0o644, 0, 0).unwrap();
    fops::write(&gfs, f.ino, Some(&h), 0, b"v1").unwrap();
    fops::release(&gfs, f.ino, h).unwrap();
    flush_layer(&gfs, img);
    ctl(&gfs, crate::proto::CtlCmd::LayerUmount, None, "img").unwrap();

    ctl(&gfs, crate::proto::CtlCmd::LayerCreateRw, Some("img"), "top").unwrap();
    let top = layer_handle(&gfs, "top");
    let (f, h) = fops::create(&gfs, top, "fresh", 0o644, 0, 0).unwrap();
    fops::release(&gfs, f.ino, h).unwrap();
    let changed = fops::lookup(&gfs, top, "change").unwrap();
    fops::write(&gfs, changed.ino, None, 0, b"v2").unwrap();
    fops::unlink(&gfs, top, "gone").unwrap();

    let changes = crate::diff::layer_diff(&gfs, "top").unwrap();
    let find = |name: &str| changes.iter().find(|c| c.path == format!("/{name}"));
    assert_eq!(find("fresh").unwrap().kind, ChangeKind::Added);
    assert_eq!(find("change").unwrap().kind, ChangeKind::Modified);
    assert_eq!(find("gone").unwrap().kind, ChangeKind::Removed);
    assert!(find("keep").is_none());
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn frozen_layer_rejects_writes() {
    let (gfs, path) = mount_fresh(64 * 1024);
    make_layer_root(&gfs);
    ctl(&gfs, crate::proto::CtlCmd::LayerCreate, None, "ro").unwrap();
    let ro = layer_handle(&gfs, "ro");
    ctl(&gfs, crate::proto::CtlCmd::LayerUmount, None, "ro").unwrap();
    let err = fops::create(&gfs, ro, "nope", 0o644, 0, 0).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EROFS));
    let err = fops::mkdir(&gfs, ro, "nope", 0o755, 0, 0).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EROFS));
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn layer_root_subdir_is_protected() {
    let (gfs, path) = mount_fresh(64 * 1024);
    let lr = make_layer_root(&gfs);
    ctl(&gfs, crate::proto::CtlCmd::LayerCreate, None, "img").unwrap();
    // Removing a layer root through rmdir is rejected
    let err = fops::rmdir(&gfs, lr, "img").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    // Control commands elsewhere than the layer root are rejected
    let err = fops::ioctl(
        &gfs,
        root(),
        crate::proto::CtlCmd::LayerCreate as u32,
        &encode_ctl_payload(None, "x"),
    )
    .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));
    // Commit needs the swap-layers option
    let err = ctl(&gfs, crate::proto::CtlCmd::LayerCommit, Some("img"), "img2").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn deleting_container_removes_init_layer() {
    let (gfs, path) = mount_fresh(64 * 1024);
    make_layer_root(&gfs);
    ctl(&gfs, crate::proto::CtlCmd::LayerCreate, None, "img").unwrap();
    ctl(&gfs, crate::proto::CtlCmd::LayerUmount, None, "img").unwrap();
    ctl(&gfs, crate::proto::CtlCmd::LayerCreateRw, Some("img"), "app-init").unwrap();
    ctl(&gfs, crate::proto::CtlCmd::LayerUmount, None, "app-init").unwrap();
    ctl(&gfs, crate::proto::CtlCmd::LayerCreateRw, Some("app-init"), "app").unwrap();
    let app = layer_handle(&gfs, "app");
    let init = layer_handle(&gfs, "app-init");
    ctl(&gfs, crate::proto::CtlCmd::LayerRemove, None, "app").unwrap();
    // Both the container and its init layer are gone from the table
    assert!(gfs.layer(layer::handle_layer(app)).is_none());
    assert!(gfs.layer(layer::handle_layer(init)).is_none());
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn statfs_reports_the_device() {
    let (gfs, path) = mount_fresh(16 * 1024);
    let statfs = fops::statfs(&gfs);
    assert_eq!(statfs.bsize, BLOCK_SIZE as u32);
    assert_eq!(statfs.blocks, 16 * 1024);
    assert!(statfs.bfree < statfs.blocks);
    assert_eq!(statfs.namemax, FILENAME_MAX as u32);
    flush::unmount(&gfs).unwrap();
    std::fs::remove_file(&path).unwrap();
}
