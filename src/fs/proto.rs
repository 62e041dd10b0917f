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

//! Reply types of the filesystem protocol boundary and the control-plane
//! command codec.
//!
//! The kernel transport registers the operation handlers of [`crate::fops`]
//! and turns these replies into protocol messages; errno values travel in
//! [`std::io::Error::raw_os_error`].

use crate::bcache::PageData;
use crate::layout::BLOCK_SIZE;
use crate::layout::FILENAME_MAX;
use std::io;
use std::sync::Arc;

/// Attributes of an inode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attr {
    /// File handle: layer index and inode number.
    pub ino: u64,
    /// Mode and permissions.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Device id of special files.
    pub rdev: u64,
    /// Size in bytes.
    pub size: u64,
    /// Blocks in use.
    pub blocks: u64,
    /// Modification time, seconds.
    pub mtime_sec: i64,
    /// Modification time, nanoseconds.
    pub mtime_nsec: i64,
    /// Change time, seconds.
    pub ctime_sec: i64,
    /// Change time, nanoseconds.
    pub ctime_nsec: i64,
}

/// A lookup/create reply. A zero `ino` is a negative entry the kernel may
/// cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct Entry {
    /// File handle of the resolved inode, zero when negative.
    pub ino: u64,
    /// Attributes of the inode.
    pub attr: Attr,
    /// Generation number.
    pub generation: u64,
}

impl Entry {
    /// Builds a positive entry.
    pub fn new(ino: u64, attr: Attr) -> Self {
        Self {
            ino,
            attr,
            generation: 1,
        }
    }

    /// Builds a negative entry.
    pub fn negative() -> Self {
        Self::default()
    }
}

/// A statfs reply.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatFs {
    /// Block size.
    pub bsize: u32,
    /// Fragment size.
    pub frsize: u32,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Inodes available to unprivileged users.
    pub favail: u64,
    /// Maximum file name length.
    pub namemax: u32,
}

impl StatFs {
    /// Fills the fixed fields.
    pub fn new(tblocks: u64, used: u64, inodes: u64) -> Self {
        let bfree = tblocks - used;
        Self {
            bsize: BLOCK_SIZE as u32,
            frsize: BLOCK_SIZE as u32,
            blocks: tblocks,
            bfree,
            bavail: bfree,
            files: u32::MAX as u64,
            ffree: u32::MAX as u64 - inodes,
            favail: u32::MAX as u64 - inodes,
            namemax: FILENAME_MAX as u32,
        }
    }
}

/// Which attributes a setattr request changes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    /// New mode, keeping the file type bits.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New size; shrinking truncates.
    pub size: Option<u64>,
    /// New modification time, or `None` with `mtime_now`.
    pub mtime: Option<(i64, i64)>,
    /// Set the modification time to now.
    pub mtime_now: bool,
}

/// One entry of a readdir reply.
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// File handle of the entry.
    pub ino: u64,
    /// File type bits.
    pub mode: u32,
    /// Cookie to resume reading after this entry.
    pub off: u64,
    /// Name of the entry.
    pub name: String,
}

/// One segment of a read reply. Segments reference cache pages directly so
/// the transport can splice them out without copying.
pub enum ReadSeg {
    /// A slice of a cached or dirty page.
    Data(Arc<PageData>, usize, usize),
    /// A hole, reading as zeroes.
    Zero(usize),
}

/// A vectored read reply.
pub struct ReadReply {
    /// The segments, in file order.
    pub segs: Vec<ReadSeg>,
}

impl ReadReply {
    /// Total length of the reply.
    pub fn len(&self) -> usize {
        self.segs
            .iter()
            .map(|s| match s {
                ReadSeg::Data(_, _, len) => *len,
                ReadSeg::Zero(len) => *len,
            })
            .sum()
    }

    /// Tells whether the reply is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the reply into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in &self.segs {
            match seg {
                ReadSeg::Data(data, off, len) => out.extend_from_slice(&data[*off..*off + *len]),
                ReadSeg::Zero(len) => out.resize(out.len() + len, 0),
            }
        }
        out
    }
}

/// Control-plane commands recognised on the layer root directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtlCmd {
    /// Create a read-only layer.
    LayerCreate = 101,
    /// Create a read-write layer.
    LayerCreateRw = 102,
    /// Remove a layer.
    LayerRemove = 103,
    /// Mark a layer mounted.
    LayerMount = 104,
    /// Unmount a layer, freezing images.
    LayerUmount = 105,
    /// Display global or layer stats.
    LayerStat = 106,
    /// Unmount all layers.
    UmountAll = 107,
    /// Clear stats of a layer.
    ClearStat = 108,
    /// Promote a read-write layer to a read-only image.
    LayerCommit = 109,
    /// Adjust the syncer interval, in seconds.
    SyncerTime = 110,
    /// Adjust the page cache memory budget, in megabytes.
    PcacheMemory = 111,
    /// Enumerate changes of a layer against its parent.
    LayerDiff = 112,
}

impl CtlCmd {
    /// Decodes a command number.
    pub fn from_u32(cmd: u32) -> Option<Self> {
        Some(match cmd {
            101 => Self::LayerCreate,
            102 => Self::LayerCreateRw,
            103 => Self::LayerRemove,
            104 => Self::LayerMount,
            105 => Self::LayerUmount,
            106 => Self::LayerStat,
            107 => Self::UmountAll,
            108 => Self::ClearStat,
            109 => Self::LayerCommit,
            110 => Self::SyncerTime,
            111 => Self::PcacheMemory,
            112 => Self::LayerDiff,
            _ => return None,
        })
    }
}

/// Encodes a control payload: a length-prefixed `"name"` or
/// `"parent\0name"` string.
pub fn encode_ctl_payload(parent: Option<&str>, name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(parent) = parent {
        body.extend_from_slice(parent.as_bytes());
        body.push(0);
    }
    body.extend_from_slice(name.as_bytes());
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decodes a control payload into `(parent, name)`.
pub fn decode_ctl_payload(buf: &[u8]) -> io::Result<(Option<String>, String)> {
    if buf.len() < 2 {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    let len = u16::from_le_bytes(buf[..2].try_into().unwrap()) as usize;
    let body = buf
        .get(2..2 + len)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
    let string_of = |raw: &[u8]| -> io::Result<String> {
        String::from_utf8(raw.to_vec()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
    };
    match body.iter().position(|b| *b == 0) {
        Some(split) => Ok((
            Some(string_of(&body[..split])?),
            string_of(&body[split + 1..])?,
        )),
        None => Ok((None, string_of(body)?)),
    }
}

/// Kind of a change reported by a layer diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Path exists here and not in the parent.
    Added = 0,
    /// Path exists in both, with different content.
    Modified = 1,
    /// Path exists in the parent only.
    Removed = 2,
}

/// One change of a layer relative to its parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    /// What happened to the path.
    pub kind: ChangeKind,
    /// The path, rooted at the layer.
    pub path: String,
}

/// Encodes a change stream: `(u8 kind, u16 len, path)` records.
pub fn encode_changes(changes: &[Change]) -> Vec<u8> {
    let mut out = Vec::new();
    for change in changes {
        out.push(change.kind as u8);
        out.extend_from_slice(&(change.path.len() as u16).to_le_bytes());
        out.extend_from_slice(change.path.as_bytes());
    }
    out
}

/// Decodes a change stream.
pub fn decode_changes(mut buf: &[u8]) -> io::Result<Vec<Change>> {
    let mut changes = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 3 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let kind = match buf[0] {
            0 => ChangeKind::Added,
            1 => ChangeKind::Modified,
            2 => ChangeKind::Removed,
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };
        let len = u16::from_le_bytes(buf[1..3].try_into().unwrap()) as usize;
        let path = buf
            .get(3..3 + len)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        changes.push(Change {
            kind,
            path: String::from_utf8_lossy(path).into_owned(),
        });
        buf = &buf[3 + len..];
    }
    Ok(changes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ctl_payload_round_trip() {
        let buf = encode_ctl_payload(None, "layer1");
        assert_eq!(decode_ctl_payload(&buf).unwrap(), (None, "layer1".into()));
        let buf = encode_ctl_payload(Some("base"), "layer2");
        assert_eq!(
            decode_ctl_payload(&buf).unwrap(),
            (Some("base".into()), "layer2".into())
        );
    }

    #[test]
    fn change_stream_round_trip() {
        let changes = vec![
            Change {
                kind: ChangeKind::Added,
                path: "/a".into(),
            },
            Change {
                kind: ChangeKind::Modified,
                path: "/a/b".into(),
            },
            Change {
                kind: ChangeKind::Removed,
                path: "/c".into(),
            },
        ];
        let buf = encode_changes(&changes);
        assert_eq!(decode_changes(&buf).unwrap(), changes);
    }

    #[test]
    fn command_numbers() {
        assert_eq!(CtlCmd::from_u32(101), Some(CtlCmd::LayerCreate));
        assert_eq!(CtlCmd::from_u32(108), Some(CtlCmd::ClearStat));
        assert_eq!(CtlCmd::from_u32(42), None);
        assert_eq!(CtlCmd::LayerDiff as u32, 112);
    }
}
