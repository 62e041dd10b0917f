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

//! Block I/O on the underlying device or file.

use crate::layout::BLOCK_SIZE;
use libc::ioctl;
use std::ffi::c_long;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Error;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// The device backing a filesystem.
pub struct Device {
    /// The device or regular file.
    file: File,
    /// Size of the device in blocks.
    size: u64,
    /// Number of block reads issued.
    reads: AtomicU64,
    /// Number of block writes issued.
    writes: AtomicU64,
}

/// Returns the size of the given device or file in bytes.
fn device_size(file: &File) -> io::Result<u64> {
    let metadata = file.metadata()?;
    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        let mut size: u64 = 0;
        let ret = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(size)
    } else if file_type.is_file() {
        Ok(metadata.len())
    } else {
        Err(Error::from_raw_os_error(libc::EINVAL))
    }
}

impl Device {
    /// Opens the device at `path` for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = device_size(&file)? / BLOCK_SIZE as u64;
        Ok(Self {
            file,
            size,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Returns the size of the device in blocks.
    pub fn size_blocks(&self) -> u64 {
        self.size
    }

    /// Reads the filesystem block `block` into `buf`.
    pub fn read_block(&self, block: u64, buf: &mut [u8]) -> io::Result<()> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        assert!(block < self.size);
        self.file.read_exact_at(buf, block * BLOCK_SIZE as u64)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes `buf` at the filesystem block `block`.
    pub fn write_block(&self, buf: &[u8], block: u64) -> io::Result<()> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        assert!(block < self.size);
        self.file.write_all_at(buf, block * BLOCK_SIZE as u64)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a scatter/gather list of blocks contiguously, starting at
    /// `block`.
    pub fn write_blocks(&self, bufs: &[&[u8]], block: u64) -> io::Result<()> {
        assert!(block + bufs.len() as u64 <= self.size);
        let iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|buf| {
                assert_eq!(buf.len(), BLOCK_SIZE);
                libc::iovec {
                    iov_base: buf.as_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                }
            })
            .collect();
        let mut off = block * BLOCK_SIZE as u64;
        let mut next = 0;
        // pwritev may write a prefix of the list; advance and retry
        while next < iov.len() {
            let ret = unsafe {
                libc::pwritev(
                    self.file.as_raw_fd(),
                    iov[next..].as_ptr(),
                    (iov.len() - next) as libc::c_int,
                    off as libc::off_t,
                )
            };
            if ret < 0 {
                return Err(Error::last_os_error());
            }
            let written = ret as usize;
            assert_eq!(written % BLOCK_SIZE, 0);
            off += written as u64;
            next += written / BLOCK_SIZE;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes all written data to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Returns the number of reads and writes issued so far.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::layout::new_block;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    /// Creates a sparse test device of `blocks` blocks in the temp
    /// directory and returns its path.
    pub fn test_device(blocks: u64) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "layerfs-test-{}-{seq}.img",
            std::process::id()
        ));
        let file = File::create(&path).unwrap();
        file.set_len(blocks * BLOCK_SIZE as u64).unwrap();
        path
    }

    #[test]
    fn read_back_written_blocks() {
        let path = test_device(64);
        let dev = Device::open(&path).unwrap();
        assert_eq!(dev.size_blocks(), 64);
        let mut one = new_block();
        one[..4].copy_from_slice(b"one!");
        let mut two = new_block();
        two[..4].copy_from_slice(b"two!");
        dev.write_blocks(&[&one[..], &two[..]], 10).unwrap();
        let mut buf = new_block();
        dev.read_block(11, &mut buf[..]).unwrap();
        assert_eq!(&buf[..4], b"two!");
        dev.read_block(10, &mut buf[..]).unwrap();
        assert_eq!(&buf[..4], b"one!");
        let (reads, writes) = dev.counters();
        assert_eq!(reads, 2);
        assert_eq!(writes, 1);
        std::fs::remove_file(&path).unwrap();
    }
}
