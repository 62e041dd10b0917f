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

//! Per-layer request statistics.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Operations tracked per layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Lookup = 0,
    Getattr,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Release,
    Opendir,
    Readdir,
    Releasedir,
    Statfs,
    Setxattr,
    Getxattr,
    Listxattr,
    Removexattr,
    Create,
    Ioctl,
    LayerCreate,
    LayerRemove,
    LayerCommit,
    LayerDiff,
    LayerMount,
    LayerUmount,
    LayerStat,
    Cleanup,
}

/// Number of tracked operations.
pub const OP_MAX: usize = Op::Cleanup as usize + 1;

/// Operation names, for display.
const OP_NAMES: [&str; OP_MAX] = [
    "lookup",
    "getattr",
    "setattr",
    "readlink",
    "mknod",
    "mkdir",
    "unlink",
    "rmdir",
    "symlink",
    "rename",
    "link",
    "open",
    "read",
    "write",
    "release",
    "opendir",
    "readdir",
    "releasedir",
    "statfs",
    "setxattr",
    "getxattr",
    "listxattr",
    "removexattr",
    "create",
    "ioctl",
    "layer_create",
    "layer_remove",
    "layer_commit",
    "layer_diff",
    "layer_mount",
    "layer_umount",
    "layer_stat",
    "cleanup",
];

/// Request counters for one layer.
pub struct Stats {
    /// Set when request statistics are being gathered.
    enabled: bool,
    /// Requests completed, by operation.
    counts: [AtomicU64; OP_MAX],
    /// Requests failed, by operation.
    errors: [AtomicU64; OP_MAX],
    /// Cumulative wall time, by operation, in nanoseconds.
    nanos: [AtomicU64; OP_MAX],
}

impl Stats {
    /// Creates the counters. When `enabled` is false, every call is a no-op.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
            nanos: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Starts timing a request.
    pub fn begin(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    /// Records a completed request.
    pub fn add(&self, op: Op, err: bool, start: Option<Instant>) {
        if !self.enabled {
            return;
        }
        self.counts[op as usize].fetch_add(1, Ordering::Relaxed);
        if err {
            self.errors[op as usize].fetch_add(1, Ordering::Relaxed);
        }
        if let Some(start) = start {
            self.nanos[op as usize].fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
    }

    /// Resets all counters.
    pub fn clear(&self) {
        for i in 0..OP_MAX {
            self.counts[i].store(0, Ordering::Relaxed);
            self.errors[i].store(0, Ordering::Relaxed);
            self.nanos[i].store(0, Ordering::Relaxed);
        }
    }

    /// Formats the non-zero counters, one line per operation.
    pub fn format(&self) -> String {
        if !self.enabled {
            return String::new();
        }
        let mut out = String::new();
        for i in 0..OP_MAX {
            let count = self.counts[i].load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            let errors = self.errors[i].load(Ordering::Relaxed);
            let nanos = self.nanos[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "\t{:<14} count {count:<10} errors {errors:<6} total {}us\n",
                OP_NAMES[i],
                nanos / 1000
            ));
        }
        out
    }

    /// Displays the non-zero counters.
    pub fn display(&self, name: &str) {
        let body = self.format();
        if !body.is_empty() {
            eprintln!("Request stats for {name}:\n{body}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_when_enabled() {
        let stats = Stats::new(true);
        let start = stats.begin();
        assert!(start.is_some());
        stats.add(Op::Lookup, false, start);
        stats.add(Op::Lookup, true, None);
        let out = stats.format();
        assert!(out.contains("lookup"));
        assert!(out.contains("count 2"));
        assert!(out.contains("errors 1"));
        stats.clear();
        assert!(stats.format().is_empty());
    }

    #[test]
    fn noop_when_disabled() {
        let stats = Stats::new(false);
        assert!(stats.begin().is_none());
        stats.add(Op::Read, false, None);
        assert!(stats.format().is_empty());
    }
}
