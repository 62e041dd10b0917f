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

//! A user-space layered copy-on-write filesystem for container images.
//!
//! One block device (or plain file) holds a tree of layers: a read-only
//! base layer plus image and container layers, each a complete filesystem
//! view sharing unchanged blocks with its parent. The kernel transport
//! drives the operation handlers in [`fops`]; the control plane of
//! [`proto`] creates, commits and deletes layers.

pub mod alloc;
pub mod bcache;
pub mod crc32;
pub mod device;
pub mod diff;
pub mod dir;
pub mod emap;
pub mod extent;
pub mod flush;
pub mod fops;
pub mod inode;
pub mod layer;
pub mod layout;
pub mod memory;
pub mod page;
pub mod proto;
pub mod rwlock;
pub mod stats;
pub mod xattr;

#[cfg(test)]
mod tests;
