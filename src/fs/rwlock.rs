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

//! A reader/writer lock with explicit unlock.
//!
//! Layer locks are taken in one function and released in another (an admin
//! operation replies to the caller before finishing its work under the
//! lock), which rules out guard-based locking.

use std::sync::Condvar;
use std::sync::Mutex;

/// Lock state.
#[derive(Default)]
struct State {
    /// Number of active readers.
    readers: u32,
    /// Set while a writer holds the lock.
    writer: bool,
    /// Number of writers waiting. Blocks new readers.
    waiting: u32,
}

/// A reader/writer lock without guards.
#[derive(Default)]
pub struct RwLock {
    state: Mutex<State>,
    cond: Condvar,
}

impl RwLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock in shared mode.
    pub fn lock_shared(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.waiting > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
    }

    /// Tries to acquire the lock in shared mode without blocking.
    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.waiting > 0 {
            return false;
        }
        state.readers += 1;
        true
    }

    /// Acquires the lock in exclusive mode.
    pub fn lock_exclusive(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting += 1;
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.waiting -= 1;
        state.writer = true;
    }

    /// Tries to acquire the lock in exclusive mode without blocking.
    pub fn try_lock_exclusive(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    /// Acquires the lock in the requested mode.
    pub fn lock(&self, exclusive: bool) {
        if exclusive {
            self.lock_exclusive();
        } else {
            self.lock_shared();
        }
    }

    /// Releases a shared hold.
    pub fn unlock_shared(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.readers > 0 && !state.writer);
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Releases an exclusive hold.
    pub fn unlock_exclusive(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.writer && state.readers == 0);
        state.writer = false;
        self.cond.notify_all();
    }

    /// Releases a hold of the given mode.
    pub fn unlock(&self, exclusive: bool) {
        if exclusive {
            self.unlock_exclusive();
        } else {
            self.unlock_shared();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::thread;

    #[test]
    fn shared_holds_coexist() {
        let lock = RwLock::new();
        lock.lock_shared();
        assert!(lock.try_lock_shared());
        assert!(!lock.try_lock_exclusive());
        lock.unlock_shared();
        lock.unlock_shared();
        assert!(lock.try_lock_exclusive());
        assert!(!lock.try_lock_shared());
        lock.unlock_exclusive();
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::new());
        let hits = Arc::new(AtomicU32::new(0));
        lock.lock_exclusive();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let hits = hits.clone();
                thread::spawn(move || {
                    lock.lock_shared();
                    hits.fetch_add(1, Ordering::SeqCst);
                    lock.unlock_shared();
                })
            })
            .collect();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        lock.unlock_exclusive();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
