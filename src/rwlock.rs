//! The reentrant read-write lock guarding one file system.
//!
//! Differences from an ordinary RW lock, dictated by the concurrency model:
//!
//! - A thread may re-enter its own write lock, and may take the read lock
//!   while holding the write lock.
//! - Upgrading a read lock to a write lock is refused. Inner layers detect
//!   the situation via [`ReentrantRwLock::check_write_held`] and raise
//!   `NeedsWriteLock`; the locking layer then re-runs the operation on the
//!   write lock from scratch.
//! - Acquisition is observable per thread so that nested frames can switch
//!   to try-acquisition, which is what turns potential deadlock between
//!   file systems into the lock-retry protocol.

use std::cell::Cell;
use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{FsError, FsResult};

thread_local! {
    // Number of kernel file system locks held by this thread. Nonzero means
    // further locks must be try-acquired to respect the lock order.
    static HELD: Cell<usize> = const { Cell::new(0) };
}

/// Whether the current thread already holds any file system lock.
pub(crate) fn current_thread_holds_locks() -> bool {
    HELD.with(|h| h.get()) != 0
}

fn held_inc() {
    HELD.with(|h| h.set(h.get() + 1));
}

fn held_dec() {
    HELD.with(|h| h.set(h.get() - 1));
}

#[derive(Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_depth: usize,
    readers: HashMap<ThreadId, usize>,
}

impl LockState {
    fn write_held_by(&self, me: ThreadId) -> bool {
        self.writer == Some(me)
    }

    fn can_write(&self, me: ThreadId) -> bool {
        match self.writer {
            Some(owner) => owner == me,
            // No writer: writable only when nobody reads. A thread's own
            // read lock also blocks it, which is why upgrades are refused.
            None => self.readers.is_empty(),
        }
    }

    fn can_read(&self, me: ThreadId) -> bool {
        match self.writer {
            Some(owner) => owner == me,
            None => true,
        }
    }
}

/// Reentrant read-write lock. See the module docs for the semantics.
#[derive(Default)]
pub(crate) struct ReentrantRwLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl ReentrantRwLock {
    pub(crate) fn new() -> ReentrantRwLock {
        ReentrantRwLock::default()
    }

    /// Acquire the read lock, blocking.
    pub(crate) fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !state.can_read(me) {
            self.released.wait(&mut state);
        }
        *state.readers.entry(me).or_insert(0) += 1;
        drop(state);
        held_inc();
        ReadGuard { lock: self }
    }

    /// Try to acquire the read lock without blocking.
    pub(crate) fn try_read(&self) -> Option<ReadGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if !state.can_read(me) {
            return None;
        }
        *state.readers.entry(me).or_insert(0) += 1;
        drop(state);
        held_inc();
        Some(ReadGuard { lock: self })
    }

    /// Acquire the write lock, blocking.
    ///
    /// Must not be called while the current thread holds only the read lock;
    /// that would be an upgrade, which deadlocks against other upgraders.
    /// The locking layer guarantees this by releasing the read lock before
    /// re-running an operation on the write lock.
    pub(crate) fn write(&self) -> WriteGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        debug_assert!(
            state.write_held_by(me) || !state.readers.contains_key(&me),
            "read-to-write upgrade attempted"
        );
        while !state.can_write(me) {
            self.released.wait(&mut state);
        }
        state.writer = Some(me);
        state.write_depth += 1;
        drop(state);
        held_inc();
        WriteGuard { lock: self }
    }

    /// Try to acquire the write lock without blocking.
    pub(crate) fn try_write(&self) -> Option<WriteGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.readers.contains_key(&me) && !state.write_held_by(me) {
            // An upgrade can never succeed.
            return None;
        }
        if !state.can_write(me) {
            return None;
        }
        state.writer = Some(me);
        state.write_depth += 1;
        drop(state);
        held_inc();
        Some(WriteGuard { lock: self })
    }

    /// Whether the current thread holds the write lock.
    pub(crate) fn is_write_held_by_current(&self) -> bool {
        self.state.lock().write_held_by(thread::current().id())
    }

    /// Fails with `NeedsWriteLock` unless the current thread holds the write
    /// lock. Inner layers call this before any mutation.
    pub(crate) fn check_write_held(&self) -> FsResult<()> {
        if self.is_write_held_by_current() {
            Ok(())
        } else {
            Err(FsError::NeedsWriteLock)
        }
    }
}

impl std::fmt::Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReentrantRwLock")
            .field("writer", &state.writer)
            .field("write_depth", &state.write_depth)
            .field("readers", &state.readers.len())
            .finish()
    }
}

/// RAII read guard.
pub(crate) struct ReadGuard<'a> {
    lock: &'a ReentrantRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut state = self.lock.state.lock();
        if let Some(count) = state.readers.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&me);
            }
        }
        drop(state);
        held_dec();
        self.lock.released.notify_all();
    }
}

/// RAII write guard.
pub(crate) struct WriteGuard<'a> {
    lock: &'a ReentrantRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.write_depth -= 1;
        if state.write_depth == 0 {
            state.writer = None;
        }
        drop(state);
        held_dec();
        self.lock.released.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn write_is_reentrant() {
        let lock = ReentrantRwLock::new();
        let _a = lock.write();
        let _b = lock.write();
        assert!(lock.is_write_held_by_current());
        let _c = lock.read();
    }

    #[test]
    fn check_write_held_signals() {
        let lock = ReentrantRwLock::new();
        assert!(matches!(
            lock.check_write_held(),
            Err(FsError::NeedsWriteLock)
        ));
        let _g = lock.write();
        assert!(lock.check_write_held().is_ok());
    }

    #[test]
    fn upgrade_is_refused() {
        let lock = ReentrantRwLock::new();
        let _r = lock.read();
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn readers_exclude_writers() {
        let lock = Arc::new(ReentrantRwLock::new());
        let _r = lock.read();
        let other = Arc::clone(&lock);
        let handle = std::thread::spawn(move || other.try_write().is_none());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn held_count_tracks_guards() {
        let lock = ReentrantRwLock::new();
        assert!(!current_thread_holds_locks());
        {
            let _g = lock.write();
            assert!(current_thread_holds_locks());
        }
        assert!(!current_thread_holds_locks());
    }
}
