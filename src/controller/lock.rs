//! Layer 1 (inside the false-positive fallback): locking.
//!
//! Serializes concurrent threads per file system on the model's reentrant
//! read-write lock and implements both halves of the retry machinery:
//!
//! - `NeedsWriteLock`, raised by an inner layer that discovered it must
//!   mutate while only the read lock is held, makes this layer release the
//!   read lock and re-run the operation on the write lock.
//! - `NeedsLockRetry`, raised when a nested frame could not try-acquire a
//!   lock without risking a deadlock, makes the *outermost* locked frame on
//!   the thread release everything, sleep for a uniformly random interval
//!   and re-run the operation from the top. Operations are required to be
//!   consistent under partial execution, which makes the re-run sound.

use std::sync::Arc;
use std::time::Duration;

use crate::access_options::{AccessKinds, AccessOptions};
use crate::addr::EntryName;
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult, SyncError};
use crate::model::Model;
use crate::rwlock::current_thread_holds_locks;
use crate::socket::{
    FsInputStream, FsOutputStream, InputEndpoint, OnClose, OutputEndpoint,
};
use crate::sync_options::SyncOptions;

/// Sleep for a uniformly random interval in `[1, timeout]`.
fn backoff(timeout: Duration) {
    let millis = timeout.as_millis().max(1) as u64;
    std::thread::sleep(Duration::from_millis(fastrand::u64(1..=millis)));
}

/// Layer 1 controller.
pub(crate) struct LockController<C> {
    model: Arc<Model>,
    timeout: Duration,
    inner: C,
}

impl<C: Controller> LockController<C> {
    pub(crate) fn new(model: Arc<Model>, timeout: Duration, inner: C) -> LockController<C> {
        LockController {
            model,
            timeout,
            inner,
        }
    }

    /// Run `op` under this file system's lock.
    ///
    /// The outermost locked frame on a thread acquires blocking and owns the
    /// back-off retry loop; nested frames only ever try-acquire so that a
    /// cross-file-system deadlock degenerates into a retry instead.
    fn apply<T>(&self, write: bool, op: &dyn Fn(&C) -> FsResult<T>) -> FsResult<T> {
        if current_thread_holds_locks() {
            return self.apply_nested(write, op);
        }
        let mut write = write;
        loop {
            let result = if write {
                let _guard = self.model.lock().write();
                op(&self.inner)
            } else {
                let _guard = self.model.lock().read();
                op(&self.inner)
            };
            match result {
                Err(FsError::NeedsWriteLock) if !write => {
                    write = true;
                }
                Err(FsError::NeedsLockRetry) => backoff(self.timeout),
                other => return other,
            }
        }
    }

    fn apply_nested<T>(&self, write: bool, op: &dyn Fn(&C) -> FsResult<T>) -> FsResult<T> {
        if write {
            match self.model.lock().try_write() {
                Some(_guard) => op(&self.inner),
                None => Err(FsError::NeedsLockRetry),
            }
        } else {
            let result = match self.model.lock().try_read() {
                Some(_guard) => op(&self.inner),
                None => return Err(FsError::NeedsLockRetry),
            };
            match result {
                // The read guard is gone; escalate on the write lock.
                Err(FsError::NeedsWriteLock) => self.apply_nested(true, op),
                other => other,
            }
        }
    }

    /// Derive a close commit that re-acquires this file system's write lock.
    fn locked_close(&self, orig: OnClose) -> OnClose {
        let model = Arc::clone(&self.model);
        let timeout = self.timeout;
        let mut orig = orig;
        Box::new(move |written| loop {
            if current_thread_holds_locks() {
                return match model.lock().try_write() {
                    Some(_guard) => orig(written),
                    None => Err(FsError::NeedsLockRetry),
                };
            }
            let result = {
                let _guard = model.lock().write();
                orig(written)
            };
            match result {
                Err(FsError::NeedsLockRetry) => backoff(timeout),
                other => return other,
            }
        })
    }
}

impl<C: Controller> Controller for LockController<C> {
    fn model(&self) -> &Arc<Model> {
        &self.model
    }

    fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    fn stat(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.apply(false, &|inner| inner.stat(opts, name))
    }

    fn check_access(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
    ) -> FsResult<()> {
        self.apply(false, &|inner| inner.check_access(opts, name, kinds))
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        self.apply(true, &|inner| inner.set_read_only(name))
    }

    fn set_time(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
        millis: i64,
    ) -> FsResult<()> {
        self.apply(true, &|inner| inner.set_time(opts, name, kinds, millis))
    }

    fn mknod(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kind: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        self.apply(true, &|inner| {
            inner.mknod(opts, name, kind, template.clone())
        })
    }

    fn unlink(&self, opts: AccessOptions, name: &EntryName) -> FsResult<()> {
        self.apply(true, &|inner| inner.unlink(opts, name))
    }

    fn sync(&self, opts: SyncOptions) -> Result<(), SyncError> {
        loop {
            let result = {
                let _guard = self.model.lock().write();
                self.inner.sync(opts)
            };
            match result {
                Err(composite) if composite.contains_lock_retry() => backoff(self.timeout),
                other => return other,
            }
        }
    }

    fn input_target(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Entry> {
        self.apply(false, &|inner| inner.input_target(opts, name))
    }

    fn output_target(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        self.apply(true, &|inner| inner.output_target(opts, name, template))
    }

    fn open_input(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        peer: Option<&dyn OutputEndpoint>,
    ) -> FsResult<FsInputStream> {
        // Opening a stream may mount and install accounting state, so it
        // always runs on the write lock.
        self.apply(true, &|inner| inner.open_input(opts, name, peer))
    }

    fn open_output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
        peer: Option<&dyn InputEndpoint>,
    ) -> FsResult<FsOutputStream> {
        let mut stream = self.apply(true, &|inner| inner.open_output(opts, name, template, peer))?;
        stream.wrap_close_with(|orig| self.locked_close(orig));
        Ok(stream)
    }
}
