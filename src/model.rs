//! Per-mount mutable state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::MountPoint;
use crate::error::FsError;
use crate::rwlock::ReentrantRwLock;

type TouchHook = Box<dyn Fn(&MountPoint) + Send + Sync>;

/// The shared mutable state of one file system: its mount point, the
/// `touched` flag tracking un-synced writes, the file system lock, and the
/// memo for a persistent false positive.
pub struct Model {
    mount_point: MountPoint,
    touched: AtomicBool,
    lock: ReentrantRwLock,
    false_positive: Mutex<Option<FsError>>,
    touch_hook: Mutex<Option<TouchHook>>,
}

impl Model {
    /// Fresh state for the given mount point.
    pub fn new(mount_point: MountPoint) -> Arc<Model> {
        Arc::new(Model {
            mount_point,
            touched: AtomicBool::new(false),
            lock: ReentrantRwLock::new(),
            false_positive: Mutex::new(None),
            touch_hook: Mutex::new(None),
        })
    }

    /// The mount point this state belongs to.
    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    /// The mount point of the parent file system, if any.
    pub fn parent_mount_point(&self) -> Option<&MountPoint> {
        self.mount_point.parent()
    }

    /// Whether writes have occurred since the last successful sync.
    pub fn is_touched(&self) -> bool {
        self.touched.load(Ordering::Acquire)
    }

    /// Mark the file system as carrying un-synced changes.
    pub(crate) fn touch(&self) {
        if !self.touched.swap(true, Ordering::AcqRel) {
            if let Some(hook) = self.touch_hook.lock().as_ref() {
                hook(&self.mount_point);
            }
        }
    }

    /// Reset the touched flag after a successful sync or abort.
    pub(crate) fn reset_touched(&self) {
        self.touched.store(false, Ordering::Release);
    }

    /// Invoked once when the model first becomes touched after a sync; the
    /// manager uses this to pin the controller until the changes are synced.
    pub(crate) fn set_touch_hook(&self, hook: TouchHook) {
        *self.touch_hook.lock() = Some(hook);
    }

    /// The file system lock.
    pub(crate) fn lock(&self) -> &ReentrantRwLock {
        &self.lock
    }

    /// The memoized cause of a persistent false positive, if any.
    pub(crate) fn false_positive(&self) -> Option<FsError> {
        self.false_positive.lock().clone()
    }

    pub(crate) fn set_false_positive(&self, cause: FsError) {
        *self.false_positive.lock() = Some(cause);
    }

    /// Forget a memoized false positive; called on sync so the next access
    /// re-probes the file.
    pub(crate) fn clear_false_positive(&self) {
        *self.false_positive.lock() = None;
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("mount_point", &self.mount_point)
            .field("touched", &self.is_touched())
            .field("lock", &self.lock)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn touch_fires_hook_once() {
        let model = Model::new(MountPoint::parse("file:/tmp/").unwrap());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        model.set_touch_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!model.is_touched());
        model.touch();
        model.touch();
        assert!(model.is_touched());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        model.reset_touched();
        model.touch();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
