//! The pacemaker.
//!
//! An optional front-end to the manager that bounds how many archive file
//! systems stay mounted at once. Every access moves the mount point to the
//! young end of an LRU list; when the bound is exceeded, the eldest mount
//! is flushed and unmounted *without* forcing streams closed. A busy mount
//! simply stays mounted and is retried on a later overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::addr::MountPoint;
use crate::controller::Controller;
use crate::error::FsResult;
use crate::manager::Manager;
use crate::sync_options::SyncOptions;

/// Bounded-LRU front-end to a [`Manager`].
pub struct Pacemaker {
    manager: Manager,
    maximum: AtomicUsize,
    lru: Mutex<VecDeque<MountPoint>>,
}

impl Pacemaker {
    /// Wrap a manager with the given bound on mounted archive file systems.
    /// [`Manager::pacemaker`] builds one with the configured bound instead.
    pub fn new(manager: Manager, maximum: usize) -> Pacemaker {
        Pacemaker {
            manager,
            maximum: AtomicUsize::new(maximum.max(1)),
            lru: Mutex::new(VecDeque::new()),
        }
    }

    /// The bound on mounted archive file systems.
    pub fn maximum_mounted(&self) -> usize {
        self.maximum.load(Ordering::Relaxed)
    }

    /// Adjust the bound at runtime. Takes effect on the next access.
    pub fn set_maximum_mounted(&self, maximum: usize) {
        self.maximum.store(maximum.max(1), Ordering::Relaxed);
    }

    /// The wrapped manager.
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Like [`Manager::controller`], additionally recording the access and
    /// retiring the eldest mounts beyond the bound.
    pub fn controller(&self, mount_point: &MountPoint) -> FsResult<Arc<dyn Controller>> {
        let controller = self.manager.controller(mount_point)?;
        if mount_point.is_nested() {
            self.accessed(mount_point);
        }
        Ok(controller)
    }

    fn accessed(&self, mount_point: &MountPoint) {
        let eldest: Vec<MountPoint> = {
            let mut lru = self.lru.lock();
            lru.retain(|mp| mp != mount_point);
            lru.push_back(mount_point.clone());
            let maximum = self.maximum_mounted();
            let mut evict = Vec::new();
            while lru.len() > maximum {
                match lru.pop_front() {
                    Some(mp) => evict.push(mp),
                    None => break,
                }
            }
            evict
        };
        for mount_point in eldest {
            // Flush and unmount, but never force: a busy archive fails the
            // bounded wait, stays mounted and gets another chance later.
            let opts = SyncOptions::UMOUNT | SyncOptions::CLEAR_CACHE;
            match self.manager.sync_mount(&mount_point, opts) {
                Ok(()) => debug!("pacemaker retired {mount_point}"),
                Err(err) if err.is_warning_only() => {
                    debug!("pacemaker retired {mount_point} with warnings: {err}");
                }
                Err(err) => {
                    warn!("pacemaker could not retire {mount_point}: {err}");
                    self.lru.lock().push_back(mount_point);
                }
            }
        }
    }
}

impl std::fmt::Debug for Pacemaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pacemaker")
            .field("maximum", &self.maximum_mounted())
            .field("tracked", &self.lru.lock().len())
            .finish()
    }
}
