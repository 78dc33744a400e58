//! The file system manager.
//!
//! Interns one controller per mount point, builds parent chains bottom-up,
//! and drives sync over all live file systems in deeper-first order so that
//! a nested archive commits into its parent before the parent itself is
//! committed.
//!
//! Controllers are interned weakly: an archive nobody references and nobody
//! has written to may be dropped at any time. As soon as a model becomes
//! touched the manager pins the controller with a strong reference and
//! releases the pin only after a sync that leaves the model clean.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::addr::MountPoint;
use crate::config::{Config, Env};
use crate::controller::Controller;
use crate::error::{FsResult, SyncError, SyncErrorBuilder};
use crate::model::Model;
use crate::registry::DriverRegistry;
use crate::stats::{IoStatistics, ManagerStats};
use crate::sync_options::SyncOptions;

/// The kernel entry point. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    env: Arc<Env>,
    registry: DriverRegistry,
    controllers: Mutex<HashMap<MountPoint, Weak<dyn Controller>>>,
    pinned: Mutex<HashMap<MountPoint, Arc<dyn Controller>>>,
}

impl Manager {
    /// Build a manager from a driver registry and a configuration.
    pub fn new(registry: DriverRegistry, config: &Config) -> Manager {
        Manager {
            shared: Arc::new(ManagerShared {
                env: Env::new(config),
                registry,
                controllers: Mutex::new(HashMap::new()),
                pinned: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The interned controller for a mount point, creating it and its
    /// parent chain on first access.
    ///
    /// Concurrent calls for the same mount point return the same
    /// controller.
    pub fn controller(&self, mount_point: &MountPoint) -> FsResult<Arc<dyn Controller>> {
        if let Some(live) = self.lookup(mount_point) {
            return Ok(live);
        }
        let built = self.build(mount_point)?;
        // The hook must be live before anyone can reach the controller.
        self.install_touch_hook(built.model());
        let mut controllers = self.shared.controllers.lock();
        if let Some(winner) = controllers.get(mount_point).and_then(Weak::upgrade) {
            // Another thread interned first; ours was never published.
            return Ok(winner);
        }
        controllers.insert(mount_point.clone(), Arc::downgrade(&built));
        drop(controllers);
        debug!("interned controller for {mount_point}");
        Ok(built)
    }

    fn lookup(&self, mount_point: &MountPoint) -> Option<Arc<dyn Controller>> {
        self.shared
            .controllers
            .lock()
            .get(mount_point)
            .and_then(Weak::upgrade)
    }

    fn build(&self, mount_point: &MountPoint) -> FsResult<Arc<dyn Controller>> {
        let model = Model::new(mount_point.clone());
        match mount_point.parent() {
            Some(parent) => {
                let parent = self.controller(parent)?;
                let driver = self
                    .shared
                    .registry
                    .archive_driver(mount_point.scheme())?
                    .clone();
                Ok(driver.new_controller(&driver, &self.shared.env, model, parent))
            }
            None => {
                let driver = self.shared.registry.host_driver(mount_point.scheme())?;
                driver.new_controller(&self.shared.env, model)
            }
        }
    }

    fn install_touch_hook(&self, model: &Arc<Model>) {
        let weak = Arc::downgrade(&self.shared);
        model.set_touch_hook(Box::new(move |mount_point| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let live = shared
                .controllers
                .lock()
                .get(mount_point)
                .and_then(Weak::upgrade);
            if let Some(controller) = live {
                shared
                    .pinned
                    .lock()
                    .insert(mount_point.clone(), controller);
            }
        }));
    }

    /// Live controllers, deepest mount points first.
    fn live_sorted(&self) -> Vec<(MountPoint, Arc<dyn Controller>)> {
        let mut live: Vec<(MountPoint, Arc<dyn Controller>)> = {
            let mut controllers = self.shared.controllers.lock();
            controllers.retain(|_, weak| weak.strong_count() > 0);
            controllers
                .iter()
                .filter_map(|(mp, weak)| weak.upgrade().map(|c| (mp.clone(), c)))
                .collect()
        };
        live.sort_by(|(a, _), (b, _)| {
            b.depth()
                .cmp(&a.depth())
                .then_with(|| b.render().cmp(a.render()))
        });
        live
    }

    /// The number of live file systems.
    pub fn size(&self) -> usize {
        let mut controllers = self.shared.controllers.lock();
        controllers.retain(|_, weak| weak.strong_count() > 0);
        controllers.len()
    }

    /// The mount points of all live file systems, deepest first.
    pub fn mount_points(&self) -> Vec<MountPoint> {
        self.live_sorted().into_iter().map(|(mp, _)| mp).collect()
    }

    /// Sync every live file system, deepest first, aggregating all
    /// failures into one composite.
    pub fn sync(&self, opts: SyncOptions) -> Result<(), SyncError> {
        let mut builder = SyncErrorBuilder::new();
        for (mount_point, controller) in self.live_sorted() {
            let clean = match controller.sync(opts) {
                Ok(()) => true,
                Err(err) => {
                    let clean = err.is_warning_only();
                    builder.merge(err);
                    clean
                }
            };
            self.settle(&mount_point, &controller, opts, clean);
        }
        builder.check()
    }

    /// Sync one live file system, if any. Used by the pacemaker to retire
    /// the eldest mount.
    pub fn sync_mount(
        &self,
        mount_point: &MountPoint,
        opts: SyncOptions,
    ) -> Result<(), SyncError> {
        let Some(controller) = self.lookup(mount_point) else {
            return Ok(());
        };
        let result = controller.sync(opts);
        let clean = match &result {
            Ok(()) => true,
            Err(err) => err.is_warning_only(),
        };
        self.settle(mount_point, &controller, opts, clean);
        result
    }

    /// Post-sync bookkeeping: drop interned and pinned references where the
    /// sync left nothing worth keeping alive.
    fn settle(
        &self,
        mount_point: &MountPoint,
        controller: &Arc<dyn Controller>,
        opts: SyncOptions,
        clean: bool,
    ) {
        if clean && opts.contains(SyncOptions::UMOUNT) {
            self.shared.controllers.lock().remove(mount_point);
            self.shared.pinned.lock().remove(mount_point);
        } else if !controller.model().is_touched() {
            self.shared.pinned.lock().remove(mount_point);
        }
    }

    /// A snapshot of the manager's gauges.
    pub fn stats(&self) -> ManagerStats {
        let live = self.live_sorted();
        ManagerStats {
            file_systems_total: live.len(),
            file_systems_mounted: live.iter().filter(|(_, c)| c.is_mounted()).count(),
            file_systems_touched: live
                .iter()
                .filter(|(_, c)| c.model().is_touched())
                .count(),
            top_level_archives: live.iter().filter(|(mp, _)| mp.depth() == 1).count(),
        }
    }

    /// The byte counters shared by all streams of this kernel.
    pub fn io_stats(&self) -> Arc<IoStatistics> {
        Arc::clone(&self.shared.env.stats)
    }

    /// A pacemaker front-end bounded by the configured
    /// [`Config::pacemaker_max`](crate::config::Config::pacemaker_max).
    pub fn pacemaker(&self) -> crate::pacemaker::Pacemaker {
        crate::pacemaker::Pacemaker::new(self.clone(), self.shared.env.pacemaker_max)
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("file_systems", &self.size())
            .finish()
    }
}
