//! Controllers and the decorator stack.
//!
//! Every file system in the federation is driven by one controller. For an
//! archive file system the controller is a stack of layers, outermost
//! first:
//!
//! 1. false-positive fallback — reroutes to the parent when the file turns
//!    out not to be an archive;
//! 2. locking — serializes threads per file system and runs the lock-retry
//!    protocol;
//! 3. resource accounting — tracks live streams for sync;
//! 4. caching — read-through/write-back buffers for `CACHE` operations;
//! 5. context — snapshots the operation's options on a thread local;
//! 6. target — owns the in-memory directory and talks to the driver.
//!
//! Host file system controllers keep only the locking and resource layers
//! around a host target.

mod cache;
mod context;
mod false_positive;
mod lock;
mod resource;
mod target;

pub use self::context::current_options;

pub(crate) use self::cache::CacheController;
pub(crate) use self::context::ContextController;
pub(crate) use self::false_positive::FalsePositiveController;
pub(crate) use self::lock::LockController;
pub(crate) use self::resource::ResourceController;
pub(crate) use self::target::TargetController;

use std::sync::Arc;

use crate::access_options::{AccessKinds, AccessOptions};
use crate::addr::EntryName;
use crate::config::Env;
use crate::driver::ArchiveDriver;
use crate::entry::{Entry, EntryType};
use crate::error::{FsResult, SyncError};
use crate::model::Model;
use crate::socket::{
    FsInputStream, FsOutputStream, InputEndpoint, InputSocket, OutputEndpoint, OutputSocket,
};
use crate::sync_options::SyncOptions;

/// The operations of one file system.
///
/// Controllers obtained from the manager never surface the control-flow
/// error kinds; those are consumed inside the stack.
pub trait Controller: Send + Sync {
    /// The state shared by all layers of this controller.
    fn model(&self) -> &Arc<Model>;

    /// Whether the file system currently has a mounted directory.
    fn is_mounted(&self) -> bool;

    /// Look up an entry. `None` means absent.
    fn stat(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>>;

    /// Fail unless the entry exists and permits the given access kinds.
    fn check_access(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
    ) -> FsResult<()>;

    /// Make an entry read-only.
    fn set_read_only(&self, name: &EntryName) -> FsResult<()>;

    /// Set the timestamps selected by `kinds` to `millis`.
    fn set_time(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
        millis: i64,
    ) -> FsResult<()>;

    /// Create a file or directory entry.
    fn mknod(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kind: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()>;

    /// Remove an entry. Directories must be empty.
    fn unlink(&self, opts: AccessOptions, name: &EntryName) -> FsResult<()>;

    /// Flush and optionally unmount this file system. See the sync options
    /// for the exact contract.
    fn sync(&self, opts: SyncOptions) -> Result<(), SyncError>;

    /// The entry an input socket on `name` would read. May mount.
    fn input_target(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Entry>;

    /// The entry an output socket on `name` would write. May mount and may
    /// describe a yet-to-be-created entry.
    fn output_target(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
    ) -> FsResult<Entry>;

    /// Open a read stream on `name`. Part of the socket protocol; user code
    /// goes through [`ControllerOps::input`].
    fn open_input(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        peer: Option<&dyn OutputEndpoint>,
    ) -> FsResult<FsInputStream>;

    /// Open a write stream on `name`. Part of the socket protocol; user
    /// code goes through [`ControllerOps::output`].
    fn open_output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
        peer: Option<&dyn InputEndpoint>,
    ) -> FsResult<FsOutputStream>;
}

/// Socket construction on shared controllers.
pub trait ControllerOps {
    /// A lazy input socket on `name`.
    fn input(&self, opts: AccessOptions, name: &EntryName) -> InputSocket;

    /// A lazy output socket on `name`. The template, when present, donates
    /// sizes and times to the created entry.
    fn output(&self, opts: AccessOptions, name: &EntryName, template: Option<Entry>)
        -> OutputSocket;
}

impl ControllerOps for Arc<dyn Controller> {
    fn input(&self, opts: AccessOptions, name: &EntryName) -> InputSocket {
        InputSocket::new(Arc::new(ControllerInputEndpoint {
            controller: Arc::clone(self),
            opts,
            name: name.clone(),
        }))
    }

    fn output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<Entry>,
    ) -> OutputSocket {
        OutputSocket::new(Arc::new(ControllerOutputEndpoint {
            controller: Arc::clone(self),
            opts,
            name: name.clone(),
            template,
        }))
    }
}

struct ControllerInputEndpoint {
    controller: Arc<dyn Controller>,
    opts: AccessOptions,
    name: EntryName,
}

impl InputEndpoint for ControllerInputEndpoint {
    fn local_target(&self) -> FsResult<Entry> {
        self.controller.input_target(self.opts, &self.name)
    }

    fn open(&self, peer: Option<&dyn OutputEndpoint>) -> FsResult<FsInputStream> {
        self.controller.open_input(self.opts, &self.name, peer)
    }
}

struct ControllerOutputEndpoint {
    controller: Arc<dyn Controller>,
    opts: AccessOptions,
    name: EntryName,
    template: Option<Entry>,
}

impl OutputEndpoint for ControllerOutputEndpoint {
    fn local_target(&self) -> FsResult<Entry> {
        self.controller
            .output_target(self.opts, &self.name, self.template.as_ref())
    }

    fn open(&self, peer: Option<&dyn InputEndpoint>) -> FsResult<FsOutputStream> {
        self.controller
            .open_output(self.opts, &self.name, self.template.as_ref(), peer)
    }
}

/// Assemble the standard federation stack for one archive file system.
pub(crate) fn federate(
    driver: Arc<dyn ArchiveDriver>,
    env: Arc<Env>,
    model: Arc<Model>,
    parent: Arc<dyn Controller>,
) -> Arc<dyn Controller> {
    let parent_entry = model
        .mount_point()
        .entry_in_parent()
        .cloned()
        .expect("a federated mount point names an entry in its parent");
    let target = TargetController::new(
        Arc::clone(&env),
        driver,
        Arc::clone(&model),
        Arc::clone(&parent),
        parent_entry.clone(),
    );
    let context = ContextController::new(target);
    let cache = CacheController::new(Arc::clone(&env.pool), context);
    let resource = ResourceController::new(Arc::clone(&env.stats), env.wait_timeout, cache);
    let lock = LockController::new(Arc::clone(&model), env.wait_timeout, resource);
    Arc::new(FalsePositiveController::new(model, parent, parent_entry, lock))
}
