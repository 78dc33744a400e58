//! Layer 0: false-positive fallback.
//!
//! A file can carry an archive extension without holding archive bytes. The
//! driver signals this by failing the mount with `FalsePositive` (or its
//! persistent sibling, which is memoized on the model until the next sync).
//! This outermost layer catches the signal — after the inner stack has
//! released its locks — and reroutes the operation to the parent file
//! system, addressing the archive as the plain file it turned out to be.

use std::sync::Arc;

use log::debug;

use crate::access_options::{AccessKinds, AccessOptions};
use crate::addr::EntryName;
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult, SyncError};
use crate::model::Model;
use crate::socket::{FsInputStream, FsOutputStream, InputEndpoint, OutputEndpoint};
use crate::sync_options::SyncOptions;

/// Layer 0 controller.
pub(crate) struct FalsePositiveController<C> {
    model: Arc<Model>,
    parent: Arc<dyn Controller>,
    parent_entry: EntryName,
    inner: C,
}

impl<C: Controller> FalsePositiveController<C> {
    pub(crate) fn new(
        model: Arc<Model>,
        parent: Arc<dyn Controller>,
        parent_entry: EntryName,
        inner: C,
    ) -> FalsePositiveController<C> {
        FalsePositiveController {
            model,
            parent,
            parent_entry,
            inner,
        }
    }

    /// The name of `name` as seen by the parent file system: the root maps
    /// to the archive file itself.
    fn reroute_name(&self, name: &EntryName) -> FsResult<EntryName> {
        if name.is_root() {
            Ok(self.parent_entry.clone())
        } else {
            self.parent_entry.join(name.as_str())
        }
    }

    fn guard<T>(
        &self,
        attempt: impl FnOnce(&C) -> FsResult<T>,
        reroute: impl FnOnce(&Arc<dyn Controller>) -> FsResult<T>,
    ) -> FsResult<T> {
        if self.model.false_positive().is_some() {
            return reroute(&self.parent);
        }
        match attempt(&self.inner) {
            Err(FsError::FalsePositive(_)) => reroute(&self.parent),
            Err(FsError::PersistentFalsePositive(cause)) => {
                debug!(
                    "{} is not an archive ({cause}), rerouting to the parent until the next sync",
                    self.model.mount_point()
                );
                self.model.set_false_positive(*cause);
                reroute(&self.parent)
            }
            other => other,
        }
    }
}

impl<C: Controller> Controller for FalsePositiveController<C> {
    fn model(&self) -> &Arc<Model> {
        &self.model
    }

    fn is_mounted(&self) -> bool {
        self.model.false_positive().is_none() && self.inner.is_mounted()
    }

    fn stat(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.guard(
            |inner| inner.stat(opts, name),
            |parent| {
                if name.is_root() {
                    // The archive file is not a directory, so the root of
                    // the would-be file system does not exist.
                    return Ok(None);
                }
                parent.stat(opts, &self.reroute_name(name)?)
            },
        )
    }

    fn check_access(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
    ) -> FsResult<()> {
        self.guard(
            |inner| inner.check_access(opts, name, kinds),
            |parent| parent.check_access(opts, &self.reroute_name(name)?, kinds),
        )
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        self.guard(
            |inner| inner.set_read_only(name),
            |parent| parent.set_read_only(&self.reroute_name(name)?),
        )
    }

    fn set_time(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
        millis: i64,
    ) -> FsResult<()> {
        self.guard(
            |inner| inner.set_time(opts, name, kinds, millis),
            |parent| parent.set_time(opts, &self.reroute_name(name)?, kinds, millis),
        )
    }

    fn mknod(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kind: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        self.guard(
            |inner| inner.mknod(opts, name, kind, template.clone()),
            |parent| parent.mknod(opts, &self.reroute_name(name)?, kind, template.clone()),
        )
    }

    fn unlink(&self, opts: AccessOptions, name: &EntryName) -> FsResult<()> {
        self.guard(
            |inner| inner.unlink(opts, name),
            |parent| parent.unlink(opts, &self.reroute_name(name)?),
        )
    }

    fn sync(&self, opts: SyncOptions) -> Result<(), SyncError> {
        // A sync ends the memoization: the file may have become a real
        // archive (or stopped being one) since.
        self.model.clear_false_positive();
        self.inner.sync(opts)
    }

    fn input_target(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Entry> {
        self.guard(
            |inner| inner.input_target(opts, name),
            |parent| parent.input_target(opts, &self.reroute_name(name)?),
        )
    }

    fn output_target(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        self.guard(
            |inner| inner.output_target(opts, name, template),
            |parent| parent.output_target(opts, &self.reroute_name(name)?, template),
        )
    }

    fn open_input(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        peer: Option<&dyn OutputEndpoint>,
    ) -> FsResult<FsInputStream> {
        self.guard(
            |inner| inner.open_input(opts, name, peer),
            |parent| parent.open_input(opts, &self.reroute_name(name)?, peer),
        )
    }

    fn open_output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
        peer: Option<&dyn InputEndpoint>,
    ) -> FsResult<FsOutputStream> {
        self.guard(
            |inner| inner.open_output(opts, name, template, peer),
            |parent| parent.open_output(opts, &self.reroute_name(name)?, template, peer),
        )
    }
}
