//! Layer 2: resource accounting.
//!
//! Registers every stream returned by the inner layers with the
//! controller's accountant and implements the wait/force-close phase of
//! sync. Resources owned by the calling thread can never be waited for
//! (that would deadlock), so without a force-close option they are always
//! fatal; with one they are closed and reported as a warning.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::access_options::{AccessKinds, AccessOptions};
use crate::accountant::{Accountant, ForceClosable, ResourceKind};
use crate::addr::EntryName;
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult, SyncError, SyncErrorBuilder};
use crate::model::Model;
use crate::socket::{FsInputStream, FsOutputStream, InputEndpoint, OutputEndpoint};
use crate::stats::IoStatistics;
use crate::sync_options::SyncOptions;

/// Layer 2 controller.
pub(crate) struct ResourceController<C> {
    stats: Arc<IoStatistics>,
    wait_timeout: Duration,
    accountant: Accountant,
    inner: C,
}

impl<C: Controller> ResourceController<C> {
    pub(crate) fn new(
        stats: Arc<IoStatistics>,
        wait_timeout: Duration,
        inner: C,
    ) -> ResourceController<C> {
        ResourceController {
            stats,
            wait_timeout,
            accountant: Accountant::new(),
            inner,
        }
    }

    /// The wait/force-close phase. Returns the assembly to merge the inner
    /// sync into, or the final error when the file system is busy.
    fn settle_resources(&self, opts: SyncOptions) -> Result<SyncErrorBuilder, SyncError> {
        let mut builder = SyncErrorBuilder::new();
        let covered = |kind: ResourceKind| match kind {
            ResourceKind::Input => opts.contains(SyncOptions::FORCE_CLOSE_INPUT),
            ResourceKind::Output => opts.contains(SyncOptions::FORCE_CLOSE_OUTPUT),
        };

        let uncovered = self.accountant.uncovered(covered);
        if uncovered.local > 0 {
            // Waiting for our own streams would deadlock.
            builder.fail(FsError::CurrentThreadBusy(uncovered.local));
            return Err(builder.check().expect_err("nonempty"));
        }
        if uncovered.total > 0 {
            // The wait is always bounded; the wait-close options stretch it.
            let timeout = if opts.waits_close() {
                self.wait_timeout * 10
            } else {
                self.wait_timeout
            };
            let remaining = self.accountant.wait_foreign(covered, timeout);
            if remaining.total > 0 {
                builder.fail(FsError::ThreadsBusy {
                    total: remaining.total,
                    local: remaining.local,
                });
                return Err(builder.check().expect_err("nonempty"));
            }
        }

        if opts.forces_close() {
            let all = self.accountant.counts();
            let covered_local = all.local;
            if covered_local > 0 {
                // Same-thread resources are only ever force-closed, never
                // waited for, and always reported.
                warn!(
                    "sync of {} force-closes {covered_local} stream(s) of the calling thread",
                    self.inner.model().mount_point()
                );
                builder.warn(FsError::CurrentThreadBusy(covered_local));
            }
            for err in self.accountant.force_close(covered) {
                builder.warn(FsError::from(err));
            }
        }
        Ok(builder)
    }
}

impl<C: Controller> Controller for ResourceController<C> {
    fn model(&self) -> &Arc<Model> {
        self.inner.model()
    }

    fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    fn stat(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.inner.stat(opts, name)
    }

    fn check_access(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
    ) -> FsResult<()> {
        self.inner.check_access(opts, name, kinds)
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        self.inner.set_read_only(name)
    }

    fn set_time(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
        millis: i64,
    ) -> FsResult<()> {
        self.inner.set_time(opts, name, kinds, millis)
    }

    fn mknod(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kind: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        self.inner.mknod(opts, name, kind, template)
    }

    fn unlink(&self, opts: AccessOptions, name: &EntryName) -> FsResult<()> {
        self.inner.unlink(opts, name)
    }

    fn sync(&self, opts: SyncOptions) -> Result<(), SyncError> {
        let mut builder = self.settle_resources(opts)?;
        if let Err(inner) = self.inner.sync(opts) {
            builder.merge(inner);
        }
        builder.check()
    }

    fn input_target(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Entry> {
        self.inner.input_target(opts, name)
    }

    fn output_target(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        self.inner.output_target(opts, name, template)
    }

    fn open_input(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        peer: Option<&dyn OutputEndpoint>,
    ) -> FsResult<FsInputStream> {
        let mut stream = self.inner.open_input(opts, name, peer)?;
        stream.set_stats(Arc::clone(&self.stats));
        let core: Arc<dyn ForceClosable> = stream.core();
        let handle = self
            .accountant
            .register(ResourceKind::Input, Arc::downgrade(&core));
        stream.set_account(handle);
        Ok(stream)
    }

    fn open_output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
        peer: Option<&dyn InputEndpoint>,
    ) -> FsResult<FsOutputStream> {
        let mut stream = self.inner.open_output(opts, name, template, peer)?;
        stream.set_stats(Arc::clone(&self.stats));
        let core: Arc<dyn ForceClosable> = stream.core();
        let handle = self
            .accountant
            .register(ResourceKind::Output, Arc::downgrade(&core));
        stream.set_account(handle);
        Ok(stream)
    }
}
