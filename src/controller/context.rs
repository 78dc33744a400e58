//! Operation context snapshots.
//!
//! The options passed to a controller operation are pushed onto a thread
//! local before the operation descends into the stack, so that deep helpers
//! (drivers deciding on compression, entry factories, date conversion) see
//! the caller's intent without threading the options through every
//! signature.

use std::cell::RefCell;

use crate::access_options::{AccessKinds, AccessOptions};
use crate::addr::EntryName;
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::{FsResult, SyncError};
use crate::model::Model;
use crate::socket::{FsInputStream, FsOutputStream, InputEndpoint, OutputEndpoint};
use crate::sync_options::SyncOptions;
use std::sync::Arc;

thread_local! {
    static CONTEXT: RefCell<Vec<AccessOptions>> = const { RefCell::new(Vec::new()) };
}

/// The options of the innermost controller operation running on this
/// thread, if any.
pub fn current_options() -> Option<AccessOptions> {
    CONTEXT.with(|stack| stack.borrow().last().copied())
}

struct ContextGuard;

impl ContextGuard {
    fn push(opts: AccessOptions) -> ContextGuard {
        CONTEXT.with(|stack| stack.borrow_mut().push(opts));
        ContextGuard
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Layer 4: snapshots the operation's access options.
pub(crate) struct ContextController<C> {
    inner: C,
}

impl<C: Controller> ContextController<C> {
    pub(crate) fn new(inner: C) -> ContextController<C> {
        ContextController { inner }
    }
}

impl<C: Controller> Controller for ContextController<C> {
    fn model(&self) -> &Arc<Model> {
        self.inner.model()
    }

    fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    fn stat(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        let _ctx = ContextGuard::push(opts);
        self.inner.stat(opts, name)
    }

    fn check_access(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
    ) -> FsResult<()> {
        let _ctx = ContextGuard::push(opts);
        self.inner.check_access(opts, name, kinds)
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        let _ctx = ContextGuard::push(AccessOptions::empty());
        self.inner.set_read_only(name)
    }

    fn set_time(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
        millis: i64,
    ) -> FsResult<()> {
        let _ctx = ContextGuard::push(opts);
        self.inner.set_time(opts, name, kinds, millis)
    }

    fn mknod(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kind: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        let _ctx = ContextGuard::push(opts);
        self.inner.mknod(opts, name, kind, template)
    }

    fn unlink(&self, opts: AccessOptions, name: &EntryName) -> FsResult<()> {
        let _ctx = ContextGuard::push(opts);
        self.inner.unlink(opts, name)
    }

    fn sync(&self, opts: SyncOptions) -> Result<(), SyncError> {
        self.inner.sync(opts)
    }

    fn input_target(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Entry> {
        let _ctx = ContextGuard::push(opts);
        self.inner.input_target(opts, name)
    }

    fn output_target(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        let _ctx = ContextGuard::push(opts);
        self.inner.output_target(opts, name, template)
    }

    fn open_input(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        peer: Option<&dyn OutputEndpoint>,
    ) -> FsResult<FsInputStream> {
        let _ctx = ContextGuard::push(opts);
        self.inner.open_input(opts, name, peer)
    }

    fn open_output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
        peer: Option<&dyn InputEndpoint>,
    ) -> FsResult<FsOutputStream> {
        let _ctx = ContextGuard::push(opts);
        self.inner.open_output(opts, name, template, peer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn context_nests_and_unwinds() {
        assert!(current_options().is_none());
        {
            let _outer = ContextGuard::push(AccessOptions::CACHE);
            assert_eq!(current_options(), Some(AccessOptions::CACHE));
            {
                let _inner = ContextGuard::push(AccessOptions::COMPRESS);
                assert_eq!(current_options(), Some(AccessOptions::COMPRESS));
            }
            assert_eq!(current_options(), Some(AccessOptions::CACHE));
        }
        assert!(current_options().is_none());
    }
}
