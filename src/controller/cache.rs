//! Layer 3: per-entry caching.
//!
//! Only operations carrying the `CACHE` option are routed through the
//! buffers here; everything else passes straight to the inner layer. Per
//! entry name there is at most one read-through buffer and one write-back
//! buffer. A write-back buffer turns dirty when its stream closes and stays
//! dirty until a sync flushes it through the inner layer, in lexicographic
//! entry name order; a flush failure on one entry does not stop the
//! remaining flushes.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::access_options::{AccessKinds, AccessOptions};
use crate::addr::EntryName;
use crate::controller::Controller;
use crate::entry::{now_millis, AccessKind, Entry, EntryType, SizeKind};
use crate::error::{FsError, FsResult, SyncError, SyncErrorBuilder};
use crate::model::Model;
use crate::pool::{IoBuffer, IoPool};
use crate::socket::{FsInputStream, FsOutputStream, InputEndpoint, OutputEndpoint};
use crate::sync_options::SyncOptions;

#[derive(Default)]
struct EntryCache {
    input: Option<Arc<dyn IoBuffer>>,
    output: Option<Arc<dyn IoBuffer>>,
    dirty: bool,
    opts: AccessOptions,
}

struct CacheShared<C> {
    pool: Arc<dyn IoPool>,
    inner: C,
    caches: Mutex<BTreeMap<String, EntryCache>>,
}

/// Layer 3 controller.
pub(crate) struct CacheController<C> {
    shared: Arc<CacheShared<C>>,
}

impl<C: Controller + 'static> CacheController<C> {
    pub(crate) fn new(pool: Arc<dyn IoPool>, inner: C) -> CacheController<C> {
        CacheController {
            shared: Arc::new(CacheShared {
                pool,
                inner,
                caches: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Flush dirty buffers through the inner layer. Failures are recorded
    /// and do not abort later flushes.
    fn flush(&self, builder: &mut SyncErrorBuilder) {
        let dirty: Vec<(String, Arc<dyn IoBuffer>, AccessOptions)> = {
            let caches = self.shared.caches.lock();
            caches
                .iter()
                .filter(|(_, cache)| cache.dirty)
                .filter_map(|(name, cache)| {
                    cache
                        .output
                        .as_ref()
                        .map(|buffer| (name.clone(), Arc::clone(buffer), cache.opts))
                })
                .collect()
        };
        for (name, buffer, opts) in dirty {
            match self.flush_one(&name, &buffer, opts) {
                Ok(()) => {
                    if let Some(cache) = self.shared.caches.lock().get_mut(&name) {
                        cache.dirty = false;
                    }
                }
                Err(cause) => builder.fail(cause),
            }
        }
    }

    fn flush_one(
        &self,
        name: &str,
        buffer: &Arc<dyn IoBuffer>,
        opts: AccessOptions,
    ) -> FsResult<()> {
        debug!("flushing cached entry {name:?}");
        let name = EntryName::new(name)?;
        // The buffer holds the complete contents by now.
        let flush_opts =
            opts & !(AccessOptions::CACHE | AccessOptions::EXCLUSIVE | AccessOptions::APPEND);
        let mut stream = self
            .shared
            .inner
            .open_output(flush_opts, &name, None, None)?;
        let mut reader = buffer.input()?;
        io::copy(&mut reader, &mut stream).map_err(FsError::from)?;
        stream.close()
    }
}

impl<C: Controller + 'static> Controller for CacheController<C> {
    fn model(&self) -> &Arc<Model> {
        self.shared.inner.model()
    }

    fn is_mounted(&self) -> bool {
        self.shared.inner.is_mounted()
    }

    fn stat(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.shared.inner.stat(opts, name)
    }

    fn check_access(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
    ) -> FsResult<()> {
        self.shared.inner.check_access(opts, name, kinds)
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        self.shared.inner.set_read_only(name)
    }

    fn set_time(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
        millis: i64,
    ) -> FsResult<()> {
        self.shared.inner.set_time(opts, name, kinds, millis)
    }

    fn mknod(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kind: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        self.shared.inner.mknod(opts, name, kind, template)
    }

    fn unlink(&self, opts: AccessOptions, name: &EntryName) -> FsResult<()> {
        self.shared.inner.unlink(opts, name)?;
        self.shared.caches.lock().remove(name.as_str());
        Ok(())
    }

    fn sync(&self, opts: SyncOptions) -> Result<(), SyncError> {
        let mut builder = SyncErrorBuilder::new();
        if opts.contains(SyncOptions::ABORT_CHANGES) {
            let mut caches = self.shared.caches.lock();
            for cache in caches.values_mut() {
                cache.output = None;
                cache.dirty = false;
            }
        } else {
            self.flush(&mut builder);
        }
        if let Err(inner) = self.shared.inner.sync(opts) {
            builder.merge(inner);
        }
        if opts.contains(SyncOptions::CLEAR_CACHE) {
            self.shared.caches.lock().clear();
        }
        builder.check()
    }

    fn input_target(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Entry> {
        self.shared.inner.input_target(opts, name)
    }

    fn output_target(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        self.shared.inner.output_target(opts, name, template)
    }

    fn open_input(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        peer: Option<&dyn OutputEndpoint>,
    ) -> FsResult<FsInputStream> {
        if !opts.contains(AccessOptions::CACHE) {
            return self.shared.inner.open_input(opts, name, peer);
        }
        // Dirty write-back bytes win over everything else.
        {
            let caches = self.shared.caches.lock();
            if let Some(cache) = caches.get(name.as_str()) {
                if let (true, Some(buffer)) = (cache.dirty, cache.output.as_ref()) {
                    return Ok(FsInputStream::new(buffer.input()?));
                }
                if let Some(buffer) = cache.input.as_ref() {
                    return Ok(FsInputStream::new(buffer.input()?));
                }
            }
        }
        // Read-through: materialize the entry into a fresh buffer.
        let buffer = self.shared.pool.allocate()?;
        {
            let mut stream = self.shared.inner.open_input(opts, name, peer)?;
            let mut writer = buffer.output()?;
            io::copy(&mut stream, &mut writer).map_err(FsError::from)?;
        }
        let mut caches = self.shared.caches.lock();
        let cache = caches.entry(name.as_str().to_string()).or_default();
        cache.input = Some(Arc::clone(&buffer));
        Ok(FsInputStream::new(buffer.input()?))
    }

    fn open_output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
        peer: Option<&dyn InputEndpoint>,
    ) -> FsResult<FsOutputStream> {
        if !opts.contains(AccessOptions::CACHE) {
            return self.shared.inner.open_output(opts, name, template, peer);
        }
        opts.check_conflicts()?;
        if opts.contains(AccessOptions::EXCLUSIVE)
            && self.shared.inner.stat(opts, name)?.is_some()
        {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        let buffer = self.shared.pool.allocate()?;
        let mut writer = buffer.output()?;
        let mut appended = 0u64;
        if opts.contains(AccessOptions::APPEND) {
            // Seed the buffer with the current contents so the write-back
            // holds the complete entry.
            match self.open_input(opts, name, None) {
                Ok(mut existing) => {
                    appended = io::copy(&mut existing, &mut writer).map_err(FsError::from)?;
                }
                Err(FsError::NoSuchEntry(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let shared = Arc::clone(&self.shared);
        let commit_name = name.clone();
        let commit_template = template.cloned();
        let commit_buffer = Arc::clone(&buffer);
        Ok(FsOutputStream::new(
            writer,
            Some(Box::new(move |written| {
                // Register the entry with the back end so stat sees it
                // before the flush, then keep the bytes dirty until sync.
                let written = written + appended;
                let mut template = commit_template
                    .clone()
                    .unwrap_or_else(|| Entry::new(commit_name.as_str(), EntryType::File));
                template.set_size(SizeKind::Data, written as i64);
                if template.time(AccessKind::Write) < 0 {
                    template.set_time(AccessKind::Write, now_millis());
                }
                let mknod_opts = opts & !AccessOptions::EXCLUSIVE;
                shared.inner.mknod(
                    mknod_opts,
                    &commit_name,
                    EntryType::File,
                    Some(template),
                )?;
                let mut caches = shared.caches.lock();
                let cache = caches.entry(commit_name.as_str().to_string()).or_default();
                cache.output = Some(Arc::clone(&commit_buffer));
                cache.dirty = true;
                cache.input = None;
                cache.opts = opts;
                Ok(())
            })),
        ))
    }
}
