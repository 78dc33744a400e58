//! Layer 5: the archive target.
//!
//! Owns the in-memory directory of one mounted archive, performs lazy
//! (un)mounting through the parent file system, stages written entries in
//! pool buffers and commits them through the driver's output service during
//! sync.

use std::collections::BTreeMap;
use std::io;
use std::io::Read;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::access_options::{AccessKinds, AccessOptions};
use crate::addr::EntryName;
use crate::config::Env;
use crate::controller::{current_options, Controller, ControllerOps};
use crate::driver::{ArchiveDriver, InputService};
use crate::entry::{now_millis, AccessKind, Entry, EntryType, SizeKind};
use crate::error::{FsError, FsResult, SyncError, SyncErrorBuilder};
use crate::model::Model;
use crate::pool::IoBuffer;
use crate::socket::{FsInputStream, FsOutputStream, InputEndpoint, OutputEndpoint};
use crate::sync_options::SyncOptions;

struct Node {
    entry: Entry,
    read_only: bool,
}

/// The mounted directory of one archive.
struct ArchiveFs {
    /// Canonical entry name -> node; `""` is the root directory.
    tree: BTreeMap<String, Node>,
    /// The driver's view of the archive bytes as of mount time.
    input: Option<Arc<dyn InputService>>,
    /// Entries written since mount time, keyed like `tree`. These override
    /// the input service until the next unmount.
    staged: BTreeMap<String, Arc<dyn IoBuffer>>,
}

impl ArchiveFs {
    fn empty() -> ArchiveFs {
        let mut tree = BTreeMap::new();
        let mut root = Entry::new("", EntryType::Directory);
        root.set_time(AccessKind::Create, now_millis());
        tree.insert(
            String::new(),
            Node {
                entry: root,
                read_only: false,
            },
        );
        ArchiveFs {
            tree,
            input: None,
            staged: BTreeMap::new(),
        }
    }

    fn from_input(input: Arc<dyn InputService>) -> FsResult<ArchiveFs> {
        let mut fs = ArchiveFs::empty();
        for mut raw in input.entries() {
            let canonical = raw.name().trim_end_matches('/').to_string();
            let name = EntryName::new(&canonical).map_err(|_| {
                FsError::CorruptArchive(format!("unrepresentable entry name {:?}", raw.name()))
            })?;
            if name.is_root() {
                continue;
            }
            raw.set_name(name.as_str());
            fs.ensure_parents(&name, true)?;
            fs.link(&name, raw);
        }
        fs.input = Some(input);
        Ok(fs)
    }

    fn node(&self, name: &EntryName) -> Option<&Node> {
        self.tree.get(name.as_str())
    }

    fn node_mut(&mut self, name: &EntryName) -> Option<&mut Node> {
        self.tree.get_mut(name.as_str())
    }

    /// Verify the ancestor chain of `name`, creating missing directories
    /// when `create` is set.
    fn ensure_parents(&mut self, name: &EntryName, create: bool) -> FsResult<()> {
        let parent = match name.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };
        match self.node(&parent) {
            Some(node) if node.entry.is_directory() => Ok(()),
            Some(_) => Err(FsError::NotDirectory(parent.to_string())),
            None if create => {
                self.ensure_parents(&parent, true)?;
                let mut entry = Entry::new(parent.as_str(), EntryType::Directory);
                entry.set_time(AccessKind::Create, now_millis());
                entry.set_time(AccessKind::Write, now_millis());
                self.link(&parent, entry);
                Ok(())
            }
            None => Err(FsError::NoSuchEntry(parent.to_string())),
        }
    }

    /// Insert a node and record it in the parent's child set. Parents must
    /// exist.
    fn link(&mut self, name: &EntryName, entry: Entry) {
        if let Some(parent) = name.parent() {
            if let Some(node) = self.node_mut(&parent) {
                if let Some(children) = node.entry.children_mut() {
                    children.insert(name.simple_name().to_string());
                }
            }
        }
        self.tree.insert(
            name.as_str().to_string(),
            Node {
                entry,
                read_only: false,
            },
        );
    }

    fn unlink_node(&mut self, name: &EntryName) {
        self.tree.remove(name.as_str());
        self.staged.remove(name.as_str());
        if let Some(parent) = name.parent() {
            if let Some(node) = self.node_mut(&parent) {
                if let Some(children) = node.entry.children_mut() {
                    children.remove(name.simple_name());
                }
            }
        }
    }
}

enum MountState {
    Unmounted,
    Mounted(ArchiveFs),
}

pub(crate) struct TargetShared {
    env: Arc<Env>,
    driver: Arc<dyn ArchiveDriver>,
    model: Arc<Model>,
    parent: Arc<dyn Controller>,
    parent_entry: EntryName,
    state: Mutex<MountState>,
}

/// Layer 5 controller. Cheap to clone internally via its shared core, which
/// the streams it hands out capture for their close commits.
pub(crate) struct TargetController {
    shared: Arc<TargetShared>,
}

impl TargetController {
    pub(crate) fn new(
        env: Arc<Env>,
        driver: Arc<dyn ArchiveDriver>,
        model: Arc<Model>,
        parent: Arc<dyn Controller>,
        parent_entry: EntryName,
    ) -> TargetController {
        TargetController {
            shared: Arc::new(TargetShared {
                env,
                driver,
                model,
                parent,
                parent_entry,
                state: Mutex::new(MountState::Unmounted),
            }),
        }
    }
}

impl TargetShared {
    /// Run `f` on the mounted file system, mounting first if necessary.
    ///
    /// Mounting mutates shared state and therefore demands the write lock;
    /// when only the read lock is held this raises `NeedsWriteLock` and the
    /// locking layer re-runs the operation.
    fn with_fs<T>(
        self: &Arc<Self>,
        auto_create: bool,
        f: impl FnOnce(&mut ArchiveFs) -> FsResult<T>,
    ) -> FsResult<T> {
        let mut state = self.state.lock();
        if matches!(*state, MountState::Unmounted) {
            self.model.lock().check_write_held()?;
            *state = MountState::Mounted(self.mount(auto_create)?);
        }
        match &mut *state {
            MountState::Mounted(fs) => f(fs),
            MountState::Unmounted => unreachable!("mounted above"),
        }
    }

    fn mount(self: &Arc<Self>, auto_create: bool) -> FsResult<ArchiveFs> {
        match self
            .parent
            .stat(AccessOptions::empty(), &self.parent_entry)?
        {
            Some(entry) if entry.is_directory() => Err(FsError::FalsePositive(Box::new(
                FsError::IsDirectory(self.parent_entry.to_string()),
            ))),
            Some(_) => {
                let source = self
                    .parent
                    .input(AccessOptions::empty(), &self.parent_entry);
                let service = self.driver.new_input_service(&self.model, &source)?;
                let fs = ArchiveFs::from_input(Arc::from(service))?;
                debug!(
                    "mounted {} with {} entries",
                    self.model.mount_point(),
                    fs.tree.len()
                );
                Ok(fs)
            }
            None if auto_create => {
                debug!("creating empty archive at {}", self.model.mount_point());
                Ok(ArchiveFs::empty())
            }
            None => Err(FsError::FalsePositive(Box::new(FsError::NoSuchEntry(
                self.parent_entry.to_string(),
            )))),
        }
    }

    /// Create or refresh the node for a written entry and stage its bytes.
    /// Runs under the write lock as part of an output stream's close.
    fn stage_written(
        self: &Arc<Self>,
        name: &EntryName,
        opts: AccessOptions,
        template: Option<&Entry>,
        buffer: Arc<dyn IoBuffer>,
        written: u64,
    ) -> FsResult<()> {
        self.with_fs(true, |fs| {
            fs.ensure_parents(name, true)?;
            let mut entry = self.driver.new_entry(
                name.as_str(),
                EntryType::File,
                current_options().unwrap_or(opts),
                template,
            );
            entry.set_name(name.as_str());
            entry.set_size(SizeKind::Data, written as i64);
            if entry.time(AccessKind::Write) < 0 {
                entry.set_time(AccessKind::Write, now_millis());
            }
            if let Some(node) = fs.node(name) {
                if node.entry.is_directory() {
                    return Err(FsError::IsDirectory(name.to_string()));
                }
            }
            fs.link(name, entry);
            fs.staged.insert(name.as_str().to_string(), buffer);
            self.model.touch();
            Ok(())
        })
    }

    /// Write every entry through a fresh output service, in lexicographic
    /// name order, then finalize the archive.
    fn commit(self: &Arc<Self>, fs: &mut ArchiveFs) -> FsResult<()> {
        let sink = self
            .parent
            .output(AccessOptions::empty(), &self.parent_entry, None);
        let input = fs.input.as_ref().map(Arc::clone);
        let mut service =
            self.driver
                .new_output_service(&self.model, &sink, input.as_deref())?;
        for (key, node) in &fs.tree {
            if key.is_empty() {
                continue;
            }
            let mut data: Option<Box<dyn Read + Send>> = if !node.entry.is_file() {
                None
            } else if let Some(buffer) = fs.staged.get(key) {
                Some(buffer.input()?)
            } else if let Some(service) = input.as_ref().filter(|s| s.entry(key).is_some()) {
                Some(service.input(key)?)
            } else {
                Some(Box::new(io::empty()))
            };
            let data_ref: Option<&mut (dyn Read + Send)> = match &mut data {
                Some(b) => Some(&mut **b),
                None => None,
            };
            let result = service.write(&node.entry, data_ref);
            result?;
        }
        service.finish()?;
        debug!("committed {}", self.model.mount_point());
        Ok(())
    }
}

impl Controller for TargetController {
    fn model(&self) -> &Arc<Model> {
        &self.shared.model
    }

    fn is_mounted(&self) -> bool {
        matches!(*self.shared.state.lock(), MountState::Mounted(_))
    }

    fn stat(&self, _opts: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        self.shared
            .with_fs(false, |fs| Ok(fs.node(name).map(|n| n.entry.clone())))
    }

    fn check_access(
        &self,
        _opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
    ) -> FsResult<()> {
        self.shared.with_fs(false, |fs| {
            let node = fs
                .node(name)
                .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
            if kinds.intersects(AccessKinds::WRITE | AccessKinds::CREATE) && node.read_only {
                return Err(FsError::ReadOnly);
            }
            Ok(())
        })
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        let shared = &self.shared;
        shared.with_fs(false, |fs| {
            shared.model.lock().check_write_held()?;
            let node = fs
                .node_mut(name)
                .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
            node.read_only = true;
            shared.model.touch();
            Ok(())
        })
    }

    fn set_time(
        &self,
        _opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
        millis: i64,
    ) -> FsResult<()> {
        let shared = &self.shared;
        shared.with_fs(false, |fs| {
            shared.model.lock().check_write_held()?;
            let node = fs
                .node_mut(name)
                .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
            if node.read_only {
                return Err(FsError::ReadOnly);
            }
            for kind in kinds.kinds() {
                node.entry.set_time(kind, millis);
            }
            shared.model.touch();
            Ok(())
        })
    }

    fn mknod(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kind: EntryType,
        template: Option<Entry>,
    ) -> FsResult<()> {
        let shared = &self.shared;
        shared.with_fs(true, |fs| {
            shared.model.lock().check_write_held()?;
            if name.is_root() {
                return Err(FsError::AlreadyExists(name.to_string()));
            }
            if !shared.driver.encodable(name.as_str()) {
                return Err(FsError::AccessDenied(format!(
                    "entry name {:?} is not encodable in charset {}",
                    name.as_str(),
                    shared.driver.charset()
                )));
            }
            if let Some(node) = fs.node(name) {
                if opts.contains(AccessOptions::EXCLUSIVE)
                    || node.entry.is_directory()
                    || kind == EntryType::Directory
                {
                    return Err(FsError::AlreadyExists(name.to_string()));
                }
            }
            fs.ensure_parents(name, opts.contains(AccessOptions::CREATE_PARENTS))?;
            let mut entry =
                shared
                    .driver
                    .new_entry(name.as_str(), kind, opts, template.as_ref());
            entry.set_name(name.as_str());
            if template.is_none() {
                entry.set_time(AccessKind::Create, now_millis());
                entry.set_time(AccessKind::Write, now_millis());
            }
            fs.link(name, entry);
            shared.model.touch();
            Ok(())
        })
    }

    fn unlink(&self, _opts: AccessOptions, name: &EntryName) -> FsResult<()> {
        let shared = &self.shared;
        shared.with_fs(false, |fs| {
            shared.model.lock().check_write_held()?;
            if name.is_root() {
                return Err(FsError::AccessDenied(
                    "cannot unlink the root entry".to_string(),
                ));
            }
            let node = fs
                .node(name)
                .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
            if node.read_only {
                return Err(FsError::ReadOnly);
            }
            if let Some(children) = node.entry.children() {
                if !children.is_empty() {
                    return Err(FsError::AccessDenied(format!(
                        "directory {name} is not empty"
                    )));
                }
            }
            fs.unlink_node(name);
            shared.model.touch();
            Ok(())
        })
    }

    fn sync(&self, opts: SyncOptions) -> Result<(), SyncError> {
        let shared = &self.shared;
        let mut builder = SyncErrorBuilder::new();
        let mut state = shared.state.lock();
        if let MountState::Mounted(fs) = &mut *state {
            if opts.contains(SyncOptions::ABORT_CHANGES) {
                fs.staged.clear();
                shared.model.reset_touched();
            } else if shared.model.is_touched() {
                match shared.commit(fs) {
                    Ok(()) => shared.model.reset_touched(),
                    Err(cause) => builder.fail(cause),
                }
            }
            if opts.contains(SyncOptions::UMOUNT) && builder.is_empty() {
                debug!("unmounting {}", shared.model.mount_point());
                *state = MountState::Unmounted;
            }
        }
        builder.check()
    }

    fn input_target(&self, _opts: AccessOptions, name: &EntryName) -> FsResult<Entry> {
        self.shared.with_fs(false, |fs| {
            fs.node(name)
                .map(|n| n.entry.clone())
                .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))
        })
    }

    fn output_target(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        let shared = &self.shared;
        shared.with_fs(true, |fs| match fs.node(name) {
            Some(node) => Ok(node.entry.clone()),
            None => Ok(shared
                .driver
                .new_entry(name.as_str(), EntryType::File, opts, template)),
        })
    }

    fn open_input(
        &self,
        _opts: AccessOptions,
        name: &EntryName,
        _peer: Option<&dyn OutputEndpoint>,
    ) -> FsResult<FsInputStream> {
        self.shared.with_fs(false, |fs| {
            let node = fs
                .node(name)
                .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
            if node.entry.is_directory() {
                return Err(FsError::IsDirectory(name.to_string()));
            }
            let reader: Box<dyn Read + Send> = if let Some(buffer) = fs.staged.get(name.as_str()) {
                buffer.input()?
            } else if let Some(service) = fs
                .input
                .as_ref()
                .filter(|s| s.entry(name.as_str()).is_some())
            {
                service.input(name.as_str())?
            } else {
                Box::new(io::empty())
            };
            Ok(FsInputStream::new(reader))
        })
    }

    fn open_output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
        _peer: Option<&dyn InputEndpoint>,
    ) -> FsResult<FsOutputStream> {
        opts.check_conflicts()?;
        let shared = Arc::clone(&self.shared);
        let buffer = shared.env.pool.allocate()?;
        let mut existing: Option<Box<dyn Read + Send>> = None;
        shared.with_fs(true, |fs| {
            if name.is_root() {
                return Err(FsError::IsDirectory(name.to_string()));
            }
            if let Some(node) = fs.node(name) {
                if opts.contains(AccessOptions::EXCLUSIVE) {
                    return Err(FsError::AlreadyExists(name.to_string()));
                }
                if node.entry.is_directory() {
                    return Err(FsError::IsDirectory(name.to_string()));
                }
                if node.read_only {
                    return Err(FsError::ReadOnly);
                }
            }
            fs.ensure_parents(name, opts.contains(AccessOptions::CREATE_PARENTS))?;
            if opts.contains(AccessOptions::APPEND) {
                if let Some(staged) = fs.staged.get(name.as_str()) {
                    existing = Some(staged.input()?);
                } else if let Some(service) = fs
                    .input
                    .as_ref()
                    .filter(|s| s.entry(name.as_str()).is_some())
                {
                    existing = Some(service.input(name.as_str())?);
                }
            }
            Ok(())
        })?;
        let mut writer = buffer.output()?;
        let mut appended = 0u64;
        if let Some(mut existing) = existing {
            appended = io::copy(&mut existing, &mut writer)?;
        }
        let commit_shared = Arc::clone(&shared);
        let commit_name = name.clone();
        let commit_template = template.cloned();
        let commit_buffer = Arc::clone(&buffer);
        Ok(FsOutputStream::new(
            writer,
            Some(Box::new(move |written| {
                commit_shared.stage_written(
                    &commit_name,
                    opts,
                    commit_template.as_ref(),
                    Arc::clone(&commit_buffer),
                    written + appended,
                )
            })),
        ))
    }
}
