//! The host file system driver.
//!
//! Backs every `file:` mount point with `std::fs`. Host controllers keep
//! the locking and resource layers of the federation stack but have no
//! cache, context or archive target: reads and writes go straight to the
//! operating system, and sync only has to settle open streams.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::access_options::{AccessKinds, AccessOptions};
use crate::addr::EntryName;
use crate::config::Env;
use crate::controller::{Controller, LockController, ResourceController};
use crate::driver::HostDriver;
use crate::entry::{system_time_millis, AccessKind, Entry, EntryType, SizeKind};
use crate::error::{FsError, FsResult, SyncError};
use crate::model::Model;
use crate::socket::{FsInputStream, FsOutputStream, InputEndpoint, OutputEndpoint};
use crate::sync_options::SyncOptions;

/// Driver for `file:` mount points.
#[derive(Debug, Default)]
pub struct FileDriver;

impl HostDriver for FileDriver {
    fn new_controller(&self, env: &Arc<Env>, model: Arc<Model>) -> FsResult<Arc<dyn Controller>> {
        let rendered = model.mount_point().render();
        let path = rendered
            .strip_prefix("file:")
            .ok_or_else(|| FsError::MalformedUri(format!("not a file mount point: {rendered}")))?;
        let target = HostTarget {
            model: Arc::clone(&model),
            root: PathBuf::from(path),
        };
        let resource = ResourceController::new(
            Arc::clone(&env.stats),
            env.wait_timeout,
            target,
        );
        Ok(Arc::new(LockController::new(
            model,
            env.wait_timeout,
            resource,
        )))
    }
}

struct HostTarget {
    model: Arc<Model>,
    root: PathBuf,
}

impl HostTarget {
    fn resolve(&self, name: &EntryName) -> PathBuf {
        if name.is_root() {
            self.root.clone()
        } else {
            self.root.join(name.as_str())
        }
    }

    fn entry_from_metadata(name: &EntryName, path: &Path, meta: &fs::Metadata) -> Entry {
        let mut entry = Entry::new(name.as_str(), EntryType::from_std(meta.file_type()));
        if meta.is_file() {
            entry.set_size(SizeKind::Data, meta.len() as i64);
            entry.set_size(SizeKind::Storage, meta.len() as i64);
        }
        if let Ok(modified) = meta.modified() {
            entry.set_time(AccessKind::Write, system_time_millis(modified));
        }
        if let Ok(accessed) = meta.accessed() {
            entry.set_time(AccessKind::Read, system_time_millis(accessed));
        }
        if let Ok(created) = meta.created() {
            entry.set_time(AccessKind::Create, system_time_millis(created));
        }
        if meta.is_dir() {
            if let Some(children) = entry.children_mut() {
                let mut names = BTreeSet::new();
                if let Ok(dir) = fs::read_dir(path) {
                    for child in dir.flatten() {
                        names.insert(child.file_name().to_string_lossy().into_owned());
                    }
                }
                *children = names;
            }
        }
        entry
    }
}

fn map_io(name: &EntryName, err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NoSuchEntry(name.to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(name.to_string()),
        io::ErrorKind::PermissionDenied => FsError::AccessDenied(name.to_string()),
        _ => FsError::from(err),
    }
}

impl Controller for HostTarget {
    fn model(&self) -> &Arc<Model> {
        &self.model
    }

    fn is_mounted(&self) -> bool {
        // A host file system has no mount lifecycle.
        true
    }

    fn stat(&self, _opts: AccessOptions, name: &EntryName) -> FsResult<Option<Entry>> {
        let path = self.resolve(name);
        match fs::symlink_metadata(&path) {
            Ok(meta) => Ok(Some(Self::entry_from_metadata(name, &path, &meta))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_io(name, err)),
        }
    }

    fn check_access(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
    ) -> FsResult<()> {
        let entry = self
            .stat(opts, name)?
            .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
        if kinds.intersects(AccessKinds::WRITE | AccessKinds::CREATE) {
            let meta = fs::metadata(self.resolve(name)).map_err(|e| map_io(name, e))?;
            if meta.permissions().readonly() && entry.is_file() {
                return Err(FsError::ReadOnly);
            }
        }
        Ok(())
    }

    fn set_read_only(&self, name: &EntryName) -> FsResult<()> {
        let path = self.resolve(name);
        let meta = fs::metadata(&path).map_err(|e| map_io(name, e))?;
        let mut permissions = meta.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&path, permissions).map_err(|e| map_io(name, e))
    }

    fn set_time(
        &self,
        _opts: AccessOptions,
        name: &EntryName,
        kinds: AccessKinds,
        millis: i64,
    ) -> FsResult<()> {
        let path = self.resolve(name);
        let time = std::time::UNIX_EPOCH + std::time::Duration::from_millis(millis.max(0) as u64);
        let mut times = fs::FileTimes::new();
        let mut any = false;
        for kind in kinds.kinds() {
            match kind {
                AccessKind::Write => {
                    times = times.set_modified(time);
                    any = true;
                }
                AccessKind::Read => {
                    times = times.set_accessed(time);
                    any = true;
                }
                // Creation times are not portably settable.
                AccessKind::Create => {}
            }
        }
        if !any {
            return Ok(());
        }
        let file = fs::File::open(&path).map_err(|e| map_io(name, e))?;
        file.set_times(times).map_err(|e| map_io(name, e))
    }

    fn mknod(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        kind: EntryType,
        _template: Option<Entry>,
    ) -> FsResult<()> {
        let path = self.resolve(name);
        match kind {
            EntryType::Directory => {
                let result = if opts.contains(AccessOptions::CREATE_PARENTS) {
                    fs::create_dir_all(&path)
                } else {
                    fs::create_dir(&path)
                };
                result.map_err(|e| map_io(name, e))
            }
            EntryType::File => {
                if opts.contains(AccessOptions::CREATE_PARENTS) {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(|e| map_io(name, e))?;
                    }
                }
                let mut options = fs::OpenOptions::new();
                options.write(true);
                if opts.contains(AccessOptions::EXCLUSIVE) {
                    options.create_new(true);
                } else {
                    options.create(true);
                }
                options
                    .open(&path)
                    .map(drop)
                    .map_err(|e| map_io(name, e))
            }
            _ => Err(FsError::AccessDenied(format!(
                "cannot create {kind:?} entries on a host file system"
            ))),
        }
    }

    fn unlink(&self, _opts: AccessOptions, name: &EntryName) -> FsResult<()> {
        let path = self.resolve(name);
        let meta = fs::symlink_metadata(&path).map_err(|e| map_io(name, e))?;
        let result = if meta.is_dir() {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|err| {
            if meta.is_dir() && err.kind() != io::ErrorKind::NotFound {
                FsError::AccessDenied(format!("cannot remove directory {name}: {err}"))
            } else {
                map_io(name, err)
            }
        })
    }

    fn sync(&self, _opts: SyncOptions) -> Result<(), SyncError> {
        // Host writes hit the operating system when streams close; there is
        // nothing left to flush or unmount.
        self.model.reset_touched();
        Ok(())
    }

    fn input_target(&self, opts: AccessOptions, name: &EntryName) -> FsResult<Entry> {
        self.stat(opts, name)?
            .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))
    }

    fn output_target(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        template: Option<&Entry>,
    ) -> FsResult<Entry> {
        match self.stat(opts, name)? {
            Some(entry) => Ok(entry),
            None => {
                let mut entry = Entry::new(name.as_str(), EntryType::File);
                if let Some(template) = template {
                    entry.apply_template(template);
                }
                Ok(entry)
            }
        }
    }

    fn open_input(
        &self,
        _opts: AccessOptions,
        name: &EntryName,
        _peer: Option<&dyn OutputEndpoint>,
    ) -> FsResult<FsInputStream> {
        let path = self.resolve(name);
        let meta = fs::symlink_metadata(&path).map_err(|e| map_io(name, e))?;
        if meta.is_dir() {
            return Err(FsError::IsDirectory(name.to_string()));
        }
        let file = fs::File::open(&path).map_err(|e| map_io(name, e))?;
        Ok(FsInputStream::new(Box::new(file)))
    }

    fn open_output(
        &self,
        opts: AccessOptions,
        name: &EntryName,
        _template: Option<&Entry>,
        _peer: Option<&dyn InputEndpoint>,
    ) -> FsResult<FsOutputStream> {
        opts.check_conflicts()?;
        let path = self.resolve(name);
        if opts.contains(AccessOptions::CREATE_PARENTS) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| map_io(name, e))?;
            }
        }
        let mut options = fs::OpenOptions::new();
        options.write(true);
        if opts.contains(AccessOptions::EXCLUSIVE) {
            options.create_new(true);
        } else {
            options.create(true);
        }
        if opts.contains(AccessOptions::APPEND) {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let file = options.open(&path).map_err(|e| map_io(name, e))?;
        self.model.touch();
        Ok(FsOutputStream::new(Box::new(file), None))
    }
}
