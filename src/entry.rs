//! Archive entry metadata.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Sentinel for an unknown size or time.
pub const UNKNOWN: i64 = -1;

/// Entry types.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum EntryType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// Anything else (device nodes, sockets, ...).
    Special,
}

impl EntryType {
    /// Convert a std `FileType` to an `EntryType`.
    pub fn from_std(file_type: std::fs::FileType) -> EntryType {
        if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_file() {
            EntryType::File
        } else if file_type.is_symlink() {
            EntryType::Symlink
        } else {
            EntryType::Special
        }
    }
}

/// The size kinds tracked per entry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum SizeKind {
    /// Decompressed payload size.
    Data = 0,
    /// Size as stored in the containing file system.
    Storage = 1,
}

impl SizeKind {
    /// All size kinds.
    pub const ALL: [SizeKind; 2] = [SizeKind::Data, SizeKind::Storage];
}

/// The access kinds tracked per entry, used both as timestamp indices and as
/// members of an access-check set.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum AccessKind {
    /// Last read.
    Read = 0,
    /// Last write.
    Write = 1,
    /// Creation.
    Create = 2,
}

impl AccessKind {
    /// All access kinds.
    pub const ALL: [AccessKind; 3] = [AccessKind::Read, AccessKind::Write, AccessKind::Create];
}

/// Metadata of one file system entry.
///
/// Sizes and times use [`UNKNOWN`] when not known; times are milliseconds
/// since the Unix epoch. Directories carry the simple names of their members.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Entry {
    name: String,
    kind: EntryType,
    sizes: [i64; 2],
    times: [i64; 3],
    children: Option<BTreeSet<String>>,
}

impl Entry {
    /// Create an entry with unknown sizes and times.
    pub fn new(name: impl Into<String>, kind: EntryType) -> Entry {
        let children = match kind {
            EntryType::Directory => Some(BTreeSet::new()),
            _ => None,
        };
        Entry {
            name: name.into(),
            kind,
            sizes: [UNKNOWN; 2],
            times: [UNKNOWN; 3],
            children,
        }
    }

    /// The entry name, relative to its file system.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The entry type.
    pub fn kind(&self) -> EntryType {
        self.kind
    }

    /// Whether this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind == EntryType::File
    }

    /// Whether this is a directory.
    pub fn is_directory(&self) -> bool {
        self.kind == EntryType::Directory
    }

    /// The size of the given kind, or [`UNKNOWN`].
    pub fn size(&self, kind: SizeKind) -> i64 {
        self.sizes[kind as usize]
    }

    /// Set the size of the given kind.
    pub fn set_size(&mut self, kind: SizeKind, size: i64) {
        self.sizes[kind as usize] = size;
    }

    /// The time of the given access kind in milliseconds since the epoch, or
    /// [`UNKNOWN`].
    pub fn time(&self, kind: AccessKind) -> i64 {
        self.times[kind as usize]
    }

    /// Set the time of the given access kind.
    pub fn set_time(&mut self, kind: AccessKind, millis: i64) {
        self.times[kind as usize] = millis;
    }

    /// The simple names of this directory's members, or `None` for
    /// non-directories.
    pub fn children(&self) -> Option<&BTreeSet<String>> {
        self.children.as_ref()
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut BTreeSet<String>> {
        self.children.as_mut()
    }

    /// Copy sizes and times from a template entry.
    pub fn apply_template(&mut self, template: &Entry) {
        for kind in SizeKind::ALL {
            self.sizes[kind as usize] = template.size(kind);
        }
        for kind in AccessKind::ALL {
            self.times[kind as usize] = template.time(kind);
        }
    }
}

/// The current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Convert a `SystemTime` to milliseconds since the epoch.
pub(crate) fn system_time_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(UNKNOWN)
}
