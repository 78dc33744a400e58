//! Driver contracts.
//!
//! An archive driver owns the byte layout of one archive family. The kernel
//! never touches archive bytes itself: it asks the driver for an input
//! service to enumerate and read a mounted archive, and for an output
//! service to write the committed state back through the parent file system.

use std::io::Read;
use std::sync::Arc;

use crate::access_options::AccessOptions;
use crate::config::Env;
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::FsResult;
use crate::model::Model;
use crate::socket::{InputSocket, OutputSocket};

/// Read side of a mounted archive.
///
/// Created from the archive's bytes in the parent file system. Lives for as
/// long as the archive stays mounted.
pub trait InputService: Send + Sync {
    /// All entries of the archive, in no particular order.
    fn entries(&self) -> Vec<Entry>;

    /// Look up one entry by its canonical name.
    fn entry(&self, name: &str) -> Option<Entry>;

    /// Open the decompressed bytes of one entry.
    fn input(&self, name: &str) -> FsResult<Box<dyn Read + Send>>;
}

/// Write side of an archive, used while committing during sync.
///
/// Entries are written in lexicographic byte order of their names so that
/// identical logical content produces identical archive bytes.
pub trait OutputService: Send {
    /// Append one entry. `data` is `None` for entries without content
    /// (directories).
    fn write(&mut self, entry: &Entry, data: Option<&mut (dyn Read + Send)>) -> FsResult<()>;

    /// Write the archive trailer and flush the sink.
    fn finish(&mut self) -> FsResult<()>;
}

/// The format-specific factory for one archive family.
pub trait ArchiveDriver: Send + Sync {
    /// The character set used for entry names inside the archive.
    fn charset(&self) -> &'static str {
        "UTF-8"
    }

    /// Whether the given entry name can be encoded in the archive.
    fn encodable(&self, _name: &str) -> bool {
        true
    }

    /// Construct an archive-level entry. Directory names end in `/`; the
    /// template, when present, donates sizes and times.
    fn new_entry(
        &self,
        name: &str,
        kind: EntryType,
        _opts: AccessOptions,
        template: Option<&Entry>,
    ) -> Entry {
        let name = if kind == EntryType::Directory && !name.is_empty() && !name.ends_with('/') {
            format!("{name}/")
        } else {
            name.to_string()
        };
        let mut entry = Entry::new(name, kind);
        if let Some(template) = template {
            entry.apply_template(template);
        }
        entry
    }

    /// Open an archive for reading through `source`, which addresses the
    /// archive file in the parent file system.
    ///
    /// Returns `FalsePositive` when the bytes do not match the driver's
    /// magic, or its persistent sibling when re-probing on every access
    /// would be wasted effort.
    fn new_input_service(
        &self,
        model: &Model,
        source: &InputSocket,
    ) -> FsResult<Box<dyn InputService>>;

    /// Open an archive for writing through `sink`. `input` is the current
    /// input service for drivers that update in place.
    fn new_output_service(
        &self,
        model: &Model,
        sink: &OutputSocket,
        input: Option<&dyn InputService>,
    ) -> FsResult<Box<dyn OutputService>>;

    /// Assemble the controller stack for one archive file system. The
    /// default builds the standard five-layer federation stack.
    fn new_controller(
        &self,
        this: &Arc<dyn ArchiveDriver>,
        env: &Arc<Env>,
        model: Arc<Model>,
        parent: Arc<dyn Controller>,
    ) -> Arc<dyn Controller> {
        crate::controller::federate(Arc::clone(this), Arc::clone(env), model, parent)
    }
}

/// The factory for host (non-federated) file system controllers.
pub trait HostDriver: Send + Sync {
    /// Build the controller for the opaque mount point carried by `model`.
    fn new_controller(&self, env: &Arc<Env>, model: Arc<Model>) -> FsResult<Arc<dyn Controller>>;
}
