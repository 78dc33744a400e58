//! Virtual file system kernel for nestable archives
//!
//! nestfs presents archive files as transparent, nestable directories: a
//! path such as `sar:sar:file:/tmp/outer.sar!/inner.sar!/data.bin`
//! addresses a file inside an archive inside an archive. Each archive is a
//! *federated* file system with its own controller; reads and writes cross
//! archive boundaries transparently, with per-entry caching, lazy mounting
//! and an explicit `sync` that writes changes back to the parent storage.
//!
//! The kernel is format-agnostic: archive byte layouts live behind the
//! [`ArchiveDriver`] contract, registered per URI scheme in a
//! [`DriverRegistry`]. The crate ships the host file system driver, the
//! [`drivers::sar`] reference container driver, and the canonical
//! extension table for the well-known archive families.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nestfs::drivers::sar::SarDriver;
//! use nestfs::{
//!     AccessOptions, Config, ControllerOps, DriverRegistry, EntryName, Manager, MountPoint,
//!     Scheme, SyncOptions,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = DriverRegistry::new();
//!     registry.register_archive(Scheme::new("sar")?, &["sar"], Arc::new(SarDriver::new()));
//!     let manager = Manager::new(registry, &Config::default());
//!
//!     let archive = MountPoint::parse("sar:file:/tmp/demo.sar!/")?;
//!     let controller = manager.controller(&archive)?;
//!     controller
//!         .output(
//!             AccessOptions::CREATE_PARENTS,
//!             &EntryName::new("docs/hello.txt")?,
//!             None,
//!         )
//!         .open_stream()?
//!         .write_all_and_close(b"hello")?;
//!
//!     // Nothing touches /tmp/demo.sar until the sync commits it.
//!     manager.sync(SyncOptions::umount())?;
//!     Ok(())
//! }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod access_options;
mod accountant;
mod addr;
mod config;
mod controller;
mod driver;
pub mod drivers;
mod entry;
mod error;
mod manager;
mod model;
mod pacemaker;
mod pool;
mod registry;
mod rwlock;
mod socket;
mod stats;
mod sync_options;

pub use crate::access_options::{AccessKinds, AccessOptions};
pub use crate::addr::{EntryName, FsPath, MountPoint, Scheme, SEPARATOR};
pub use crate::config::{Config, Env};
pub use crate::controller::{current_options, Controller, ControllerOps};
pub use crate::driver::{ArchiveDriver, HostDriver, InputService, OutputService};
pub use crate::entry::{AccessKind, Entry, EntryType, SizeKind, UNKNOWN};
pub use crate::error::{FsError, FsResult, SyncError, SyncErrorBuilder, SyncSeverity};
pub use crate::manager::Manager;
pub use crate::model::Model;
pub use crate::pacemaker::Pacemaker;
pub use crate::pool::{new_pool, IoBuffer, IoPool, MemoryPool, PoolKind, TempFilePool};
pub use crate::registry::{default_scheme_extensions, DriverRegistry};
pub use crate::socket::{
    connect, copy, FsInputStream, FsOutputStream, InputEndpoint, InputSocket, OutputEndpoint,
    OutputSocket,
};
pub use crate::stats::{IoStatistics, ManagerStats};
pub use crate::sync_options::SyncOptions;
