//! Drivers shipped with the kernel.
//!
//! `file` is the host file system driver behind every opaque mount point.
//! `sar` is a deliberately simple container driver: it exists to exercise
//! the driver contract end to end (mounting, false positives, committing)
//! without the kernel taking a position on real-world codec formats, whose
//! drivers are registered by the embedder.

pub mod file;
pub mod sar;
