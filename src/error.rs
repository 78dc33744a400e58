//! Error vocabulary of the kernel.
//!
//! All fallible operations use one [`FsError`] enum so that every layer of
//! the controller stack can match on the kind of a failure without downcasting.
//! Three kinds are pure control flow ([`FsError::NeedsWriteLock`],
//! [`FsError::NeedsLockRetry`], [`FsError::FalsePositive`] and its persistent
//! sibling): they are raised by inner layers and consumed by outer ones, and
//! must never surface through a controller obtained from the manager.
//!
//! Sync failures are composites: every problem encountered during a sync is
//! accumulated into a [`SyncError`] which is a warning if and only if no
//! destructive failure occurred.

use std::fmt;
use std::io;
use std::sync::Arc;

use smallvec::SmallVec;

/// Result alias used by all kernel operations.
pub type FsResult<T> = Result<T, FsError>;

/// The error kinds of the kernel.
///
/// `Io` wraps the underlying error in an `Arc` so that values of this type
/// stay cloneable; a persistent false positive is remembered on the model and
/// handed out repeatedly until the next sync.
#[derive(Debug, Clone)]
pub enum FsError {
    /// A URI could not be parsed into a mount point or path.
    MalformedUri(String),
    /// A mount point URI lacks a scheme or is not absolute.
    NonabsoluteUri(String),
    /// No entry exists under the given name.
    NoSuchEntry(String),
    /// An entry already exists and the operation demanded exclusivity.
    AlreadyExists(String),
    /// A non-directory entry was addressed as a directory.
    NotDirectory(String),
    /// A directory entry was addressed as a plain file.
    IsDirectory(String),
    /// The file system or entry is read-only.
    ReadOnly,
    /// Access was denied for the requested kinds.
    AccessDenied(String),
    /// No usable key is available for an encrypted archive.
    BadKey,
    /// A key was available but failed authentication.
    AuthenticationFailed,
    /// An archive's own structure is damaged beyond what a driver accepts.
    CorruptArchive(String),
    /// A resource needed by the operation is currently in use.
    BusyResource(String),
    /// Sync found open streams owned by the calling thread; waiting would
    /// deadlock. Carries the local resource count.
    CurrentThreadBusy(usize),
    /// Sync timed out waiting for open streams owned by other threads.
    ThreadsBusy {
        /// Open resources in total.
        total: usize,
        /// Open resources owned by the calling thread.
        local: usize,
    },
    /// The file looks like an archive by name but not by content. Rerouted
    /// to the parent file system by the outermost federating layer.
    FalsePositive(Box<FsError>),
    /// Like `FalsePositive`, but remembered on the model until the next sync
    /// so the mount is not re-attempted on every access.
    PersistentFalsePositive(Box<FsError>),
    /// The operation requires the write lock but only the read lock is held.
    /// Caught by the locking layer, which re-runs the operation on the write
    /// lock.
    NeedsWriteLock,
    /// The operation would have to acquire a lock out of order. Caught by the
    /// outermost locked frame, which releases everything, backs off and
    /// retries.
    NeedsLockRetry,
    /// An underlying I/O failure.
    Io(Arc<io::Error>),
}

impl FsError {
    /// Whether this kind is internal control flow that the decorator stack
    /// must consume.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            FsError::NeedsWriteLock
                | FsError::NeedsLockRetry
                | FsError::FalsePositive(_)
                | FsError::PersistentFalsePositive(_)
        )
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::MalformedUri(uri) => write!(f, "malformed URI: {uri}"),
            FsError::NonabsoluteUri(uri) => write!(f, "URI is not absolute: {uri}"),
            FsError::NoSuchEntry(name) => write!(f, "no such entry: {name:?}"),
            FsError::AlreadyExists(name) => write!(f, "entry already exists: {name:?}"),
            FsError::NotDirectory(name) => write!(f, "not a directory: {name:?}"),
            FsError::IsDirectory(name) => write!(f, "is a directory: {name:?}"),
            FsError::ReadOnly => write!(f, "file system is read-only"),
            FsError::AccessDenied(what) => write!(f, "access denied: {what}"),
            FsError::BadKey => write!(f, "no usable key"),
            FsError::AuthenticationFailed => write!(f, "key authentication failed"),
            FsError::CorruptArchive(what) => write!(f, "corrupt archive: {what}"),
            FsError::BusyResource(what) => write!(f, "resource busy: {what}"),
            FsError::CurrentThreadBusy(local) => {
                write!(f, "{local} open stream(s) on the current thread")
            }
            FsError::ThreadsBusy { total, local } => {
                write!(f, "{total} open stream(s), {local} on the current thread")
            }
            FsError::FalsePositive(cause) => write!(f, "not an archive: {cause}"),
            FsError::PersistentFalsePositive(cause) => write!(f, "not an archive: {cause}"),
            FsError::NeedsWriteLock => write!(f, "operation needs the write lock"),
            FsError::NeedsLockRetry => write!(f, "operation needs a lock retry"),
            FsError::Io(err) => write!(f, "I/O failure: {err}"),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FsError::Io(err) => Some(err.as_ref()),
            FsError::FalsePositive(cause) | FsError::PersistentFalsePositive(cause) => {
                Some(cause.as_ref())
            }
            _ => None,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::Io(Arc::new(err))
    }
}

/// Discrimination of sync failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSeverity {
    /// Non-destructive; the mount is still consistent and may continue to be
    /// used (e.g. a close error on a forcibly closed stream).
    Warning,
    /// Destructive; data may have been lost (e.g. the archive trailer could
    /// not be written).
    Fatal,
}

/// Composite error thrown by `sync`.
///
/// Callers receive at most one of these per sync call; all individual
/// failures are chained inside. Fatal causes take precedence over warnings
/// when determining the severity.
#[derive(Debug)]
pub struct SyncError {
    severity: SyncSeverity,
    causes: Vec<FsError>,
}

impl SyncError {
    /// The overall severity.
    pub fn severity(&self) -> SyncSeverity {
        self.severity
    }

    /// Every individual failure, fatal causes first.
    pub fn causes(&self) -> &[FsError] {
        &self.causes
    }

    /// True if the mount is still consistent.
    pub fn is_warning_only(&self) -> bool {
        self.severity == SyncSeverity::Warning
    }

    pub(crate) fn contains_lock_retry(&self) -> bool {
        self.causes
            .iter()
            .any(|c| matches!(c, FsError::NeedsLockRetry))
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            SyncSeverity::Warning => write!(f, "sync completed with warnings:")?,
            SyncSeverity::Fatal => write!(f, "sync failed, data may have been lost:")?,
        }
        for cause in &self.causes {
            write!(f, " [{cause}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes
            .first()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Accumulator for sync failures.
///
/// `warn` records a non-destructive problem and lets the sync continue;
/// `fail` records a destructive one. `check` produces the composite, fatal
/// causes taking precedence, or `Ok(())` when nothing was recorded.
#[derive(Debug, Default)]
pub struct SyncErrorBuilder {
    warnings: SmallVec<[FsError; 4]>,
    fatals: SmallVec<[FsError; 4]>,
}

impl SyncErrorBuilder {
    /// A fresh, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a non-destructive failure and continue.
    pub fn warn(&mut self, cause: FsError) {
        self.warnings.push(cause);
    }

    /// Record a destructive failure. The sync keeps going so that later
    /// steps can still salvage what they can, but the final composite will
    /// be fatal.
    pub fn fail(&mut self, cause: FsError) {
        self.fatals.push(cause);
    }

    /// Absorb another composite, keeping its severity discrimination.
    pub fn merge(&mut self, other: SyncError) {
        match other.severity {
            SyncSeverity::Warning => self.warnings.extend(other.causes),
            SyncSeverity::Fatal => self.fatals.extend(other.causes),
        }
    }

    /// Whether anything was recorded.
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.fatals.is_empty()
    }

    /// Produce the composite, or `Ok(())` when nothing was recorded.
    pub fn check(self) -> Result<(), SyncError> {
        if self.is_empty() {
            return Ok(());
        }
        let severity = if self.fatals.is_empty() {
            SyncSeverity::Warning
        } else {
            SyncSeverity::Fatal
        };
        let mut causes = Vec::with_capacity(self.fatals.len() + self.warnings.len());
        causes.extend(self.fatals);
        causes.extend(self.warnings);
        Err(SyncError { severity, causes })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_builder_is_clean() {
        assert!(SyncErrorBuilder::new().check().is_ok());
    }

    #[test]
    fn warnings_only_stay_warnings() {
        let mut b = SyncErrorBuilder::new();
        b.warn(FsError::ReadOnly);
        b.warn(FsError::BadKey);
        let err = b.check().unwrap_err();
        assert_eq!(err.severity(), SyncSeverity::Warning);
        assert_eq!(err.causes().len(), 2);
    }

    #[test]
    fn fatal_takes_precedence() {
        let mut b = SyncErrorBuilder::new();
        b.warn(FsError::ReadOnly);
        b.fail(FsError::CorruptArchive("trailer".into()));
        let err = b.check().unwrap_err();
        assert_eq!(err.severity(), SyncSeverity::Fatal);
        // Fatal causes are listed first.
        assert!(matches!(err.causes()[0], FsError::CorruptArchive(_)));
    }

    #[test]
    fn control_flow_kinds() {
        assert!(FsError::NeedsWriteLock.is_control_flow());
        assert!(FsError::FalsePositive(Box::new(FsError::ReadOnly)).is_control_flow());
        assert!(!FsError::ReadOnly.is_control_flow());
    }
}
