//! Access option and access kind bit-fields.

use std::fmt::Display;
use std::fmt::Formatter;

use bitflags::bitflags;

use crate::entry::AccessKind;
use crate::error::{FsError, FsResult};

bitflags! {
    /// Options for every controller operation.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct AccessOptions: u16 {
        /// Route reads and writes through the per-entry cache layer.
        const CACHE = 1 << 0;
        /// Prefer compressed storage for written entries.
        const COMPRESS = 1 << 1;
        /// Prefer uncompressed storage for written entries.
        const STORE = 1 << 2;
        /// Encrypt written entries, where the driver supports it.
        const ENCRYPT = 1 << 3;
        /// Create missing parent directories on output and mknod.
        const CREATE_PARENTS = 1 << 4;
        /// Fail if the target entry already exists.
        const EXCLUSIVE = 1 << 5;
        /// Append to the target entry instead of replacing it.
        const APPEND = 1 << 6;
        /// Allow the containing archive to grow in place instead of being
        /// rewritten.
        const GROW = 1 << 7;
    }
}

impl AccessOptions {
    /// Fails when mutually exclusive options are combined.
    pub fn check_conflicts(self) -> FsResult<()> {
        if self.contains(AccessOptions::COMPRESS | AccessOptions::STORE) {
            return Err(FsError::AccessDenied(
                "COMPRESS conflicts with STORE".to_string(),
            ));
        }
        if self.contains(AccessOptions::EXCLUSIVE | AccessOptions::APPEND) {
            return Err(FsError::AccessDenied(
                "EXCLUSIVE conflicts with APPEND".to_string(),
            ));
        }
        Ok(())
    }
}

impl Display for AccessOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.bits(), f)
    }
}

bitflags! {
    /// A set of access kinds, used by `check_access` and `set_time`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct AccessKinds: u8 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Create access.
        const CREATE = 1 << 2;
        /// Execute access.
        const EXECUTE = 1 << 3;
    }
}

impl AccessKinds {
    /// The timestamp kinds selected by this set, in declaration order.
    pub fn kinds(self) -> impl Iterator<Item = AccessKind> {
        [
            (AccessKinds::READ, AccessKind::Read),
            (AccessKinds::WRITE, AccessKind::Write),
            (AccessKinds::CREATE, AccessKind::Create),
        ]
        .into_iter()
        .filter_map(move |(flag, kind)| self.contains(flag).then_some(kind))
    }
}

impl From<AccessKind> for AccessKinds {
    fn from(kind: AccessKind) -> Self {
        match kind {
            AccessKind::Read => AccessKinds::READ,
            AccessKind::Write => AccessKinds::WRITE,
            AccessKind::Create => AccessKinds::CREATE,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conflict_checking() {
        assert!((AccessOptions::COMPRESS | AccessOptions::STORE)
            .check_conflicts()
            .is_err());
        assert!((AccessOptions::COMPRESS | AccessOptions::CACHE)
            .check_conflicts()
            .is_ok());
    }

    #[test]
    fn kind_iteration() {
        let kinds: Vec<_> = (AccessKinds::READ | AccessKinds::CREATE).kinds().collect();
        assert_eq!(kinds, vec![AccessKind::Read, AccessKind::Create]);
    }
}
