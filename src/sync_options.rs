//! Sync option bit-field.

use std::fmt::Display;
use std::fmt::Formatter;

use bitflags::bitflags;

bitflags! {
    /// Options for `sync`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct SyncOptions: u8 {
        /// Wait for input streams held by other threads to close instead of
        /// failing after the bounded timeout.
        const WAIT_CLOSE_INPUT = 1 << 0;
        /// Wait for output streams held by other threads to close.
        const WAIT_CLOSE_OUTPUT = 1 << 1;
        /// Forcibly close open input streams; their owners see I/O failures
        /// on further use.
        const FORCE_CLOSE_INPUT = 1 << 2;
        /// Forcibly close open output streams.
        const FORCE_CLOSE_OUTPUT = 1 << 3;
        /// Discard un-synced changes instead of committing them.
        const ABORT_CHANGES = 1 << 4;
        /// Evict all cached entry buffers after the sync.
        const CLEAR_CACHE = 1 << 5;
        /// Drop the in-memory directory after the sync, returning the mount
        /// to its unmounted state.
        const UMOUNT = 1 << 6;
    }
}

impl SyncOptions {
    /// The conjunction used on application exit: unmount everything, forcing
    /// open streams closed and clearing all caches.
    pub fn umount() -> SyncOptions {
        SyncOptions::UMOUNT
            | SyncOptions::FORCE_CLOSE_INPUT
            | SyncOptions::FORCE_CLOSE_OUTPUT
            | SyncOptions::CLEAR_CACHE
    }

    /// Whether any force-close flag is set.
    pub fn forces_close(self) -> bool {
        self.intersects(SyncOptions::FORCE_CLOSE_INPUT | SyncOptions::FORCE_CLOSE_OUTPUT)
    }

    /// Whether any wait-close flag is set.
    pub fn waits_close(self) -> bool {
        self.intersects(SyncOptions::WAIT_CLOSE_INPUT | SyncOptions::WAIT_CLOSE_OUTPUT)
    }
}

impl Display for SyncOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.bits(), f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn umount_implies_force_and_clear() {
        let opts = SyncOptions::umount();
        assert!(opts.contains(SyncOptions::UMOUNT));
        assert!(opts.contains(SyncOptions::FORCE_CLOSE_INPUT));
        assert!(opts.contains(SyncOptions::FORCE_CLOSE_OUTPUT));
        assert!(opts.contains(SyncOptions::CLEAR_CACHE));
        assert!(opts.forces_close());
    }
}
