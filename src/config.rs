//! Kernel configuration.
//!
//! There is no hidden global state: everything the kernel needs at runtime
//! is decided here and passed to [`crate::manager::Manager::new`]. Multiple
//! independently configured kernels can coexist in one process, which is
//! also what keeps tests isolated.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::pool::{new_pool, IoPool, PoolKind};
use crate::stats::IoStatistics;

/// Tunables consumed when a manager is constructed.
#[derive(Clone, Debug)]
pub struct Config {
    /// Which buffer pool backs caches and staged entries.
    pub pool: PoolKind,
    /// Bound for waiting on foreign streams during sync, and the upper
    /// bound of the random back-off interval in the lock-retry protocol.
    pub wait_timeout: Duration,
    /// Bound on mounted archive file systems for a pacemaker obtained via
    /// [`crate::manager::Manager::pacemaker`].
    pub pacemaker_max: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pool: PoolKind::Memory,
            wait_timeout: Duration::from_millis(100),
            pacemaker_max: 5,
        }
    }
}

/// Shared runtime environment of one kernel instance, handed to drivers
/// when they assemble controllers.
pub struct Env {
    pub(crate) pool: Arc<dyn IoPool>,
    pub(crate) wait_timeout: Duration,
    pub(crate) pacemaker_max: usize,
    pub(crate) stats: Arc<IoStatistics>,
}

impl Env {
    pub(crate) fn new(config: &Config) -> Arc<Env> {
        Arc::new(Env {
            pool: new_pool(config.pool),
            wait_timeout: config.wait_timeout,
            pacemaker_max: config.pacemaker_max,
            stats: Arc::new(IoStatistics::new()),
        })
    }

    /// The buffer pool backing caches and staged entries.
    pub fn pool(&self) -> &Arc<dyn IoPool> {
        &self.pool
    }

    /// The bounded wait used by sync and the lock-retry back-off.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// The byte counters shared by all accounted streams.
    pub fn stats(&self) -> &Arc<IoStatistics> {
        &self.stats
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}
