//! Resource accounting for open streams.
//!
//! Every stream handed to user code is registered here on creation and
//! unregistered when it closes. Sync queries the accounts to decide whether
//! it may proceed: resources owned by the calling thread can never be waited
//! for (the wait would deadlock), resources owned by other threads can be
//! waited for or forcibly closed.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Condvar, Mutex};

/// Whether a resource moves bytes in or out; force-close options distinguish
/// the two.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ResourceKind {
    Input,
    Output,
}

/// Implemented by stream cores so the accountant can close them from the
/// syncing thread.
pub(crate) trait ForceClosable: Send + Sync {
    /// Close the underlying resource, leaving the user-facing handle in a
    /// state where further operations fail.
    fn force_close(&self) -> io::Result<()>;
}

/// Counts of open resources.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ResourceCounts {
    /// All open resources.
    pub total: usize,
    /// Those owned by the current thread.
    pub local: usize,
}

struct Account {
    owner: ThreadId,
    kind: ResourceKind,
    resource: Weak<dyn ForceClosable>,
}

#[derive(Default)]
struct Accounts {
    next_id: u64,
    open: HashMap<u64, Account>,
}

/// Per-controller registry of live streams.
#[derive(Clone, Default)]
pub(crate) struct Accountant {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    accounts: Mutex<Accounts>,
    closed: Condvar,
}

impl Accountant {
    pub(crate) fn new() -> Accountant {
        Accountant::default()
    }

    /// Register a resource owned by the current thread. Dropping the handle
    /// unregisters it.
    pub(crate) fn register(
        &self,
        kind: ResourceKind,
        resource: Weak<dyn ForceClosable>,
    ) -> ResourceHandle {
        let mut accounts = self.shared.accounts.lock();
        let id = accounts.next_id;
        accounts.next_id += 1;
        accounts.open.insert(
            id,
            Account {
                owner: thread::current().id(),
                kind,
                resource,
            },
        );
        ResourceHandle {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Current counts, distinguishing resources of the calling thread.
    pub(crate) fn counts(&self) -> ResourceCounts {
        let me = thread::current().id();
        let accounts = self.shared.accounts.lock();
        let total = accounts.open.len();
        let local = accounts.open.values().filter(|a| a.owner == me).count();
        ResourceCounts { total, local }
    }

    /// Counts restricted to resources of kinds NOT covered by `covered`.
    pub(crate) fn uncovered(&self, covered: impl Fn(ResourceKind) -> bool) -> ResourceCounts {
        let me = thread::current().id();
        let accounts = self.shared.accounts.lock();
        let mut counts = ResourceCounts::default();
        for account in accounts.open.values() {
            if covered(account.kind) {
                continue;
            }
            counts.total += 1;
            if account.owner == me {
                counts.local += 1;
            }
        }
        counts
    }

    /// Wait until no foreign thread holds an uncovered resource, up to
    /// `timeout`. The wait is always bounded: a foreign output stream may
    /// need this controller's write lock to close, which the syncing
    /// caller is holding. Returns the remaining counts.
    pub(crate) fn wait_foreign(
        &self,
        covered: impl Fn(ResourceKind) -> bool,
        timeout: Duration,
    ) -> ResourceCounts {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut accounts = self.shared.accounts.lock();
        loop {
            let mut counts = ResourceCounts::default();
            for account in accounts.open.values() {
                if covered(account.kind) {
                    continue;
                }
                counts.total += 1;
                if account.owner == me {
                    counts.local += 1;
                }
            }
            if counts.total == counts.local {
                return counts;
            }
            if self
                .shared
                .closed
                .wait_until(&mut accounts, deadline)
                .timed_out()
            {
                return counts;
            }
        }
    }

    /// Forcibly close every open resource of a covered kind, draining the
    /// accounts. Close failures are returned for the sync assembly.
    pub(crate) fn force_close(&self, covered: impl Fn(ResourceKind) -> bool) -> Vec<io::Error> {
        let drained: Vec<Account> = {
            let mut accounts = self.shared.accounts.lock();
            let ids: Vec<u64> = accounts
                .open
                .iter()
                .filter(|(_, a)| covered(a.kind))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| accounts.open.remove(&id))
                .collect()
        };
        let mut failures = Vec::new();
        for account in drained {
            if let Some(resource) = account.resource.upgrade() {
                warn!("forcibly closing a stream left open by {:?}", account.owner);
                if let Err(err) = resource.force_close() {
                    failures.push(err);
                }
            }
        }
        self.shared.closed.notify_all();
        failures
    }

}

impl std::fmt::Debug for Accountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let accounts = self.shared.accounts.lock();
        f.debug_struct("Accountant")
            .field("open", &accounts.open.len())
            .finish()
    }
}

/// RAII registration of one stream; dropping it releases the account and
/// wakes any thread blocked in wait-idle.
pub(crate) struct ResourceHandle {
    shared: Weak<Shared>,
    id: u64,
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.accounts.lock().open.remove(&self.id);
            shared.closed.notify_all();
        }
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceHandle({})", self.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeResource {
        closed: AtomicBool,
    }

    impl ForceClosable for FakeResource {
        fn force_close(&self) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn register_and_release() {
        let accountant = Accountant::new();
        let res: Arc<dyn ForceClosable> = Arc::new(FakeResource {
            closed: AtomicBool::new(false),
        });
        let handle = accountant.register(ResourceKind::Input, Arc::downgrade(&res));
        assert_eq!(
            accountant.counts(),
            ResourceCounts { total: 1, local: 1 }
        );
        drop(handle);
        assert_eq!(
            accountant.counts(),
            ResourceCounts { total: 0, local: 0 }
        );
    }

    #[test]
    fn force_close_drains_covered_kinds() {
        let accountant = Accountant::new();
        let input = Arc::new(FakeResource {
            closed: AtomicBool::new(false),
        });
        let output = Arc::new(FakeResource {
            closed: AtomicBool::new(false),
        });
        let input_dyn: Arc<dyn ForceClosable> = input.clone();
        let output_dyn: Arc<dyn ForceClosable> = output.clone();
        let _h1 = accountant.register(ResourceKind::Input, Arc::downgrade(&input_dyn));
        let _h2 = accountant.register(ResourceKind::Output, Arc::downgrade(&output_dyn));

        let failures = accountant.force_close(|kind| kind == ResourceKind::Input);
        assert!(failures.is_empty());
        assert!(input.closed.load(Ordering::SeqCst));
        assert!(!output.closed.load(Ordering::SeqCst));
        assert_eq!(accountant.counts().total, 1);
    }

    #[test]
    fn uncovered_ignores_covered_kinds() {
        let accountant = Accountant::new();
        let res: Arc<dyn ForceClosable> = Arc::new(FakeResource {
            closed: AtomicBool::new(false),
        });
        let _h = accountant.register(ResourceKind::Output, Arc::downgrade(&res));
        let counts = accountant.uncovered(|kind| kind == ResourceKind::Output);
        assert_eq!(counts.total, 0);
    }
}
