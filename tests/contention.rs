//! Statistical liveness: a workload that randomly mixes parent-side and
//! child-side operations across threads must complete in finite time. The
//! lock-retry protocol turns would-be deadlocks between the host and the
//! archive file systems into bounded random retries, so completion of the
//! whole workload is the property under test.

use std::io::Read;
use std::sync::Arc;
use std::thread;

use nestfs::drivers::sar::SarDriver;
use nestfs::{
    AccessOptions, Config, Controller, ControllerOps, DriverRegistry, EntryName, Manager,
    MountPoint, Scheme, SyncOptions,
};

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 1250;

fn name(s: &str) -> EntryName {
    EntryName::new(s).unwrap()
}

fn try_write(controller: &Arc<dyn Controller>, entry: &str, data: &[u8]) {
    let socket = controller.output(AccessOptions::CREATE_PARENTS, &name(entry), None);
    if let Ok(stream) = socket.open_stream() {
        // A concurrent forced sync may poison the stream; completion, not
        // success, is what matters here.
        let _ = stream.write_all_and_close(data);
    }
}

fn try_read(controller: &Arc<dyn Controller>, entry: &str) {
    let socket = controller.input(AccessOptions::empty(), &name(entry));
    if let Ok(mut stream) = socket.open_stream() {
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    }
}

#[test]
fn mixed_contention_completes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut registry = DriverRegistry::new();
    registry.register_archive(
        Scheme::new("sar").unwrap(),
        &["sar"],
        Arc::new(SarDriver::new()),
    );
    let manager = Manager::new(registry, &Config::default());

    let archive = MountPoint::parse(&format!("sar:file:{}/a.sar!/", dir.path().display())).unwrap();
    let host = MountPoint::parse(&format!("file:{}/", dir.path().display())).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|worker| {
            let manager = manager.clone();
            let archive = archive.clone();
            let host = host.clone();
            thread::spawn(move || {
                for op in 0..OPS_PER_THREAD {
                    let child = manager.controller(&archive).unwrap();
                    let parent = manager.controller(&host).unwrap();
                    match fastrand::usize(0..8) {
                        0 => try_write(&child, &format!("w{worker}/e{}", op % 7), b"child write"),
                        1 => try_read(&child, &format!("w{worker}/e{}", op % 7)),
                        2 => {
                            let _ = child.stat(AccessOptions::empty(), &name("w0/e0"));
                        }
                        3 => {
                            let _ = parent.stat(AccessOptions::empty(), &name("a.sar"));
                        }
                        4 => try_write(&parent, &format!("plain{worker}.txt"), b"host write"),
                        5 => try_read(&parent, "a.sar"),
                        6 => {
                            let _ = child.check_access(
                                AccessOptions::empty(),
                                &EntryName::root(),
                                nestfs::AccessKinds::READ,
                            );
                        }
                        _ => {
                            // Occasional forced partial sync from the side.
                            if op % 100 == 99 {
                                let _ = child.sync(
                                    SyncOptions::FORCE_CLOSE_INPUT
                                        | SyncOptions::FORCE_CLOSE_OUTPUT
                                        | SyncOptions::CLEAR_CACHE,
                                );
                            }
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker completed without panicking");
    }

    // The tree is still consistent enough for a final full sync.
    match manager.sync(SyncOptions::umount()) {
        Ok(()) => {}
        Err(err) => assert!(err.is_warning_only(), "final sync lost data: {err}"),
    }
    assert_eq!(manager.size(), 0);
}
