//! End-to-end kernel scenarios against real temp directories: the host
//! driver underneath, the `sar` container driver on top.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use nestfs::drivers::sar::SarDriver;
use nestfs::{
    copy, AccessKind, AccessOptions, Config, Controller, ControllerOps, DriverRegistry, EntryName,
    EntryType, FsError, FsPath, Manager, MountPoint, Pacemaker, Scheme, SizeKind, SyncOptions,
    SyncSeverity,
};

fn new_manager() -> (Manager, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut registry = DriverRegistry::new();
    registry.register_archive(
        Scheme::new("sar").unwrap(),
        &["sar"],
        Arc::new(SarDriver::new()),
    );
    (Manager::new(registry, &Config::default()), dir)
}

fn archive_mp(dir: &Path, name: &str) -> MountPoint {
    MountPoint::parse(&format!("sar:file:{}/{name}!/", dir.display())).unwrap()
}

fn nested_mp(dir: &Path, outer: &str, inner: &str) -> MountPoint {
    MountPoint::parse(&format!("sar:sar:file:{}/{outer}!/{inner}!/", dir.display())).unwrap()
}

fn host_mp(dir: &Path) -> MountPoint {
    MountPoint::parse(&format!("file:{}/", dir.display())).unwrap()
}

fn name(s: &str) -> EntryName {
    EntryName::new(s).unwrap()
}

fn write_entry(controller: &Arc<dyn Controller>, opts: AccessOptions, entry: &str, data: &[u8]) {
    controller
        .output(opts, &name(entry), None)
        .open_stream()
        .unwrap()
        .write_all_and_close(data)
        .unwrap();
}

fn read_entry(controller: &Arc<dyn Controller>, opts: AccessOptions, entry: &str) -> Vec<u8> {
    controller
        .input(opts, &name(entry))
        .open_stream()
        .unwrap()
        .read_to_end_and_close()
        .unwrap()
}

#[test]
fn write_sync_reopen_read() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");

    let controller = manager.controller(&mp).unwrap();
    write_entry(&controller, AccessOptions::empty(), "x", b"AB");
    // Visible before the sync.
    let entry = controller
        .stat(AccessOptions::empty(), &name("x"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.size(SizeKind::Data), 2);
    drop(controller);

    manager.sync(SyncOptions::umount()).unwrap();
    assert_eq!(manager.size(), 0);

    let controller = manager.controller(&mp).unwrap();
    assert_eq!(read_entry(&controller, AccessOptions::empty(), "x"), b"AB");
}

#[test]
fn create_parents_yields_directories() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");

    let controller = manager.controller(&mp).unwrap();
    write_entry(&controller, AccessOptions::CREATE_PARENTS, "d/y", b"payload");
    drop(controller);
    manager.sync(SyncOptions::umount()).unwrap();

    let controller = manager.controller(&mp).unwrap();
    let entry = controller
        .stat(AccessOptions::empty(), &name("d"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.kind(), EntryType::Directory);
    assert!(entry.children().unwrap().contains("y"));
    assert_eq!(
        read_entry(&controller, AccessOptions::empty(), "d/y"),
        b"payload"
    );
}

#[test]
fn nested_archives_read_through() {
    let (manager, dir) = new_manager();
    let inner_mp = nested_mp(dir.path(), "a.sar", "b.sar");

    let controller = manager.controller(&inner_mp).unwrap();
    write_entry(&controller, AccessOptions::empty(), "c", b"deep bytes");
    drop(controller);
    manager.sync(SyncOptions::umount()).unwrap();
    assert_eq!(manager.size(), 0);

    // The outer archive holds a well-formed inner container.
    let outer = manager.controller(&archive_mp(dir.path(), "a.sar")).unwrap();
    assert!(outer
        .stat(AccessOptions::empty(), &name("b.sar"))
        .unwrap()
        .unwrap()
        .is_file());

    let controller = manager.controller(&inner_mp).unwrap();
    assert_eq!(
        read_entry(&controller, AccessOptions::empty(), "c"),
        b"deep bytes"
    );
}

#[test]
fn sync_is_idempotent() {
    let (manager, dir) = new_manager();
    let controller = manager.controller(&archive_mp(dir.path(), "a.sar")).unwrap();
    write_entry(&controller, AccessOptions::empty(), "x", b"1");
    drop(controller);

    manager.sync(SyncOptions::umount()).unwrap();
    assert_eq!(manager.size(), 0);
    manager.sync(SyncOptions::umount()).unwrap();
    assert_eq!(manager.size(), 0);
}

#[test]
fn entry_metadata_survives_remount() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");

    let controller = manager.controller(&mp).unwrap();
    write_entry(&controller, AccessOptions::empty(), "kept", b"12345");
    let before = controller
        .stat(AccessOptions::empty(), &name("kept"))
        .unwrap()
        .unwrap();
    drop(controller);
    manager.sync(SyncOptions::umount()).unwrap();

    let controller = manager.controller(&mp).unwrap();
    let after = controller
        .stat(AccessOptions::empty(), &name("kept"))
        .unwrap()
        .unwrap();
    assert_eq!(after.size(SizeKind::Data), before.size(SizeKind::Data));
    assert_eq!(after.time(AccessKind::Write), before.time(AccessKind::Write));
}

#[test]
fn concurrent_interning_returns_one_controller() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let mp = mp.clone();
            thread::spawn(move || manager.controller(&mp).unwrap())
        })
        .collect();
    let controllers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for controller in &controllers[1..] {
        assert!(Arc::ptr_eq(&controllers[0], controller));
    }
}

#[test]
fn socket_copy_preserves_bytes() {
    let (manager, dir) = new_manager();
    let a = manager.controller(&archive_mp(dir.path(), "a.sar")).unwrap();
    let b = manager.controller(&archive_mp(dir.path(), "b.sar")).unwrap();

    write_entry(&a, AccessOptions::empty(), "src", b"copy me around");

    let mut input = a.input(AccessOptions::empty(), &name("src"));
    let mut output = b.output(AccessOptions::empty(), &name("dst"), None);
    let copied = copy(&mut input, &mut output).unwrap();
    assert_eq!(copied, 14);

    let src = a
        .stat(AccessOptions::empty(), &name("src"))
        .unwrap()
        .unwrap();
    let dst = b
        .stat(AccessOptions::empty(), &name("dst"))
        .unwrap()
        .unwrap();
    assert_eq!(src.size(SizeKind::Data), dst.size(SizeKind::Data));
    assert_eq!(
        read_entry(&b, AccessOptions::empty(), "dst"),
        b"copy me around"
    );
}

#[test]
fn sync_without_force_fails_busy() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");
    let controller = manager.controller(&mp).unwrap();
    write_entry(&controller, AccessOptions::empty(), "x", b"xyzzy");

    // Two streams held open by two other threads.
    let mut streams = Vec::new();
    for _ in 0..2 {
        let controller = Arc::clone(&controller);
        streams.push(
            thread::spawn(move || {
                controller
                    .input(AccessOptions::empty(), &name("x"))
                    .open_stream()
                    .unwrap()
            })
            .join()
            .unwrap(),
        );
    }

    let err = controller.sync(SyncOptions::empty()).unwrap_err();
    assert_eq!(err.severity(), SyncSeverity::Fatal);
    assert!(matches!(
        err.causes()[0],
        FsError::ThreadsBusy { total: 2, local: 0 }
    ));
    drop(streams);
}

#[test]
fn forced_close_completes_and_poisons_streams() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");
    let controller = manager.controller(&mp).unwrap();
    write_entry(&controller, AccessOptions::empty(), "x", b"xyzzy");

    let mut streams = Vec::new();
    for _ in 0..2 {
        let controller = Arc::clone(&controller);
        streams.push(
            thread::spawn(move || {
                controller
                    .input(AccessOptions::empty(), &name("x"))
                    .open_stream()
                    .unwrap()
            })
            .join()
            .unwrap(),
        );
    }

    controller
        .sync(SyncOptions::FORCE_CLOSE_INPUT | SyncOptions::FORCE_CLOSE_OUTPUT)
        .unwrap();

    for mut stream in streams {
        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(err.to_string().contains("forcibly closed"));
    }
}

#[test]
fn same_thread_stream_requires_force_and_warns() {
    let (manager, dir) = new_manager();
    let controller = manager.controller(&archive_mp(dir.path(), "a.sar")).unwrap();
    write_entry(&controller, AccessOptions::empty(), "x", b"xyzzy");

    let stream = controller
        .input(AccessOptions::empty(), &name("x"))
        .open_stream()
        .unwrap();

    // Without force this must fail fatally, never wait.
    let err = controller.sync(SyncOptions::empty()).unwrap_err();
    assert_eq!(err.severity(), SyncSeverity::Fatal);
    assert!(matches!(err.causes()[0], FsError::CurrentThreadBusy(1)));

    // With force it completes, surfacing the forced local close as a warning.
    let err = controller
        .sync(SyncOptions::FORCE_CLOSE_INPUT | SyncOptions::FORCE_CLOSE_OUTPUT)
        .unwrap_err();
    assert_eq!(err.severity(), SyncSeverity::Warning);
    assert!(matches!(err.causes()[0], FsError::CurrentThreadBusy(1)));
    drop(stream);
}

#[test]
fn false_positive_reroutes_to_parent() {
    let (manager, dir) = new_manager();
    std::fs::write(dir.path().join("foo.sar"), b"notanarchive").unwrap();
    let mp = archive_mp(dir.path(), "foo.sar");

    let controller = manager.controller(&mp).unwrap();
    // The root of the would-be archive does not exist...
    assert!(controller
        .stat(AccessOptions::empty(), &EntryName::root())
        .unwrap()
        .is_none());
    assert!(!controller.is_mounted());

    // ...but the parent file system serves the raw bytes.
    let host = manager.controller(&host_mp(dir.path())).unwrap();
    assert_eq!(
        read_entry(&host, AccessOptions::empty(), "foo.sar"),
        b"notanarchive"
    );

    // Reading through the rerouted mount serves the same bytes.
    assert_eq!(
        controller
            .input(AccessOptions::empty(), &EntryName::root())
            .open_stream()
            .unwrap()
            .read_to_end_and_close()
            .unwrap(),
        b"notanarchive"
    );
}

#[test]
fn five_byte_false_positive_serves_parent_bytes() {
    let (manager, dir) = new_manager();
    std::fs::write(dir.path().join("foo.sar"), b"hello").unwrap();

    let controller = manager.controller(&archive_mp(dir.path(), "foo.sar")).unwrap();
    assert!(controller
        .stat(AccessOptions::empty(), &EntryName::root())
        .unwrap()
        .is_none());

    let host = manager.controller(&host_mp(dir.path())).unwrap();
    assert_eq!(read_entry(&host, AccessOptions::empty(), "foo.sar"), b"hello");
}

#[test]
fn cached_writes_are_dirty_until_sync() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");
    let controller = manager.controller(&mp).unwrap();

    write_entry(&controller, AccessOptions::CACHE, "x", b"buffered");
    // Reads see the dirty buffer and stat sees the entry before any sync.
    assert_eq!(read_entry(&controller, AccessOptions::CACHE, "x"), b"buffered");
    assert!(controller
        .stat(AccessOptions::empty(), &name("x"))
        .unwrap()
        .is_some());
    drop(controller);

    manager.sync(SyncOptions::umount()).unwrap();
    let controller = manager.controller(&mp).unwrap();
    assert_eq!(
        read_entry(&controller, AccessOptions::empty(), "x"),
        b"buffered"
    );
}

#[test]
fn abort_changes_discards_writes() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");
    let controller = manager.controller(&mp).unwrap();
    write_entry(&controller, AccessOptions::empty(), "x", b"doomed");
    drop(controller);

    manager
        .sync(SyncOptions::umount() | SyncOptions::ABORT_CHANGES)
        .unwrap();
    // The archive was never written to the host directory.
    assert!(!dir.path().join("a.sar").exists());
}

#[test]
fn mknod_and_unlink() {
    let (manager, dir) = new_manager();
    let controller = manager.controller(&archive_mp(dir.path(), "a.sar")).unwrap();

    controller
        .mknod(
            AccessOptions::empty(),
            &name("d"),
            EntryType::Directory,
            None,
        )
        .unwrap();
    write_entry(&controller, AccessOptions::empty(), "d/f", b"1");

    // A populated directory refuses to go.
    assert!(controller.unlink(AccessOptions::empty(), &name("d")).is_err());
    controller.unlink(AccessOptions::empty(), &name("d/f")).unwrap();
    controller.unlink(AccessOptions::empty(), &name("d")).unwrap();
    assert!(controller
        .stat(AccessOptions::empty(), &name("d"))
        .unwrap()
        .is_none());

    // Exclusive creation of an existing entry fails.
    controller
        .mknod(AccessOptions::empty(), &name("f"), EntryType::File, None)
        .unwrap();
    assert!(matches!(
        controller.mknod(
            AccessOptions::EXCLUSIVE,
            &name("f"),
            EntryType::File,
            None
        ),
        Err(FsError::AlreadyExists(_))
    ));
}

#[test]
fn manager_gauges_track_mounts() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");
    let controller = manager.controller(&mp).unwrap();

    // Interned but not yet mounted.
    let stats = manager.stats();
    assert_eq!(stats.file_systems_total, 2);
    assert_eq!(stats.top_level_archives, 1);
    assert_eq!(stats.file_systems_touched, 0);

    write_entry(&controller, AccessOptions::empty(), "x", b"12");
    let stats = manager.stats();
    assert!(stats.file_systems_mounted >= 1);
    assert!(stats.file_systems_touched >= 1);
    assert!(manager.io_stats().bytes_written() >= 2);
    drop(controller);

    manager.sync(SyncOptions::umount()).unwrap();
    assert_eq!(manager.stats().file_systems_total, 0);
}

#[test]
fn touched_controller_survives_dropped_references() {
    let (manager, dir) = new_manager();
    let mp = archive_mp(dir.path(), "a.sar");
    {
        let controller = manager.controller(&mp).unwrap();
        write_entry(&controller, AccessOptions::empty(), "x", b"pinned");
    }
    // No user reference remains, but the touched mount is still live.
    assert!(manager.mount_points().contains(&mp));
    manager.sync(SyncOptions::umount()).unwrap();

    let controller = manager.controller(&mp).unwrap();
    assert_eq!(read_entry(&controller, AccessOptions::empty(), "x"), b"pinned");
}

#[test]
fn pacemaker_bound_comes_from_config() {
    let (manager, _dir) = new_manager();
    // Config::default() carries the bound the manager hands to pacemakers.
    assert_eq!(manager.pacemaker().maximum_mounted(), 5);
}

#[test]
fn pacemaker_retires_eldest_mount() {
    let (manager, dir) = new_manager();
    let pacemaker = Pacemaker::new(manager.clone(), 1);
    assert_eq!(pacemaker.maximum_mounted(), 1);

    let a = pacemaker.controller(&archive_mp(dir.path(), "a.sar")).unwrap();
    write_entry(&a, AccessOptions::empty(), "x", b"first");
    drop(a);

    // Accessing a second archive pushes the first over the bound; it is
    // flushed to the host directory and unmounted.
    let b = pacemaker.controller(&archive_mp(dir.path(), "b.sar")).unwrap();
    write_entry(&b, AccessOptions::empty(), "y", b"second");
    assert!(dir.path().join("a.sar").exists());
    drop(b);

    manager.sync(SyncOptions::umount()).unwrap();
    assert!(dir.path().join("b.sar").exists());
}

#[test]
fn path_decomposition_matches_mount_chain() {
    let (_, dir) = new_manager();
    let path = FsPath::parse(&format!(
        "sar:sar:file:{}/a.sar!/b.sar!/c/d",
        dir.path().display()
    ))
    .unwrap();
    let chain = path.decompose();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0].1.as_str(), "a.sar");
    assert_eq!(chain[1].1.as_str(), "b.sar");
    assert_eq!(chain[2].1.as_str(), "c/d");
    assert_eq!(chain[2].0, *path.mount_point());
    // Round trip through the rendering.
    assert_eq!(FsPath::parse(&path.render()).unwrap(), path);
}
