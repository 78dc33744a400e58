//! I/O sockets and accounted streams.
//!
//! A socket is a cheap, lazy factory for a single I/O resource: nothing is
//! mounted and no byte moves until a stream is opened or a target queried.
//! Sockets may be paired so that a copy pipeline can pass hints (sizes,
//! times) from one end to the other before any data flows.
//!
//! The streams produced here are the values handed to user code. They are
//! registered with a controller's resource accountant while open, and they
//! can be forcibly closed by a concurrent sync, after which any further use
//! fails with an I/O error instead of touching freed archive state.

use std::fmt;
use std::io;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::accountant::{ForceClosable, ResourceHandle};
use crate::entry::Entry;
use crate::error::{FsError, FsResult};
use crate::stats::IoStatistics;

/// Callback run when an output stream is closed in an orderly fashion,
/// receiving the number of bytes written. `FnMut` so that an outer layer
/// can re-run the commit after a lock retry.
pub(crate) type OnClose = Box<dyn FnMut(u64) -> FsResult<()> + Send>;

fn closed_error(forced: bool) -> io::Error {
    if forced {
        io::Error::new(
            io::ErrorKind::Other,
            "stream was forcibly closed by a sync",
        )
    } else {
        io::Error::new(io::ErrorKind::Other, "stream is closed")
    }
}

// ---------------------------------------------------------------------------
// Input streams

pub(crate) struct InputCore {
    inner: Mutex<Option<Box<dyn Read + Send>>>,
    forced: AtomicBool,
}

impl ForceClosable for InputCore {
    fn force_close(&self) -> io::Result<()> {
        self.forced.store(true, Ordering::Release);
        drop(self.inner.lock().take());
        Ok(())
    }
}

/// A readable stream over one entry.
///
/// Closing (or dropping) the stream releases its resource account. After a
/// forced close every read fails.
pub struct FsInputStream {
    core: Arc<InputCore>,
    stats: Option<Arc<IoStatistics>>,
    // Held for its Drop: releases the resource account with the stream.
    #[allow(dead_code)]
    account: Option<ResourceHandle>,
}

impl FsInputStream {
    pub(crate) fn new(inner: Box<dyn Read + Send>) -> FsInputStream {
        FsInputStream {
            core: Arc::new(InputCore {
                inner: Mutex::new(Some(inner)),
                forced: AtomicBool::new(false),
            }),
            stats: None,
            account: None,
        }
    }

    pub(crate) fn core(&self) -> Arc<InputCore> {
        Arc::clone(&self.core)
    }

    pub(crate) fn set_stats(&mut self, stats: Arc<IoStatistics>) {
        self.stats = Some(stats);
    }

    pub(crate) fn set_account(&mut self, account: ResourceHandle) {
        self.account = Some(account);
    }

    /// Read the whole stream into a byte vector and close it.
    pub fn read_to_end_and_close(mut self) -> FsResult<Vec<u8>> {
        let mut data = Vec::new();
        self.read_to_end(&mut data)?;
        self.close()?;
        Ok(data)
    }

    /// Close the stream. This is the mandated termination; dropping the
    /// stream closes it as well but swallows errors.
    pub fn close(self) -> FsResult<()> {
        drop(self.core.inner.lock().take());
        Ok(())
    }
}

impl Read for FsInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.core.inner.lock();
        match guard.as_mut() {
            Some(inner) => {
                let n = inner.read(buf)?;
                if let Some(stats) = &self.stats {
                    stats.add_read(n as u64);
                }
                Ok(n)
            }
            None => Err(closed_error(self.core.forced.load(Ordering::Acquire))),
        }
    }
}

impl fmt::Debug for FsInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsInputStream")
            .field("open", &self.core.inner.lock().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Output streams

pub(crate) struct OutBody {
    writer: Box<dyn Write + Send>,
    on_close: Option<OnClose>,
    written: u64,
}

pub(crate) struct OutputCore {
    inner: Mutex<Option<OutBody>>,
    forced: AtomicBool,
}

impl ForceClosable for OutputCore {
    fn force_close(&self) -> io::Result<()> {
        self.forced.store(true, Ordering::Release);
        match self.inner.lock().take() {
            // Flush what was written, but do not commit: a forcibly closed
            // stream may hold a half-written entry.
            Some(mut body) => body.writer.flush(),
            None => Ok(()),
        }
    }
}

/// A writable stream over one entry.
///
/// The written bytes are committed when [`FsOutputStream::close`] runs; a
/// forced close discards the commit and fails all further writes.
pub struct FsOutputStream {
    core: Arc<OutputCore>,
    stats: Option<Arc<IoStatistics>>,
    // Held for its Drop: releases the resource account with the stream.
    #[allow(dead_code)]
    account: Option<ResourceHandle>,
}

impl FsOutputStream {
    pub(crate) fn new(writer: Box<dyn Write + Send>, on_close: Option<OnClose>) -> FsOutputStream {
        FsOutputStream {
            core: Arc::new(OutputCore {
                inner: Mutex::new(Some(OutBody {
                    writer,
                    on_close,
                    written: 0,
                })),
                forced: AtomicBool::new(false),
            }),
            stats: None,
            account: None,
        }
    }

    pub(crate) fn core(&self) -> Arc<OutputCore> {
        Arc::clone(&self.core)
    }

    pub(crate) fn set_stats(&mut self, stats: Arc<IoStatistics>) {
        self.stats = Some(stats);
    }

    pub(crate) fn set_account(&mut self, account: ResourceHandle) {
        self.account = Some(account);
    }

    /// Replace the close commit with a derived one, e.g. to run it under
    /// the file system's write lock.
    pub(crate) fn wrap_close_with<F>(&mut self, wrap: F)
    where
        F: FnOnce(OnClose) -> OnClose,
    {
        let mut guard = self.core.inner.lock();
        if let Some(body) = guard.as_mut() {
            if let Some(orig) = body.on_close.take() {
                body.on_close = Some(wrap(orig));
            }
        }
    }

    /// Write the given bytes, then close.
    pub fn write_all_and_close(mut self, data: &[u8]) -> FsResult<()> {
        self.write_all(data)?;
        self.close()
    }

    /// Flush, commit and close the stream. This is the mandated
    /// termination; dropping the stream attempts the same but can only log
    /// failures.
    pub fn close(mut self) -> FsResult<()> {
        self.close_internal()
    }

    fn close_internal(&mut self) -> FsResult<()> {
        let body = self.core.inner.lock().take();
        match body {
            Some(mut body) => {
                body.writer.flush()?;
                drop(body.writer);
                match body.on_close.take() {
                    Some(mut commit) => commit(body.written),
                    None => Ok(()),
                }
            }
            None => {
                if self.core.forced.load(Ordering::Acquire) {
                    Err(FsError::from(closed_error(true)))
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl Write for FsOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.core.inner.lock();
        match guard.as_mut() {
            Some(body) => {
                let n = body.writer.write(buf)?;
                body.written += n as u64;
                if let Some(stats) = &self.stats {
                    stats.add_written(n as u64);
                }
                Ok(n)
            }
            None => Err(closed_error(self.core.forced.load(Ordering::Acquire))),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.core.inner.lock();
        match guard.as_mut() {
            Some(body) => body.writer.flush(),
            None => Err(closed_error(self.core.forced.load(Ordering::Acquire))),
        }
    }
}

impl Drop for FsOutputStream {
    fn drop(&mut self) {
        if self.core.inner.lock().is_some() {
            if let Err(err) = self.close_internal() {
                warn!("error closing an output stream on drop: {err}");
            }
        }
    }
}

impl fmt::Debug for FsOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsOutputStream")
            .field("open", &self.core.inner.lock().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Sockets

/// The lazy factory behind an input socket.
pub trait InputEndpoint: Send + Sync {
    /// The entry this socket reads; querying it may mount file systems.
    fn local_target(&self) -> FsResult<Entry>;

    /// Open a stream. `peer` carries the paired output's endpoint, if any.
    fn open(&self, peer: Option<&dyn OutputEndpoint>) -> FsResult<FsInputStream>;
}

/// The lazy factory behind an output socket.
pub trait OutputEndpoint: Send + Sync {
    /// The entry this socket writes; querying it may mount file systems.
    fn local_target(&self) -> FsResult<Entry>;

    /// Open a stream. `peer` carries the paired input's endpoint, if any.
    fn open(&self, peer: Option<&dyn InputEndpoint>) -> FsResult<FsOutputStream>;
}

/// A lazy handle for reading one entry.
///
/// Cloning is cheap. A socket may be opened any number of times; every open
/// yields a fresh stream.
#[derive(Clone)]
pub struct InputSocket {
    endpoint: Arc<dyn InputEndpoint>,
    peer: Option<Arc<dyn OutputEndpoint>>,
}

impl InputSocket {
    /// Wrap an endpoint.
    pub fn new(endpoint: Arc<dyn InputEndpoint>) -> InputSocket {
        InputSocket {
            endpoint,
            peer: None,
        }
    }

    /// The entry this socket reads. May mount file systems.
    pub fn local_target(&self) -> FsResult<Entry> {
        self.endpoint.local_target()
    }

    /// The paired output's entry, if a peer is connected.
    pub fn peer_target(&self) -> FsResult<Option<Entry>> {
        match &self.peer {
            Some(peer) => peer.local_target().map(Some),
            None => Ok(None),
        }
    }

    /// Inherit the peer of another input socket without mutating it.
    pub fn bind(&mut self, other: &InputSocket) -> &mut InputSocket {
        self.peer = other.peer.clone();
        self
    }

    /// Open a fresh stream over the entry.
    pub fn open_stream(&self) -> FsResult<FsInputStream> {
        self.endpoint.open(self.peer.as_deref())
    }
}

impl fmt::Debug for InputSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSocket")
            .field("peer", &self.peer.is_some())
            .finish()
    }
}

/// A lazy handle for writing one entry.
#[derive(Clone)]
pub struct OutputSocket {
    endpoint: Arc<dyn OutputEndpoint>,
    peer: Option<Arc<dyn InputEndpoint>>,
}

impl OutputSocket {
    /// Wrap an endpoint.
    pub fn new(endpoint: Arc<dyn OutputEndpoint>) -> OutputSocket {
        OutputSocket {
            endpoint,
            peer: None,
        }
    }

    /// The entry this socket writes. May mount file systems.
    pub fn local_target(&self) -> FsResult<Entry> {
        self.endpoint.local_target()
    }

    /// The paired input's entry, if a peer is connected.
    pub fn peer_target(&self) -> FsResult<Option<Entry>> {
        match &self.peer {
            Some(peer) => peer.local_target().map(Some),
            None => Ok(None),
        }
    }

    /// Inherit the peer of another output socket without mutating it.
    pub fn bind(&mut self, other: &OutputSocket) -> &mut OutputSocket {
        self.peer = other.peer.clone();
        self
    }

    /// Open a fresh stream over the entry.
    pub fn open_stream(&self) -> FsResult<FsOutputStream> {
        self.endpoint.open(self.peer.as_deref())
    }
}

impl fmt::Debug for OutputSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSocket")
            .field("peer", &self.peer.is_some())
            .finish()
    }
}

/// Symmetrically pair two sockets, clearing any prior pairing on both sides.
pub fn connect(input: &mut InputSocket, output: &mut OutputSocket) {
    input.peer = Some(Arc::clone(&output.endpoint));
    output.peer = Some(Arc::clone(&input.endpoint));
}

/// Copy all bytes from `input` to `output`.
///
/// The sockets are connected first so that the output side can size or
/// align its entry based on the input's metadata before any byte moves.
/// Returns the number of bytes copied.
pub fn copy(input: &mut InputSocket, output: &mut OutputSocket) -> FsResult<u64> {
    connect(input, output);
    let mut reader = input.open_stream()?;
    let mut writer = output.open_stream()?;
    let copied = io::copy(&mut reader, &mut writer).map_err(FsError::from)?;
    writer.close()?;
    reader.close()?;
    Ok(copied)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entry::EntryType;

    struct FixedInput(Vec<u8>);

    impl InputEndpoint for FixedInput {
        fn local_target(&self) -> FsResult<Entry> {
            let mut entry = Entry::new("in", EntryType::File);
            entry.set_size(crate::entry::SizeKind::Data, self.0.len() as i64);
            Ok(entry)
        }

        fn open(&self, _peer: Option<&dyn OutputEndpoint>) -> FsResult<FsInputStream> {
            Ok(FsInputStream::new(Box::new(io::Cursor::new(self.0.clone()))))
        }
    }

    struct SinkOutput {
        collected: Arc<Mutex<Vec<u8>>>,
    }

    impl OutputEndpoint for SinkOutput {
        fn local_target(&self) -> FsResult<Entry> {
            Ok(Entry::new("out", EntryType::File))
        }

        fn open(&self, peer: Option<&dyn InputEndpoint>) -> FsResult<FsOutputStream> {
            // Peer metadata is visible before any byte moves.
            if let Some(peer) = peer {
                assert!(peer.local_target()?.size(crate::entry::SizeKind::Data) >= 0);
            }
            let collected = Arc::clone(&self.collected);
            Ok(FsOutputStream::new(
                Box::new(CollectWriter {
                    collected,
                    staged: Vec::new(),
                }),
                None,
            ))
        }
    }

    struct CollectWriter {
        collected: Arc<Mutex<Vec<u8>>>,
        staged: Vec<u8>,
    }

    impl Write for CollectWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.staged.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            *self.collected.lock() = self.staged.clone();
            Ok(())
        }
    }

    #[test]
    fn copy_streams_all_bytes() {
        let mut input = InputSocket::new(Arc::new(FixedInput(b"payload".to_vec())));
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut output = OutputSocket::new(Arc::new(SinkOutput {
            collected: Arc::clone(&collected),
        }));
        let copied = copy(&mut input, &mut output).unwrap();
        assert_eq!(copied, 7);
        assert_eq!(*collected.lock(), b"payload");
        // connect() paired both sides.
        assert!(input.peer_target().unwrap().is_some());
        assert!(output.peer_target().unwrap().is_some());
    }

    #[test]
    fn forced_close_fails_reads() {
        let socket = InputSocket::new(Arc::new(FixedInput(b"abc".to_vec())));
        let mut stream = socket.open_stream().unwrap();
        let core = stream.core();
        core.force_close().unwrap();
        let mut buf = [0u8; 4];
        assert!(stream.read(&mut buf).is_err());
    }

    #[test]
    fn close_commit_runs_once() {
        let committed = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&committed);
        let mut stream = FsOutputStream::new(
            Box::new(io::sink()),
            Some(Box::new(move |written| {
                *seen.lock() = Some(written);
                Ok(())
            })),
        );
        stream.write_all(b"12345").unwrap();
        stream.close().unwrap();
        assert_eq!(*committed.lock(), Some(5));
    }

    #[test]
    fn forced_close_skips_commit() {
        let committed = Arc::new(Mutex::new(false));
        let seen = Arc::clone(&committed);
        let mut stream = FsOutputStream::new(
            Box::new(io::sink()),
            Some(Box::new(move |_| {
                *seen.lock() = true;
                Ok(())
            })),
        );
        stream.write_all(b"x").unwrap();
        stream.core().force_close().unwrap();
        assert!(stream.write_all(b"y").is_err());
        drop(stream);
        assert!(!*committed.lock());
    }
}
