//! Buffer pools for staged entry data.
//!
//! Cached reads, buffered writes and staged archive entries all hold their
//! bytes in pool buffers. A buffer is an opaque handle: the memory pool keeps
//! bytes on the heap, the temp-file pool spills them to disk so that huge
//! entries do not exhaust memory.

use std::io;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::FsResult;

/// The pool implementations shipped with the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolKind {
    /// Heap-backed buffers.
    Memory,
    /// Buffers spilled to unlinked temporary files.
    TempFile,
}

/// Allocator for I/O buffers.
pub trait IoPool: Send + Sync {
    /// Allocate a fresh, empty buffer.
    fn allocate(&self) -> FsResult<Arc<dyn IoBuffer>>;
}

/// An opaque handle to staged bytes.
///
/// A buffer holds one self-contained blob. Opening the output side replaces
/// the contents; any number of input sides may be opened afterwards.
pub trait IoBuffer: Send + Sync {
    /// The current content size in bytes.
    fn size(&self) -> u64;

    /// Open a reader over the current contents.
    fn input(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Open a writer that replaces the contents. The new contents become
    /// visible when the writer is flushed or dropped.
    fn output(&self) -> io::Result<Box<dyn Write + Send>>;
}

/// Construct the pool selected by a [`PoolKind`].
pub fn new_pool(kind: PoolKind) -> Arc<dyn IoPool> {
    match kind {
        PoolKind::Memory => Arc::new(MemoryPool::new()),
        PoolKind::TempFile => Arc::new(TempFilePool),
    }
}

/// Heap-backed pool.
#[derive(Debug)]
pub struct MemoryPool {
    initial_capacity: usize,
}

impl MemoryPool {
    /// A pool whose buffers start out with one page of capacity.
    pub fn new() -> MemoryPool {
        MemoryPool {
            initial_capacity: page_size::get(),
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        MemoryPool::new()
    }
}

impl IoPool for MemoryPool {
    fn allocate(&self) -> FsResult<Arc<dyn IoBuffer>> {
        Ok(Arc::new(MemoryBuffer {
            data: Arc::new(Mutex::new(Vec::with_capacity(self.initial_capacity))),
        }))
    }
}

struct MemoryBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl IoBuffer for MemoryBuffer {
    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn input(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.lock().clone())))
    }

    fn output(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(MemoryWriter {
            staged: Vec::new(),
            target: Arc::clone(&self.data),
        }))
    }
}

// The writer stages locally and publishes on flush or drop, so a reader
// opened mid-write still sees the previous contents.
struct MemoryWriter {
    staged: Vec<u8>,
    target: Arc<Mutex<Vec<u8>>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staged.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        *self.target.lock() = self.staged.clone();
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        *self.target.lock() = std::mem::take(&mut self.staged);
    }
}

/// Pool spilling buffers into temporary files.
#[derive(Debug)]
pub struct TempFilePool;

impl IoPool for TempFilePool {
    fn allocate(&self) -> FsResult<Arc<dyn IoBuffer>> {
        let file = NamedTempFile::new()?;
        Ok(Arc::new(TempFileBuffer {
            file: Mutex::new(file),
        }))
    }
}

struct TempFileBuffer {
    file: Mutex<NamedTempFile>,
}

impl IoBuffer for TempFileBuffer {
    fn size(&self) -> u64 {
        self.file
            .lock()
            .as_file()
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn input(&self) -> io::Result<Box<dyn Read + Send>> {
        let guard = self.file.lock();
        let mut reader = guard.reopen()?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Box::new(reader))
    }

    fn output(&self) -> io::Result<Box<dyn Write + Send>> {
        let guard = self.file.lock();
        let mut writer = guard.reopen()?;
        writer.set_len(0)?;
        writer.seek(SeekFrom::Start(0))?;
        Ok(Box::new(writer))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    fn round_trip(pool: &dyn IoPool) {
        let buffer = pool.allocate().unwrap();
        assert_eq!(buffer.size(), 0);
        {
            let mut w = buffer.output().unwrap();
            w.write_all(b"hello pool").unwrap();
            w.flush().unwrap();
        }
        assert_eq!(buffer.size(), 10);
        let mut contents = Vec::new();
        buffer.input().unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello pool");
        // A second write replaces the first.
        {
            let mut w = buffer.output().unwrap();
            w.write_all(b"xy").unwrap();
        }
        assert_eq!(buffer.size(), 2);
    }

    #[test]
    fn memory_round_trip() {
        round_trip(&MemoryPool::new());
    }

    #[test]
    fn temp_file_round_trip() {
        round_trip(&TempFilePool);
    }
}
