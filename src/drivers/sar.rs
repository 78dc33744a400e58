//! The reference container driver.
//!
//! A `sar` ("simple archive") container is a flat, uncompressed record
//! stream:
//!
//! ```text
//! magic  := b"SAR1"
//! record := name_len:u16le  kind:u8  mtime:i64le  data_len:u64le
//!           name:[u8; name_len]  data:[u8; data_len]
//! file   := magic record*
//! ```
//!
//! Directory entry names end in `/` and carry no data. A zero-length file
//! mounts as an empty archive; a non-empty file without the magic is a
//! persistent false positive. The format has no compression and no central
//! directory on purpose: its job is to exercise the driver contract and the
//! integration suite, not to compete with real codecs.

use std::collections::BTreeMap;
use std::io::Read;

use log::debug;

use crate::controller::current_options;
use crate::driver::{ArchiveDriver, InputService, OutputService};
use crate::entry::{AccessKind, Entry, EntryType, SizeKind};
use crate::error::{FsError, FsResult};
use crate::model::Model;
use crate::socket::{FsOutputStream, InputSocket, OutputSocket};

const MAGIC: &[u8; 4] = b"SAR1";

/// Driver for `sar` containers.
#[derive(Debug, Default)]
pub struct SarDriver;

impl SarDriver {
    /// A fresh driver value.
    pub fn new() -> SarDriver {
        SarDriver
    }
}

fn kind_to_byte(kind: EntryType) -> u8 {
    match kind {
        EntryType::File => 0,
        EntryType::Directory => 1,
        EntryType::Symlink => 2,
        EntryType::Special => 3,
    }
}

fn byte_to_kind(byte: u8) -> FsResult<EntryType> {
    match byte {
        0 => Ok(EntryType::File),
        1 => Ok(EntryType::Directory),
        2 => Ok(EntryType::Symlink),
        3 => Ok(EntryType::Special),
        _ => Err(FsError::CorruptArchive(format!(
            "unknown entry kind {byte}"
        ))),
    }
}

impl ArchiveDriver for SarDriver {
    fn encodable(&self, name: &str) -> bool {
        name.len() <= u16::MAX as usize
    }

    fn new_input_service(
        &self,
        model: &Model,
        source: &InputSocket,
    ) -> FsResult<Box<dyn InputService>> {
        let bytes = source.open_stream()?.read_to_end_and_close()?;
        if bytes.is_empty() {
            // A zero-length file is a prospective empty archive.
            return Ok(Box::new(SarInputService {
                records: BTreeMap::new(),
            }));
        }
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(FsError::PersistentFalsePositive(Box::new(
                FsError::CorruptArchive(format!(
                    "{} has no container magic",
                    model.mount_point()
                )),
            )));
        }
        let mut records = BTreeMap::new();
        let mut cursor = Parser {
            bytes: &bytes[MAGIC.len()..],
        };
        while !cursor.at_end() {
            let name_len = cursor.u16()? as usize;
            let kind = byte_to_kind(cursor.u8()?)?;
            let mtime = cursor.i64()?;
            let data_len = cursor.u64()? as usize;
            let name = String::from_utf8(cursor.take(name_len)?.to_vec())
                .map_err(|_| FsError::CorruptArchive("entry name is not UTF-8".to_string()))?;
            let data = cursor.take(data_len)?.to_vec();
            let mut entry = Entry::new(name.clone(), kind);
            entry.set_size(SizeKind::Data, data.len() as i64);
            entry.set_size(SizeKind::Storage, data.len() as i64);
            entry.set_time(AccessKind::Write, mtime);
            records.insert(name.trim_end_matches('/').to_string(), (entry, data));
        }
        Ok(Box::new(SarInputService { records }))
    }

    fn new_output_service(
        &self,
        _model: &Model,
        sink: &OutputSocket,
        _input: Option<&dyn InputService>,
    ) -> FsResult<Box<dyn OutputService>> {
        if let Some(opts) = current_options() {
            // The container never compresses; surface ignored intents.
            debug!("writing sar container with options {opts}");
        }
        let mut stream = sink.open_stream()?;
        use std::io::Write;
        stream.write_all(MAGIC)?;
        Ok(Box::new(SarOutputService {
            stream: Some(stream),
        }))
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, n: usize) -> FsResult<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(FsError::CorruptArchive("truncated record".to_string()));
        }
        let (taken, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(taken)
    }

    fn u8(&mut self) -> FsResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> FsResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> FsResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn i64(&mut self) -> FsResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }
}

struct SarInputService {
    /// Canonical (separator-trimmed) name -> (entry, payload).
    records: BTreeMap<String, (Entry, Vec<u8>)>,
}

impl InputService for SarInputService {
    fn entries(&self) -> Vec<Entry> {
        self.records.values().map(|(entry, _)| entry.clone()).collect()
    }

    fn entry(&self, name: &str) -> Option<Entry> {
        self.records.get(name).map(|(entry, _)| entry.clone())
    }

    fn input(&self, name: &str) -> FsResult<Box<dyn Read + Send>> {
        let (_, data) = self
            .records
            .get(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data.clone())))
    }
}

struct SarOutputService {
    stream: Option<FsOutputStream>,
}

impl OutputService for SarOutputService {
    fn write(&mut self, entry: &Entry, data: Option<&mut (dyn Read + Send)>) -> FsResult<()> {
        use std::io::Write;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FsError::BusyResource("output service is finished".to_string()))?;
        let mut name = entry.name().to_string();
        if entry.is_directory() && !name.ends_with('/') {
            name.push('/');
        }
        if name.len() > u16::MAX as usize {
            return Err(FsError::AccessDenied(format!(
                "entry name {name:?} is too long for the container"
            )));
        }
        let mut payload = Vec::new();
        if let Some(data) = data {
            data.read_to_end(&mut payload)?;
        }
        stream.write_all(&(name.len() as u16).to_le_bytes())?;
        stream.write_all(&[kind_to_byte(entry.kind())])?;
        stream.write_all(&entry.time(AccessKind::Write).to_le_bytes())?;
        stream.write_all(&(payload.len() as u64).to_le_bytes())?;
        stream.write_all(name.as_bytes())?;
        stream.write_all(&payload)?;
        Ok(())
    }

    fn finish(&mut self) -> FsResult<()> {
        match self.stream.take() {
            Some(stream) => stream.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::MountPoint;
    use crate::socket::{InputEndpoint, OutputEndpoint};
    use parking_lot::Mutex;
    use std::io;
    use std::io::Write;
    use std::sync::Arc;

    struct MemoryFile {
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    impl InputEndpoint for MemoryFile {
        fn local_target(&self) -> FsResult<Entry> {
            Ok(Entry::new("archive.sar", EntryType::File))
        }

        fn open(
            &self,
            _peer: Option<&dyn OutputEndpoint>,
        ) -> FsResult<crate::socket::FsInputStream> {
            Ok(crate::socket::FsInputStream::new(Box::new(io::Cursor::new(
                self.bytes.lock().clone(),
            ))))
        }
    }

    struct MemoryFileSink {
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    impl OutputEndpoint for MemoryFileSink {
        fn local_target(&self) -> FsResult<Entry> {
            Ok(Entry::new("archive.sar", EntryType::File))
        }

        fn open(&self, _peer: Option<&dyn InputEndpoint>) -> FsResult<FsOutputStream> {
            let bytes = Arc::clone(&self.bytes);
            struct W {
                bytes: Arc<Mutex<Vec<u8>>>,
                staged: Vec<u8>,
            }
            impl Write for W {
                fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                    self.staged.extend_from_slice(buf);
                    Ok(buf.len())
                }
                fn flush(&mut self) -> io::Result<()> {
                    *self.bytes.lock() = self.staged.clone();
                    Ok(())
                }
            }
            impl Drop for W {
                fn drop(&mut self) {
                    *self.bytes.lock() = std::mem::take(&mut self.staged);
                }
            }
            Ok(FsOutputStream::new(
                Box::new(W {
                    bytes,
                    staged: Vec::new(),
                }),
                None,
            ))
        }
    }

    fn model() -> Arc<Model> {
        Model::new(MountPoint::parse("sar:file:/tmp/archive.sar!/").unwrap())
    }

    #[test]
    fn container_round_trip() {
        let driver = SarDriver::new();
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let sink = OutputSocket::new(Arc::new(MemoryFileSink {
            bytes: Arc::clone(&bytes),
        }));

        let mut out = driver
            .new_output_service(&model(), &sink, None)
            .unwrap();
        let mut dir = Entry::new("d/", EntryType::Directory);
        dir.set_time(AccessKind::Write, 1000);
        out.write(&dir, None).unwrap();
        let mut file = Entry::new("d/x", EntryType::File);
        file.set_time(AccessKind::Write, 2000);
        let mut payload: &[u8] = b"hello container";
        out.write(&file, Some(&mut payload)).unwrap();
        out.finish().unwrap();

        let source = InputSocket::new(Arc::new(MemoryFile {
            bytes: Arc::clone(&bytes),
        }));
        let input = driver.new_input_service(&model(), &source).unwrap();
        assert_eq!(input.entries().len(), 2);
        let entry = input.entry("d/x").unwrap();
        assert_eq!(entry.size(SizeKind::Data), 15);
        assert_eq!(entry.time(AccessKind::Write), 2000);
        let mut read_back = Vec::new();
        input.input("d/x").unwrap().read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, b"hello container");
        assert!(input.entry("d").unwrap().is_directory());
    }

    #[test]
    fn garbage_is_a_persistent_false_positive() {
        let driver = SarDriver::new();
        let source = InputSocket::new(Arc::new(MemoryFile {
            bytes: Arc::new(Mutex::new(b"notanarchive".to_vec())),
        }));
        match driver.new_input_service(&model(), &source) {
            Err(FsError::PersistentFalsePositive(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected a persistent false positive"),
        }
    }

    #[test]
    fn empty_file_mounts_empty() {
        let driver = SarDriver::new();
        let source = InputSocket::new(Arc::new(MemoryFile {
            bytes: Arc::new(Mutex::new(Vec::new())),
        }));
        let input = driver.new_input_service(&model(), &source).unwrap();
        assert!(input.entries().is_empty());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let driver = SarDriver::new();
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[5, 0, 0]); // half a header
        let source = InputSocket::new(Arc::new(MemoryFile {
            bytes: Arc::new(Mutex::new(bytes)),
        }));
        match driver.new_input_service(&model(), &source) {
            Err(FsError::CorruptArchive(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected a corrupt archive error"),
        }
    }
}
