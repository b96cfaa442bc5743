//! The L0 on-disk artifact: a full snapshot followed by an append-only WAL.
//!
//! One file (`index.l0.<major>.<minor>`) holds both sections:
//!
//! ```text
//! +----------------------------------------------------------+
//! | Snapshot: [version][key_size:u32][count:u64]             |
//! |           [record]*  [crc32:u32]                         |
//! +----------------------------------------------------------+
//! | WAL group: [version][count:u32][record]* [crc32:u32]     |
//! +----------------------------------------------------------+
//! | ...one group per committed version...                    |
//! +----------------------------------------------------------+
//! ```
//!
//! ## Record format
//!
//! ```text
//! [op:u8][key][value:u64]        op = 0 (upsert), value present
//! [op:u8][key]                   op = 1 (erase), no value
//! ```
//!
//! Fixed-size keys are written raw; variable-length keys carry a `u8` length
//! prefix (lengths are capped at 128). All integers are little-endian. Each
//! section's crc32 covers every preceding byte of that section; a mismatch
//! fails recovery with `Corruption`.
//!
//! The descriptor records the snapshot size and each group's `(offset, size)`
//! so recovery never scans blindly: it loads the snapshot, then replays
//! exactly the groups the descriptor names.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::failpoint;
use crate::types::{EditVersion, IndexValue, NULL_INDEX_VALUE};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Operation kind recorded in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOp {
    Upsert = 0,
    Erase = 1,
}

/// One logged operation. `value` is the null sentinel for erases.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub op: LogOp,
    pub key: Vec<u8>,
    pub value: IndexValue,
}

impl LogRecord {
    pub fn upsert(key: Vec<u8>, value: IndexValue) -> Self {
        Self {
            op: LogOp::Upsert,
            key,
            value,
        }
    }

    pub fn erase(key: Vec<u8>) -> Self {
        Self {
            op: LogOp::Erase,
            key,
            value: NULL_INDEX_VALUE,
        }
    }
}

/// Handle to one L0 file (snapshot + WAL).
pub struct IndexFile {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for IndexFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexFile").field("path", &self.path).finish()
    }
}

fn fail_scope(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl IndexFile {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Opens an existing file for reading and appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |m| m.len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Writes the snapshot section from scratch, discarding any existing
    /// content. Returns the snapshot size in bytes.
    pub fn dump_snapshot(
        &mut self,
        version: EditVersion,
        key_size: usize,
        entries: &[(Vec<u8>, IndexValue)],
    ) -> Result<u64> {
        if failpoint::triggered_for("snapshot_dump_fail", &fail_scope(&self.path)) {
            return Err(Error::IO(format!(
                "injected dump failure for {}",
                self.path.display()
            )));
        }

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut writer = CrcWriter::new(BufWriter::new(&mut self.file));

        writer.write_i64::<LittleEndian>(version.major)?;
        writer.write_i64::<LittleEndian>(version.minor)?;
        writer.write_u32::<LittleEndian>(key_size as u32)?;
        writer.write_u64::<LittleEndian>(entries.len() as u64)?;
        for (key, value) in entries {
            if value.is_null() {
                write_record(&mut writer, key_size, &LogRecord::erase(key.clone()))?;
            } else {
                write_record(&mut writer, key_size, &LogRecord::upsert(key.clone(), *value))?;
            }
        }
        let (crc, mut inner) = writer.finish();
        inner.write_u32::<LittleEndian>(crc)?;
        inner.flush()?;
        drop(inner);

        Ok(self.size())
    }

    /// Reads the snapshot section from the start of the file, verifying its
    /// checksum. Returns the version, the records, and the section length.
    pub fn load_snapshot(&mut self, key_size: usize) -> Result<(EditVersion, Vec<LogRecord>, u64)> {
        if failpoint::triggered_for("snapshot_load_fail", &fail_scope(&self.path)) {
            return Err(Error::IO(format!(
                "injected load failure for {}",
                self.path.display()
            )));
        }

        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = CrcReader::new(BufReader::new(&mut self.file));

        let major = reader.read_i64::<LittleEndian>()?;
        let minor = reader.read_i64::<LittleEndian>()?;
        let stored_key_size = reader.read_u32::<LittleEndian>()? as usize;
        if stored_key_size != key_size {
            return Err(crate::errcorrupt!(
                "snapshot key size {stored_key_size} != expected {key_size}"
            ));
        }
        let count = reader.read_u64::<LittleEndian>()?;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            records.push(read_record(&mut reader, key_size)?);
        }
        let (crc, mut inner) = reader.finish();
        let stored_crc = inner.read_u32::<LittleEndian>()?;
        if crc != stored_crc {
            return Err(crate::errcorrupt!(
                "snapshot checksum mismatch: computed {crc:#x}, stored {stored_crc:#x}"
            ));
        }
        let consumed = 8 + 8 + 4 + 8
            + records
                .iter()
                .map(|r| record_len(r, key_size) as u64)
                .sum::<u64>()
            + 4;

        Ok((EditVersion::new(major, minor), records, consumed))
    }

    /// Appends one version's WAL group at the end of the file. The group is
    /// buffered and written with a single syscall; durability comes from the
    /// caller's later `sync`. Returns `(offset, size)` for the descriptor.
    pub fn append_group(
        &mut self,
        version: EditVersion,
        key_size: usize,
        records: &[LogRecord],
    ) -> Result<(u64, u64)> {
        let offset = self.file.seek(SeekFrom::End(0))?;

        let mut buf = Vec::new();
        buf.write_i64::<LittleEndian>(version.major)?;
        buf.write_i64::<LittleEndian>(version.minor)?;
        buf.write_u32::<LittleEndian>(records.len() as u32)?;
        for record in records {
            write_record(&mut buf, key_size, record)?;
        }
        let crc = CRC32.checksum(&buf);
        buf.write_u32::<LittleEndian>(crc)?;

        self.file.write_all(&buf)?;
        Ok((offset, buf.len() as u64))
    }

    /// Reads back one WAL group previously recorded at `(offset, size)`.
    pub fn read_group(
        &mut self,
        offset: u64,
        size: u64,
        key_size: usize,
    ) -> Result<(EditVersion, Vec<LogRecord>)> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact(&mut buf)?;

        if size < 4 {
            return Err(crate::errcorrupt!("wal group truncated"));
        }
        let payload = &buf[..buf.len() - 4];
        let stored_crc = u32::from_le_bytes(buf[buf.len() - 4..].try_into().unwrap());
        if CRC32.checksum(payload) != stored_crc {
            return Err(crate::errcorrupt!(
                "wal group checksum mismatch at offset {offset}"
            ));
        }

        let mut reader = payload;
        let major = reader.read_i64::<LittleEndian>()?;
        let minor = reader.read_i64::<LittleEndian>()?;
        let count = reader.read_u32::<LittleEndian>()?;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            records.push(read_record(&mut reader, key_size)?);
        }
        Ok((EditVersion::new(major, minor), records))
    }
}

fn record_len(record: &LogRecord, key_size: usize) -> usize {
    let key_len = if key_size > 0 {
        key_size
    } else {
        1 + record.key.len()
    };
    match record.op {
        LogOp::Upsert => 1 + key_len + 8,
        LogOp::Erase => 1 + key_len,
    }
}

fn write_record<W: Write>(w: &mut W, key_size: usize, record: &LogRecord) -> Result<()> {
    w.write_u8(record.op as u8)?;
    if key_size == 0 {
        w.write_u8(record.key.len() as u8)?;
    }
    w.write_all(&record.key)?;
    if record.op == LogOp::Upsert {
        w.write_u64::<LittleEndian>(record.value.get_value())?;
    }
    Ok(())
}

fn read_record<R: Read>(r: &mut R, key_size: usize) -> Result<LogRecord> {
    let op = match r.read_u8()? {
        0 => LogOp::Upsert,
        1 => LogOp::Erase,
        other => return Err(crate::errcorrupt!("unknown log op {other}")),
    };
    let key_len = if key_size > 0 {
        key_size
    } else {
        r.read_u8()? as usize
    };
    let mut key = vec![0u8; key_len];
    r.read_exact(&mut key)?;
    let value = match op {
        LogOp::Upsert => IndexValue(r.read_u64::<LittleEndian>()?),
        LogOp::Erase => NULL_INDEX_VALUE,
    };
    Ok(LogRecord { op, key, value })
}

/// Writer adapter feeding a running crc32 alongside the inner writer.
struct CrcWriter<W: Write> {
    inner: W,
    digest: crc::Digest<'static, u32>,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn finish(self) -> (u32, W) {
        (self.digest.finalize(), self.inner)
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter feeding a running crc32 from the bytes read.
struct CrcReader<R: Read> {
    inner: R,
    digest: crc::Digest<'static, u32>,
}

impl<R: Read> CrcReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn finish(self) -> (u32, R) {
        (self.digest.finalize(), self.inner)
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn entries(n: u64) -> Vec<(Vec<u8>, IndexValue)> {
        (0..n).map(|i| (i.to_le_bytes().to_vec(), IndexValue(i * 2))).collect()
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("index.l0.1.0");
        let mut file = IndexFile::create(&path).expect("create");

        let mut all = entries(100);
        // Tombstones must survive the round trip.
        all.push((b"deadkey0".to_vec(), NULL_INDEX_VALUE));
        let size = file.dump_snapshot(EditVersion::new(1, 0), 8, &all).expect("dump");
        assert_eq!(size, file.size());

        let (version, records, consumed) = file.load_snapshot(8).expect("load");
        assert_eq!(version, EditVersion::new(1, 0));
        assert_eq!(consumed, size);
        assert_eq!(records.len(), all.len());
        for (record, (key, value)) in records.iter().zip(all.iter()) {
            assert_eq!(&record.key, key);
            if value.is_null() {
                assert_eq!(record.op, LogOp::Erase);
            } else {
                assert_eq!(record.op, LogOp::Upsert);
                assert_eq!(&record.value, value);
            }
        }
    }

    #[test]
    fn test_wal_group_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("index.l0.1.0");
        let mut file = IndexFile::create(&path).expect("create");
        file.dump_snapshot(EditVersion::new(1, 0), 0, &[]).expect("dump");

        let records = vec![
            LogRecord::upsert(b"alpha".to_vec(), IndexValue(1)),
            LogRecord::upsert(b"beta".to_vec(), IndexValue(2)),
            LogRecord::erase(b"alpha".to_vec()),
        ];
        let (offset, size) = file
            .append_group(EditVersion::new(2, 0), 0, &records)
            .expect("append");
        let (version, replayed) = file.read_group(offset, size, 0).expect("read");
        assert_eq!(version, EditVersion::new(2, 0));
        assert_eq!(replayed, records);

        // Replaying the same group twice yields identical records.
        let (_, replayed2) = file.read_group(offset, size, 0).expect("read again");
        assert_eq!(replayed2, records);
    }

    #[test]
    fn test_snapshot_checksum_sensitivity() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("index.l0.1.0");
        let mut file = IndexFile::create(&path).expect("create");
        file.dump_snapshot(EditVersion::new(1, 0), 8, &entries(50)).expect("dump");

        // Flip one byte in the middle of the snapshot.
        let mut raw = std::fs::read(&path).expect("read raw");
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        std::fs::write(&path, &raw).expect("write raw");

        let mut reopened = IndexFile::open(&path).expect("open");
        let err = reopened.load_snapshot(8).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)), "got {err:?}");
    }

    #[test]
    fn test_wal_group_corruption() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("index.l0.1.0");
        let mut file = IndexFile::create(&path).expect("create");
        file.dump_snapshot(EditVersion::new(1, 0), 0, &[]).expect("dump");
        let records = vec![LogRecord::upsert(b"k".to_vec(), IndexValue(9))];
        let (offset, size) = file
            .append_group(EditVersion::new(2, 0), 0, &records)
            .expect("append");

        let mut raw = std::fs::read(&path).expect("read raw");
        let target = offset as usize + 20;
        raw[target] ^= 0xff;
        std::fs::write(&path, &raw).expect("write raw");

        let mut reopened = IndexFile::open(&path).expect("open");
        assert!(reopened.read_group(offset, size, 0).is_err());
    }

    #[test]
    fn test_dump_failpoint_leaves_file_untouched() {
        let dir = TempDir::new().expect("temp dir");
        let scope = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        let path = dir.path().join("index.l0.1.0");
        let mut file = IndexFile::create(&path).expect("create");
        file.dump_snapshot(EditVersion::new(1, 0), 8, &entries(10)).expect("dump");
        let before = std::fs::read(&path).expect("read");

        crate::failpoint::enable(&format!("snapshot_dump_fail/{scope}"));
        let err = file
            .dump_snapshot(EditVersion::new(2, 0), 8, &entries(20))
            .unwrap_err();
        crate::failpoint::disable(&format!("snapshot_dump_fail/{scope}"));
        assert!(matches!(err, Error::IO(_)));
        assert_eq!(std::fs::read(&path).expect("read"), before);

        crate::failpoint::enable(&format!("snapshot_load_fail/{scope}"));
        assert!(file.load_snapshot(8).is_err());
        crate::failpoint::disable(&format!("snapshot_load_fail/{scope}"));
        assert!(file.load_snapshot(8).is_ok());
    }
}
