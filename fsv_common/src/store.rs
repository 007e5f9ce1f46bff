//! Status file store.
//!
//! The supervisor is the only writer. Every write seeks nowhere: it issues a
//! single positioned write of the whole record at offset 0, so a reader that
//! opens the file between writes always sees a complete record. A reader
//! racing the middle of a write can still observe a torn record; that is
//! accepted, the next query will see a consistent one.

use crate::snapshot::{SNAPSHOT_SIZE, SnapshotRecord};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reading or writing the status file.
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error
    #[error("IO error on status file: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: io::Error,
    },

    /// File shorter than one record; treated as corruption.
    #[error("unexpected data in status file: expected {expected} bytes, found {found}")]
    Truncated {
        /// Required size
        expected: usize,
        /// Bytes actually available
        found: usize,
    },

    /// Magic bytes do not match.
    #[error("status file has bad magic (not an fsv snapshot)")]
    BadMagic,

    /// Layout version written by an incompatible build.
    #[error("unsupported status file version {0}")]
    UnsupportedVersion(u32),

    /// The kernel accepted fewer bytes than one record.
    #[error("short write to status file: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes written
        written: usize,
        /// Bytes required
        expected: usize,
    },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Long-lived writer handle on the status file.
#[derive(Debug)]
pub struct SnapshotStore {
    file: File,
    path: PathBuf,
}

impl SnapshotStore {
    /// Open (creating if needed) the status file for writing.
    pub fn create(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Overwrite the file with `record` in one positioned write.
    pub fn write(&mut self, record: &SnapshotRecord) -> StoreResult<()> {
        let bytes = record.encode();
        let written = self.file.write_at(&bytes, 0)?;
        if written != bytes.len() {
            return Err(StoreError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode the status file at `path`.
    ///
    /// Missing, unreadable, short or foreign files are errors; nothing is
    /// ever partially parsed.
    pub fn read(path: &Path) -> StoreResult<SnapshotRecord> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; SNAPSHOT_SIZE];
        let n = read_full(&mut file, &mut buf)?;
        SnapshotRecord::decode(&buf[..n])
    }
}

/// Fill `buf` unless EOF comes first; returns bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::config::SlotLimits;
    use crate::snapshot::{ChildSlot, SlotKind, SupervisorState};
    use tempfile::tempdir;

    fn record(pid: i32) -> SnapshotRecord {
        SnapshotRecord {
            supervisor: SupervisorState {
                pid,
                started_at: Timestamp::new(1_000, 0),
                gave_up: false,
                timeout_seconds: 0,
            },
            slots: [ChildSlot::new(SlotLimits::default()); 2],
        }
    }

    #[test]
    fn read_after_write_matches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("info.struct");
        let mut store = SnapshotStore::create(&path).unwrap();

        let mut r = record(100);
        r.slot_mut(SlotKind::Command).pid = 101;
        store.write(&r).unwrap();
        assert_eq!(SnapshotStore::read(&path).unwrap(), r);

        // Second write replaces the first entirely.
        let r2 = record(0);
        store.write(&r2).unwrap();
        assert_eq!(SnapshotStore::read(&path).unwrap(), r2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), SNAPSHOT_SIZE as u64);
    }

    #[test]
    fn repeated_reads_are_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("info.struct");
        let mut store = SnapshotStore::create(&path).unwrap();
        store.write(&record(7)).unwrap();

        let a = std::fs::read(&path).unwrap();
        let b = std::fs::read(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(SnapshotStore::read(&path).unwrap(), SnapshotStore::read(&path).unwrap());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = SnapshotStore::read(&dir.path().join("absent"));
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }

    #[test]
    fn empty_file_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("info.struct");
        let _store = SnapshotStore::create(&path).unwrap();
        assert!(matches!(
            SnapshotStore::read(&path),
            Err(StoreError::Truncated { found: 0, .. })
        ));
    }

    #[test]
    fn short_file_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("info.struct");
        std::fs::write(&path, &record(1).encode()[..40]).unwrap();
        assert!(matches!(
            SnapshotStore::read(&path),
            Err(StoreError::Truncated { found: 40, .. })
        ));
    }
}
