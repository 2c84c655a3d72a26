//! Read-only verification of a store directory.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use crate::file::FileBackend;
use crate::frame::{FrameScanner, ScanEnd, ScanItem};
use crate::store::{CHANGES_LOG, META_LOG};
use serde::Serialize;
use std::path::Path;

/// Frame-by-frame summary of one log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogScan {
    /// Log size in bytes.
    pub size: u64,
    /// Well-formed frames.
    pub frames: u64,
    /// Start offsets of unreadable stretches.
    pub damaged: Vec<u64>,
    /// Bytes inside those stretches.
    pub damaged_bytes: u64,
    /// Bytes of a partially written last frame.
    pub torn_bytes: u64,
}

impl LogScan {
    /// Returns true if every byte of the log is a well-formed frame.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.damaged.is_empty() && self.torn_bytes == 0
    }

    fn of(backend: &dyn StorageBackend) -> StoreResult<Self> {
        let mut scanner = FrameScanner::new(backend)?;
        let mut scan = LogScan {
            size: scanner.size(),
            ..LogScan::default()
        };
        for item in scanner.by_ref() {
            match item? {
                ScanItem::Entry { .. } => scan.frames += 1,
                ScanItem::Damaged { offset, len, .. } => {
                    scan.damaged.push(offset);
                    scan.damaged_bytes += len;
                }
            }
        }
        if let Some(ScanEnd::TornTail { offset }) = scanner.end() {
            scan.torn_bytes = scan.size - offset;
        }
        Ok(scan)
    }
}

/// Scan results for both logs of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// `changes.log`.
    pub changes: LogScan,
    /// `meta.log`.
    pub meta: LogScan,
}

impl ScanReport {
    /// Returns true if both logs are clean.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.changes.is_clean() && self.meta.is_clean()
    }
}

/// Scans the logs in `dir` without repairing anything.
///
/// A missing log counts as empty.
///
/// # Errors
///
/// Returns an error if `dir` does not exist or a log cannot be read.
pub fn scan_dir(dir: impl AsRef<Path>) -> StoreResult<ScanReport> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("store directory {} does not exist", dir.display()),
        )));
    }

    let scan_log = |name: &str| -> StoreResult<LogScan> {
        let path = dir.join(name);
        if !path.exists() {
            return Ok(LogScan::default());
        }
        LogScan::of(&FileBackend::open(&path)?)
    };

    Ok(ScanReport {
        changes: scan_log(CHANGES_LOG)?,
        meta: scan_log(META_LOG)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeStore, StoreConfig};
    use std::io::Write;
    use tempfile::tempdir;
    use vaultsync_protocol::{ChangeRecord, Cursor, OwnerId};

    #[test]
    fn clean_store_scans_clean() {
        let dir = tempdir().unwrap();
        {
            let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
            store.put(&ChangeRecord::new("c1", "x")).unwrap();
            store.set_cursor(&OwnerId::new("u"), Cursor::new(1)).unwrap();
        }

        let report = scan_dir(dir.path()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.changes.frames, 1);
        assert_eq!(report.meta.frames, 1);
    }

    #[test]
    fn scan_reports_without_repairing() {
        let dir = tempdir().unwrap();
        {
            let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
            store.put(&ChangeRecord::new("c1", "x")).unwrap();
        }
        let path = dir.path().join(CHANGES_LOG);
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"VSLG\x01").unwrap();
        drop(file);
        let size = std::fs::metadata(&path).unwrap().len();

        let report = scan_dir(dir.path()).unwrap();
        assert_eq!(report.changes.torn_bytes, 5);
        assert!(!report.is_clean());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn header_damage_is_located_not_fatal() {
        let dir = tempdir().unwrap();
        {
            let store = ChangeStore::open(dir.path(), StoreConfig::default()).unwrap();
            store.put(&ChangeRecord::new("c1", "x")).unwrap();
            store.put(&ChangeRecord::new("c2", "y")).unwrap();
        }
        let path = dir.path().join(CHANGES_LOG);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[1] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let report = scan_dir(dir.path()).unwrap();
        assert_eq!(report.changes.damaged, [0]);
        assert_eq!(report.changes.frames, 1);
        assert_eq!(report.changes.torn_bytes, 0);
    }

    #[test]
    fn missing_dir_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(scan_dir(dir.path().join("absent")).is_err());
    }
}
