//! The log manager.
//!
//! Assigns LSNs, buffers encoded records and forces them to stable storage on
//! [`LogManager::flush`]. LSNs are dense record numbers starting at
//! [`Lsn::FIRST`], so the record with LSN `n` is the `n`-th record of the log.
//!
//! On open, the log file is scanned front to back. The first record that is
//! truncated, fails its checksum or breaks the LSN sequence marks a torn tail:
//! the file is cut back to the end of the last valid record.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use bracket_common::types::Lsn;

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::record::LogRecord;

/// Log statistics.
#[derive(Debug, Default)]
pub struct LogStats {
    /// Total records appended.
    pub records_written: AtomicU64,
    /// Total encoded bytes appended.
    pub bytes_written: AtomicU64,
    /// Number of flushes that reached the file.
    pub flushes: AtomicU64,
}

struct LogInner {
    /// Every record of the log, indexed by `lsn - 1`.
    records: Vec<LogRecord>,
    /// Encoded records not yet handed to the file.
    pending: BytesMut,
    /// Log file (None for in-memory logs).
    file: Option<File>,
    /// Highest LSN on stable storage.
    flushed_lsn: Lsn,
    closed: bool,
}

impl LogInner {
    fn next_lsn(&self) -> Lsn {
        Lsn::new(self.records.len() as u64 + 1)
    }
}

/// Append-only log of [`LogRecord`]s.
pub struct LogManager {
    config: LogConfig,
    inner: Mutex<LogInner>,
    stats: LogStats,
}

impl LogManager {
    /// Opens (or creates) the log described by `config`.
    pub fn open(config: LogConfig) -> LogResult<Self> {
        config.validate().map_err(LogError::config_error)?;

        if config.in_memory {
            return Ok(Self::with_inner(config, Vec::new(), None));
        }

        std::fs::create_dir_all(&config.dir)?;
        let path = config.log_path();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let (records, valid_len) = Self::scan(&bytes);

        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = bytes.len(),
                "truncating torn log tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        info!(
            path = %path.display(),
            records = records.len(),
            "opened log"
        );
        Ok(Self::with_inner(config, records, Some(file)))
    }

    /// Creates an in-memory log.
    pub fn in_memory() -> Self {
        Self::with_inner(LogConfig::in_memory(), Vec::new(), None)
    }

    fn with_inner(config: LogConfig, records: Vec<LogRecord>, file: Option<File>) -> Self {
        let flushed_lsn = Lsn::new(records.len() as u64);
        Self {
            config,
            inner: Mutex::new(LogInner {
                records,
                pending: BytesMut::new(),
                file,
                flushed_lsn,
                closed: false,
            }),
            stats: LogStats::default(),
        }
    }

    /// Decodes records until the first invalid one.
    ///
    /// Returns the valid records and the byte length they cover.
    fn scan(bytes: &[u8]) -> (Vec<LogRecord>, usize) {
        let mut records = Vec::new();
        let mut offset = 0;
        let mut expected = Lsn::FIRST;

        while offset < bytes.len() {
            match LogRecord::decode(&bytes[offset..]) {
                Ok((record, used)) if record.lsn == expected => {
                    offset += used;
                    expected = expected.next();
                    records.push(record);
                }
                Ok((record, _)) => {
                    warn!(lsn = %record.lsn, expected = %expected, "log sequence broken");
                    break;
                }
                Err(e) => {
                    debug!(offset, error = %e, "log scan stopped");
                    break;
                }
            }
        }

        (records, offset)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Returns the log statistics.
    pub fn stats(&self) -> &LogStats {
        &self.stats
    }

    /// Appends a record, assigning it the next LSN.
    ///
    /// The `lsn` field of `record` is overwritten.
    pub fn append(&self, mut record: LogRecord) -> LogResult<Lsn> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(LogError::Closed);
        }

        let lsn = inner.next_lsn();
        record.lsn = lsn;
        let encoded = record.encode();
        if encoded.len() > self.config.max_record_size {
            return Err(LogError::config_error(format!(
                "record of {} bytes exceeds max_record_size {}",
                encoded.len(),
                self.config.max_record_size
            )));
        }

        if inner.file.is_some() {
            inner.pending.extend_from_slice(&encoded);
        }
        inner.records.push(record);

        self.stats.records_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Forces every record up to and including `up_to` to stable storage.
    ///
    /// Flushing past the end of the log flushes everything.
    pub fn flush(&self, up_to: Lsn) -> LogResult<()> {
        let mut inner = self.inner.lock();
        if up_to <= inner.flushed_lsn {
            return Ok(());
        }
        self.flush_locked(&mut inner)
    }

    /// Forces the whole log to stable storage.
    pub fn flush_all(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut LogInner) -> LogResult<()> {
        let last = Lsn::new(inner.records.len() as u64);
        if let Some(file) = inner.file.as_mut() {
            if !inner.pending.is_empty() {
                file.write_all(&inner.pending)?;
                if self.config.sync_on_commit {
                    file.sync_data()?;
                }
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.pending.clear();
        inner.flushed_lsn = last;
        Ok(())
    }

    /// Highest LSN known to be on stable storage.
    pub fn flushed_lsn(&self) -> Lsn {
        self.inner.lock().flushed_lsn
    }

    /// LSN the next appended record will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn()
    }

    /// LSN of the last appended record (`Lsn::INVALID` if the log is empty).
    pub fn last_lsn(&self) -> Lsn {
        Lsn::new(self.inner.lock().records.len() as u64)
    }

    /// Returns the record with the given LSN.
    pub fn get(&self, lsn: Lsn) -> LogResult<LogRecord> {
        let inner = self.inner.lock();
        lsn.as_u64()
            .checked_sub(1)
            .and_then(|idx| inner.records.get(idx as usize))
            .cloned()
            .ok_or(LogError::LsnNotFound { lsn })
    }

    /// Returns a snapshot of every record in LSN order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.inner.lock().records.clone()
    }

    /// Returns a snapshot of the records with LSN >= `from`.
    pub fn records_from(&self, from: Lsn) -> Vec<LogRecord> {
        let inner = self.inner.lock();
        let start = (from.as_u64().max(1) - 1) as usize;
        inner.records.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Drops every record that has not reached stable storage, as a crash
    /// would.
    pub fn discard_unflushed(&self) {
        let mut inner = self.inner.lock();
        let keep = inner.flushed_lsn.as_u64() as usize;
        let lost = inner.records.len().saturating_sub(keep);
        inner.records.truncate(keep);
        inner.pending.clear();
        if lost > 0 {
            debug!(lost, "discarded unflushed log records");
        }
    }

    /// Flushes and closes the log. Further appends fail.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        self.flush_locked(&mut inner)?;
        if let Some(file) = inner.file.as_mut() {
            file.sync_all()?;
        }
        inner.closed = true;
        Ok(())
    }

    /// Returns true if the log has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LogManager")
            .field("records", &inner.records.len())
            .field("flushed_lsn", &inner.flushed_lsn)
            .field("in_memory", &self.config.in_memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogOperation;
    use bracket_common::types::{PageId, TxnId, UnitId};
    use std::io::Seek;

    fn allocate(block: u32) -> LogRecord {
        LogRecord::update(
            Lsn::INVALID,
            Lsn::INVALID,
            TxnId::new(1),
            LogOperation::Allocate {
                page: PageId::new(1, block),
                unit: UnitId::new(1),
            },
        )
    }

    #[test]
    fn test_lsn_assignment() {
        let log = LogManager::in_memory();
        assert_eq!(log.next_lsn(), Lsn::FIRST);
        assert_eq!(log.append(allocate(1)).unwrap(), Lsn::new(1));
        assert_eq!(log.append(allocate(2)).unwrap(), Lsn::new(2));
        assert_eq!(log.last_lsn(), Lsn::new(2));
        assert_eq!(log.get(Lsn::new(2)).unwrap().lsn, Lsn::new(2));
        assert!(matches!(
            log.get(Lsn::new(3)),
            Err(LogError::LsnNotFound { .. })
        ));
        assert!(log.get(Lsn::INVALID).is_err());
    }

    #[test]
    fn test_discard_unflushed() {
        let log = LogManager::in_memory();
        log.append(allocate(1)).unwrap();
        log.flush(Lsn::new(1)).unwrap();
        log.append(allocate(2)).unwrap();

        log.discard_unflushed();
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.next_lsn(), Lsn::new(2));
    }

    #[test]
    fn test_reopen_file_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::for_testing(dir.path());
        {
            let log = LogManager::open(config.clone()).unwrap();
            for block in 1..=5 {
                log.append(allocate(block)).unwrap();
            }
            log.flush(Lsn::new(3)).unwrap();
            log.close().unwrap();
        }

        let log = LogManager::open(config).unwrap();
        assert_eq!(log.records().len(), 5);
        assert_eq!(log.flushed_lsn(), Lsn::new(5));
        assert_eq!(log.records_from(Lsn::new(4)).len(), 2);
    }

    #[test]
    fn test_unflushed_records_are_lost() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::for_testing(dir.path());
        {
            let log = LogManager::open(config.clone()).unwrap();
            log.append(allocate(1)).unwrap();
            log.flush_all().unwrap();
            log.append(allocate(2)).unwrap();
        }

        let log = LogManager::open(config).unwrap();
        assert_eq!(log.records().len(), 1);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::for_testing(dir.path());
        {
            let log = LogManager::open(config.clone()).unwrap();
            log.append(allocate(1)).unwrap();
            log.append(allocate(2)).unwrap();
            log.close().unwrap();
        }

        let path = config.log_path();
        let len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(len - 5).unwrap();
            file.seek(std::io::SeekFrom::End(0)).unwrap();
            file.write_all(&[0xAB; 3]).unwrap();
        }

        let log = LogManager::open(config.clone()).unwrap();
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.next_lsn(), Lsn::new(2));
        log.append(allocate(3)).unwrap();
        log.close().unwrap();

        let log = LogManager::open(config).unwrap();
        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].lsn, Lsn::new(2));
    }

    #[test]
    fn test_closed_log_rejects_appends() {
        let log = LogManager::in_memory();
        log.close().unwrap();
        assert!(log.is_closed());
        assert!(matches!(log.append(allocate(1)), Err(LogError::Closed)));
    }
}
