//! Positional file I/O for block data and metadata files.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              BlockSpace                 │
//! │  (bitmaps, units, metadata catalog)     │
//! └─────────────────────────────────────────┘
//!              │                   │
//!              ▼                   ▼
//! ┌─────────────────────┐  ┌─────────────────────┐
//! │  DataFile           │  │  metadata file      │
//! │  (.cnt, N blocks)   │  │  (.meta, rewritten) │
//! └─────────────────────┘  └─────────────────────┘
//! ```

use std::fs::{File as StdFile, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// A file accessed with position-based reads and writes.
///
/// The underlying handle sits behind a mutex so that seek + read/write pairs
/// are atomic with respect to other threads.
pub struct DataFile {
    file: Mutex<StdFile>,
    path: PathBuf,
}

impl DataFile {
    /// Creates a new file, failing if it already exists.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Opens an existing file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current file size.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// Bytes past the end of the file read as zero.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                buf[total..].fill(0);
                break;
            }
            total += n;
        }
        Ok(())
    }

    /// Writes all of `buf` at `offset`.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    /// Truncates or extends the file. New bytes are zero.
    pub fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.lock().set_len(size)
    }

    /// Syncs data and metadata to disk.
    pub fn sync_all(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    /// Syncs data only.
    pub fn sync_data(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile").field("path", &self.path).finish()
    }
}

/// Replaces the contents of `path` with `bytes`.
///
/// The bytes go to a sibling temporary file that is fsynced and renamed over
/// `path`, so readers see either the old or the new contents.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_io() {
        let dir = tempfile::tempdir().unwrap();
        let file = DataFile::create(dir.path().join("blocks.cnt")).unwrap();
        file.set_len(1024).unwrap();

        file.write_all_at(&[1, 2, 3, 4], 512).unwrap();
        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, 512).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(file.size().unwrap(), 1024);
    }

    #[test]
    fn test_read_past_end_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let file = DataFile::create(dir.path().join("short.cnt")).unwrap();
        file.write_all_at(&[9; 8], 0).unwrap();

        let mut buf = [0xAAu8; 16];
        file.read_exact_at(&mut buf, 4).unwrap();
        assert_eq!(&buf[..4], &[9; 4]);
        assert_eq!(&buf[4..], &[0; 12]);
    }

    #[test]
    fn test_create_fails_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.cnt");
        DataFile::create(&path).unwrap();
        assert!(DataFile::create(&path).is_err());
        assert!(DataFile::open(&path).is_ok());
    }

    #[test]
    fn test_write_file_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.meta");
        write_file_atomic(&path, b"first version").unwrap();
        write_file_atomic(&path, b"v2").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"v2");
        assert!(!dir.path().join("x.meta.tmp").exists());
    }
}
