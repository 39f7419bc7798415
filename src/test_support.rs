//! `LowLevelStorage` test doubles.
//!
//! `MemoryStorage` is a fast, in-memory double for unit tests that don't care about real
//! persistence. `FileStorage` is a thin `std::fs::File` wrapper guarded by `spin::RwLock`,
//! built the same way the teacher's own `fat32-fs-std` example wires a `BlockDevice` over
//! a real file — used by the crash-recovery and persistence integration tests, which need
//! an actual file to reopen.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use spin::RwLock;

use crate::error::{Error, StorageIoError};
use crate::storage::LowLevelStorage;

/// In-memory double backed by a single flat byte buffer (positioned I/O only cares about
/// offsets, not file identity) plus a set of "existing names" so `rename`/`unlink`/
/// `exists` behave meaningfully for transaction-log tests that check for a marker file's
/// presence.
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
    names: RwLock<HashSet<String>>,
}

impl MemoryStorage {
    pub fn new(initial_len: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; initial_len]),
            names: RwLock::new(HashSet::new()),
        }
    }
}

impl LowLevelStorage for MemoryStorage {
    fn pread(&self, buf: &mut [u8], offset: u64) -> crate::storage::Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            buf.fill(0);
            let available = data.len().saturating_sub(start);
            if available > 0 {
                buf[..available].copy_from_slice(&data[start..start + available]);
            }
            return Ok(());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> crate::storage::Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn fsync(&self) -> crate::storage::Result<()> {
        Ok(())
    }

    fn unlink(&self, path: &str) -> crate::storage::Result<()> {
        self.names.write().remove(path);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> crate::storage::Result<()> {
        let mut names = self.names.write();
        names.remove(from);
        names.insert(to.to_string());
        Ok(())
    }

    fn stat(&self, _path: &str) -> crate::storage::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn exists(&self, path: &str) -> bool {
        self.names.read().contains(path)
    }
}

impl MemoryStorage {
    /// Marks `name` as present without writing any bytes — used by tests that need to
    /// seed a pre-existing marker file (e.g. a lone temp file with no matching final).
    pub fn touch(&self, name: &str) {
        self.names.write().insert(name.to_string());
    }
}

/// A real file on disk, used where tests need to reopen/crash-simulate across processes
/// of the test itself (e.g. truncating the file to model a crash mid-write).
pub struct FileStorage {
    file: RwLock<File>,
    dir: PathBuf,
}

impl FileStorage {
    pub fn create(dir: &Path, name: &str, initial_len: u64) -> Result<Self, Error> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|_| Error::StorageIo(StorageIoError::Write { offset: 0, len: 0 }))?;
        file.set_len(initial_len)
            .map_err(|_| Error::StorageIo(StorageIoError::Write { offset: 0, len: 0 }))?;
        Ok(Self {
            file: RwLock::new(file),
            dir: dir.to_path_buf(),
        })
    }

    pub fn open(dir: &Path, name: &str) -> Result<Self, Error> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| Error::StorageIo(StorageIoError::Read { offset: 0, len: 0 }))?;
        Ok(Self {
            file: RwLock::new(file),
            dir: dir.to_path_buf(),
        })
    }
}

impl LowLevelStorage for FileStorage {
    fn pread(&self, buf: &mut [u8], offset: u64) -> crate::storage::Result<()> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| Error::StorageIo(StorageIoError::Read { offset, len: buf.len() }))?;
        file.read_exact(buf)
            .map_err(|_| Error::StorageIo(StorageIoError::Read { offset, len: buf.len() }))
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> crate::storage::Result<()> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| Error::StorageIo(StorageIoError::Write { offset, len: buf.len() }))?;
        file.write_all(buf)
            .map_err(|_| Error::StorageIo(StorageIoError::Write { offset, len: buf.len() }))
    }

    fn fsync(&self) -> crate::storage::Result<()> {
        self.file.write().sync_all().map_err(|_| Error::StorageIo(StorageIoError::Fsync))
    }

    fn unlink(&self, path: &str) -> crate::storage::Result<()> {
        std::fs::remove_file(self.dir.join(path)).map_err(|_| Error::StorageIo(StorageIoError::Unlink))
    }

    fn rename(&self, from: &str, to: &str) -> crate::storage::Result<()> {
        std::fs::rename(self.dir.join(from), self.dir.join(to)).map_err(|_| Error::StorageIo(StorageIoError::Rename))
    }

    fn stat(&self, path: &str) -> crate::storage::Result<u64> {
        std::fs::metadata(self.dir.join(path))
            .map(|m| m.len())
            .map_err(|_| Error::StorageIo(StorageIoError::Stat))
    }

    fn exists(&self, path: &str) -> bool {
        self.dir.join(path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_grows_on_write_past_end() {
        let storage = MemoryStorage::new(0);
        storage.pwrite(&[1, 2, 3, 4], 10).unwrap();
        let mut buf = [0u8; 4];
        storage.pread(&mut buf, 10).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn file_storage_roundtrips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::create(dir.path(), "control", 4096).unwrap();
            storage.pwrite(b"hello", 100).unwrap();
            storage.fsync().unwrap();
        }
        let storage = FileStorage::open(dir.path(), "control").unwrap();
        let mut buf = [0u8; 5];
        storage.pread(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn file_storage_rename_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::create(dir.path(), "txn.tmp", 16).unwrap();
        storage.rename("txn.tmp", "txn.final").unwrap();
        assert!(storage.exists("txn.final"));
        assert!(!storage.exists("txn.tmp"));
        storage.unlink("txn.final").unwrap();
        assert!(!storage.exists("txn.final"));
    }
}
