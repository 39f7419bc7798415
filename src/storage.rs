//! The host-provided storage primitive the engine is built on top of.
//!
//! A volume owns two `LowLevelStorage` instances: one for the control area, one for the
//! bulk area. Both speak the same capability set; the bulk area additionally promises an
//! efficient path for chunk-aligned writes, which `ClusterDataCache` relies on.

use crate::error::{Error, StorageIoError};

pub type Result<T> = core::result::Result<T, Error>;

/// Raw positioned I/O against a single backing file, as supplied by the host platform.
///
/// Implementations must make `pwrite` at `offset % chunk_size == 0` with
/// `len == chunk_size` efficient on the bulk area; no other access pattern needs a
/// particular performance guarantee.
pub trait LowLevelStorage: Send + Sync {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()>;

    fn fsync(&self) -> Result<()>;

    fn unlink(&self, path: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn stat(&self, path: &str) -> Result<u64>;

    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }
}

pub(crate) fn read_err(offset: u64, len: usize) -> Error {
    StorageIoError::Read { offset, len }.into()
}

pub(crate) fn write_err(offset: u64, len: usize) -> Error {
    StorageIoError::Write { offset, len }.into()
}
