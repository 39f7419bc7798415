//! Error taxonomy for the SplitFAT storage engine.
//!
//! Every fallible operation in this crate returns one of the kinds below rather than
//! panicking or using exception-like unwinding. The variants map 1:1 onto the taxonomy
//! buckets described by the specification: storage-io, integrity, capacity, usage,
//! transaction, not-supported and fatal.

use core::fmt;

/// A single error produced by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying `LowLevelStorage` reported a failure (pread/pwrite/fsync/...).
    StorageIo(StorageIoError),
    /// A CRC mismatch or a structurally inconsistent FAT/cluster state was observed.
    Integrity(IntegrityError),
    /// The volume cannot grow or a fixed-size table is full.
    Capacity(CapacityError),
    /// The caller passed an invalid argument or used the API in an invalid state.
    Usage(UsageError),
    /// A transaction was misused, or its on-disk log is corrupt.
    Transaction(TransactionError),
    /// The requested feature is not implemented on this platform/configuration.
    NotSupported(&'static str),
    /// The volume is in an unrecoverable state; the caller must treat it as lost.
    Fatal(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageIoError {
    Read { offset: u64, len: usize },
    Write { offset: u64, len: usize },
    Fsync,
    Stat,
    Rename,
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// CRC-32 of a cached FAT block does not match `BlockControlData::fat_crc32`.
    FatBlockCrc { block_index: u32 },
    /// CRC-16 of a cluster's payload does not match the value encoded in its FAT cell.
    ClusterCrc { cluster_index: u32 },
    /// A FAT cell is reachable but does not form part of a well-formed chain.
    DanglingChain { cluster_index: u32 },
    /// A cell believed to be live was found free.
    FreeClusterReferenced { cluster_index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    /// `allocate_block` was called but `allocated_count == max_blocks`.
    CannotExtend,
    /// A fixed-size bitmap/table index fell outside its declared size.
    IndexOutOfRange { index: u32, size: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    InvalidClusterIndex(u32),
    InvalidBlockIndex(u32),
    FatNotCached { block_index: u32 },
    InvalidConfig(&'static str),
    VolumeNotOpen,
    VolumeAlreadyOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    AlreadyStarted,
    NotStarted,
    LogCorrupt(&'static str),
    NoLogFound,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StorageIo(e) => write!(f, "storage I/O error: {:?}", e),
            Error::Integrity(e) => write!(f, "integrity error: {:?}", e),
            Error::Capacity(e) => write!(f, "capacity error: {:?}", e),
            Error::Usage(e) => write!(f, "usage error: {:?}", e),
            Error::Transaction(e) => write!(f, "transaction error: {:?}", e),
            Error::NotSupported(what) => write!(f, "not supported: {}", what),
            Error::Fatal(why) => write!(f, "fatal volume error: {}", why),
        }
    }
}

impl std::error::Error for Error {}

impl From<StorageIoError> for Error {
    fn from(e: StorageIoError) -> Self {
        Error::StorageIo(e)
    }
}

impl From<IntegrityError> for Error {
    fn from(e: IntegrityError) -> Self {
        Error::Integrity(e)
    }
}

impl From<CapacityError> for Error {
    fn from(e: CapacityError) -> Self {
        Error::Capacity(e)
    }
}

impl From<UsageError> for Error {
    fn from(e: UsageError) -> Self {
        Error::Usage(e)
    }
}

impl From<TransactionError> for Error {
    fn from(e: TransactionError) -> Self {
        Error::Transaction(e)
    }
}
