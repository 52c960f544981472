use block_device::DeviceError;
use thiserror::Error;

/// The closed set of error kinds the core can return. Errors surface to the
/// caller unchanged; the core never wraps them with extra context and never
/// retries.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("device read failed: {0}")]
    Read(#[source] DeviceError),
    #[error("device write failed: {0}")]
    Write(#[source] DeviceError),
    #[error("device erase failed: {0}")]
    Erase(#[source] DeviceError),
    #[error("no free block on device")]
    DeviceFull,
    #[error("file address exceeds the index tree's addressing capacity")]
    FileFull,
    #[error("file not found")]
    FileNotFound,
    #[error("read/release path found an empty or tombstoned block slot")]
    UnreleasedBlock,
    #[error("device is not formatted (superblock magic mismatch)")]
    NotFormatted,
    #[error("write would skip past current end of file")]
    WritePastEnd,
    #[error("read past end of file")]
    Eof,
    #[error("file name exceeds the configured maximum length")]
    FileNameTooLong,
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Every device failure on a read path becomes `FsError::Read`; there is no
/// single blanket `From<DeviceError>` because the spec distinguishes Read,
/// Write and Erase by which operation triggered the failure, not by the
/// device error's own shape.
pub(crate) fn rd(e: DeviceError) -> FsError {
    FsError::Read(e)
}
pub(crate) fn wr(e: DeviceError) -> FsError {
    FsError::Write(e)
}
pub(crate) fn er(e: DeviceError) -> FsError {
    FsError::Erase(e)
}
