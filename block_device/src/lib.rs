//! Page-addressed block device abstraction.
//!
//! This is the only collaborator the core filesystem needs from the
//! transport layer: read/write/flush against fixed-size pages. The concrete
//! SD-SPI command set, CRC framing and timeouts are external to this crate,
//! same as the disk driver split in a typical embedded-fs implementation.

use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileBlockDevice;
pub use memory::MemoryBlockDevice;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("page {page} out of range (device has {num_pages} pages)")]
    OutOfRange { page: u32, num_pages: u32 },
    #[error("read/write span [{offset}, {offset}+{len}) escapes page bounds (page size {page_size})")]
    SpanOutOfBounds {
        offset: usize,
        len: usize,
        page_size: usize,
    },
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// A hint the core sets around writes that are the first to touch a freshly
/// reserved block. A device MAY use this to skip the read-modify-write round
/// it would otherwise perform to preserve unwritten bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHint {
    /// Default: treat the destination bytes outside `[offset, offset+n)` as
    /// live data that must be preserved.
    Normal,
    /// The destination page has never been written (or was just erased);
    /// bytes outside `[offset, offset+n)` are don't-care.
    Dirty,
}

/// Capability set the core consumes from a block device: read, write, flush.
pub trait BlockDevice {
    fn page_size(&self) -> usize;
    fn num_pages(&self) -> u32;

    /// Read `n` bytes from device page `page`, starting `offset` bytes into
    /// that page. `0 <= offset + n <= page_size`.
    fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len()` bytes to device page `page` at `offset`. `hint`
    /// tells the device whether it may skip preserving bytes outside the
    /// written span.
    fn write(&mut self, page: u32, offset: usize, buf: &[u8], hint: WriteHint) -> Result<()>;

    /// Make all prior writes durable.
    fn flush(&mut self) -> Result<()>;

    fn check_span(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.page_size() {
            return Err(DeviceError::SpanOutOfBounds {
                offset,
                len,
                page_size: self.page_size(),
            });
        }
        Ok(())
    }

    fn check_page(&self, page: u32) -> Result<()> {
        if page >= self.num_pages() {
            return Err(DeviceError::OutOfRange {
                page,
                num_pages: self.num_pages(),
            });
        }
        Ok(())
    }
}
