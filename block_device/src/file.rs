use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, trace};

use crate::{BlockDevice, Result, WriteHint};

/// `std::fs::File`-backed device standing in for the SD-SPI transport on a
/// developer machine. No command framing, CRC, or timeouts — that transport
/// layer is out of scope for this crate.
pub struct FileBlockDevice {
    file: File,
    page_size: usize,
    num_pages: u32,
}

impl FileBlockDevice {
    /// Opens (creating if needed) a backing file sized to exactly
    /// `num_pages * page_size` bytes.
    pub fn open(path: impl AsRef<Path>, num_pages: u32, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = num_pages as u64 * page_size as u64;
        file.set_len(len)?;
        debug!("opened file-backed device: {num_pages} pages of {page_size} bytes");
        Ok(Self {
            file,
            page_size,
            num_pages,
        })
    }

    fn seek_to(&mut self, page: u32, offset: usize) -> Result<()> {
        let pos = page as u64 * self.page_size as u64 + offset as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> u32 {
        self.num_pages
    }

    fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_page(page)?;
        self.check_span(offset, buf.len())?;
        trace!("file device read page={page} offset={offset} len={}", buf.len());
        self.seek_to(page, offset)?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, page: u32, offset: usize, buf: &[u8], hint: WriteHint) -> Result<()> {
        self.check_page(page)?;
        self.check_span(offset, buf.len())?;
        trace!("file device write page={page} offset={offset} len={} hint={hint:?}", buf.len());
        self.seek_to(page, offset)?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        trace!("file device flush");
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WriteHint;

    #[test]
    fn round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("tinyfs-block-device-test-{}", std::process::id()));
        let mut dev = FileBlockDevice::open(&path, 4, 512).unwrap();
        dev.write(1, 0, b"payload", WriteHint::Dirty).unwrap();
        dev.flush().unwrap();
        let mut buf = [0u8; 7];
        dev.read(1, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        let _ = std::fs::remove_file(&path);
    }
}
