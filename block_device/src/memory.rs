use log::{trace, warn};

use crate::{BlockDevice, Result, WriteHint};

/// `Vec<u8>`-backed device, the test-bench analogue of a real SD card.
pub struct MemoryBlockDevice {
    page_size: usize,
    mem: Vec<u8>,
    flush_count: u32,
}

impl MemoryBlockDevice {
    pub fn new(num_pages: u32, page_size: usize) -> Self {
        Self {
            page_size,
            mem: vec![0u8; num_pages as usize * page_size],
            flush_count: 0,
        }
    }

    pub fn flush_count(&self) -> u32 {
        self.flush_count
    }

    fn page_range(&self, page: u32, offset: usize, len: usize) -> (usize, usize) {
        let start = page as usize * self.page_size + offset;
        (start, start + len)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> u32 {
        (self.mem.len() / self.page_size) as u32
    }

    fn read(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        if let Err(e) = self.check_page(page).and_then(|_| self.check_span(offset, buf.len())) {
            warn!("memory device read rejected: {e}");
            return Err(e);
        }
        trace!("memory device read page={page} offset={offset} len={}", buf.len());
        let (start, end) = self.page_range(page, offset, buf.len());
        buf.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn write(&mut self, page: u32, offset: usize, buf: &[u8], hint: WriteHint) -> Result<()> {
        if let Err(e) = self.check_page(page).and_then(|_| self.check_span(offset, buf.len())) {
            warn!("memory device write rejected: {e}");
            return Err(e);
        }
        trace!("memory device write page={page} offset={offset} len={} hint={hint:?}", buf.len());
        let (start, end) = self.page_range(page, offset, buf.len());
        self.mem[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_count += 1;
        trace!("memory device flush #{}", self.flush_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut dev = MemoryBlockDevice::new(8, 512);
        dev.write(3, 10, b"hello", WriteHint::Normal).unwrap();
        let mut buf = [0u8; 5];
        dev.read(3, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn out_of_range_page() {
        let mut dev = MemoryBlockDevice::new(2, 512);
        let mut buf = [0u8; 1];
        assert!(dev.read(5, 0, &mut buf).is_err());
    }

    #[test]
    fn span_out_of_bounds() {
        let mut dev = MemoryBlockDevice::new(2, 512);
        let mut buf = [0u8; 16];
        assert!(dev.read(0, 500, &mut buf).is_err());
    }
}
