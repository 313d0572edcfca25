//! Open files: positioned byte I/O on top of the file header.

use std::cmp;

use crate::error::SysError;
use crate::fs::FileHeader;
use crate::kernel::KernelCtx;
use crate::param::SECTOR_SIZE;

/// A handle to a file: its header, the header's home sector, and a
/// seek position. `read`/`write` advance the position; `read_at`/
/// `write_at` name an explicit offset.
pub struct OpenFile {
    hdr: FileHeader,
    hdr_sector: u32,
    pos: u32,
}

impl OpenFile {
    pub(crate) fn new(hdr: FileHeader, hdr_sector: u32) -> Self {
        Self {
            hdr,
            hdr_sector,
            pos: 0,
        }
    }

    pub fn length(&self) -> u32 {
        self.hdr.length()
    }

    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn header(&self) -> &FileHeader {
        &self.hdr
    }

    /// Reads from the seek position, advancing it. Returns the bytes
    /// actually read; short (or zero) at end of file.
    pub fn read(&mut self, dst: &mut [u8], ctx: &KernelCtx) -> u32 {
        let n = self.read_at(dst, self.pos, ctx);
        self.pos += n;
        n
    }

    /// Writes at the seek position, advancing it; extends the file if
    /// the write reaches past the end.
    pub fn write(&mut self, src: &[u8], ctx: &KernelCtx) -> Result<u32, SysError> {
        let n = self.write_at(src, self.pos, ctx)?;
        self.pos += n;
        Ok(n)
    }

    pub fn read_at(&self, dst: &mut [u8], offset: u32, ctx: &KernelCtx) -> u32 {
        let length = self.hdr.length();
        if offset >= length || dst.is_empty() {
            return 0;
        }
        let n = cmp::min(dst.len() as u32, length - offset) as usize;
        let disk = ctx.kernel().disk();

        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < n {
            let at = offset as usize + done;
            let in_sector = at % SECTOR_SIZE;
            let chunk = cmp::min(SECTOR_SIZE - in_sector, n - done);
            let sector = self.hdr.byte_to_sector(at as u32, ctx);
            disk.read_sector(sector, &mut sector_buf, ctx);
            dst[done..done + chunk].copy_from_slice(&sector_buf[in_sector..in_sector + chunk]);
            done += chunk;
        }
        n as u32
    }

    /// Writes at an explicit offset, read-modify-writing partial
    /// sectors. A write past the current end extends the file first;
    /// the updated header goes back to disk as part of the extension.
    pub fn write_at(&mut self, src: &[u8], offset: u32, ctx: &KernelCtx) -> Result<u32, SysError> {
        if src.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(src.len() as u32)
            .ok_or(SysError::FileTooLarge)?;
        if end > self.hdr.length() {
            let extra = end - self.hdr.length();
            ctx.kernel()
                .fs()
                .extend(&mut self.hdr, self.hdr_sector, extra, ctx)?;
        }
        let disk = ctx.kernel().disk();

        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < src.len() {
            let at = offset as usize + done;
            let in_sector = at % SECTOR_SIZE;
            let chunk = cmp::min(SECTOR_SIZE - in_sector, src.len() - done);
            let sector = self.hdr.byte_to_sector(at as u32, ctx);
            if chunk < SECTOR_SIZE {
                disk.read_sector(sector, &mut sector_buf, ctx);
            }
            sector_buf[in_sector..in_sector + chunk].copy_from_slice(&src[done..done + chunk]);
            disk.write_sector(sector, &sector_buf, ctx);
            done += chunk;
        }
        Ok(src.len() as u32)
    }
}
