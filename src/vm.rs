//! User address spaces.
//!
//! An address space is a page table mapping virtual page numbers to
//! physical pages of the machine's memory. Pages are taken from a
//! machine-wide `PageMap`; an executable's segments are loaded at
//! their virtual addresses and every user thread gets its own stack
//! pages appended to the space.
//!
//! Executables use a flat format: a header with a magic word and three
//! segment descriptors (code, initialised data, uninitialised data),
//! followed by the segment bytes at the file offsets the descriptors
//! name. Uninitialised data occupies pages but no file bytes.

use std::cmp;
use std::mem;

use bitmaps::Bitmap;
use zerocopy::{AsBytes, FromBytes};

use crate::error::SysError;
use crate::fs::OpenFile;
use crate::kernel::KernelCtx;
use crate::machine::{NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, STACK_REG};
use crate::param::{MAX_USER_STR, NUM_PHYS_PAGES, PAGE_SIZE, STACK_PAGES};
use crate::utils::div_round_up;

pub const EXEC_MAGIC: u32 = 0x00badfad;

/// One loadable region of an executable.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ExecSegment {
    pub vaddr: u32,
    pub file_offset: u32,
    pub size: u32,
}

/// The executable header, stored at file offset 0.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ExecHeader {
    pub magic: u32,
    pub code: ExecSegment,
    pub init_data: ExecSegment,
    pub uninit_data: ExecSegment,
}

/// Allocator for the machine's physical page frames.
pub struct PageMap {
    map: Bitmap<NUM_PHYS_PAGES>,
    /// Frames actually installed; at most `NUM_PHYS_PAGES`.
    limit: usize,
}

impl PageMap {
    pub(crate) fn new(limit: usize) -> Self {
        assert!(limit <= NUM_PHYS_PAGES);
        Self {
            map: Bitmap::new(),
            limit,
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        let page = self.map.first_false_index().filter(|p| *p < self.limit)?;
        let _ = self.map.set(page, true);
        Some(page)
    }

    pub fn free(&mut self, page: usize) {
        let was = self.map.set(page, false);
        assert!(was, "freeing a page that was not allocated");
    }

    pub fn free_count(&self) -> usize {
        self.limit - self.map.len()
    }
}

/// A user address space: virtual page number -> physical page.
pub struct AddrSpace {
    pages: Vec<usize>,
}

impl AddrSpace {
    /// Builds an address space from an executable: reads the header,
    /// sizes the image, allocates and zeroes pages, and copies the
    /// code and initialised-data segments in. The space ends with one
    /// stack region for the root thread.
    pub fn load(exe: &OpenFile, ctx: &KernelCtx) -> Result<Self, SysError> {
        let mut hdr = ExecHeader::default();
        if exe.read_at(hdr.as_bytes_mut(), 0, ctx) != mem::size_of::<ExecHeader>() as u32 {
            return Err(SysError::BadExecutable);
        }
        if hdr.magic != EXEC_MAGIC {
            return Err(SysError::BadExecutable);
        }

        let image_end = [&hdr.code, &hdr.init_data, &hdr.uninit_data]
            .iter()
            .map(|s| s.vaddr as usize + s.size as usize)
            .max()
            .unwrap_or(0);
        let num_pages = div_round_up(image_end, PAGE_SIZE) + STACK_PAGES;

        let mut space = Self { pages: Vec::new() };
        space.grow(num_pages, ctx)?;
        log::debug!(
            "loading executable: {} pages, code {} bytes, data {} bytes",
            num_pages,
            hdr.code.size,
            hdr.init_data.size
        );

        space.load_segment(exe, &hdr.code, ctx)?;
        space.load_segment(exe, &hdr.init_data, ctx)?;
        Ok(space)
    }

    /// Appends `extra` zeroed pages, all-or-nothing.
    fn grow(&mut self, extra: usize, ctx: &KernelCtx) -> Result<(), SysError> {
        let kernel = ctx.kernel();
        let mut taken = scopeguard::guard(Vec::new(), |pages: Vec<usize>| {
            for page in pages {
                kernel.free_page(page, ctx);
            }
        });
        for _ in 0..extra {
            let page = kernel.alloc_page(ctx).ok_or(SysError::OutOfPages)?;
            kernel
                .machine()
                .write_phys(page * PAGE_SIZE, &[0u8; PAGE_SIZE], ctx)?;
            taken.push(page);
        }
        self.pages.append(&mut scopeguard::ScopeGuard::into_inner(taken));
        Ok(())
    }

    fn load_segment(
        &self,
        exe: &OpenFile,
        seg: &ExecSegment,
        ctx: &KernelCtx,
    ) -> Result<(), SysError> {
        if seg.size == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; seg.size as usize];
        if exe.read_at(&mut buf, seg.file_offset, ctx) != seg.size {
            return Err(SysError::BadExecutable);
        }
        self.copy_out(seg.vaddr, &buf, ctx)
    }

    /// Adds a fresh stack region for a forked user thread. On success
    /// the new stack top is `num_pages() * PAGE_SIZE`.
    pub fn create_stack(&mut self, ctx: &KernelCtx) -> Result<(), SysError> {
        self.grow(STACK_PAGES, ctx)
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Consumes the space, yielding its frames for return to the page
    /// map.
    pub(crate) fn take_pages(self) -> Vec<usize> {
        self.pages
    }

    /// Sets up the machine registers to start execution at the image's
    /// entry point with the stack at the top of the space. The stack
    /// pointer backs off a little to keep accidental reads past the
    /// end in bounds.
    pub fn init_registers(&self, ctx: &KernelCtx) {
        let machine = ctx.kernel().machine();
        for reg in 0..NUM_TOTAL_REGS {
            machine.write_register(reg, 0, ctx);
        }
        machine.write_register(PC_REG, 0, ctx);
        machine.write_register(NEXT_PC_REG, 4, ctx);
        machine.write_register(
            STACK_REG,
            (self.num_pages() * PAGE_SIZE) as u32 - 16,
            ctx,
        );
    }

    fn translate(&self, vaddr: u32) -> Result<usize, SysError> {
        let vpn = vaddr as usize / PAGE_SIZE;
        let frame = *self.pages.get(vpn).ok_or(SysError::BadAddress)?;
        Ok(frame * PAGE_SIZE + vaddr as usize % PAGE_SIZE)
    }

    /// Copies kernel bytes into user memory, page by page.
    pub fn copy_out(&self, vaddr: u32, src: &[u8], ctx: &KernelCtx) -> Result<(), SysError> {
        let machine = ctx.kernel().machine();
        let mut done = 0;
        while done < src.len() {
            let va = vaddr as usize + done;
            let n = cmp::min(PAGE_SIZE - va % PAGE_SIZE, src.len() - done);
            let pa = self.translate(va as u32)?;
            machine.write_phys(pa, &src[done..done + n], ctx)?;
            done += n;
        }
        Ok(())
    }

    /// Copies user memory out into a kernel buffer, page by page.
    pub fn copy_in(&self, vaddr: u32, dst: &mut [u8], ctx: &KernelCtx) -> Result<(), SysError> {
        let machine = ctx.kernel().machine();
        let mut done = 0;
        while done < dst.len() {
            let va = vaddr as usize + done;
            let n = cmp::min(PAGE_SIZE - va % PAGE_SIZE, dst.len() - done);
            let pa = self.translate(va as u32)?;
            machine.read_phys(pa, &mut dst[done..done + n], ctx)?;
            done += n;
        }
        Ok(())
    }

    /// Fetches a NUL-terminated string from user memory.
    pub fn read_str(&self, vaddr: u32, ctx: &KernelCtx) -> Result<String, SysError> {
        let machine = ctx.kernel().machine();
        let mut bytes = Vec::new();
        for i in 0..MAX_USER_STR {
            let pa = self.translate(vaddr + i as u32)?;
            let mut byte = [0u8];
            machine.read_phys(pa, &mut byte, ctx)?;
            if byte[0] == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte[0]);
        }
        Err(SysError::BadAddress)
    }
}
