//! The on-disk file header (the i-node) and its indirect blocks.
//!
//! A header occupies exactly one sector and locates every data sector
//! of one file. The first `NUM_DIRECT` sectors are indexed inline;
//! beyond that a single-indirect block holds the next `NUM_INDIRECT`
//! entries, and beyond *that* a double-indirect block holds up to
//! `NUM_INDIRECT` further indirect blocks. Sector index 0 is reserved
//! to mean "none", so a zero in either indirect field says the block
//! has not been materialised yet.
//!
//! Growth fills regions in a fixed order — direct, single-indirect,
//! double-indirect — always extending into the next hole, and meta
//! blocks are allocated lazily the first time a byte needs them.
//! `allocate` is all-or-nothing: the free-map pre-check counts data
//! and meta sectors, and any sector taken before a failure is put
//! back, with the header restored, before the error is returned.
//!
//! Unlike a real system the header records no permissions, ownership,
//! or modification dates.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::error::SysError;
use crate::fs::FreeMap;
use crate::kernel::KernelCtx;
use crate::param::{MAX_FILE_SECTORS, NUM_DIRECT, NUM_INDIRECT, SECTOR_SIZE};
use crate::utils::div_round_up;

/// One sector of sector indices, used by both indirect levels.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct IndirectBlock {
    num_sectors: u32,
    entries: [u32; NUM_INDIRECT],
}

const_assert_eq!(core::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl IndirectBlock {
    fn new() -> Self {
        Self {
            num_sectors: 0,
            entries: [0; NUM_INDIRECT],
        }
    }

    fn fetch_from(sector: u32, ctx: &KernelCtx) -> Self {
        let mut buf = [0u8; SECTOR_SIZE];
        ctx.kernel().disk().read_sector(sector, &mut buf, ctx);
        let mut block = Self::new();
        block.as_bytes_mut().copy_from_slice(&buf);
        block
    }

    fn write_back(&self, sector: u32, ctx: &KernelCtx) {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(self.as_bytes());
        ctx.kernel().disk().write_sector(sector, &buf, ctx);
    }
}

/// The file header. Serialised to disk as-is: little-endian words,
/// no embedded pointers, position independent.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, AsBytes, FromBytes)]
pub struct FileHeader {
    num_bytes: u32,
    num_sectors: u32,
    single_indirect: u32,
    double_indirect: u32,
    direct: [u32; NUM_DIRECT],
}

const_assert_eq!(core::mem::size_of::<FileHeader>(), SECTOR_SIZE);

impl FileHeader {
    /// A fresh header for an empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes in the file.
    pub fn length(&self) -> u32 {
        self.num_bytes
    }

    /// Data sectors allocated to the file.
    pub fn sectors(&self) -> u32 {
        self.num_sectors
    }

    /// The single-indirect meta sector, 0 while not materialised.
    pub fn single_indirect_sector(&self) -> u32 {
        self.single_indirect
    }

    /// The double-indirect outer meta sector, 0 while not materialised.
    pub fn double_indirect_sector(&self) -> u32 {
        self.double_indirect
    }

    /// Reads the header back from its sector.
    pub fn fetch_from(sector: u32, ctx: &KernelCtx) -> Self {
        let mut buf = [0u8; SECTOR_SIZE];
        ctx.kernel().disk().read_sector(sector, &mut buf, ctx);
        let mut hdr = Self::new();
        hdr.as_bytes_mut().copy_from_slice(&buf);
        hdr
    }

    /// Writes the header to its sector.
    pub fn write_back(&self, sector: u32, ctx: &KernelCtx) {
        assert!(
            self.num_sectors as usize == div_round_up(self.num_bytes as usize, SECTOR_SIZE),
            "file header sector count disagrees with its byte length"
        );
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(self.as_bytes());
        ctx.kernel().disk().write_sector(sector, &buf, ctx);
    }

    /// The physical sector holding file byte `offset`. Costs nothing
    /// for the direct range, one sector read for single-indirect and
    /// two for double-indirect.
    pub fn byte_to_sector(&self, offset: u32, ctx: &KernelCtx) -> u32 {
        assert!(offset < self.num_bytes, "offset beyond end of file");
        self.sector_of(offset as usize / SECTOR_SIZE, ctx)
    }

    /// Translates a file-relative sector number to a disk sector.
    fn sector_of(&self, vs: usize, ctx: &KernelCtx) -> u32 {
        if vs < NUM_DIRECT {
            self.direct[vs]
        } else if vs < NUM_DIRECT + NUM_INDIRECT {
            assert_ne!(self.single_indirect, 0);
            let block = IndirectBlock::fetch_from(self.single_indirect, ctx);
            block.entries[vs - NUM_DIRECT]
        } else {
            assert_ne!(self.double_indirect, 0);
            let local = vs - NUM_DIRECT - NUM_INDIRECT;
            let outer = IndirectBlock::fetch_from(self.double_indirect, ctx);
            let inner = IndirectBlock::fetch_from(outer.entries[local / NUM_INDIRECT], ctx);
            inner.entries[local % NUM_INDIRECT]
        }
    }

    /// Expands the file by `extra_bytes`, taking data and meta sectors
    /// from `freemap`. Either the whole extension succeeds or the
    /// header and free map are left exactly as they were.
    pub fn allocate(
        &mut self,
        freemap: &mut FreeMap,
        extra_bytes: u32,
        ctx: &KernelCtx,
    ) -> Result<(), SysError> {
        let new_bytes = self
            .num_bytes
            .checked_add(extra_bytes)
            .ok_or(SysError::FileTooLarge)?;
        let old_sectors = self.num_sectors as usize;
        let new_sectors = div_round_up(new_bytes as usize, SECTOR_SIZE);
        if new_sectors > MAX_FILE_SECTORS {
            return Err(SysError::FileTooLarge);
        }
        if new_sectors == old_sectors {
            // The growth fits in the last allocated sector.
            self.num_bytes = new_bytes;
            return Ok(());
        }

        if freemap.count_free() < new_sectors - old_sectors + self.meta_demand(new_sectors) {
            log::debug!(
                "allocate: {} bytes need more sectors than the free map has",
                extra_bytes
            );
            return Err(SysError::NoSpace);
        }

        let saved = *self;
        let mut taken = Vec::new();
        match self.fill(freemap, &mut taken, new_sectors, ctx) {
            Ok(()) => {
                self.num_bytes = new_bytes;
                Ok(())
            }
            Err(e) => {
                *self = saved;
                for sector in taken {
                    freemap.clear(sector);
                }
                Err(e)
            }
        }
    }

    /// Meta sectors an extension to `new_sectors` will materialise.
    fn meta_demand(&self, new_sectors: usize) -> usize {
        let mut meta = 0;
        if new_sectors > NUM_DIRECT && self.single_indirect == 0 {
            meta += 1;
        }
        if new_sectors > NUM_DIRECT + NUM_INDIRECT {
            if self.double_indirect == 0 {
                meta += 1;
            }
            let old_sectors = self.num_sectors as usize;
            let inners_now = if old_sectors > NUM_DIRECT + NUM_INDIRECT {
                div_round_up(old_sectors - NUM_DIRECT - NUM_INDIRECT, NUM_INDIRECT)
            } else {
                0
            };
            let inners_after =
                div_round_up(new_sectors - NUM_DIRECT - NUM_INDIRECT, NUM_INDIRECT);
            meta += inners_after - inners_now;
        }
        meta
    }

    fn take(freemap: &mut FreeMap, taken: &mut Vec<u32>) -> Result<u32, SysError> {
        let sector = freemap.find().ok_or(SysError::NoSpace)?;
        taken.push(sector);
        Ok(sector)
    }

    /// Grows the sector tables up to `new_sectors`, region by region.
    fn fill(
        &mut self,
        freemap: &mut FreeMap,
        taken: &mut Vec<u32>,
        new_sectors: usize,
        ctx: &KernelCtx,
    ) -> Result<(), SysError> {
        // Direct blocks.
        while (self.num_sectors as usize) < new_sectors && (self.num_sectors as usize) < NUM_DIRECT
        {
            let sector = Self::take(freemap, taken)?;
            log::trace!("adding sector {} to the direct blocks", sector);
            self.direct[self.num_sectors as usize] = sector;
            self.num_sectors += 1;
        }
        if self.num_sectors as usize == new_sectors {
            return Ok(());
        }

        // Single indirect.
        let fresh = self.single_indirect == 0;
        if fresh {
            self.single_indirect = Self::take(freemap, taken)?;
            log::trace!("creating the single indirect at sector {}", self.single_indirect);
        }
        let mut block = if fresh {
            IndirectBlock::new()
        } else {
            IndirectBlock::fetch_from(self.single_indirect, ctx)
        };
        while (self.num_sectors as usize) < new_sectors
            && (self.num_sectors as usize) < NUM_DIRECT + NUM_INDIRECT
        {
            let sector = Self::take(freemap, taken)?;
            log::trace!("adding sector {} to the single indirect", sector);
            block.entries[block.num_sectors as usize] = sector;
            block.num_sectors += 1;
            self.num_sectors += 1;
        }
        block.write_back(self.single_indirect, ctx);
        if self.num_sectors as usize == new_sectors {
            return Ok(());
        }

        // Double indirect.
        let fresh = self.double_indirect == 0;
        if fresh {
            self.double_indirect = Self::take(freemap, taken)?;
            log::trace!("creating the double indirect at sector {}", self.double_indirect);
        }
        let mut outer = if fresh {
            IndirectBlock::new()
        } else {
            IndirectBlock::fetch_from(self.double_indirect, ctx)
        };
        while (self.num_sectors as usize) < new_sectors {
            let local = self.num_sectors as usize - NUM_DIRECT - NUM_INDIRECT;
            let slot = local / NUM_INDIRECT;
            let fresh_inner = slot >= outer.num_sectors as usize;
            if fresh_inner {
                let sector = Self::take(freemap, taken)?;
                log::trace!("creating an inner indirect at sector {}", sector);
                outer.entries[slot] = sector;
                outer.num_sectors += 1;
            }
            let mut inner = if fresh_inner {
                IndirectBlock::new()
            } else {
                IndirectBlock::fetch_from(outer.entries[slot], ctx)
            };
            while (self.num_sectors as usize) < new_sectors
                && (inner.num_sectors as usize) < NUM_INDIRECT
            {
                let sector = Self::take(freemap, taken)?;
                inner.entries[inner.num_sectors as usize] = sector;
                inner.num_sectors += 1;
                self.num_sectors += 1;
            }
            inner.write_back(outer.entries[slot], ctx);
        }
        outer.write_back(self.double_indirect, ctx);
        Ok(())
    }

    /// Returns every sector reachable from the header to the free map:
    /// data sectors first, then the indirect meta sectors. Idempotent;
    /// sectors already clear are left alone.
    pub fn deallocate(&self, freemap: &mut FreeMap, ctx: &KernelCtx) {
        for vs in 0..self.num_sectors as usize {
            let sector = self.sector_of(vs, ctx);
            if freemap.test(sector) {
                freemap.clear(sector);
            }
        }
        if self.single_indirect != 0 && freemap.test(self.single_indirect) {
            freemap.clear(self.single_indirect);
        }
        if self.double_indirect != 0 {
            let outer = IndirectBlock::fetch_from(self.double_indirect, ctx);
            for slot in 0..outer.num_sectors as usize {
                let inner = outer.entries[slot];
                if freemap.test(inner) {
                    freemap.clear(inner);
                }
            }
            if freemap.test(self.double_indirect) {
                freemap.clear(self.double_indirect);
            }
        }
    }
}
