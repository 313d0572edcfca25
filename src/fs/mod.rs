//! The file system: a free-sector map, a single flat directory, and
//! files located by their headers.
//!
//! Directory lookups run under the read side of a readers/writers
//! lock; create and remove take the write side. The free map and every
//! header extension are serialised by one metadata lock. The free map
//! and directory live in kernel memory for the life of the simulated
//! disk; headers, indirect blocks, and file data live on the disk
//! itself, with sector 0 reserved so a zero sector index can mean
//! "none".

use arrayvec::{ArrayString, ArrayVec};
use bitmaps::Bitmap;

use crate::error::SysError;
use crate::intr::IntrCell;
use crate::kernel::KernelCtx;
use crate::param::{MAX_FILE_NAME, NUM_DIR_ENTRIES, NUM_SECTORS};
use crate::synch::{Lock, RwLock};

mod filehdr;
mod openfile;

pub use filehdr::FileHeader;
pub use openfile::OpenFile;

/// The set of free disk sectors.
pub struct FreeMap {
    map: Bitmap<NUM_SECTORS>,
}

impl FreeMap {
    /// A fresh map with only the reserved sector 0 taken.
    pub fn new() -> Self {
        let mut map = Bitmap::new();
        let _ = map.set(0, true);
        Self { map }
    }

    /// Takes the lowest free sector.
    pub fn find(&mut self) -> Option<u32> {
        let sector = self.map.first_false_index()?;
        let _ = self.map.set(sector, true);
        Some(sector as u32)
    }

    pub fn clear(&mut self, sector: u32) {
        let was = self.map.set(sector as usize, false);
        assert!(was, "clearing sector {} that was not allocated", sector);
    }

    pub fn test(&self, sector: u32) -> bool {
        self.map.get(sector as usize)
    }

    pub fn count_free(&self) -> usize {
        NUM_SECTORS - self.map.len()
    }
}

impl Default for FreeMap {
    fn default() -> Self {
        Self::new()
    }
}

struct DirEntry {
    name: ArrayString<MAX_FILE_NAME>,
    sector: u32,
}

/// The flat directory: file name -> header sector.
struct Directory {
    entries: ArrayVec<DirEntry, NUM_DIR_ENTRIES>,
}

impl Directory {
    fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    fn find(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.name.as_str() == name)
            .map(|e| e.sector)
    }

    fn add(&mut self, name: ArrayString<MAX_FILE_NAME>, sector: u32) {
        self.entries.push(DirEntry { name, sector });
    }

    fn remove(&mut self, name: &str) -> Option<u32> {
        let at = self.entries.iter().position(|e| e.name.as_str() == name)?;
        Some(self.entries.remove(at).sector)
    }
}

pub struct FileSystem {
    /// Serialises free-map use and header extension.
    meta: Lock,
    dir_lock: RwLock,
    /// Only touched while `meta` is held (or, for the directory's own
    /// header bookkeeping, under `dir_lock` write side).
    freemap: IntrCell<FreeMap>,
    dir: IntrCell<Directory>,
}

impl FileSystem {
    pub(crate) fn new() -> Self {
        Self {
            meta: Lock::new("fs meta"),
            dir_lock: RwLock::new("fs directory"),
            freemap: IntrCell::new(FreeMap::new()),
            dir: IntrCell::new(Directory::new()),
        }
    }

    fn checked_name(name: &str) -> Result<ArrayString<MAX_FILE_NAME>, SysError> {
        if name.is_empty() {
            return Err(SysError::EmptyFileName);
        }
        ArrayString::from(name).map_err(|_| SysError::NameTooLong)
    }

    /// Creates a file with `initial_bytes` of space.
    pub fn create(&self, name: &str, initial_bytes: u32, ctx: &KernelCtx) -> Result<(), SysError> {
        let name = Self::checked_name(name)?;
        log::debug!("creating file \"{}\" ({} bytes)", name, initial_bytes);
        self.dir_lock.write_lock(ctx);
        let result = self.create_locked(name, initial_bytes, ctx);
        self.dir_lock.write_unlock(ctx);
        result
    }

    fn create_locked(
        &self,
        name: ArrayString<MAX_FILE_NAME>,
        initial_bytes: u32,
        ctx: &KernelCtx,
    ) -> Result<(), SysError> {
        {
            let intr = ctx.intr_off();
            let dir = self.dir.get(&intr);
            if dir.find(name.as_str()).is_some() {
                return Err(SysError::FileExists);
            }
            if dir.entries.is_full() {
                return Err(SysError::DirectoryFull);
            }
        }

        self.meta.acquire(ctx);
        let result = self.alloc_header(initial_bytes, ctx);
        self.meta.release(ctx);
        let hdr_sector = result?;

        let mut intr = ctx.intr_off();
        self.dir.get_mut(&mut intr).add(name, hdr_sector);
        Ok(())
    }

    /// Takes a header sector, sizes the new file, and writes the
    /// header out. Caller holds `meta`.
    fn alloc_header(&self, initial_bytes: u32, ctx: &KernelCtx) -> Result<u32, SysError> {
        let mut intr = ctx.intr_off();
        let freemap = self.freemap.get_mut(&mut intr);
        let hdr_sector = freemap.find().ok_or(SysError::NoSpace)?;
        let mut hdr = FileHeader::new();
        match hdr.allocate(freemap, initial_bytes, ctx) {
            Ok(()) => {
                hdr.write_back(hdr_sector, ctx);
                Ok(hdr_sector)
            }
            Err(e) => {
                freemap.clear(hdr_sector);
                Err(e)
            }
        }
    }

    /// Opens an existing file.
    pub fn open(&self, name: &str, ctx: &KernelCtx) -> Result<OpenFile, SysError> {
        let name = Self::checked_name(name)?;
        self.dir_lock.read_lock(ctx);
        let sector = {
            let intr = ctx.intr_off();
            self.dir.get(&intr).find(name.as_str())
        };
        self.dir_lock.read_unlock(ctx);
        let sector = sector.ok_or(SysError::FileNotFound)?;
        log::debug!("opening file \"{}\" (header sector {})", name, sector);
        Ok(OpenFile::new(FileHeader::fetch_from(sector, ctx), sector))
    }

    /// Deletes a file, returning all its sectors to the free map.
    pub fn remove(&self, name: &str, ctx: &KernelCtx) -> Result<(), SysError> {
        let name = Self::checked_name(name)?;
        self.dir_lock.write_lock(ctx);
        let sector = {
            let mut intr = ctx.intr_off();
            self.dir.get_mut(&mut intr).remove(name.as_str())
        };
        self.dir_lock.write_unlock(ctx);
        let sector = sector.ok_or(SysError::FileNotFound)?;

        log::debug!("removing file \"{}\" (header sector {})", name, sector);
        let hdr = FileHeader::fetch_from(sector, ctx);
        self.meta.acquire(ctx);
        {
            let mut intr = ctx.intr_off();
            let freemap = self.freemap.get_mut(&mut intr);
            hdr.deallocate(freemap, ctx);
            freemap.clear(sector);
        }
        self.meta.release(ctx);
        Ok(())
    }

    /// Grows an open file's header and writes it back, under the
    /// metadata lock.
    pub(crate) fn extend(
        &self,
        hdr: &mut FileHeader,
        hdr_sector: u32,
        extra_bytes: u32,
        ctx: &KernelCtx,
    ) -> Result<(), SysError> {
        self.meta.acquire(ctx);
        let result = {
            let mut intr = ctx.intr_off();
            hdr.allocate(self.freemap.get_mut(&mut intr), extra_bytes, ctx)
        };
        if result.is_ok() {
            hdr.write_back(hdr_sector, ctx);
        }
        self.meta.release(ctx);
        result
    }

    /// Free sectors left on the disk.
    pub fn free_sectors(&self, ctx: &KernelCtx) -> usize {
        let intr = ctx.intr_off();
        self.freemap.get(&intr).count_free()
    }
}
