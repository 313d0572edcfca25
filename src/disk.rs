//! The synchronous disk.
//!
//! Mirrors the console: the raw device moves one sector per request
//! and raises a completion interrupt, modelled as a V on the semaphore
//! given to the device at construction. `SynchDisk` serialises
//! requests behind a lock and sleeps until the completion arrives, so
//! callers see a plain blocking sector interface.

use std::sync::Arc;

use crate::intr::IntrCell;
use crate::kernel::KernelCtx;
use crate::param::SECTOR_SIZE;
use crate::synch::{Lock, Semaphore};

/// The asynchronous sector device. Completion of either request is
/// signalled by V'ing the semaphore the device was built with.
pub trait DiskDevice: Send + Sync {
    fn read_request(&self, sector: usize, dst: &mut [u8; SECTOR_SIZE], ctx: &KernelCtx);
    fn write_request(&self, sector: usize, src: &[u8; SECTOR_SIZE], ctx: &KernelCtx);
}

struct RamDiskState {
    sectors: IntrCell<Vec<[u8; SECTOR_SIZE]>>,
    done: Arc<Semaphore>,
}

/// The simulated disk: an in-memory sector array whose requests
/// complete, and raise the completion interrupt, before returning.
#[derive(Clone)]
pub struct RamDisk {
    state: Arc<RamDiskState>,
}

impl RamDisk {
    pub(crate) fn new(num_sectors: usize, done: Arc<Semaphore>) -> Self {
        Self {
            state: Arc::new(RamDiskState {
                sectors: IntrCell::new(vec![[0u8; SECTOR_SIZE]; num_sectors]),
                done,
            }),
        }
    }
}

impl DiskDevice for RamDisk {
    fn read_request(&self, sector: usize, dst: &mut [u8; SECTOR_SIZE], ctx: &KernelCtx) {
        {
            let intr = ctx.intr_off();
            *dst = self.state.sectors.get(&intr)[sector];
        }
        self.state.done.v(ctx);
    }

    fn write_request(&self, sector: usize, src: &[u8; SECTOR_SIZE], ctx: &KernelCtx) {
        {
            let mut intr = ctx.intr_off();
            self.state.sectors.get_mut(&mut intr)[sector] = *src;
        }
        self.state.done.v(ctx);
    }
}

/// Blocking sector I/O over the raw device, one request at a time.
pub struct SynchDisk {
    lock: Lock,
    request_done: Arc<Semaphore>,
    device: Box<dyn DiskDevice>,
}

impl SynchDisk {
    pub(crate) fn new(device: Box<dyn DiskDevice>, request_done: Arc<Semaphore>) -> Self {
        Self {
            lock: Lock::new("synch disk"),
            request_done,
            device,
        }
    }

    pub fn read_sector(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE], ctx: &KernelCtx) {
        self.lock.acquire(ctx);
        self.device.read_request(sector as usize, dst, ctx);
        self.request_done.p(ctx);
        self.lock.release(ctx);
    }

    pub fn write_sector(&self, sector: u32, src: &[u8; SECTOR_SIZE], ctx: &KernelCtx) {
        self.lock.acquire(ctx);
        self.device.write_request(sector as usize, src, ctx);
        self.request_done.p(ctx);
        self.lock.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::{Kernel, KernelCtx, KernelParams};
    use crate::param::SECTOR_SIZE;

    fn boot() -> KernelCtx {
        Kernel::new(KernelParams::default()).main_ctx()
    }

    #[test]
    fn sectors_round_trip() {
        let ctx = boot();
        let disk = ctx.kernel().disk();
        let mut out = [0u8; SECTOR_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = i as u8;
        }
        disk.write_sector(42, &out, &ctx);
        let mut back = [0u8; SECTOR_SIZE];
        disk.read_sector(42, &mut back, &ctx);
        assert_eq!(out, back);
    }

    #[test]
    fn fresh_sectors_read_as_zero() {
        let ctx = boot();
        let mut buf = [1u8; SECTOR_SIZE];
        ctx.kernel().disk().read_sector(9, &mut buf, &ctx);
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
    }
}
