//! The synchronous console.
//!
//! The underlying character device is asynchronous: it moves one byte
//! at a time and signals completion through an interrupt callback. The
//! callbacks V two semaphores handed to the device at construction,
//! and `SynchConsole` turns that into blocking whole-buffer reads and
//! writes, with a lock so the bytes of one call stay contiguous in the
//! stream. Interleaving between calls is at line granularity.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use crate::intr::IntrCell;
use crate::kernel::KernelCtx;
use crate::synch::{Lock, Semaphore};

/// The asynchronous character device. `get_char` may only be called
/// after the read-available semaphore was V'd; `put_char` completes by
/// V'ing the write-done semaphore.
pub trait CharDevice: Send + Sync {
    fn put_char(&self, c: u8, ctx: &KernelCtx);
    fn get_char(&self, ctx: &KernelCtx) -> u8;
}

struct SimConsoleState {
    input: IntrCell<VecDeque<u8>>,
    output: IntrCell<Vec<u8>>,
    read_avail: Arc<Semaphore>,
    write_done: Arc<Semaphore>,
}

/// The simulated console device: input is scripted, output is
/// captured, and every request completes (and raises its completion
/// interrupt) before returning.
#[derive(Clone)]
pub struct SimConsole {
    state: Arc<SimConsoleState>,
}

impl SimConsole {
    pub(crate) fn new(read_avail: Arc<Semaphore>, write_done: Arc<Semaphore>) -> Self {
        Self {
            state: Arc::new(SimConsoleState {
                input: IntrCell::new(VecDeque::new()),
                output: IntrCell::new(Vec::new()),
                read_avail,
                write_done,
            }),
        }
    }

    /// Makes `bytes` arrive on the console input, one read-available
    /// interrupt per byte.
    pub fn feed_input(&self, bytes: &[u8], ctx: &KernelCtx) {
        {
            let mut intr = ctx.intr_off();
            self.state.input.get_mut(&mut intr).extend(bytes);
        }
        for _ in bytes {
            self.state.read_avail.v(ctx);
        }
    }

    /// Drains everything written so far.
    pub fn take_output(&self, ctx: &KernelCtx) -> Vec<u8> {
        let mut intr = ctx.intr_off();
        mem::take(self.state.output.get_mut(&mut intr))
    }
}

impl CharDevice for SimConsole {
    fn put_char(&self, c: u8, ctx: &KernelCtx) {
        {
            let mut intr = ctx.intr_off();
            self.state.output.get_mut(&mut intr).push(c);
        }
        self.state.write_done.v(ctx);
    }

    fn get_char(&self, ctx: &KernelCtx) -> u8 {
        let mut intr = ctx.intr_off();
        self.state
            .input
            .get_mut(&mut intr)
            .pop_front()
            .expect("console read with no input available")
    }
}

/// Blocking, serialised access to the character device.
pub struct SynchConsole {
    lock: Lock,
    read_avail: Arc<Semaphore>,
    write_done: Arc<Semaphore>,
    device: Box<dyn CharDevice>,
}

impl SynchConsole {
    pub(crate) fn new(
        device: Box<dyn CharDevice>,
        read_avail: Arc<Semaphore>,
        write_done: Arc<Semaphore>,
    ) -> Self {
        Self {
            lock: Lock::new("synch console"),
            read_avail,
            write_done,
            device,
        }
    }

    /// Fills `dst`, one character per read-available interrupt.
    pub fn read_line(&self, dst: &mut [u8], ctx: &KernelCtx) {
        self.lock.acquire(ctx);
        for slot in dst.iter_mut() {
            self.read_avail.p(ctx);
            *slot = self.device.get_char(ctx);
        }
        self.lock.release(ctx);
    }

    /// Emits `src`, waiting out the write-done interrupt per character.
    pub fn write_line(&self, src: &[u8], ctx: &KernelCtx) {
        self.lock.acquire(ctx);
        for &c in src {
            self.device.put_char(c, ctx);
            self.write_done.p(ctx);
        }
        self.lock.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::kernel::{Kernel, KernelCtx, KernelParams};
    use crate::synch::Semaphore;

    fn boot() -> KernelCtx {
        Kernel::new(KernelParams::default()).main_ctx()
    }

    #[test]
    fn write_line_reaches_the_device_in_order() {
        let ctx = boot();
        ctx.kernel().console().write_line(b"hello world", &ctx);
        assert_eq!(ctx.kernel().sim_console().take_output(&ctx), b"hello world");
    }

    #[test]
    fn read_line_drains_fed_input() {
        let ctx = boot();
        ctx.kernel().sim_console().feed_input(b"abc", &ctx);
        let mut buf = [0u8; 3];
        ctx.kernel().console().read_line(&mut buf, &ctx);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn read_line_blocks_until_input_arrives() {
        let ctx = boot();
        let done = Arc::new(Semaphore::new("done", 0));
        {
            let done = Arc::clone(&done);
            ctx.fork("reader", move |ctx| {
                let mut buf = [0u8; 2];
                ctx.kernel().console().read_line(&mut buf, ctx);
                assert_eq!(&buf, b"ok");
                done.v(ctx);
            });
        }
        // Reader blocks on the read-available semaphore.
        ctx.yield_now();
        ctx.kernel().sim_console().feed_input(b"ok", &ctx);
        done.p(&ctx);
    }

    #[test]
    fn whole_calls_stay_contiguous() {
        let ctx = boot();
        let done = Arc::new(Semaphore::new("done", 0));
        for (name, text) in [("a", b"aaaa".as_ref()), ("b", b"bbbb".as_ref())] {
            let done = Arc::clone(&done);
            ctx.fork(name, move |ctx| {
                ctx.kernel().console().write_line(text, ctx);
                done.v(ctx);
            });
        }
        done.p(&ctx);
        done.p(&ctx);
        let out = ctx.kernel().sim_console().take_output(&ctx);
        assert!(out == b"aaaabbbb" || out == b"bbbbaaaa");
    }
}
