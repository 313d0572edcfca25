//! Readers/writers lock: many concurrent readers or one writer.
//!
//! Readers and writers share a single condition variable, so a steady
//! stream of readers can starve a writer; that is accepted.

use crate::intr::IntrCell;
use crate::kernel::KernelCtx;
use crate::synch::{Condition, Lock};
use crate::thread::Tid;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RwStatus {
    Free,
    Read,
    Write,
}

struct RwState {
    readers: usize,
    status: RwStatus,
    write_owner: Option<Tid>,
}

pub struct RwLock {
    lock: Lock,
    cond: Condition,
    state: IntrCell<RwState>,
}

impl RwLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            lock: Lock::new(name),
            cond: Condition::new(name),
            state: IntrCell::new(RwState {
                readers: 0,
                status: RwStatus::Free,
                write_owner: None,
            }),
        }
    }

    pub fn read_lock(&self, ctx: &KernelCtx) {
        self.lock.acquire(ctx);
        loop {
            let mut intr = ctx.intr_off();
            let st = self.state.get_mut(&mut intr);
            if st.status == RwStatus::Write {
                drop(intr);
                self.cond.wait(&self.lock, ctx);
                continue;
            }
            if st.status == RwStatus::Free {
                assert_eq!(st.readers, 0);
                st.status = RwStatus::Read;
            }
            st.readers += 1;
            break;
        }
        self.lock.release(ctx);
    }

    pub fn read_unlock(&self, ctx: &KernelCtx) {
        self.lock.acquire(ctx);
        let last = {
            let mut intr = ctx.intr_off();
            let st = self.state.get_mut(&mut intr);
            assert_eq!(st.status, RwStatus::Read, "read_unlock without readers");
            st.readers -= 1;
            if st.readers == 0 {
                st.status = RwStatus::Free;
                true
            } else {
                false
            }
        };
        if last {
            self.cond.broadcast(&self.lock, ctx);
        }
        self.lock.release(ctx);
    }

    pub fn write_lock(&self, ctx: &KernelCtx) {
        self.lock.acquire(ctx);
        loop {
            let mut intr = ctx.intr_off();
            let st = self.state.get_mut(&mut intr);
            if st.status != RwStatus::Free {
                drop(intr);
                self.cond.wait(&self.lock, ctx);
                continue;
            }
            assert_eq!(st.readers, 0);
            assert_eq!(st.write_owner, None);
            st.status = RwStatus::Write;
            st.write_owner = Some(ctx.tid());
            break;
        }
        self.lock.release(ctx);
    }

    pub fn write_unlock(&self, ctx: &KernelCtx) {
        self.lock.acquire(ctx);
        {
            let mut intr = ctx.intr_off();
            let st = self.state.get_mut(&mut intr);
            assert_eq!(st.status, RwStatus::Write, "write_unlock without a writer");
            assert_eq!(st.readers, 0);
            assert_eq!(
                st.write_owner,
                Some(ctx.tid()),
                "write_unlock by a thread that does not hold the write lock"
            );
            st.status = RwStatus::Free;
            st.write_owner = None;
        }
        self.cond.broadcast(&self.lock, ctx);
        self.lock.release(ctx);
    }

    /// (readers, writer held) — for invariant checks.
    pub fn observe(&self, ctx: &KernelCtx) -> (usize, bool) {
        let intr = ctx.intr_off();
        let st = self.state.get(&intr);
        (st.readers, st.status == RwStatus::Write)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::intr::IntrCell;
    use crate::kernel::{Kernel, KernelCtx, KernelParams};
    use crate::synch::Semaphore;

    fn boot() -> KernelCtx {
        Kernel::new(KernelParams::default()).main_ctx()
    }

    #[derive(Default)]
    struct Census {
        readers_in: usize,
        writers_in: usize,
        max_readers: usize,
    }

    #[test]
    fn readers_share_and_writers_exclude() {
        let ctx = boot();
        let rw = Arc::new(RwLock::new("shared"));
        let census = Arc::new(IntrCell::new(Census::default()));
        let done = Arc::new(Semaphore::new("done", 0));

        for i in 0..4 {
            let rw = Arc::clone(&rw);
            let census = Arc::clone(&census);
            let done = Arc::clone(&done);
            ctx.fork(&format!("reader {}", i), move |ctx| {
                for _ in 0..5 {
                    rw.read_lock(ctx);
                    {
                        let mut intr = ctx.intr_off();
                        let c = census.get_mut(&mut intr);
                        c.readers_in += 1;
                        c.max_readers = c.max_readers.max(c.readers_in);
                        assert_eq!(c.writers_in, 0);
                    }
                    ctx.yield_now();
                    {
                        let mut intr = ctx.intr_off();
                        census.get_mut(&mut intr).readers_in -= 1;
                    }
                    rw.read_unlock(ctx);
                    ctx.yield_now();
                }
                done.v(ctx);
            });
        }
        for i in 0..2 {
            let rw = Arc::clone(&rw);
            let census = Arc::clone(&census);
            let done = Arc::clone(&done);
            ctx.fork(&format!("writer {}", i), move |ctx| {
                for _ in 0..5 {
                    rw.write_lock(ctx);
                    {
                        let mut intr = ctx.intr_off();
                        let c = census.get_mut(&mut intr);
                        c.writers_in += 1;
                        assert_eq!(c.writers_in, 1);
                        assert_eq!(c.readers_in, 0);
                    }
                    ctx.yield_now();
                    {
                        let mut intr = ctx.intr_off();
                        census.get_mut(&mut intr).writers_in -= 1;
                    }
                    rw.write_unlock(ctx);
                    ctx.yield_now();
                }
                done.v(ctx);
            });
        }

        for _ in 0..6 {
            done.p(&ctx);
        }
        let (readers, writer) = rw.observe(&ctx);
        assert_eq!((readers, writer), (0, false));
        let intr = ctx.intr_off();
        assert!(census.get(&intr).max_readers >= 2);
    }

    #[test]
    #[should_panic]
    fn unlocking_without_a_writer_is_fatal() {
        let ctx = boot();
        let rw = RwLock::new("rw");
        rw.write_unlock(&ctx);
    }
}
