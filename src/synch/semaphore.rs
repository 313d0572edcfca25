//! Counting semaphores.

use std::collections::VecDeque;

use crate::intr::IntrCell;
use crate::kernel::KernelCtx;
use crate::thread::Tid;

struct SemInner {
    value: usize,
    queue: VecDeque<Tid>,
}

/// A non-negative counter with a blocking decrement and a waking
/// increment. Waiters are woken in FIFO order.
pub struct Semaphore {
    name: &'static str,
    inner: IntrCell<SemInner>,
}

impl Semaphore {
    pub fn new(name: &'static str, value: usize) -> Self {
        Self {
            name,
            inner: IntrCell::new(SemInner {
                value,
                queue: VecDeque::new(),
            }),
        }
    }

    /// Waits until the value is positive, then decrements it.
    ///
    /// The check and the decrement must be atomic, so interrupts are
    /// disabled for the whole operation. `sleep` assumes they are off.
    pub fn p(&self, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        while self.inner.get_mut(&mut intr).value == 0 {
            let tid = ctx.tid();
            self.inner.get_mut(&mut intr).queue.push_back(tid);
            ctx.kernel().scheduler().note_enqueued(tid, &mut intr);
            log::trace!("thread {} blocking on semaphore \"{}\"", tid, self.name);
            ctx.kernel().scheduler().sleep(ctx, &mut intr);
        }
        self.inner.get_mut(&mut intr).value -= 1;
    }

    /// Increments the value, first waking the head waiter if there is
    /// one, so the wakeup consumes this V.
    pub fn v(&self, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        let waiter = self.inner.get_mut(&mut intr).queue.pop_front();
        if let Some(tid) = waiter {
            ctx.kernel().scheduler().ready_to_run(tid, &mut intr);
        }
        self.inner.get_mut(&mut intr).value += 1;
    }

    pub fn value(&self, ctx: &KernelCtx) -> usize {
        let intr = ctx.intr_off();
        self.inner.get(&intr).value
    }

    pub fn waiters(&self, ctx: &KernelCtx) -> usize {
        let intr = ctx.intr_off();
        self.inner.get(&intr).queue.len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::intr::IntrCell;
    use crate::kernel::{Kernel, KernelCtx, KernelParams};

    fn boot() -> KernelCtx {
        Kernel::new(KernelParams::default()).main_ctx()
    }

    #[test]
    fn value_tracks_p_and_v_counts() {
        let ctx = boot();
        let sem = Semaphore::new("sem", 2);
        sem.p(&ctx);
        sem.p(&ctx);
        sem.v(&ctx);
        sem.v(&ctx);
        sem.v(&ctx);
        assert_eq!(sem.value(&ctx), 3);
        assert_eq!(sem.waiters(&ctx), 0);
    }

    #[test]
    fn blocked_waiters_wake_in_fifo_order() {
        let ctx = boot();
        let sem = Arc::new(Semaphore::new("sem", 0));
        let done = Arc::new(Semaphore::new("done", 0));
        let order = Arc::new(IntrCell::new(Vec::new()));
        for i in 0..3 {
            let sem = Arc::clone(&sem);
            let done = Arc::clone(&done);
            let order = Arc::clone(&order);
            ctx.fork(&format!("waiter {}", i), move |ctx| {
                sem.p(ctx);
                let mut intr = ctx.intr_off();
                order.get_mut(&mut intr).push(i);
                drop(intr);
                done.v(ctx);
            });
        }
        // One yield runs each forked thread up to its blocking P.
        ctx.yield_now();
        assert_eq!(sem.waiters(&ctx), 3);
        for _ in 0..3 {
            sem.v(&ctx);
        }
        for _ in 0..3 {
            done.p(&ctx);
        }
        let intr = ctx.intr_off();
        assert_eq!(*order.get(&intr), vec![0, 1, 2]);
    }

    #[test]
    fn v_before_p_never_blocks() {
        let ctx = boot();
        let sem = Semaphore::new("sem", 0);
        sem.v(&ctx);
        sem.p(&ctx);
        assert_eq!(sem.value(&ctx), 0);
    }
}
