//! Mutual-exclusion locks.

use crate::intr::IntrCell;
use crate::kernel::KernelCtx;
use crate::synch::Semaphore;
use crate::thread::Tid;

/// A mutex built from a binary semaphore plus an owner field. Only the
/// owner may release; releasing a lock the current thread does not
/// hold is a fatal error.
pub struct Lock {
    name: &'static str,
    owner: IntrCell<Option<Tid>>,
    sem: Semaphore,
}

impl Lock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            owner: IntrCell::new(None),
            sem: Semaphore::new(name, 1),
        }
    }

    /// Acquires the lock, sleeping while another thread holds it.
    pub fn acquire(&self, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        log::trace!("thread {} acquiring lock \"{}\"", ctx.tid(), self.name);
        self.sem.p(ctx);
        *self.owner.get_mut(&mut intr) = Some(ctx.tid());
    }

    /// Releases the lock and wakes the head waiter, if any.
    pub fn release(&self, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        log::trace!("thread {} releasing lock \"{}\"", ctx.tid(), self.name);
        assert_eq!(
            *self.owner.get(&intr),
            Some(ctx.tid()),
            "release of lock \"{}\" by a thread that does not hold it",
            self.name
        );
        *self.owner.get_mut(&mut intr) = None;
        self.sem.v(ctx);
    }

    pub fn held_by_current(&self, ctx: &KernelCtx) -> bool {
        let intr = ctx.intr_off();
        *self.owner.get(&intr) == Some(ctx.tid())
    }

    /// The thread currently holding the lock.
    pub fn owner(&self, ctx: &KernelCtx) -> Option<Tid> {
        let intr = ctx.intr_off();
        *self.owner.get(&intr)
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
    fn at_most_one_holder_under_contention() {
        let ctx = boot();
        let lock = Arc::new(Lock::new("counter"));
        let counter = Arc::new(IntrCell::new(0u32));
        let done = Arc::new(Semaphore::new("done", 0));
        for i in 0..5 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            let done = Arc::clone(&done);
            ctx.fork(&format!("worker {}", i), move |ctx| {
                for _ in 0..10 {
                    lock.acquire(ctx);
                    assert!(lock.held_by_current(ctx));
                    let read = {
                        let intr = ctx.intr_off();
                        *counter.get(&intr)
                    };
                    // Give everyone else a chance to race.
                    ctx.yield_now();
                    {
                        let mut intr = ctx.intr_off();
                        *counter.get_mut(&mut intr) = read + 1;
                    }
                    lock.release(ctx);
                }
                done.v(ctx);
            });
        }
        for _ in 0..5 {
            done.p(&ctx);
        }
        let intr = ctx.intr_off();
        assert_eq!(*counter.get(&intr), 50);
    }

    #[test]
    fn owner_is_visible_only_to_the_holder() {
        let ctx = boot();
        let lock = Arc::new(Lock::new("owned"));
        let done = Arc::new(Semaphore::new("done", 0));
        lock.acquire(&ctx);
        assert!(lock.held_by_current(&ctx));
        assert_eq!(lock.owner(&ctx), Some(ctx.tid()));
        {
            let lock = Arc::clone(&lock);
            let done = Arc::clone(&done);
            ctx.fork("observer", move |ctx| {
                assert!(!lock.held_by_current(ctx));
                done.v(ctx);
            });
        }
        done.p(&ctx);
        lock.release(&ctx);
        assert_eq!(lock.owner(&ctx), None);
    }

    #[test]
    #[should_panic]
    fn releasing_an_unheld_lock_is_fatal() {
        let ctx = boot();
        let lock = Lock::new("unheld");
        lock.release(&ctx);
    }
}
