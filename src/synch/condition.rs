//! Condition variables, Mesa style.
//!
//! A condition variable is not bound to a lock at construction; every
//! `wait` names the lock to release and reacquire. A woken waiter does
//! not run until the signaller gives up the lock, and some other
//! thread may consume the resource in between, so waiters must re-test
//! their predicate: `while !p { cond.wait(&lock, ctx) }`.

use std::collections::VecDeque;

use crate::intr::IntrCell;
use crate::kernel::KernelCtx;
use crate::synch::Lock;
use crate::thread::Tid;

pub struct Condition {
    name: &'static str,
    queue: IntrCell<VecDeque<Tid>>,
}

impl Condition {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: IntrCell::new(VecDeque::new()),
        }
    }

    /// Atomically enqueues the caller, releases `lock`, and sleeps;
    /// reacquires `lock` before returning. The caller must hold
    /// `lock`.
    pub fn wait(&self, lock: &Lock, ctx: &KernelCtx) {
        assert!(
            lock.held_by_current(ctx),
            "wait on condition \"{}\" without holding lock \"{}\"",
            self.name,
            lock.name()
        );
        let mut intr = ctx.intr_off();
        let tid = ctx.tid();
        self.queue.get_mut(&mut intr).push_back(tid);
        ctx.kernel().scheduler().note_enqueued(tid, &mut intr);
        log::trace!("thread {} waiting on condition \"{}\"", tid, self.name);
        lock.release(ctx);
        ctx.kernel().scheduler().sleep(ctx, &mut intr);
        drop(intr);
        lock.acquire(ctx);
    }

    /// Wakes the head waiter, if any. The signaller keeps the lock;
    /// the waiter runs once it can reacquire it.
    pub fn signal(&self, _lock: &Lock, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        let waiter = self.queue.get_mut(&mut intr).pop_front();
        if let Some(tid) = waiter {
            log::trace!("condition \"{}\" waking thread {}", self.name, tid);
            ctx.kernel().scheduler().ready_to_run(tid, &mut intr);
        }
    }

    /// Wakes every thread currently waiting.
    pub fn broadcast(&self, _lock: &Lock, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        while let Some(tid) = self.queue.get_mut(&mut intr).pop_front() {
            ctx.kernel().scheduler().ready_to_run(tid, &mut intr);
        }
    }

    pub fn waiters(&self, ctx: &KernelCtx) -> usize {
        let intr = ctx.intr_off();
        self.queue.get(&intr).len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
