//! The FIFO scheduler and the context-switch machinery.
//!
//! Every kernel thread is backed by a host thread, but the kernel is
//! still a uniprocessor: a baton is handed from the switching-out
//! thread to the switching-in one, and a thread only executes kernel
//! code while it holds the baton. Blocking means parking the host
//! thread until some other thread passes the baton back via
//! `ready_to_run` and a later switch.
//!
//! A switch also moves the machine's user-mode register file: the
//! outgoing thread's registers are saved into its table entry and the
//! incoming thread's are loaded, for threads bound to a process.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread as host;

use crate::intr::IntrGuard;
use crate::kernel::{Kernel, KernelCtx};
use crate::machine::NUM_TOTAL_REGS;
use crate::proc::ProcId;

/// Index of a kernel thread in the scheduler's table.
pub type Tid = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Finished,
}

/// Saved user-mode CPU state for a thread attached to a process.
struct UserContext {
    proc: ProcId,
    registers: [u32; NUM_TOTAL_REGS],
}

struct ThreadEntry {
    name: String,
    state: ThreadState,
    baton: Arc<Baton>,
    /// Whether the thread sits on some wait queue. A thread may be on
    /// at most one queue at a time.
    queued: bool,
    user: Option<UserContext>,
}

/// The hand-off primitive between host threads. `wait` parks until a
/// matching `hand`; the mutex also orders all kernel-state writes of
/// the switching-out thread before the switching-in thread resumes.
struct Baton {
    run: Mutex<bool>,
    wake: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            run: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn hand(&self) {
        let mut run = self.run.lock().expect("baton mutex");
        *run = true;
        self.wake.notify_one();
    }

    fn wait(&self) {
        let mut run = self.run.lock().expect("baton mutex");
        while !*run {
            run = self.wake.wait(run).expect("baton mutex");
        }
        *run = false;
    }
}

struct SchedState {
    threads: Vec<ThreadEntry>,
    ready: VecDeque<Tid>,
    current: Tid,
}

impl SchedState {
    /// Saves the machine's registers into `from` and installs `to`'s,
    /// for whichever of the two carries a user context.
    fn swap_user_context(
        &mut self,
        from: Tid,
        to: Tid,
        kernel: &Kernel,
        intr: &mut IntrGuard<'_>,
    ) {
        if let Some(user) = self.threads[from].user.as_mut() {
            user.registers = kernel.machine().save_registers(intr);
        }
        if let Some(user) = self.threads[to].user.as_ref() {
            kernel.machine().load_registers(&user.registers, intr);
        }
    }

    /// Picks the next thread off the ready queue and makes it current.
    /// Returns the batons to hand to and to wait on.
    fn switch_from(
        &mut self,
        tid: Tid,
        kernel: &Kernel,
        intr: &mut IntrGuard<'_>,
    ) -> (Arc<Baton>, Arc<Baton>) {
        let next = self
            .ready
            .pop_front()
            .unwrap_or_else(|| panic!("deadlock: thread {} blocked with no ready thread", tid));
        self.threads[next].state = ThreadState::Running;
        self.current = next;
        self.swap_user_context(tid, next, kernel, intr);
        (self.threads[next].baton.clone(), self.threads[tid].baton.clone())
    }
}

/// The scheduler: a thread table and a FIFO ready queue.
pub struct Scheduler {
    state: spin::Mutex<SchedState>,
}

impl Scheduler {
    /// Builds a scheduler whose thread 0 is the calling host thread.
    pub(crate) fn new() -> Self {
        let main = ThreadEntry {
            name: "main".to_string(),
            state: ThreadState::Running,
            baton: Arc::new(Baton::new()),
            queued: false,
            user: None,
        };
        Self {
            state: spin::Mutex::new(SchedState {
                threads: vec![main],
                ready: VecDeque::new(),
                current: 0,
            }),
        }
    }

    /// Creates a new kernel thread and appends it to the ready queue.
    /// The thread first runs when a switch selects it; it enters `f`
    /// with interrupts enabled and finishes when `f` returns.
    pub fn fork(
        &self,
        kernel: &Arc<Kernel>,
        name: &str,
        proc: Option<ProcId>,
        f: Box<dyn FnOnce(&KernelCtx) + Send>,
    ) -> Tid {
        let _intr = IntrGuard::new(kernel);
        let baton = Arc::new(Baton::new());
        let tid = {
            let mut st = self.state.lock();
            let tid = st.threads.len();
            st.threads.push(ThreadEntry {
                name: name.to_string(),
                state: ThreadState::Ready,
                baton: Arc::clone(&baton),
                queued: false,
                user: proc.map(|p| UserContext {
                    proc: p,
                    registers: [0; NUM_TOTAL_REGS],
                }),
            });
            st.ready.push_back(tid);
            tid
        };
        log::trace!("forking thread {} \"{}\"", tid, name);

        let kernel = Arc::clone(kernel);
        host::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                baton.wait();
                let ctx = KernelCtx::new(kernel, tid);
                ctx.kernel().intr_state().enable();
                f(&ctx);
                ctx.kernel().scheduler().finish(&ctx);
            })
            .expect("spawning a host thread");
        tid
    }

    /// Puts a blocked thread back on the ready queue. Must be called
    /// with interrupts disabled.
    pub fn ready_to_run(&self, tid: Tid, _intr: &mut IntrGuard<'_>) {
        let mut st = self.state.lock();
        let entry = &mut st.threads[tid];
        assert_eq!(
            entry.state,
            ThreadState::Blocked,
            "ready_to_run on a thread that is not blocked"
        );
        entry.queued = false;
        entry.state = ThreadState::Ready;
        st.ready.push_back(tid);
    }

    /// Records that a thread was placed on a wait queue. Debug builds
    /// reject a thread being placed on two queues.
    pub(crate) fn note_enqueued(&self, tid: Tid, _intr: &mut IntrGuard<'_>) {
        let mut st = self.state.lock();
        debug_assert!(!st.threads[tid].queued, "thread on two wait queues");
        st.threads[tid].queued = true;
    }

    /// Blocks the current thread. Must be called with interrupts
    /// disabled, after the caller has put the thread on some wait
    /// queue; returns once another thread calls `ready_to_run` on it
    /// and a switch selects it, still with interrupts disabled.
    pub fn sleep(&self, ctx: &KernelCtx, intr: &mut IntrGuard<'_>) {
        assert!(
            !ctx.kernel().intr_state().get(),
            "sleep with interrupts enabled"
        );
        let tid = ctx.tid();
        let (to, from) = {
            let mut st = self.state.lock();
            assert_eq!(st.current, tid);
            st.threads[tid].state = ThreadState::Blocked;
            st.switch_from(tid, ctx.kernel(), intr)
        };
        to.hand();
        from.wait();
    }

    /// Yields the CPU: the current thread goes to the back of the
    /// ready queue and the head runs. A no-op when nothing else is
    /// ready.
    pub fn yield_now(&self, ctx: &KernelCtx) {
        let mut intr = IntrGuard::new(ctx.kernel());
        let tid = ctx.tid();
        let switch = {
            let mut st = self.state.lock();
            assert_eq!(st.current, tid);
            if st.ready.is_empty() {
                None
            } else {
                st.threads[tid].state = ThreadState::Ready;
                st.ready.push_back(tid);
                Some(st.switch_from(tid, ctx.kernel(), &mut intr))
            }
        };
        if let Some((to, from)) = switch {
            to.hand();
            from.wait();
        }
    }

    /// Ends the current thread. Hands the baton onward and returns so
    /// the host thread can exit; the table entry stays `Finished`.
    pub(crate) fn finish(&self, ctx: &KernelCtx) {
        let intr = IntrGuard::new(ctx.kernel());
        let tid = ctx.tid();
        log::trace!("thread {} \"{}\" finishing", tid, self.name_of(tid));
        let to = {
            let mut st = self.state.lock();
            assert_eq!(st.current, tid);
            st.threads[tid].state = ThreadState::Finished;
            match st.ready.pop_front() {
                Some(next) => {
                    st.threads[next].state = ThreadState::Running;
                    st.current = next;
                    let mut intr = intr;
                    st.swap_user_context(tid, next, ctx.kernel(), &mut intr);
                    mem::forget(intr);
                    Some(st.threads[next].baton.clone())
                }
                None => {
                    assert!(
                        !st.threads.iter().any(|t| t.state == ThreadState::Blocked),
                        "deadlock: last runnable thread finished with blocked threads left"
                    );
                    mem::forget(intr);
                    None
                }
            }
        };
        if let Some(to) = to {
            to.hand();
        }
    }

    pub fn current(&self) -> Tid {
        self.state.lock().current
    }

    pub fn name_of(&self, tid: Tid) -> String {
        self.state.lock().threads[tid].name.clone()
    }

    pub fn state_of(&self, tid: Tid) -> ThreadState {
        self.state.lock().threads[tid].state
    }

    /// The process a thread is running user code for, if any.
    pub fn proc_of(&self, tid: Tid) -> Option<ProcId> {
        self.state.lock().threads[tid].user.as_ref().map(|u| u.proc)
    }

    /// Attaches the given thread to a process, with a zeroed register
    /// file. Used when installing the root process on the boot thread.
    pub(crate) fn bind_user(&self, tid: Tid, proc: ProcId) {
        let mut st = self.state.lock();
        st.threads[tid].user = Some(UserContext {
            proc,
            registers: [0; NUM_TOTAL_REGS],
        });
    }

    pub(crate) fn unbind_user(&self, tid: Tid) {
        self.state.lock().threads[tid].user = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::intr::IntrCell;
    use crate::kernel::{Kernel, KernelParams};
    use crate::synch::Semaphore;

    fn boot() -> KernelCtx {
        Kernel::new(KernelParams::default()).main_ctx()
    }

    #[test]
    fn forked_threads_run_in_fork_order() {
        let ctx = boot();
        let order = Arc::new(IntrCell::new(Vec::new()));
        let done = Arc::new(Semaphore::new("done", 0));
        for i in 0..3 {
            let order = Arc::clone(&order);
            let done = Arc::clone(&done);
            ctx.fork(&format!("t{}", i), move |ctx| {
                let mut intr = ctx.intr_off();
                order.get_mut(&mut intr).push(i);
                drop(intr);
                done.v(ctx);
            });
        }
        for _ in 0..3 {
            done.p(&ctx);
        }
        let intr = ctx.intr_off();
        assert_eq!(*order.get(&intr), vec![0, 1, 2]);
    }

    #[test]
    fn yield_alternates_between_ready_threads() {
        let ctx = boot();
        let trace = Arc::new(IntrCell::new(Vec::new()));
        let done = Arc::new(Semaphore::new("done", 0));
        for id in 0..2 {
            let trace = Arc::clone(&trace);
            let done = Arc::clone(&done);
            ctx.fork(&format!("pingpong {}", id), move |ctx| {
                for _ in 0..3 {
                    let mut intr = ctx.intr_off();
                    trace.get_mut(&mut intr).push(id);
                    drop(intr);
                    ctx.yield_now();
                }
                done.v(ctx);
            });
        }
        done.p(&ctx);
        done.p(&ctx);
        let intr = ctx.intr_off();
        assert_eq!(*trace.get(&intr), vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn thread_states_follow_the_lifecycle() {
        let ctx = boot();
        let done = Arc::new(Semaphore::new("done", 0));
        let tid = {
            let done = Arc::clone(&done);
            ctx.fork("short lived", move |ctx| {
                done.v(ctx);
            })
        };
        assert_eq!(ctx.kernel().scheduler().state_of(tid), ThreadState::Ready);
        // The forked thread finishes before handing the CPU back.
        done.p(&ctx);
        assert_eq!(ctx.kernel().scheduler().state_of(tid), ThreadState::Finished);
        assert_eq!(
            ctx.kernel().scheduler().state_of(ctx.tid()),
            ThreadState::Running
        );
    }

    #[test]
    fn names_are_kept_for_debugging() {
        let ctx = boot();
        assert_eq!(ctx.kernel().scheduler().name_of(0), "main");
    }
}
