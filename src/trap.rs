//! Entry into the kernel from user programs.
//!
//! Control transfers here when user code executes a syscall
//! instruction. The calling convention: the syscall number arrives in
//! r2, arguments 1..4 in r4..r7, and any result goes back in r2. The
//! program counter must be advanced past the syscall before resuming,
//! or the program would loop making the same call forever.
//!
//! Anything else the CPU cannot handle (bad addresses, arithmetic
//! errors) is a fatal kernel assertion here. A syscall that fails in a
//! non-fatal way shuts the machine down and disposes of the current
//! process; a kinder kernel would kill only the offending process.

use crate::kernel::KernelCtx;
use crate::machine::{
    Exception, ARG1_REG, ARG2_REG, ARG3_REG, ARG4_REG, RET_REG,
};
use crate::syscall::{self, Handled};

/// What the machine's run loop should do after a trap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrapOutcome {
    /// Resume the interpreter.
    Continue,
    /// The current thread's user program is over; unwind so the
    /// kernel thread can finish.
    ThreadExit,
    /// The machine is halted.
    Shutdown,
}

pub fn handle_exception(e: Exception, ctx: &KernelCtx) -> TrapOutcome {
    assert_eq!(e, Exception::Syscall, "unexpected user mode exception {:?}", e);

    let machine = ctx.kernel().machine();
    let num = machine.read_register(RET_REG, ctx);
    let args = [
        machine.read_register(ARG1_REG, ctx),
        machine.read_register(ARG2_REG, ctx),
        machine.read_register(ARG3_REG, ctx),
        machine.read_register(ARG4_REG, ctx),
    ];
    log::trace!("syscall {} args {:?} (thread {})", num, args, ctx.tid());

    match syscall::dispatch(num, args, ctx) {
        Ok(Handled::Value(v)) => {
            machine.write_register(RET_REG, v, ctx);
            machine.advance_pc(ctx);
            TrapOutcome::Continue
        }
        Ok(Handled::Done) => {
            machine.advance_pc(ctx);
            TrapOutcome::Continue
        }
        Ok(Handled::Halt) => {
            machine.halt(ctx);
            TrapOutcome::Shutdown
        }
        Ok(Handled::ProcessComplete) => TrapOutcome::Shutdown,
        Ok(Handled::ThreadExit) => TrapOutcome::ThreadExit,
        Err(e) => {
            log::warn!("error in user program: {}; shutting down", e);
            machine.advance_pc(ctx);
            if let Some(pid) = ctx.kernel().scheduler().proc_of(ctx.tid()) {
                ctx.kernel().dispose_process(pid, ctx);
            }
            machine.halt(ctx);
            TrapOutcome::Shutdown
        }
    }
}
