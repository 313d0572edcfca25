//! Syscall numbers and the dispatch table.

use crate::error::SysError;
use crate::kernel::KernelCtx;

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_JOIN: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_OPEN: u32 = 5;
pub const SYS_READ: u32 = 6;
pub const SYS_WRITE: u32 = 7;
pub const SYS_CLOSE: u32 = 8;
pub const SYS_FORK: u32 = 9;
pub const SYS_YIELD: u32 = 10;

/// What a serviced syscall asks the trap handler to do next.
pub(crate) enum Handled {
    /// Write the value to the result register and keep running.
    Value(u32),
    /// Keep running.
    Done,
    /// The Halt syscall: stop the machine.
    Halt,
    /// The process completed and the machine is already halted.
    ProcessComplete,
    /// Only the current thread's user program is over.
    ThreadExit,
}

pub(crate) fn dispatch(num: u32, args: [u32; 4], ctx: &KernelCtx) -> Result<Handled, SysError> {
    match num {
        SYS_HALT => {
            log::debug!("shutdown, initiated by user program");
            Ok(Handled::Halt)
        }
        SYS_EXIT => {
            if ctx.exit_process(args[0] as i32) {
                Ok(Handled::ProcessComplete)
            } else {
                Ok(Handled::ThreadExit)
            }
        }
        SYS_CREATE => {
            ctx.file_create(args[0])?;
            Ok(Handled::Done)
        }
        SYS_OPEN => Ok(Handled::Value(ctx.file_open(args[0])?)),
        SYS_READ => Ok(Handled::Value(ctx.file_read(args[0], args[1], args[2])?)),
        SYS_WRITE => {
            ctx.file_write(args[0], args[1], args[2])?;
            Ok(Handled::Done)
        }
        SYS_CLOSE => {
            ctx.file_close(args[0])?;
            Ok(Handled::Done)
        }
        SYS_FORK => {
            ctx.process_fork(args[0])?;
            Ok(Handled::Done)
        }
        SYS_YIELD => {
            ctx.process_yield();
            Ok(Handled::Done)
        }
        // Exec and Join have numbers but no implementation.
        _ => Err(SysError::UnknownSyscall),
    }
}
