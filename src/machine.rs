//! The simulated MIPS machine: register file, physical memory, and the
//! seam to the instruction interpreter.
//!
//! The kernel owns the machine state; the interpreter is an external
//! collaborator behind the `Simulator` trait. `Machine::run` drives it
//! until it raises an exception, services the trap, and resumes, until
//! the machine is halted. All interpreter-visible state lives in the
//! register file and memory, so the interpreter itself can be shared
//! by every user thread; a context switch saves and restores the
//! registers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SysError;
use crate::intr::{IntrCell, IntrGuard};
use crate::kernel::KernelCtx;
use crate::param::PAGE_SIZE;
use crate::trap::{self, TrapOutcome};

pub const NUM_GP_REGS: usize = 32;

/// r2 carries the syscall number in and the result out.
pub const RET_REG: usize = 2;
/// r4..r7 carry syscall arguments 1..4.
pub const ARG1_REG: usize = 4;
pub const ARG2_REG: usize = 5;
pub const ARG3_REG: usize = 6;
pub const ARG4_REG: usize = 7;
/// User stack pointer.
pub const STACK_REG: usize = 29;

pub const HI_REG: usize = 32;
pub const LO_REG: usize = 33;
pub const PC_REG: usize = 34;
/// The MIPS delayed-branch convention keeps the following pc too.
pub const NEXT_PC_REG: usize = 35;
pub const PREV_PC_REG: usize = 36;
pub const BAD_VADDR_REG: usize = 39;

pub const NUM_TOTAL_REGS: usize = 40;

/// Why control came back from user mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Exception {
    Syscall,
    PageFault,
    ReadOnly,
    BusError,
    AddressError,
    Overflow,
    IllegalInstruction,
}

/// The instruction interpreter. `resume` executes user instructions
/// until the next exception; every side effect it has goes through the
/// machine's registers and memory.
pub trait Simulator: Send + Sync {
    fn resume(&self, machine: &Machine, ctx: &KernelCtx) -> Exception;
}

/// An interpreter stand-in that raises a scripted syscall at each pc.
///
/// A script maps program-counter values to trap frames; since the
/// dispatcher advances the pc by 4 after each serviced syscall, laying
/// entries out consecutively plays back like a straight-line program.
/// Forked threads start at their own function pointer, so one script
/// serves any number of threads.
pub struct ScriptedSim {
    at: HashMap<u32, (u32, [u32; 4])>,
}

impl ScriptedSim {
    pub fn new() -> Self {
        Self { at: HashMap::new() }
    }

    /// Places one syscall at `pc`.
    pub fn at(mut self, pc: u32, num: u32, args: [u32; 4]) -> Self {
        self.at.insert(pc, (num, args));
        self
    }

    /// Places syscalls at `pc`, `pc + 4`, `pc + 8`, ...
    pub fn seq(mut self, mut pc: u32, calls: &[(u32, [u32; 4])]) -> Self {
        for &(num, args) in calls {
            self.at.insert(pc, (num, args));
            pc = pc.wrapping_add(4);
        }
        self
    }
}

impl Default for ScriptedSim {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator for ScriptedSim {
    fn resume(&self, machine: &Machine, ctx: &KernelCtx) -> Exception {
        let pc = machine.read_register(PC_REG, ctx);
        let &(num, args) = self
            .at
            .get(&pc)
            .unwrap_or_else(|| panic!("scripted simulator: nothing at pc {:#x}", pc));
        machine.write_register(RET_REG, num, ctx);
        machine.write_register(ARG1_REG, args[0], ctx);
        machine.write_register(ARG2_REG, args[1], ctx);
        machine.write_register(ARG3_REG, args[2], ctx);
        machine.write_register(ARG4_REG, args[3], ctx);
        Exception::Syscall
    }
}

/// An interpreter slot for kernels that never enter user mode.
pub struct NoUserProgram;

impl Simulator for NoUserProgram {
    fn resume(&self, _machine: &Machine, _ctx: &KernelCtx) -> Exception {
        panic!("machine resumed with no interpreter installed");
    }
}

pub struct Machine {
    registers: IntrCell<[u32; NUM_TOTAL_REGS]>,
    memory: IntrCell<Box<[u8]>>,
    pages: usize,
    halted: AtomicBool,
    sim: Box<dyn Simulator>,
}

impl Machine {
    pub(crate) fn new(pages: usize, sim: Box<dyn Simulator>) -> Self {
        Self {
            registers: IntrCell::new([0; NUM_TOTAL_REGS]),
            memory: IntrCell::new(vec![0u8; pages * PAGE_SIZE].into_boxed_slice()),
            pages,
            halted: AtomicBool::new(false),
            sim,
        }
    }

    pub fn read_register(&self, reg: usize, ctx: &KernelCtx) -> u32 {
        let intr = ctx.intr_off();
        self.registers.get(&intr)[reg]
    }

    pub fn write_register(&self, reg: usize, value: u32, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        self.registers.get_mut(&mut intr)[reg] = value;
    }

    /// Advances the program counter past a serviced syscall, keeping
    /// the delayed-branch registers consistent.
    pub fn advance_pc(&self, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        let regs = self.registers.get_mut(&mut intr);
        regs[PREV_PC_REG] = regs[PC_REG];
        regs[PC_REG] = regs[NEXT_PC_REG];
        regs[NEXT_PC_REG] = regs[PC_REG].wrapping_add(4);
    }

    pub(crate) fn save_registers(&self, intr: &mut IntrGuard<'_>) -> [u32; NUM_TOTAL_REGS] {
        *self.registers.get(&*intr)
    }

    pub(crate) fn load_registers(&self, regs: &[u32; NUM_TOTAL_REGS], intr: &mut IntrGuard<'_>) {
        *self.registers.get_mut(intr) = *regs;
    }

    /// Pages of physical memory installed.
    pub fn num_phys_pages(&self) -> usize {
        self.pages
    }

    pub fn read_phys(&self, addr: usize, dst: &mut [u8], ctx: &KernelCtx) -> Result<(), SysError> {
        let intr = ctx.intr_off();
        let memory = self.memory.get(&intr);
        let end = addr.checked_add(dst.len()).ok_or(SysError::BadAddress)?;
        if end > memory.len() {
            return Err(SysError::BadAddress);
        }
        dst.copy_from_slice(&memory[addr..end]);
        Ok(())
    }

    pub fn write_phys(&self, addr: usize, src: &[u8], ctx: &KernelCtx) -> Result<(), SysError> {
        let mut intr = ctx.intr_off();
        let memory = self.memory.get_mut(&mut intr);
        let end = addr.checked_add(src.len()).ok_or(SysError::BadAddress)?;
        if end > memory.len() {
            return Err(SysError::BadAddress);
        }
        memory[addr..end].copy_from_slice(src);
        Ok(())
    }

    /// Stops the machine; run loops return at their next iteration.
    pub fn halt(&self, ctx: &KernelCtx) {
        log::debug!("machine halting (thread {})", ctx.tid());
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Runs user instructions on the current thread, servicing traps,
    /// until the machine halts or the current thread's user program is
    /// done.
    pub fn run(&self, ctx: &KernelCtx) -> TrapOutcome {
        loop {
            if self.is_halted() {
                return TrapOutcome::Shutdown;
            }
            let e = self.sim.resume(self, ctx);
            match trap::handle_exception(e, ctx) {
                TrapOutcome::Continue => {}
                done => return done,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, KernelCtx, KernelParams};

    fn boot() -> KernelCtx {
        Kernel::new(KernelParams::default()).main_ctx()
    }

    #[test]
    fn pc_advance_follows_the_delayed_branch_convention() {
        let ctx = boot();
        let machine = ctx.kernel().machine();
        machine.write_register(PC_REG, 100, &ctx);
        machine.write_register(NEXT_PC_REG, 104, &ctx);
        machine.advance_pc(&ctx);
        assert_eq!(machine.read_register(PREV_PC_REG, &ctx), 100);
        assert_eq!(machine.read_register(PC_REG, &ctx), 104);
        assert_eq!(machine.read_register(NEXT_PC_REG, &ctx), 108);
    }

    #[test]
    fn physical_memory_is_bounds_checked() {
        let ctx = boot();
        let machine = ctx.kernel().machine();
        let size = machine.num_phys_pages() * crate::param::PAGE_SIZE;
        let mut byte = [0u8];
        assert!(machine.read_phys(size, &mut byte, &ctx).is_err());
        assert!(machine.write_phys(size - 1, &[1, 2], &ctx).is_err());
        assert!(machine.write_phys(size - 1, &[1], &ctx).is_ok());
    }

    #[test]
    fn registers_hold_what_was_written() {
        let ctx = boot();
        let machine = ctx.kernel().machine();
        machine.write_register(RET_REG, 0xfeed, &ctx);
        assert_eq!(machine.read_register(RET_REG, &ctx), 0xfeed);
    }
}
