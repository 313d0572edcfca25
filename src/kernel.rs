//! The kernel: one value owning every subsystem, plus the per-thread
//! context handle that all operations are threaded through.
//!
//! Nothing here is a global. A test (or an embedding program) builds
//! its own `Kernel`, gets a `KernelCtx` for the calling thread, and
//! every kernel operation takes the context explicitly: it names both
//! the kernel and the current thread.

use std::sync::Arc;

use crate::console::{SimConsole, SynchConsole};
use crate::disk::{RamDisk, SynchDisk};
use crate::error::SysError;
use crate::fs::FileSystem;
use crate::intr::{IntrCell, IntrGuard, IntrState};
use crate::machine::{Machine, NoUserProgram, Simulator};
use crate::param::{NUM_PHYS_PAGES, NUM_SECTORS};
use crate::proc::{ProcId, ProcTable, Process};
use crate::synch::Semaphore;
use crate::thread::{Scheduler, Tid};
use crate::trap::TrapOutcome;
use crate::vm::{AddrSpace, PageMap};

/// Geometry of the simulated machine. The disk is always
/// `NUM_SECTORS` sectors; the installed memory may be capped below
/// `NUM_PHYS_PAGES`.
pub struct KernelParams {
    pub memory_pages: usize,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            memory_pages: NUM_PHYS_PAGES,
        }
    }
}

pub struct Kernel {
    intr: IntrState,
    scheduler: Scheduler,
    machine: Machine,
    disk: SynchDisk,
    console: SynchConsole,
    sim_console: SimConsole,
    fs: FileSystem,
    pages: IntrCell<PageMap>,
    procs: IntrCell<ProcTable>,
}

impl Kernel {
    /// A kernel that never enters user mode; enough for threads,
    /// synchronisation, and the filesystem.
    pub fn new(params: KernelParams) -> Arc<Self> {
        Self::with_simulator(params, Box::new(NoUserProgram))
    }

    /// A kernel wired to an instruction interpreter. The calling host
    /// thread becomes kernel thread 0.
    pub fn with_simulator(params: KernelParams, sim: Box<dyn Simulator>) -> Arc<Self> {
        assert!(params.memory_pages <= NUM_PHYS_PAGES);
        let disk_done = Arc::new(Semaphore::new("disk request done", 0));
        let ram_disk = RamDisk::new(NUM_SECTORS, Arc::clone(&disk_done));
        let read_avail = Arc::new(Semaphore::new("console read avail", 0));
        let write_done = Arc::new(Semaphore::new("console write done", 0));
        let sim_console = SimConsole::new(Arc::clone(&read_avail), Arc::clone(&write_done));

        Arc::new(Self {
            intr: IntrState::new(),
            scheduler: Scheduler::new(),
            machine: Machine::new(params.memory_pages, sim),
            disk: SynchDisk::new(Box::new(ram_disk), disk_done),
            console: SynchConsole::new(Box::new(sim_console.clone()), read_avail, write_done),
            sim_console,
            fs: FileSystem::new(),
            pages: IntrCell::new(PageMap::new(params.memory_pages)),
            procs: IntrCell::new(ProcTable::new()),
        })
    }

    /// The context for the host thread that built the kernel.
    pub fn main_ctx(self: &Arc<Self>) -> KernelCtx {
        KernelCtx::new(Arc::clone(self), 0)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn disk(&self) -> &SynchDisk {
        &self.disk
    }

    pub fn console(&self) -> &SynchConsole {
        &self.console
    }

    /// The simulated console device, for scripting input and reading
    /// back output.
    pub fn sim_console(&self) -> &SimConsole {
        &self.sim_console
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub(crate) fn intr_state(&self) -> &IntrState {
        &self.intr
    }

    pub(crate) fn proc_table(&self) -> &IntrCell<ProcTable> {
        &self.procs
    }

    pub fn alloc_page(&self, ctx: &KernelCtx) -> Option<usize> {
        let mut intr = ctx.intr_off();
        self.pages.get_mut(&mut intr).alloc()
    }

    pub fn free_page(&self, page: usize, ctx: &KernelCtx) {
        let mut intr = ctx.intr_off();
        self.pages.get_mut(&mut intr).free(page);
    }

    pub fn free_page_count(&self, ctx: &KernelCtx) -> usize {
        let intr = ctx.intr_off();
        self.pages.get(&intr).free_count()
    }

    /// Uninstalls a process and returns its pages.
    pub(crate) fn dispose_process(&self, pid: ProcId, ctx: &KernelCtx) {
        let proc = {
            let mut intr = ctx.intr_off();
            self.procs.get_mut(&mut intr).remove(pid)
        };
        if let Some(proc) = proc {
            log::debug!("disposing of process \"{}\"", proc.name());
            for page in proc.space.take_pages() {
                self.free_page(page, ctx);
            }
        }
    }
}

/// The kernel context: which kernel, and which thread is running. One
/// per host thread; passed by reference through every operation.
pub struct KernelCtx {
    kernel: Arc<Kernel>,
    tid: Tid,
}

impl KernelCtx {
    pub(crate) fn new(kernel: Arc<Kernel>, tid: Tid) -> Self {
        Self { kernel, tid }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub(crate) fn kernel_arc(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Disables interrupts until the guard drops.
    pub fn intr_off(&self) -> IntrGuard<'_> {
        IntrGuard::new(&self.kernel)
    }

    /// Forks a kernel thread running `f`.
    pub fn fork(&self, name: &str, f: impl FnOnce(&KernelCtx) + Send + 'static) -> Tid {
        self.kernel
            .scheduler()
            .fork(&self.kernel, name, None, Box::new(f))
    }

    pub fn yield_now(&self) {
        self.kernel.scheduler().yield_now(self);
    }

    /// Boots a user program: opens the executable, builds the address
    /// space, installs the root process on the current thread, and
    /// runs the machine until it halts.
    pub fn run_user_program(&self, path: &str) -> Result<(), SysError> {
        let exe = self.kernel().fs().open(path, self)?;
        let space = AddrSpace::load(&exe, self)?;
        let proc = Process::new(path, self.tid(), space);
        let pid = {
            let mut intr = self.intr_off();
            self.kernel().proc_table().get_mut(&mut intr).install(proc)
        };
        self.kernel().scheduler().bind_user(self.tid(), pid);
        {
            let intr = self.intr_off();
            let table = self.kernel().proc_table().get(&intr);
            if let Some(proc) = table.get(pid) {
                proc.space().init_registers(self);
            }
        }
        log::info!("starting user program \"{}\"", path);

        let outcome = self.kernel().machine().run(self);
        if outcome == TrapOutcome::ThreadExit {
            // The root thread exited while forked threads keep going;
            // idle until one of them completes the process.
            while !self.kernel().machine().is_halted() {
                self.yield_now();
            }
        }
        self.kernel().dispose_process(pid, self);
        self.kernel().scheduler().unbind_user(self.tid());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use zerocopy::AsBytes;

    use super::*;
    use crate::machine::{
        Exception, Machine, ScriptedSim, Simulator, ARG1_REG, ARG2_REG, ARG3_REG, ARG4_REG,
        NEXT_PC_REG, PC_REG, PREV_PC_REG, RET_REG,
    };
    use crate::param::{CONSOLE_INPUT, CONSOLE_OUTPUT, FID_OFFSET};
    use crate::syscall::{
        SYS_CLOSE, SYS_CREATE, SYS_EXIT, SYS_FORK, SYS_HALT, SYS_OPEN, SYS_READ, SYS_WRITE,
        SYS_YIELD,
    };
    use crate::vm::{ExecHeader, ExecSegment, EXEC_MAGIC};

    /// Installs a data-only executable named `prog`: `data` lands at
    /// virtual address `data_vaddr` when the program is loaded.
    fn install_exec(ctx: &KernelCtx, data: &[u8], data_vaddr: u32) {
        let hdr = ExecHeader {
            magic: EXEC_MAGIC,
            code: ExecSegment::default(),
            init_data: ExecSegment {
                vaddr: data_vaddr,
                file_offset: mem::size_of::<ExecHeader>() as u32,
                size: data.len() as u32,
            },
            uninit_data: ExecSegment::default(),
        };
        ctx.kernel().fs().create("prog", 0, ctx).unwrap();
        let mut exe = ctx.kernel().fs().open("prog", ctx).unwrap();
        exe.write(hdr.as_bytes(), ctx).unwrap();
        exe.write(data, ctx).unwrap();
    }

    fn boot_with(sim: ScriptedSim) -> KernelCtx {
        Kernel::with_simulator(KernelParams::default(), Box::new(sim)).main_ctx()
    }

    #[test]
    fn halt_stops_the_machine() {
        let sim = ScriptedSim::new().at(0, SYS_HALT, [0; 4]);
        let ctx = boot_with(sim);
        install_exec(&ctx, b"", 256);
        ctx.run_user_program("prog").unwrap();
        assert!(ctx.kernel().machine().is_halted());
    }

    #[test]
    fn serviced_syscalls_advance_the_pc() {
        let sim = ScriptedSim::new().seq(
            0,
            &[
                (SYS_YIELD, [0; 4]),
                (SYS_YIELD, [0; 4]),
                (SYS_HALT, [0; 4]),
            ],
        );
        let ctx = boot_with(sim);
        install_exec(&ctx, b"", 256);
        ctx.run_user_program("prog").unwrap();
        let machine = ctx.kernel().machine();
        assert_eq!(machine.read_register(PREV_PC_REG, &ctx), 4);
        assert_eq!(machine.read_register(PC_REG, &ctx), 8);
        assert_eq!(machine.read_register(NEXT_PC_REG, &ctx), 12);
    }

    #[test]
    fn files_are_created_written_and_reread_through_syscalls() {
        // Data segment at 256: "out\0" then the message.
        let name_ptr = 256u32;
        let msg_ptr = 260u32;
        let msg = b"written from user mode";
        let mut data = b"out\0".to_vec();
        data.extend_from_slice(msg);

        // The first Open lands in slot 0, so its fid is 2.
        let sim = ScriptedSim::new().seq(
            0,
            &[
                (SYS_CREATE, [name_ptr, 0, 0, 0]),
                (SYS_OPEN, [name_ptr, 0, 0, 0]),
                (SYS_WRITE, [msg_ptr, msg.len() as u32, 2, 0]),
                (SYS_CLOSE, [2, 0, 0, 0]),
                (SYS_HALT, [0; 4]),
            ],
        );
        let ctx = boot_with(sim);
        install_exec(&ctx, &data, name_ptr);
        ctx.run_user_program("prog").unwrap();

        let file = ctx.kernel().fs().open("out", &ctx).unwrap();
        assert_eq!(file.length() as usize, msg.len());
        let mut back = vec![0u8; msg.len()];
        file.read_at(&mut back, 0, &ctx);
        assert_eq!(&back[..], &msg[..]);
    }

    #[test]
    fn console_reads_and_writes_route_to_the_device() {
        let buf_ptr = 512u32;
        let sim = ScriptedSim::new().seq(
            0,
            &[
                (SYS_READ, [buf_ptr, 5, CONSOLE_INPUT, 0]),
                (SYS_WRITE, [buf_ptr, 5, CONSOLE_OUTPUT, 0]),
                (SYS_HALT, [0; 4]),
            ],
        );
        let ctx = boot_with(sim);
        install_exec(&ctx, b"", 256);
        ctx.kernel().sim_console().feed_input(b"ping\n", &ctx);
        ctx.run_user_program("prog").unwrap();
        assert_eq!(ctx.kernel().sim_console().take_output(&ctx), b"ping\n");
        // Read puts the transferred length in the result register;
        // Write and Halt leave it to the simulator's next fetch.
        assert!(ctx.kernel().machine().is_halted());
    }

    #[test]
    fn forked_threads_run_user_code_and_complete_the_process() {
        let msg_ptr = 256u32;
        let msg = b"from the forked thread";
        let child_entry = 0x400u32;
        let sim = ScriptedSim::new()
            .seq(
                0,
                &[
                    (SYS_FORK, [child_entry, 0, 0, 0]),
                    (SYS_YIELD, [0; 4]),
                    (SYS_EXIT, [0; 4]),
                ],
            )
            .seq(
                child_entry,
                &[
                    (SYS_WRITE, [msg_ptr, msg.len() as u32, CONSOLE_OUTPUT, 0]),
                    (SYS_EXIT, [0; 4]),
                ],
            );
        let ctx = boot_with(sim);
        install_exec(&ctx, msg, msg_ptr);
        ctx.run_user_program("prog").unwrap();
        assert!(ctx.kernel().machine().is_halted());
        assert_eq!(
            ctx.kernel().sim_console().take_output(&ctx),
            msg.to_vec()
        );
    }

    #[test]
    fn a_failing_syscall_shuts_the_machine_down() {
        // Open a file that does not exist.
        let sim = ScriptedSim::new().seq(
            0,
            &[(SYS_OPEN, [256, 0, 0, 0]), (SYS_HALT, [0; 4])],
        );
        let ctx = boot_with(sim);
        install_exec(&ctx, b"ghost\0", 256);
        ctx.run_user_program("prog").unwrap();
        assert!(ctx.kernel().machine().is_halted());
        // The failing Open never wrote a fid.
        assert_eq!(ctx.kernel().machine().read_register(RET_REG, &ctx), SYS_OPEN);
    }

    #[test]
    fn missing_executables_are_reported() {
        let ctx = Kernel::new(KernelParams::default()).main_ctx();
        assert!(matches!(
            ctx.run_user_program("absent"),
            Err(SysError::FileNotFound)
        ));
    }

    /// Issues Open then Read, asserting between traps that the result
    /// register carries the assigned fid and then the transferred
    /// length.
    struct ResultRegisterChecker;

    impl Simulator for ResultRegisterChecker {
        fn resume(&self, machine: &Machine, ctx: &KernelCtx) -> Exception {
            let syscall = |num: u32, args: [u32; 4]| {
                machine.write_register(RET_REG, num, ctx);
                machine.write_register(ARG1_REG, args[0], ctx);
                machine.write_register(ARG2_REG, args[1], ctx);
                machine.write_register(ARG3_REG, args[2], ctx);
                machine.write_register(ARG4_REG, args[3], ctx);
            };
            match machine.read_register(PC_REG, ctx) {
                0 => syscall(SYS_OPEN, [256, 0, 0, 0]),
                4 => {
                    // The first open file sits in slot 0.
                    assert_eq!(machine.read_register(RET_REG, ctx), FID_OFFSET);
                    syscall(SYS_READ, [512, 16, FID_OFFSET, 0]);
                }
                8 => {
                    // Only 3 of the 16 requested bytes existed.
                    assert_eq!(machine.read_register(RET_REG, ctx), 3);
                    syscall(SYS_HALT, [0; 4]);
                }
                pc => panic!("unexpected pc {:#x}", pc),
            }
            Exception::Syscall
        }
    }

    #[test]
    fn results_land_in_the_result_register() {
        let ctx = Kernel::with_simulator(
            KernelParams::default(),
            Box::new(ResultRegisterChecker),
        )
        .main_ctx();
        ctx.kernel().fs().create("f", 0, &ctx).unwrap();
        let mut f = ctx.kernel().fs().open("f", &ctx).unwrap();
        f.write(b"abc", &ctx).unwrap();
        drop(f);
        install_exec(&ctx, b"f\0", 256);
        ctx.run_user_program("prog").unwrap();
        assert!(ctx.kernel().machine().is_halted());
    }

    #[test]
    fn page_frames_are_reclaimed_after_the_program_ends() {
        let sim = ScriptedSim::new().at(0, SYS_HALT, [0; 4]);
        let ctx = boot_with(sim);
        install_exec(&ctx, b"", 256);
        let free = ctx.kernel().free_page_count(&ctx);
        ctx.run_user_program("prog").unwrap();
        assert_eq!(ctx.kernel().free_page_count(&ctx), free);
    }
}
