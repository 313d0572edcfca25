//! Processes: an address space, an open-file table, and a set of
//! forked user threads, plus the operations the syscall dispatcher
//! calls on behalf of user programs.

use array_macro::array;

use crate::error::SysError;
use crate::fs::OpenFile;
use crate::kernel::KernelCtx;
use crate::machine::{NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, STACK_REG};
use crate::param::{
    CONSOLE_INPUT, CONSOLE_OUTPUT, FID_OFFSET, MAX_OPEN_FILES, PAGE_SIZE,
};
use crate::thread::Tid;
use crate::vm::AddrSpace;

pub type ProcId = usize;

/// A process. All user threads of a process share its address space;
/// the process goes away only once the root thread has exited and no
/// forked threads remain.
pub struct Process {
    name: String,
    /// The kernel thread the process was installed on.
    root: Tid,
    root_exited: bool,
    /// Forked user threads, for bookkeeping and debugging.
    threads: Vec<Tid>,
    forked_count: usize,
    /// Indexed by `fid - FID_OFFSET`. A slot is `None` while free or
    /// while its file is out on a transfer.
    open_files: [Option<OpenFile>; MAX_OPEN_FILES],
    pub(crate) space: AddrSpace,
}

impl Process {
    pub(crate) fn new(name: &str, root: Tid, space: AddrSpace) -> Self {
        Self {
            name: name.to_string(),
            root,
            root_exited: false,
            threads: Vec::new(),
            forked_count: 0,
            open_files: array![_ => None; MAX_OPEN_FILES],
            space,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn forked_threads(&self) -> usize {
        self.forked_count
    }

    pub fn space(&self) -> &AddrSpace {
        &self.space
    }
}

/// The installed processes, indexed by `ProcId`.
pub(crate) struct ProcTable {
    slots: Vec<Option<Process>>,
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn install(&mut self, proc: Process) -> ProcId {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(pid) => {
                self.slots[pid] = Some(proc);
                pid
            }
            None => {
                self.slots.push(Some(proc));
                self.slots.len() - 1
            }
        }
    }

    pub(crate) fn get(&self, pid: ProcId) -> Option<&Process> {
        self.slots.get(pid).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, pid: ProcId) -> Option<&mut Process> {
        self.slots.get_mut(pid).and_then(|s| s.as_mut())
    }

    pub(crate) fn remove(&mut self, pid: ProcId) -> Option<Process> {
        self.slots.get_mut(pid).and_then(|s| s.take())
    }
}

impl KernelCtx {
    /// The process the current thread runs user code for. Syscalls
    /// only arrive from user mode, so a missing binding is a kernel
    /// bug.
    pub(crate) fn current_pid(&self) -> ProcId {
        self.kernel()
            .scheduler()
            .proc_of(self.tid())
            .expect("syscall from a thread with no process")
    }

    fn read_user_str(&self, ptr: u32) -> Result<String, SysError> {
        let pid = self.current_pid();
        let intr = self.intr_off();
        let table = self.kernel().proc_table().get(&intr);
        let proc = table.get(pid).ok_or(SysError::NoProcess)?;
        proc.space.read_str(ptr, self)
    }

    fn user_copy_in(&self, ptr: u32, dst: &mut [u8]) -> Result<(), SysError> {
        let pid = self.current_pid();
        let intr = self.intr_off();
        let table = self.kernel().proc_table().get(&intr);
        let proc = table.get(pid).ok_or(SysError::NoProcess)?;
        proc.space.copy_in(ptr, dst, self)
    }

    fn user_copy_out(&self, ptr: u32, src: &[u8]) -> Result<(), SysError> {
        let pid = self.current_pid();
        let intr = self.intr_off();
        let table = self.kernel().proc_table().get(&intr);
        let proc = table.get(pid).ok_or(SysError::NoProcess)?;
        proc.space.copy_out(ptr, src, self)
    }

    fn take_open_file(&self, fid: u32) -> Result<(usize, OpenFile), SysError> {
        let slot = fid.checked_sub(FID_OFFSET).ok_or(SysError::BadFileId)? as usize;
        if slot >= MAX_OPEN_FILES {
            return Err(SysError::BadFileId);
        }
        let pid = self.current_pid();
        let mut intr = self.intr_off();
        let table = self.kernel().proc_table().get_mut(&mut intr);
        let proc = table.get_mut(pid).ok_or(SysError::NoProcess)?;
        let file = proc.open_files[slot].take().ok_or(SysError::BadFileId)?;
        Ok((slot, file))
    }

    fn put_open_file(&self, slot: usize, file: OpenFile) {
        let pid = self.current_pid();
        let mut intr = self.intr_off();
        let table = self.kernel().proc_table().get_mut(&mut intr);
        if let Some(proc) = table.get_mut(pid) {
            assert!(proc.open_files[slot].is_none());
            proc.open_files[slot] = Some(file);
        }
    }

    /// Services the Exit syscall. Returns true when the whole machine
    /// was shut down because the process completed: either the root
    /// thread exited with no forked threads left, or the last forked
    /// thread exited after the root already had.
    pub fn exit_process(&self, status: i32) -> bool {
        let pid = self.current_pid();
        let tid = self.tid();
        let complete = {
            let mut intr = self.intr_off();
            let table = self.kernel().proc_table().get_mut(&mut intr);
            let proc = table
                .get_mut(pid)
                .expect("exit from a process that is not installed");
            if tid == proc.root {
                if proc.forked_count == 0 {
                    log::debug!("process \"{}\" exiting (status {})", proc.name, status);
                    true
                } else {
                    log::debug!(
                        "root thread of \"{}\" exiting (status {}), {} forked threads remain",
                        proc.name,
                        status,
                        proc.forked_count
                    );
                    proc.root_exited = true;
                    false
                }
            } else {
                proc.forked_count -= 1;
                log::debug!(
                    "forked thread of \"{}\" exiting (status {}), {} remain",
                    proc.name,
                    status,
                    proc.forked_count
                );
                proc.root_exited && proc.forked_count == 0
            }
        };
        if complete {
            self.kernel().dispose_process(pid, self);
            self.kernel().machine().halt(self);
        }
        complete
    }

    /// Services the Create syscall: fetches the file name from user
    /// memory and makes an empty file.
    pub fn file_create(&self, ptr_name: u32) -> Result<(), SysError> {
        let name = self.read_user_str(ptr_name)?;
        self.kernel().fs().create(&name, 0, self)
    }

    /// Services the Open syscall. Returns the new file id.
    pub fn file_open(&self, ptr_name: u32) -> Result<u32, SysError> {
        let name = self.read_user_str(ptr_name)?;
        let file = self.kernel().fs().open(&name, self)?;
        let pid = self.current_pid();
        let mut intr = self.intr_off();
        let table = self.kernel().proc_table().get_mut(&mut intr);
        let proc = table.get_mut(pid).ok_or(SysError::NoProcess)?;
        let slot = proc
            .open_files
            .iter()
            .position(|f| f.is_none())
            .ok_or(SysError::TooManyOpenFiles)?;
        proc.open_files[slot] = Some(file);
        Ok(slot as u32 + FID_OFFSET)
    }

    /// Services the Close syscall.
    pub fn file_close(&self, fid: u32) -> Result<(), SysError> {
        let (slot, file) = self.take_open_file(fid)?;
        log::debug!("closing fid {} (slot {})", fid, slot);
        drop(file);
        Ok(())
    }

    /// Services the Write syscall: user memory to a file, or to the
    /// console for the reserved output id.
    pub fn file_write(&self, ptr_buf: u32, size: u32, fid: u32) -> Result<(), SysError> {
        match fid {
            CONSOLE_OUTPUT => {
                let mut buf = vec![0u8; size as usize];
                self.user_copy_in(ptr_buf, &mut buf)?;
                self.kernel().console().write_line(&buf, self);
                Ok(())
            }
            CONSOLE_INPUT => Err(SysError::WriteToConsoleInput),
            _ => {
                let mut buf = vec![0u8; size as usize];
                self.user_copy_in(ptr_buf, &mut buf)?;
                let (slot, mut file) = self.take_open_file(fid)?;
                let result = file.write(&buf, self);
                self.put_open_file(slot, file);
                result.map(|_| ())
            }
        }
    }

    /// Services the Read syscall. Returns the bytes actually read,
    /// which also goes back to the user in the result register.
    pub fn file_read(&self, ptr_buf: u32, size: u32, fid: u32) -> Result<u32, SysError> {
        if size == 0 {
            return Err(SysError::ZeroRead);
        }
        match fid {
            CONSOLE_INPUT => {
                let mut buf = vec![0u8; size as usize];
                self.kernel().console().read_line(&mut buf, self);
                self.user_copy_out(ptr_buf, &buf)?;
                Ok(size)
            }
            CONSOLE_OUTPUT => Err(SysError::ReadFromConsoleOutput),
            _ => {
                let (slot, mut file) = self.take_open_file(fid)?;
                let mut buf = vec![0u8; size as usize];
                let n = file.read(&mut buf, self);
                self.put_open_file(slot, file);
                self.user_copy_out(ptr_buf, &buf[..n as usize])?;
                Ok(n)
            }
        }
    }

    /// Services the Fork syscall: a new kernel thread running user
    /// code at `func_ptr`, on a fresh stack in the shared address
    /// space.
    pub fn process_fork(&self, func_ptr: u32) -> Result<(), SysError> {
        let pid = self.current_pid();
        let (name, stack_top) = {
            let mut intr = self.intr_off();
            let table = self.kernel().proc_table().get_mut(&mut intr);
            let proc = table.get_mut(pid).ok_or(SysError::NoProcess)?;
            proc.forked_count += 1;
            if let Err(e) = proc.space.create_stack(self) {
                proc.forked_count -= 1;
                return Err(e);
            }
            (
                format!("{} thread {}", proc.name, proc.forked_count),
                (proc.space.num_pages() * PAGE_SIZE) as u32,
            )
        };
        log::debug!("forking user thread \"{}\" at {:#x}", name, func_ptr);
        let tid = self.kernel().scheduler().fork(
            self.kernel_arc(),
            &name,
            Some(pid),
            Box::new(move |ctx: &KernelCtx| {
                let machine = ctx.kernel().machine();
                for reg in 0..NUM_TOTAL_REGS {
                    machine.write_register(reg, 0, ctx);
                }
                machine.write_register(PC_REG, func_ptr, ctx);
                machine.write_register(NEXT_PC_REG, func_ptr.wrapping_add(4), ctx);
                machine.write_register(STACK_REG, stack_top - 16, ctx);
                let _ = machine.run(ctx);
            }),
        );
        let mut intr = self.intr_off();
        let table = self.kernel().proc_table().get_mut(&mut intr);
        if let Some(proc) = table.get_mut(pid) {
            proc.threads.push(tid);
        }
        Ok(())
    }

    /// Services the Yield syscall.
    pub fn process_yield(&self) {
        log::trace!("thread {} yielding", self.tid());
        self.yield_now();
    }
}
