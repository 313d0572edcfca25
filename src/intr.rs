//! The interrupt-enable flag, the kernel's one atomicity primitive.
//!
//! The machine is a uniprocessor and kernel threads are cooperative, so
//! masking interrupts is enough to make a span of code atomic: no
//! context switch can occur until the mask is lifted. `IntrGuard` is a
//! scoped disable that restores the previous state on every exit path,
//! and `IntrCell` only hands out references against a live guard, so
//! "bracketed by disable/restore" is checked by the compiler.

use core::cell::UnsafeCell;

use crate::kernel::Kernel;

/// The process-wide interrupt-enable flag.
///
/// # Safety
///
/// Only the running kernel thread reads or writes the flag, and the
/// scheduler runs at most one kernel thread at any instant.
pub(crate) struct IntrState {
    enabled: UnsafeCell<bool>,
}

unsafe impl Sync for IntrState {}

impl IntrState {
    pub(crate) const fn new() -> Self {
        Self {
            enabled: UnsafeCell::new(true),
        }
    }

    /// Sets the flag and returns its previous state.
    fn set(&self, on: bool) -> bool {
        // SAFETY: at most one kernel thread executes at any instant.
        unsafe {
            let enabled = self.enabled.get();
            let prev = *enabled;
            *enabled = on;
            prev
        }
    }

    pub(crate) fn get(&self) -> bool {
        // SAFETY: at most one kernel thread executes at any instant.
        unsafe { *self.enabled.get() }
    }

    /// Freshly forked threads begin execution with interrupts on.
    pub(crate) fn enable(&self) {
        let _ = self.set(true);
    }
}

/// A scoped interrupt disable. Dropping the guard restores whatever
/// state the flag held when the guard was taken, so nested guards
/// compose and a blocking call made under a guard wakes up still
/// masked.
pub struct IntrGuard<'k> {
    kernel: &'k Kernel,
    prev: bool,
}

impl<'k> IntrGuard<'k> {
    pub(crate) fn new(kernel: &'k Kernel) -> Self {
        let prev = kernel.intr_state().set(false);
        Self { kernel, prev }
    }

    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }
}

impl Drop for IntrGuard<'_> {
    fn drop(&mut self) {
        let _ = self.kernel.intr_state().set(self.prev);
    }
}

/// A cell whose contents are only reachable while interrupts are
/// disabled.
///
/// # Safety
///
/// The uniprocessor contract makes this sound: a reference handed out
/// against a guard is only ever used by the thread that holds the
/// guard, and no other thread runs until the holder blocks or returns.
/// A holder that blocks while keeping a reference alive must be the
/// only path to the cell for the duration (the owning structure's lock
/// guarantees this where it happens).
pub struct IntrCell<T> {
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for IntrCell<T> {}

impl<T> IntrCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Borrows the contents mutably for as long as the guard stays
    /// mutably borrowed.
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut<'a>(&'a self, _intr: &'a mut IntrGuard<'_>) -> &'a mut T {
        // SAFETY: interrupts are disabled and the guard is exclusively
        // borrowed for the lifetime of the reference.
        unsafe { &mut *self.value.get() }
    }

    pub fn get<'a>(&'a self, _intr: &'a IntrGuard<'_>) -> &'a T {
        // SAFETY: interrupts are disabled for the lifetime of the
        // reference.
        unsafe { &*self.value.get() }
    }
}
