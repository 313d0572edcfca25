//! Thread synchronisation primitives.
//!
//! Everything here reduces to one atomic operation: masking interrupts
//! (`crate::intr`). While interrupts are off no context switch can
//! occur, so the current thread owns the CPU until it re-enables them
//! or deliberately blocks. Because these routines may be entered with
//! interrupts already disabled, they always restore the previous state
//! rather than unconditionally enabling.

mod condition;
mod lock;
mod rwlock;
mod semaphore;

pub use condition::Condition;
pub use lock::Lock;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
