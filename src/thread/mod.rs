//! Kernel threads and the cooperative scheduler.

mod scheduler;

pub use scheduler::{Scheduler, ThreadState, Tid};
