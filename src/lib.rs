//! Round-robin thread scheduler for single-core microcontrollers.
//!
//! Threads live in a fixed table of [`MAX_THREADS`] slots, slot 0 being the
//! context that called into the crate. A periodic tick preempts the running
//! thread once its time slice is used up, and any thread can hand over the
//! CPU early through a software trap. Waits (`delay`, `wait`, mutex locks)
//! are built from those voluntary switches.
//!
//! The platform is abstracted by [`arch::Arch`]. The `cortex-m` feature
//! provides the ARMv7-M port, and the `std` feature a host simulation used
//! by the tests.

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod arch;
pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod handle;
pub mod lifecycle;
pub mod mutex;
pub mod preemption;
pub mod scheduler;
pub mod sync;
pub mod thread;


pub use arch::{Arch, Trap};
pub use builder::ThreadBuilder;
pub use config::Config;
pub use error::{ThreadError, ThreadResult};
pub use guard::{critical_section, IrqGuard, SuspendScope};
pub use handle::JoinHandle;
pub use mutex::{LockScope, LockState, Mutex, MutexGuard, RawMutex};
pub use preemption::{Activity, OverflowHook, TickSource};
pub use scheduler::Scheduler;
pub use sync::exit_thread;
pub use thread::{StackMemory, ThreadEntry, ThreadId, ThreadState, MAX_THREADS};
