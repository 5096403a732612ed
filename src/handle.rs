//! Owning handles to spawned threads.
//!
//! A handle names one occupant of a slot, not the slot itself: every check
//! and the kill on drop compare the slot's generation and act in the same
//! critical section, so a handle can never reach a later thread that reused
//! the slot.

use core::fmt;
use core::mem;

use crate::arch::Arch;
use crate::error::ThreadResult;
use crate::scheduler::Scheduler;
use crate::thread::{ThreadId, ThreadState};

/// Owning handle to a spawned thread.
///
/// Dropping the handle kills the thread unless it was detached or has
/// already finished. The handle remembers which occupant of the slot it
/// belongs to, so it never touches a later thread that reused the slot.
#[must_use = "dropping a JoinHandle kills its thread; use `detach` to let it run"]
pub struct JoinHandle<'a, A: Arch> {
    scheduler: &'a Scheduler<A>,
    id: ThreadId,
    generation: u32,
}

impl<'a, A: Arch> JoinHandle<'a, A> {
    pub(crate) fn new(scheduler: &'a Scheduler<A>, id: ThreadId, generation: u32) -> Self {
        JoinHandle {
            scheduler,
            id,
            generation,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Whether the thread has ended, been killed, or been replaced.
    pub fn is_finished(&self) -> bool {
        self.state().is_none_or(|state| !state.is_alive())
    }

    /// Yields until the thread has finished.
    pub fn join(self) -> ThreadResult<()> {
        self.scheduler.poll_until(0, || self.is_finished())
    }

    /// Yields until the thread has finished or `timeout_ms` has passed. The
    /// handle stays valid on timeout.
    pub fn join_timeout(&self, timeout_ms: u32) -> ThreadResult<()> {
        self.scheduler.poll_until(timeout_ms, || self.is_finished())
    }

    /// Lets the thread run on after the handle is gone.
    pub fn detach(self) -> ThreadId {
        let id = self.id;
        mem::forget(self);
        id
    }

    /// Current state of the thread, or `None` once the slot was reused.
    pub fn state(&self) -> Option<ThreadState> {
        self.scheduler.state_of(self.id, self.generation)
    }
}

impl<A: Arch> Drop for JoinHandle<'_, A> {
    fn drop(&mut self) {
        self.scheduler.kill_generation(self.id, self.generation);
    }
}

impl<A: Arch> fmt::Debug for JoinHandle<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}
