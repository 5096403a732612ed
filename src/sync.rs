//! Voluntary switching and the waits built on it.

use crate::arch::{Arch, Trap};
use crate::error::{ThreadError, ThreadResult};
use crate::scheduler::Scheduler;

impl<A: Arch> Scheduler<A> {
    /// Hands the CPU to the next runnable thread immediately, regardless of
    /// the activity flag or the remaining quota.
    ///
    /// Must not be called with interrupts masked.
    pub fn yield_now(&self) {
        A::trap(self, Trap::Yield);
    }

    /// Like [`yield_now`](Self::yield_now), but also forces the activity
    /// flag to started as part of the same trap.
    pub(crate) fn yield_and_start(&self) {
        A::trap(self, Trap::YieldAndStart);
    }

    pub fn now_millis(&self) -> u32 {
        A::now_millis()
    }

    /// Calls `ready` until it returns `true`, yielding between attempts.
    ///
    /// Gives up with [`ThreadError::Timeout`] once more than `timeout_ms`
    /// milliseconds have passed; a timeout of 0 polls forever. The deadline
    /// is only checked after a failed attempt.
    pub fn poll_until(
        &self,
        timeout_ms: u32,
        mut ready: impl FnMut() -> bool,
    ) -> ThreadResult<()> {
        let start = A::now_millis();
        loop {
            if ready() {
                return Ok(());
            }
            if timeout_ms != 0 && A::now_millis().wrapping_sub(start) > timeout_ms {
                return Err(ThreadError::Timeout);
            }
            self.yield_now();
        }
    }

    /// Yields until at least `ms` milliseconds have passed.
    pub fn delay(&self, ms: u32) {
        let start = A::now_millis();
        let elapsed = || A::now_millis().wrapping_sub(start) >= ms;
        // Unbounded, so it cannot time out.
        let _ = self.poll_until(0, elapsed);
    }
}

/// Body of the exit routine every thread returns into.
///
/// Marks the calling thread ended and yields forever; the thread is never
/// switched back in, and its frames become garbage once the slot is reused.
pub fn exit_thread<A: Arch>(scheduler: &Scheduler<A>) -> ! {
    scheduler.exit_current();
    loop {
        scheduler.yield_now();
        A::idle();
    }
}
