//! Activity flag, tick sources and time-slice configuration.

use log::info;

use crate::arch::Arch;
use crate::error::{ThreadError, ThreadResult};
use crate::scheduler::Scheduler;
use crate::thread::{ThreadId, ThreadState};

/// System-wide flag gating preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Timer ticks may preempt the running thread.
    Started,
    /// Timer ticks only count down; only traps switch threads.
    Stopped,
    /// Nothing started yet. Behaves like `Stopped`, but the first thread
    /// creation starts the system.
    FirstRun,
}

/// Source of the periodic scheduler tick. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    /// The platform's native millisecond system tick.
    SysTick,
    /// A timer programmed for `micros` microseconds per tick.
    MicroTimer { micros: u32 },
}

impl TickSource {
    pub const fn tick_micros(self) -> u32 {
        match self {
            TickSource::SysTick => 1000,
            TickSource::MicroTimer { micros } => micros,
        }
    }
}

/// Called when a thread is switched out with less stack headroom than the
/// configured margin. Receives the remaining headroom in bytes and returns
/// the state the thread is put in.
pub type OverflowHook = fn(ThreadId, usize) -> ThreadState;

/// Default overflow policy: the thread is terminated.
pub fn end_on_overflow(_id: ThreadId, _remaining: usize) -> ThreadState {
    ThreadState::Ended
}

impl<A: Arch> Scheduler<A> {
    /// Sets the slice of one thread, in ticks. Takes effect the next time the
    /// thread is switched in. A slice of 0 is treated as 1.
    pub fn set_time_slice(&self, id: ThreadId, ticks: u32) -> ThreadResult<()> {
        self.with(|inner| {
            let thread = &mut inner.threads[id.get()];
            if thread.state == ThreadState::Empty {
                return Err(ThreadError::InvalidThreadId);
            }
            thread.ticks = ticks.saturating_sub(1);
            Ok(())
        })
    }

    pub fn time_slice(&self, id: ThreadId) -> ThreadResult<u32> {
        self.with(|inner| {
            let thread = &inner.threads[id.get()];
            if thread.state == ThreadState::Empty {
                return Err(ThreadError::InvalidThreadId);
            }
            Ok(thread.ticks + 1)
        })
    }

    /// Sets the slice, in ticks, given to threads created from now on.
    pub fn set_default_time_slice(&self, ticks: u32) {
        self.with(|inner| inner.config.time_slice = ticks.max(1));
    }

    pub fn set_default_stack_size(&self, bytes: usize) {
        self.with(|inner| inner.config.stack_size = bytes);
    }

    pub fn tick_source(&self) -> TickSource {
        self.with(|inner| inner.tick_source)
    }

    /// Drives the scheduler from the microsecond timer instead of the native
    /// system tick.
    ///
    /// # Arguments
    ///
    /// * `micros` - Tick length in microseconds
    ///
    /// # Returns
    ///
    /// `TimerUnavailable` if `micros` is 0 or the port cannot produce that
    /// tick length; the previous tick source then stays active.
    pub fn set_micro_timer(&self, micros: u32) -> ThreadResult<()> {
        if micros == 0 {
            return Err(ThreadError::TimerUnavailable);
        }
        let source = TickSource::MicroTimer { micros };
        A::configure_tick(source)?;
        self.with(|inner| inner.tick_source = source);
        info!("tick source: {} us timer", micros);
        Ok(())
    }

    /// Switches to the microsecond timer at the configured tick length.
    pub fn use_micro_timer(&self) -> ThreadResult<()> {
        let micros = self.config().tick_micros;
        self.set_micro_timer(micros)
    }

    /// Switches back to the native millisecond system tick.
    pub fn set_system_tick(&self) -> ThreadResult<()> {
        A::configure_tick(TickSource::SysTick)?;
        self.with(|inner| inner.tick_source = TickSource::SysTick);
        info!("tick source: system tick");
        Ok(())
    }

    /// Makes every new slice `micros` long: one tick of a `micros` timer.
    pub fn set_slice_micros(&self, micros: u32) -> ThreadResult<()> {
        self.set_micro_timer(micros)?;
        self.set_default_time_slice(1);
        Ok(())
    }

    /// Makes every new slice `millis` long on whichever tick source is
    /// active.
    pub fn set_slice_millis(&self, millis: u32) -> ThreadResult<()> {
        match self.tick_source() {
            TickSource::SysTick => {
                self.set_default_time_slice(millis);
                Ok(())
            }
            TickSource::MicroTimer { .. } => self.set_slice_micros(millis.saturating_mul(1000)),
        }
    }

    /// Replaces the policy applied to threads that run out of stack.
    pub fn set_stack_overflow_hook(&self, hook: OverflowHook) {
        self.with(|inner| inner.overflow_hook = hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{self, SimArch};
    use crate::config::{Config, DEFAULT_TICK_MICROS};

    extern "C" fn idle(_arg: usize) {}

    #[test]
    fn test_tick_micros() {
        assert_eq!(TickSource::SysTick.tick_micros(), 1000);
        assert_eq!(TickSource::MicroTimer { micros: 100 }.tick_micros(), 100);
    }

    #[test]
    fn test_default_overflow_policy() {
        let id = ThreadId::new(3).unwrap();
        assert_eq!(end_on_overflow(id, 4), ThreadState::Ended);
    }

    #[test]
    fn test_slice_setters() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let id = scheduler.create(idle, 0).unwrap();
        scheduler.set_time_slice(id, 4).unwrap();
        assert_eq!(scheduler.time_slice(id), Ok(4));
        // Zero is clamped to the shortest slice.
        scheduler.set_time_slice(id, 0).unwrap();
        assert_eq!(scheduler.time_slice(id), Ok(1));
        scheduler.set_time_slice(ThreadId::MAIN, 2).unwrap();
        assert_eq!(scheduler.time_slice(ThreadId::MAIN), Ok(2));

        scheduler.set_default_time_slice(0);
        assert_eq!(scheduler.config().time_slice, 1);
    }

    #[test]
    fn test_slice_of_empty_slot_is_rejected() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let id = ThreadId::new(6).unwrap();
        assert_eq!(scheduler.set_time_slice(id, 7), Err(ThreadError::InvalidThreadId));
        assert_eq!(scheduler.time_slice(id), Err(ThreadError::InvalidThreadId));
        scheduler.with(|inner| assert_eq!(inner.threads[id.get()].ticks, 0));
    }

    #[test]
    fn test_micro_timer_selection() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        assert_eq!(scheduler.tick_source(), TickSource::SysTick);
        assert_eq!(scheduler.set_micro_timer(0), Err(ThreadError::TimerUnavailable));

        scheduler.use_micro_timer().unwrap();
        assert_eq!(
            scheduler.tick_source(),
            TickSource::MicroTimer { micros: DEFAULT_TICK_MICROS }
        );
        assert_eq!(sim::tick_micros(), DEFAULT_TICK_MICROS);

        scheduler.set_system_tick().unwrap();
        assert_eq!(sim::tick_micros(), 1000);
    }

    #[test]
    fn test_slice_millis_follows_tick_source() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::with_config(Config::new());
        scheduler.set_slice_millis(5).unwrap();
        assert_eq!(scheduler.config().time_slice, 5);

        scheduler.set_micro_timer(100).unwrap();
        scheduler.set_slice_millis(2).unwrap();
        assert_eq!(scheduler.tick_source(), TickSource::MicroTimer { micros: 2000 });
        assert_eq!(scheduler.config().time_slice, 1);

        scheduler.set_slice_micros(250).unwrap();
        assert_eq!(sim::tick_micros(), 250);
    }
}
