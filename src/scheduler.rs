use core::marker::PhantomData;
use core::mem;

use log::{trace, warn};

use crate::arch::{Arch, Trap};
use crate::config::Config;
use crate::guard::IrqGuard;
use crate::preemption::{end_on_overflow, Activity, OverflowHook, TickSource};
use crate::thread::{StackMemory, Thread, ThreadId, ThreadState, MAX_THREADS};

/// Round-robin scheduler over a fixed table of [`MAX_THREADS`] slots.
///
/// All state lives behind one lock that is only ever taken with interrupts
/// masked, so on a single core it is never contended. The tick and trap
/// handlers of a port reach the scheduler through a `&'static` handle and
/// call [`tick`](Self::tick), [`on_trap`](Self::on_trap) and
/// [`switch_from`](Self::switch_from).
pub struct Scheduler<A: Arch> {
    inner: spin::Mutex<Inner>,
    _arch: PhantomData<fn() -> A>,
}

pub(crate) struct Inner {
    pub threads: [Thread; MAX_THREADS],
    /// Slot currently executing.
    pub current: usize,
    pub active: Activity,
    /// Ticks left before the current thread may be preempted.
    pub count: u32,
    pub config: Config,
    pub tick_source: TickSource,
    pub overflow_hook: OverflowHook,
}

const fn initial_table(ticks: u32) -> [Thread; MAX_THREADS] {
    let mut table = [const { Thread::empty() }; MAX_THREADS];
    table[0].state = ThreadState::Running;
    table[0].ticks = ticks;
    table
}

impl<A: Arch> Default for Scheduler<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> Scheduler<A> {
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub const fn with_config(config: Config) -> Self {
        Scheduler {
            inner: spin::Mutex::new(Inner {
                threads: initial_table(config.slice_ticks()),
                current: 0,
                active: Activity::FirstRun,
                count: config.slice_ticks(),
                config,
                tick_source: TickSource::SysTick,
                overflow_hook: end_on_overflow,
            }),
            _arch: PhantomData,
        }
    }

    /// Runs `f` on the scheduler state inside a critical section.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let _irq = IrqGuard::<A>::enter();
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    /// Records the bounds of the main stack given its top address.
    pub fn init_main_stack(&self, top: usize) {
        self.with(|inner| {
            let size = inner.config.main_stack_size.min(top);
            inner.threads[0].stack = StackMemory::Region {
                base: top - size,
                size,
            };
        });
    }

    /// Starts preemption. Returns the previous activity flag.
    pub fn start(&self) -> Activity {
        self.restore(Activity::Started)
    }

    /// Stops preemption. Returns the previous activity flag.
    pub fn stop(&self) -> Activity {
        self.restore(Activity::Stopped)
    }

    /// Sets the activity flag to a value previously returned by
    /// [`start`](Self::start) or [`stop`](Self::stop) and returns the one it
    /// replaced.
    pub fn restore(&self, previous: Activity) -> Activity {
        self.with(|inner| mem::replace(&mut inner.active, previous))
    }

    pub fn activity(&self) -> Activity {
        self.with(|inner| inner.active)
    }

    /// Id of the executing thread.
    pub fn id(&self) -> ThreadId {
        self.with(|inner| ThreadId::from_index(inner.current))
    }

    /// Number of user threads that are running or suspended.
    pub fn thread_count(&self) -> usize {
        self.with(|inner| {
            inner.threads[1..]
                .iter()
                .filter(|t| t.state.is_alive())
                .count()
        })
    }

    pub fn config(&self) -> Config {
        self.with(|inner| inner.config)
    }

    pub(crate) fn saved_sp(&self, id: ThreadId) -> usize {
        self.with(|inner| inner.threads[id.get()].sp)
    }

    /// Periodic interrupt entry. Counts down the current thread's quota and
    /// returns `true` when the port must switch threads.
    pub fn tick(&self) -> bool {
        self.with(|inner| {
            if inner.active != Activity::Started {
                return false;
            }
            if inner.count > 0 {
                inner.count -= 1;
                false
            } else {
                true
            }
        })
    }

    /// Trap entry, called before the switch the trap requests.
    pub fn on_trap(&self, trap: Trap) {
        if trap == Trap::YieldAndStart {
            self.with(|inner| inner.active = Activity::Started);
        }
    }

    /// Context-switch entry, called from the port's switch handler.
    ///
    /// # Arguments
    ///
    /// * `sp` - Stack pointer of the outgoing thread after its registers
    ///   were pushed
    ///
    /// # Returns
    ///
    /// The saved stack pointer of the thread to resume.
    pub fn switch_from(&self, sp: usize) -> usize {
        let now = A::cycle_count();
        let (from, to, next_sp) = self.with(|inner| {
            let from = inner.current;
            let next_sp = inner.select_next(sp, now);
            (from, inner.current, next_sp)
        });
        trace!("switch #{} -> #{} (sp {:#x})", from, to, next_sp);
        next_sp
    }
}

impl Inner {
    /// Round-robin selection over slots 1..N, wrapping to slot 0, which is
    /// always eligible.
    fn select_next(&mut self, sp: usize, now: u32) -> usize {
        let cur = self.current;
        let outgoing = &mut self.threads[cur];
        outgoing.sp = sp;
        outgoing.cycles_accum += now.wrapping_sub(outgoing.cycles_start) as u64;
        // Off its stack now, so the slot may be reused.
        if outgoing.state == ThreadState::Ending {
            outgoing.state = ThreadState::Ended;
        }

        if cur != 0 && outgoing.state.is_alive() {
            let remaining = outgoing.stack_remaining();
            if remaining <= self.config.stack_margin {
                let state = (self.overflow_hook)(ThreadId::from_index(cur), remaining);
                warn!(
                    "thread #{} overflowed its stack ({} bytes left), now {:?}",
                    cur, remaining, state
                );
                self.threads[cur].state = state;
            }
        }

        let mut next = cur;
        loop {
            next += 1;
            if next >= MAX_THREADS {
                next = 0;
                break;
            }
            if self.threads[next].is_runnable() {
                break;
            }
        }

        let incoming = &mut self.threads[next];
        incoming.cycles_start = now;
        self.current = next;
        self.count = incoming.ticks;
        incoming.sp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimArch;

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::<SimArch>::new();
        assert_eq!(scheduler.id(), ThreadId::MAIN);
        assert_eq!(scheduler.activity(), Activity::FirstRun);
        assert_eq!(scheduler.thread_count(), 0);
    }

    #[test]
    fn test_start_stop_restore() {
        let scheduler = Scheduler::<SimArch>::new();
        assert_eq!(scheduler.start(), Activity::FirstRun);
        assert_eq!(scheduler.stop(), Activity::Started);
        assert_eq!(scheduler.restore(Activity::Started), Activity::Stopped);
        assert_eq!(scheduler.activity(), Activity::Started);
    }

    #[test]
    fn test_single_threaded_selection() {
        let scheduler = Scheduler::<SimArch>::new();
        scheduler.start();
        for _ in 0..3 {
            scheduler.switch_from(0x1000);
            assert_eq!(scheduler.id(), ThreadId::MAIN);
        }
        assert_eq!(scheduler.saved_sp(ThreadId::MAIN), 0x1000);
    }

    #[test]
    fn test_tick_counts_down_quota() {
        let scheduler = Scheduler::<SimArch>::with_config(Config::new().with_time_slice(3));
        assert!(!scheduler.tick(), "ticks must not preempt before start");

        scheduler.start();
        assert!(!scheduler.tick());
        assert!(!scheduler.tick());
        assert!(scheduler.tick());
    }

    #[test]
    fn test_yield_and_start_forces_started() {
        let scheduler = Scheduler::<SimArch>::new();
        scheduler.stop();
        scheduler.on_trap(Trap::Yield);
        assert_eq!(scheduler.activity(), Activity::Stopped);
        scheduler.on_trap(Trap::YieldAndStart);
        assert_eq!(scheduler.activity(), Activity::Started);
    }

    #[test]
    fn test_main_stack_region() {
        let scheduler = Scheduler::<SimArch>::new();
        scheduler.init_main_stack(0x2000_8000);
        let (base, size) = scheduler.with(|inner| {
            let stack = &inner.threads[0].stack;
            (stack.base(), stack.size())
        });
        assert_eq!(size, crate::config::DEFAULT_MAIN_STACK_SIZE);
        assert_eq!(base, 0x2000_8000 - size);
    }
}
