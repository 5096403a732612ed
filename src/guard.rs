//! Critical sections and scheduler suspension scopes.

use core::marker::PhantomData;

use crate::arch::Arch;
use crate::preemption::Activity;
use crate::scheduler::Scheduler;

/// Interrupt guard for masking the interrupts that feed the scheduler.
///
/// Restores the exact mask state it found, so nested guards compose: only
/// the outermost one re-enables interrupts.
pub struct IrqGuard<A: Arch> {
    /// Previous interrupt state
    was_enabled: bool,
    _arch: PhantomData<fn() -> A>,
    // Interrupt state belongs to the core; the guard must not move threads.
    _not_send: PhantomData<*const ()>,
}

impl<A: Arch> IrqGuard<A> {
    /// Enter an interrupt-disabled critical section.
    pub fn enter() -> Self {
        let was_enabled = A::interrupts_enabled();
        A::disable_interrupts();
        IrqGuard {
            was_enabled,
            _arch: PhantomData,
            _not_send: PhantomData,
        }
    }
}

impl<A: Arch> Drop for IrqGuard<A> {
    fn drop(&mut self) {
        if self.was_enabled {
            A::enable_interrupts();
        }
    }
}

/// Runs `f` with interrupts masked.
pub fn critical_section<A: Arch, R>(f: impl FnOnce() -> R) -> R {
    let _irq = IrqGuard::<A>::enter();
    f()
}

/// Halts preemption for the lifetime of the scope.
///
/// Unlike [`IrqGuard`], interrupts stay enabled; only the scheduler's
/// activity flag is cleared, and restored to its captured value on drop.
/// Explicit yields still switch threads.
pub struct SuspendScope<'a, A: Arch> {
    scheduler: &'a Scheduler<A>,
    saved: Activity,
}

impl<'a, A: Arch> SuspendScope<'a, A> {
    pub fn new(scheduler: &'a Scheduler<A>) -> Self {
        let saved = scheduler.stop();
        SuspendScope { scheduler, saved }
    }

    /// Activity flag that will be restored when the scope ends.
    pub fn saved(&self) -> Activity {
        self.saved
    }
}

impl<A: Arch> Drop for SuspendScope<'_, A> {
    fn drop(&mut self) {
        self.scheduler.restore(self.saved);
    }
}

impl<A: Arch> Scheduler<A> {
    /// Stops preemption until the returned scope is dropped.
    pub fn suspend_scope(&self) -> SuspendScope<'_, A> {
        SuspendScope::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{self, SimArch};

    #[test]
    fn test_irq_guard_nesting() {
        sim::reset();
        assert!(SimArch::interrupts_enabled());
        {
            let _outer = IrqGuard::<SimArch>::enter();
            assert!(!SimArch::interrupts_enabled());
            {
                let _inner = IrqGuard::<SimArch>::enter();
                assert!(!SimArch::interrupts_enabled());
            }
            // The inner guard found interrupts masked and must leave them so.
            assert!(!SimArch::interrupts_enabled());
        }
        assert!(SimArch::interrupts_enabled());
    }

    #[test]
    fn test_critical_section_returns_value() {
        sim::reset();
        let value = critical_section::<SimArch, _>(|| {
            assert!(!SimArch::interrupts_enabled());
            7
        });
        assert_eq!(value, 7);
        assert!(SimArch::interrupts_enabled());
    }

    #[test]
    fn test_suspend_scope_restores_activity() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        scheduler.start();
        {
            let scope = scheduler.suspend_scope();
            assert_eq!(scope.saved(), Activity::Started);
            assert_eq!(scheduler.activity(), Activity::Stopped);
            assert!(!scheduler.tick(), "no preemption inside the scope");
        }
        assert_eq!(scheduler.activity(), Activity::Started);
    }

    #[test]
    fn test_suspend_scope_nesting() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        scheduler.start();
        {
            let _outer = SuspendScope::new(&scheduler);
            {
                let inner = SuspendScope::new(&scheduler);
                assert_eq!(inner.saved(), Activity::Stopped);
            }
            assert_eq!(scheduler.activity(), Activity::Stopped);
        }
        assert_eq!(scheduler.activity(), Activity::Started);
    }
}
