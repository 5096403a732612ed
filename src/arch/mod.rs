//! Architecture abstraction layer.
//!
//! The scheduler core never touches hardware directly. Everything it needs
//! from the platform (interrupt masking, the voluntary-switch trap, the
//! millisecond clock and the tick source) goes through the [`Arch`] trait.

use crate::error::ThreadResult;
use crate::preemption::TickSource;
use crate::scheduler::Scheduler;

/// Software trap numbers used for voluntary switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Switch immediately, regardless of activity flag or remaining quota.
    Yield,
    /// Force the activity flag to started, then switch.
    YieldAndStart,
}

impl Trap {
    pub const SVC_YIELD: u8 = 0x21;
    pub const SVC_YIELD_AND_START: u8 = 0x22;

    pub const fn svc_number(self) -> u8 {
        match self {
            Trap::Yield => Self::SVC_YIELD,
            Trap::YieldAndStart => Self::SVC_YIELD_AND_START,
        }
    }

    pub const fn from_svc(number: u8) -> Option<Self> {
        match number {
            Self::SVC_YIELD => Some(Trap::Yield),
            Self::SVC_YIELD_AND_START => Some(Trap::YieldAndStart),
            _ => None,
        }
    }
}

/// Architecture abstraction trait.
///
/// # Contract
///
/// Implementations drive the context-switch machinery. A port must route its
/// tick source into [`Scheduler::tick`], its trap into [`Scheduler::on_trap`]
/// and perform the actual switch through [`Scheduler::switch_from`].
pub trait Arch: Sized + 'static {
    /// Check if interrupts are currently enabled.
    fn interrupts_enabled() -> bool;

    /// Mask the interrupts that feed the scheduler.
    fn disable_interrupts();

    /// Unmask interrupts.
    fn enable_interrupts();

    /// Execute the voluntary-switch trap. Must not be called with interrupts
    /// masked.
    fn trap(scheduler: &Scheduler<Self>, trap: Trap);

    /// Monotonic millisecond clock.
    fn now_millis() -> u32;

    /// Make `source` the only active tick source.
    fn configure_tick(source: TickSource) -> ThreadResult<()>;

    /// Address a thread's entry function returns into.
    fn exit_routine() -> usize;

    /// Free-running cycle counter used for per-thread accounting.
    fn cycle_count() -> u32 {
        0
    }

    /// Hint for busy loops.
    fn idle() {
        core::hint::spin_loop();
    }
}

#[cfg(all(target_arch = "arm", feature = "cortex-m"))]
pub mod cortex_m;

#[cfg(any(test, feature = "std"))]
pub mod sim;

#[cfg(all(target_arch = "arm", feature = "cortex-m"))]
pub use self::cortex_m::CortexM as DefaultArch;

#[cfg(all(any(test, feature = "std"), not(all(target_arch = "arm", feature = "cortex-m"))))]
pub use self::sim::SimArch as DefaultArch;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_numbers() {
        assert_eq!(Trap::Yield.svc_number(), 0x21);
        assert_eq!(Trap::YieldAndStart.svc_number(), 0x22);
        assert_eq!(Trap::from_svc(0x21), Some(Trap::Yield));
        assert_eq!(Trap::from_svc(0x22), Some(Trap::YieldAndStart));
        assert_eq!(Trap::from_svc(0x00), None);
    }
}
