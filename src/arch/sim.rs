//! Deterministic host simulation of a port.
//!
//! No stacks are actually switched. A trap or an expiring tick runs the same
//! selection bookkeeping a real switch routine would, after which the caller
//! simply carries on as "the next thread". The millisecond clock is local to
//! the host thread and advances by one millisecond per trap, and by the tick
//! length per tick.

extern crate std;

use core::cell::Cell;

use super::{Arch, Trap};
use crate::error::{ThreadError, ThreadResult};
use crate::preemption::TickSource;
use crate::scheduler::Scheduler;

/// Cycles charged to the running thread for every simulated millisecond.
pub const CYCLES_PER_MILLI: u32 = 1000;

std::thread_local! {
    static MICROS: Cell<u64> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static TICK_MICROS: Cell<u32> = const { Cell::new(1000) };
    static LIVE_SP: Cell<Option<usize>> = const { Cell::new(None) };
    static TRAPS: Cell<u64> = const { Cell::new(0) };
}

pub struct SimArch;

impl Arch for SimArch {
    fn interrupts_enabled() -> bool {
        IRQ_ENABLED.with(Cell::get)
    }

    fn disable_interrupts() {
        IRQ_ENABLED.with(|e| e.set(false));
    }

    fn enable_interrupts() {
        IRQ_ENABLED.with(|e| e.set(true));
    }

    fn trap(scheduler: &Scheduler<Self>, trap: Trap) {
        assert!(
            Self::interrupts_enabled(),
            "trap issued with interrupts masked"
        );
        TRAPS.with(|t| t.set(t.get() + 1));
        advance_micros(1000);
        scheduler.on_trap(trap);
        switch(scheduler);
    }

    fn now_millis() -> u32 {
        (MICROS.with(Cell::get) / 1000) as u32
    }

    fn configure_tick(source: TickSource) -> ThreadResult<()> {
        let micros = source.tick_micros();
        if micros == 0 {
            return Err(ThreadError::TimerUnavailable);
        }
        TICK_MICROS.with(|t| t.set(micros));
        Ok(())
    }

    fn exit_routine() -> usize {
        sim_exit as usize
    }

    fn cycle_count() -> u32 {
        (MICROS.with(Cell::get) * CYCLES_PER_MILLI as u64 / 1000) as u32
    }
}

extern "C" fn sim_exit() -> ! {
    panic!("simulated threads never execute their entry point");
}

fn advance_micros(micros: u32) {
    MICROS.with(|m| m.set(m.get() + micros as u64));
}

fn switch(scheduler: &Scheduler<SimArch>) {
    let sp = LIVE_SP
        .with(Cell::take)
        .unwrap_or_else(|| scheduler.saved_sp(scheduler.id()));
    scheduler.switch_from(sp);
}

/// One firing of the periodic interrupt. Returns whether it switched.
pub fn tick(scheduler: &Scheduler<SimArch>) -> bool {
    advance_micros(TICK_MICROS.with(Cell::get));
    if scheduler.tick() {
        switch(scheduler);
        true
    } else {
        false
    }
}

/// Stack pointer the running thread will be switched out with next, in
/// place of its last saved value.
pub fn set_live_sp(sp: usize) {
    LIVE_SP.with(|s| s.set(Some(sp)));
}

pub fn advance_millis(ms: u32) {
    advance_micros(ms.saturating_mul(1000));
}

/// Number of traps issued on this host thread.
pub fn trap_count() -> u64 {
    TRAPS.with(Cell::get)
}

pub fn tick_micros() -> u32 {
    TICK_MICROS.with(Cell::get)
}

/// Restores the simulated hardware of this host thread to power-on state.
pub fn reset() {
    MICROS.with(|m| m.set(0));
    IRQ_ENABLED.with(|e| e.set(true));
    TICK_MICROS.with(|t| t.set(1000));
    LIVE_SP.with(|s| s.set(None));
    TRAPS.with(|t| t.set(0));
}
