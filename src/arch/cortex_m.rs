//! ARMv7-M port.
//!
//! The main thread keeps running on MSP; every created thread runs on PSP.
//! `SysTick` counts the millisecond clock and drives [`Scheduler::tick`];
//! `SVCall` decodes the voluntary-switch traps. Both only pend `PendSV`,
//! which runs at the lowest priority and performs the actual switch, so a
//! switch never happens on top of another active handler.

use core::arch::{asm, naked_asm};
use core::ptr;

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;
use cortex_m::register::primask;
use log::info;
use portable_atomic::{AtomicPtr, AtomicU32, Ordering};

use super::{Arch, Trap};
use crate::error::{ThreadError, ThreadResult};
use crate::preemption::TickSource;
use crate::scheduler::Scheduler;
use crate::sync::exit_thread;

/// Largest value the 24-bit SysTick reload register accepts.
const SYST_RELOAD_MAX: u32 = 0x00FF_FFFF;

static SCHEDULER: AtomicPtr<Scheduler<CortexM>> = AtomicPtr::new(ptr::null_mut());
static CORE_HZ: AtomicU32 = AtomicU32::new(0);
static MILLIS: AtomicU32 = AtomicU32::new(0);
/// Microseconds counted towards the next millisecond.
static MICROS_PENDING: AtomicU32 = AtomicU32::new(0);
static TICK_MICROS: AtomicU32 = AtomicU32::new(1000);

static SYSTICK_HOOK: spin::Mutex<Option<fn()>> = spin::Mutex::new(None);
static SVCALL_HOOK: spin::Mutex<Option<fn(u8)>> = spin::Mutex::new(None);

extern "C" {
    // Provided by the cortex-m-rt linker script.
    static _stack_start: u32;
}

pub struct CortexM;

impl Arch for CortexM {
    fn interrupts_enabled() -> bool {
        primask::read().is_inactive()
    }

    fn disable_interrupts() {
        cortex_m::interrupt::disable();
    }

    fn enable_interrupts() {
        // SAFETY: only called to undo a matching `disable_interrupts`.
        unsafe { cortex_m::interrupt::enable() }
    }

    fn trap(_scheduler: &Scheduler<Self>, trap: Trap) {
        // SAFETY: the SVCall handler only pends PendSV; the switch returns
        // here with every register the thread owns restored.
        unsafe {
            match trap {
                Trap::Yield => asm!("svc 0x21"),
                Trap::YieldAndStart => asm!("svc 0x22"),
            }
        }
    }

    fn now_millis() -> u32 {
        MILLIS.load(Ordering::Relaxed)
    }

    fn configure_tick(source: TickSource) -> ThreadResult<()> {
        let core_hz = CORE_HZ.load(Ordering::Relaxed);
        if core_hz == 0 {
            return Err(ThreadError::TimerUnavailable);
        }
        let micros = source.tick_micros();
        let cycles = (core_hz as u64 * micros as u64) / 1_000_000;
        if cycles == 0 || cycles - 1 > SYST_RELOAD_MAX as u64 {
            return Err(ThreadError::TimerUnavailable);
        }

        cortex_m::interrupt::free(|_| {
            // SAFETY: SYST is only reprogrammed here and in `install`, both
            // with interrupts masked.
            let mut syst = unsafe { cortex_m::Peripherals::steal() }.SYST;
            syst.disable_counter();
            syst.set_reload(cycles as u32 - 1);
            syst.clear_current();
            syst.enable_counter();
            TICK_MICROS.store(micros, Ordering::Relaxed);
        });
        Ok(())
    }

    fn exit_routine() -> usize {
        thread_exit as usize
    }

    fn cycle_count() -> u32 {
        cortex_m::peripheral::DWT::cycle_count()
    }

    fn idle() {
        cortex_m::asm::nop();
    }
}

/// Hands `scheduler` to the exception handlers and starts the 1 ms tick.
///
/// `core_hz` is the SysTick clock. Call once, from the main thread, before
/// creating threads.
pub fn install(scheduler: &'static Scheduler<CortexM>, core_hz: u32) {
    // SAFETY: takes the address of a linker symbol, never reads it.
    let stack_top = unsafe { ptr::addr_of!(_stack_start) } as usize;
    scheduler.init_main_stack(stack_top);

    cortex_m::interrupt::free(|_| {
        SCHEDULER.store(ptr::from_ref(scheduler).cast_mut(), Ordering::Release);
        CORE_HZ.store(core_hz, Ordering::Relaxed);

        // SAFETY: the port owns these peripherals from here on.
        let mut p = unsafe { cortex_m::Peripherals::steal() };
        // SAFETY: lowering PendSV cannot break priority-based critical
        // sections; all scheduler locks mask interrupts outright.
        unsafe { p.SCB.set_priority(SystemHandler::PendSV, 0xFF) };
        p.DCB.enable_trace();
        p.DWT.enable_cycle_counter();

        p.SYST.set_clock_source(SystClkSource::Core);
        p.SYST.set_reload(core_hz / 1000 - 1);
        p.SYST.clear_current();
        p.SYST.enable_interrupt();
        p.SYST.enable_counter();
    });
    info!("scheduler installed, core clock {} Hz", core_hz);
}

/// Runs `hook` at the start of every SysTick, before the scheduler.
pub fn set_systick_hook(hook: fn()) {
    cortex_m::interrupt::free(|_| *SYSTICK_HOOK.lock() = Some(hook));
}

/// Receives every SVC number the scheduler does not handle itself.
pub fn set_svcall_hook(hook: fn(u8)) {
    cortex_m::interrupt::free(|_| *SVCALL_HOOK.lock() = Some(hook));
}

fn scheduler() -> Option<&'static Scheduler<CortexM>> {
    // SAFETY: only ever set from a `&'static` in `install`.
    unsafe { SCHEDULER.load(Ordering::Acquire).as_ref() }
}

#[cortex_m_rt::exception]
fn SysTick() {
    if let Some(hook) = *SYSTICK_HOOK.lock() {
        hook();
    }

    let pending = MICROS_PENDING.load(Ordering::Relaxed) + TICK_MICROS.load(Ordering::Relaxed);
    MILLIS.store(
        MILLIS.load(Ordering::Relaxed).wrapping_add(pending / 1000),
        Ordering::Relaxed,
    );
    MICROS_PENDING.store(pending % 1000, Ordering::Relaxed);

    if let Some(scheduler) = scheduler() {
        if scheduler.tick() {
            SCB::set_pendsv();
        }
    }
}

/// Reads the immediate of the `svc` instruction that trapped, then
/// continues in [`svc_dispatch`].
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
#[unsafe(naked)]
extern "C" fn SVCall() {
    naked_asm!(
        "tst lr, #4",
        "ite eq",
        "mrseq r0, msp",
        "mrsne r0, psp",
        "ldr r0, [r0, #24]", // stacked PC
        "ldrb r0, [r0, #-2]", // low byte of the svc instruction
        "b {dispatch}",
        dispatch = sym svc_dispatch,
    );
}

extern "C" fn svc_dispatch(number: u8) {
    let Some(trap) = Trap::from_svc(number) else {
        if let Some(hook) = *SVCALL_HOOK.lock() {
            hook(number);
        }
        return;
    };
    if let Some(scheduler) = scheduler() {
        scheduler.on_trap(trap);
        SCB::set_pendsv();
    }
}

/// Context switch.
///
/// Pushes `r4-r11` and EXC_RETURN below the hardware frame of the outgoing
/// thread, on whichever stack it was using, asks the scheduler for the next
/// stack pointer and unwinds the incoming thread's frame the same way.
#[cfg(not(feature = "full-fpu"))]
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
#[unsafe(naked)]
extern "C" fn PendSV() {
    naked_asm!(
        "tst lr, #4",
        "bne 1f",
        // Main thread: its frame is on the handler stack.
        "push {{r4-r11, lr}}",
        "mov r0, sp",
        "b 2f",
        "1:",
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11, lr}}",
        "2:",
        "bl {switch}",
        "ldmia r0!, {{r4-r11, lr}}",
        "tst lr, #4",
        "bne 3f",
        "mov sp, r0",
        "bx lr",
        "3:",
        "msr psp, r0",
        "bx lr",
        switch = sym switch_context,
    );
}

/// Context switch that additionally preserves `s16-s31` for threads that
/// were using the FPU.
#[cfg(feature = "full-fpu")]
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
#[unsafe(naked)]
extern "C" fn PendSV() {
    naked_asm!(
        "tst lr, #4",
        "bne 1f",
        "tst lr, #16",
        "it eq",
        "vpusheq {{s16-s31}}",
        "push {{r4-r11, lr}}",
        "mov r0, sp",
        "b 2f",
        "1:",
        "mrs r0, psp",
        "tst lr, #16",
        "it eq",
        "vstmdbeq r0!, {{s16-s31}}",
        "stmdb r0!, {{r4-r11, lr}}",
        "2:",
        "bl {switch}",
        "ldmia r0!, {{r4-r11, lr}}",
        "tst lr, #16",
        "it eq",
        "vldmiaeq r0!, {{s16-s31}}",
        "tst lr, #4",
        "bne 3f",
        "mov sp, r0",
        "bx lr",
        "3:",
        "msr psp, r0",
        "bx lr",
        switch = sym switch_context,
    );
}

extern "C" fn switch_context(sp: usize) -> usize {
    match scheduler() {
        Some(scheduler) => scheduler.switch_from(sp),
        None => sp,
    }
}

/// Every thread's entry function returns here.
extern "C" fn thread_exit() -> ! {
    match scheduler() {
        Some(scheduler) => exit_thread(scheduler),
        None => loop {
            cortex_m::asm::wfi();
        },
    }
}
