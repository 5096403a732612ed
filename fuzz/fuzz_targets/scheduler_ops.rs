#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use slice_threads::arch::sim::{self, SimArch};
use slice_threads::{RawMutex, Scheduler, ThreadError, ThreadId, ThreadState, MAX_THREADS};

#[derive(Debug, Arbitrary)]
enum Operation {
    Create { stack_size: u16, slice: u8 },
    Kill(u8),
    Suspend(u8),
    Restart(u8),
    SetState { slot: u8, state: u8 },
    Yield,
    Tick,
    Stop,
    Start,
    Wait { slot: u8, timeout: u8 },
    TryLock,
    Unlock,
    LockTimeout(u8),
}

extern "C" fn noop(_arg: usize) {}

fn id(slot: u8) -> ThreadId {
    ThreadId::new(slot as usize % MAX_THREADS).unwrap_or(ThreadId::MAIN)
}

fn state(raw: u8) -> ThreadState {
    match raw % 5 {
        0 => ThreadState::Empty,
        1 => ThreadState::Running,
        2 => ThreadState::Ended,
        3 => ThreadState::Ending,
        _ => ThreadState::Suspended,
    }
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    sim::reset();
    let scheduler = Scheduler::<SimArch>::new();
    let mutex = RawMutex::new(&scheduler);

    for _ in 0..256 {
        let Ok(op) = Operation::arbitrary(&mut u) else {
            break;
        };
        match op {
            Operation::Create { stack_size, slice } => {
                let created = scheduler.create_with_stack(noop, 0, stack_size as usize);
                if let Ok(id) = created {
                    let _ = scheduler.set_time_slice(id, slice as u32);
                }
            }
            Operation::Kill(slot) => {
                let _ = scheduler.kill(id(slot));
            }
            Operation::Suspend(slot) => {
                let _ = scheduler.suspend(id(slot));
            }
            Operation::Restart(slot) => {
                let _ = scheduler.restart(id(slot));
            }
            Operation::SetState { slot, state: raw } => {
                let _ = scheduler.set_state(id(slot), state(raw));
            }
            Operation::Yield => scheduler.yield_now(),
            Operation::Tick => {
                sim::tick(&scheduler);
            }
            Operation::Stop => {
                scheduler.stop();
            }
            Operation::Start => {
                scheduler.start();
            }
            Operation::Wait { slot, timeout } => {
                // Unbounded waits may never finish in a fuzz run.
                let _ = scheduler.wait(id(slot), timeout as u32 + 1);
            }
            Operation::TryLock => {
                let _ = mutex.try_lock();
            }
            Operation::Unlock => mutex.unlock(),
            Operation::LockTimeout(timeout) => {
                let result = mutex.lock(timeout as u32 + 1);
                assert!(matches!(result, Ok(()) | Err(ThreadError::Timeout)));
            }
        }

        // Slot 0 must stay runnable whatever was done to the table.
        assert_eq!(scheduler.state(ThreadId::MAIN), ThreadState::Running);
        assert!(scheduler.thread_count() < MAX_THREADS);
    }
});
