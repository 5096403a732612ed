//! Stress tests to verify scheduler stability under churn and contention

#![cfg(feature = "std")]

extern crate std;

use std::vec::Vec;

use slice_threads::arch::sim::{self, SimArch};
use slice_threads::{Mutex, Scheduler, ThreadError, ThreadId, ThreadState, MAX_THREADS};

extern "C" fn noop(_arg: usize) {}

/// Stress test: create and retire threads far beyond the table size
#[test]
fn stress_test_slot_churn() {
    sim::reset();
    let scheduler = Scheduler::<SimArch>::new();
    let mut created = 0;

    for round in 0..500 {
        match scheduler.create_with_stack(noop, round, 256 + (round % 7) * 64) {
            Ok(_) => created += 1,
            Err(ThreadError::MaxThreadsReached) => {
                // Retire whoever is running, the way a returning thread would.
                let id = scheduler.id();
                if !id.is_main() {
                    scheduler.kill(id).unwrap();
                }
                scheduler.yield_now();
            }
            Err(e) => panic!("unexpected error in round {round}: {e}"),
        }
        assert!(scheduler.thread_count() < MAX_THREADS);
    }
    assert!(created > MAX_THREADS * 10, "only {created} threads created");
}

/// Stress test: timed locks across many contending threads never overlap
#[test]
fn stress_test_contended_data_mutex() {
    sim::reset();
    let scheduler = Scheduler::<SimArch>::new();
    let mutex = Mutex::new(&scheduler, Vec::<ThreadId>::new());
    for _ in 1..MAX_THREADS {
        scheduler.create(noop, 0).unwrap();
    }

    let mut entries = [0u32; MAX_THREADS];
    for step in 0..2_000u32 {
        let me = scheduler.id();
        if let Some(mut log) = mutex.try_lock() {
            log.push(me);
            entries[me.get()] += 1;
            if step % 5 != 0 {
                // Hold the lock across a switch now and then.
                scheduler.yield_now();
                assert!(mutex.try_lock().is_none());
            }
        }
        if step % 3 == 0 {
            sim::tick(&scheduler);
        } else {
            scheduler.yield_now();
        }
    }

    let log = mutex.lock();
    assert_eq!(log.len() as u32, entries.iter().sum::<u32>());
    assert!(entries.iter().all(|&n| n > 0), "some thread starved: {entries:?}");
}

/// Stress test: suspend and restart at random never loses a thread
#[test]
fn stress_test_suspend_restart() {
    sim::reset();
    let scheduler = Scheduler::<SimArch>::new();
    let ids: Vec<ThreadId> = (1..MAX_THREADS)
        .map(|_| scheduler.create(noop, 0).unwrap())
        .collect();

    let mut seed = 0x2545_f491u32;
    for _ in 0..5_000 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let id = ids[seed as usize % ids.len()];
        match scheduler.state(id) {
            ThreadState::Running => scheduler.suspend(id).unwrap(),
            ThreadState::Suspended => scheduler.restart(id).unwrap(),
            state => panic!("thread {id} in unexpected state {state:?}"),
        }
        scheduler.yield_now();
        let current = scheduler.id();
        assert!(current.is_main() || scheduler.state(current) == ThreadState::Running);
    }

    for &id in &ids {
        let _ = scheduler.restart(id);
        assert_eq!(scheduler.state(id), ThreadState::Running);
    }
    assert_eq!(scheduler.thread_count(), MAX_THREADS - 1);
}
