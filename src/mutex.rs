//! Blocking mutex with a single parked waiter.
//!
//! A contender that finds the lock taken can park itself: it records its id
//! and suspends, and the next unlock restarts it and forces an immediate
//! switch so it gets to run promptly. Only one contender can be parked at a
//! time. Any others poll, yielding between attempts, so among three or more
//! contenders there is no ordering guarantee, only progress.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use portable_atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::arch::Arch;
use crate::error::ThreadResult;
use crate::guard::critical_section;
use crate::scheduler::Scheduler;
use crate::thread::ThreadId;

const NO_WAITER: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockState {
    Unlocked = 0,
    Locked = 1,
}

/// Lock word plus parked-waiter slot, without protected data.
///
/// Every field is only written inside a critical section, so plain loads
/// and stores suffice and no compare-and-swap is required of the core.
pub struct RawMutex<'a, A: Arch> {
    scheduler: &'a Scheduler<A>,
    state: AtomicU8,
    waiter: AtomicUsize,
    /// Slot generation of the parked waiter. A waiter killed while parked
    /// leaves a stale record that must not wake a later occupant.
    generation: AtomicU32,
}

impl<'a, A: Arch> RawMutex<'a, A> {
    pub const fn new(scheduler: &'a Scheduler<A>) -> Self {
        RawMutex {
            scheduler,
            state: AtomicU8::new(LockState::Unlocked as u8),
            waiter: AtomicUsize::new(NO_WAITER),
            generation: AtomicU32::new(0),
        }
    }

    /// Takes the lock if it is free. Never blocks.
    pub fn try_lock(&self) -> bool {
        critical_section::<A, _>(|| {
            if self.state.load(Ordering::Acquire) == LockState::Unlocked as u8 {
                self.state.store(LockState::Locked as u8, Ordering::Release);
                true
            } else {
                false
            }
        })
    }

    /// Acquires the lock, yielding while it is held elsewhere.
    ///
    /// # Arguments
    ///
    /// * `timeout_ms` - 0 to wait indefinitely, in which case the caller may
    ///   park itself until the next unlock; otherwise the caller only polls
    ///
    /// # Returns
    ///
    /// `Ok(())` once the lock is held, or `Timeout` once more than
    /// `timeout_ms` milliseconds have passed without acquiring it.
    pub fn lock(&self, timeout_ms: u32) -> ThreadResult<()> {
        let park = timeout_ms == 0;
        self.scheduler
            .poll_until(timeout_ms, || self.try_lock_or_park(park))
    }

    /// One acquisition attempt. On failure, and if `park` is set, suspends
    /// the caller as the waiter when the slot is free.
    pub(crate) fn try_lock_or_park(&self, park: bool) -> bool {
        if self.try_lock() {
            return true;
        }
        if park {
            self.park();
        }
        false
    }

    fn park(&self) {
        let scheduler = self.scheduler;
        let _suspend = scheduler.suspend_scope();
        let id = scheduler.id();
        // The main thread must stay runnable.
        if id.is_main() {
            return;
        }
        let generation = scheduler.generation(id);
        let parked = critical_section::<A, _>(|| {
            let held = self.state.load(Ordering::Acquire) == LockState::Locked as u8;
            if !held || self.waiter.load(Ordering::Acquire) != NO_WAITER {
                return false;
            }
            self.waiter.store(id.get(), Ordering::Release);
            self.generation.store(generation, Ordering::Release);
            true
        });
        if parked {
            // Running and not main, so this cannot fail.
            let _ = scheduler.suspend(id);
        }
    }

    /// Releases the lock. A parked waiter is restarted and switched to
    /// straight away, even if the system was stopped.
    ///
    /// A waiter that was killed while parked is forgotten; whatever thread
    /// occupies its slot now is left alone.
    pub fn unlock(&self) {
        let scheduler = self.scheduler;
        let suspend = scheduler.suspend_scope();
        let waiter = critical_section::<A, _>(|| {
            if self.state.load(Ordering::Acquire) != LockState::Locked as u8 {
                return None;
            }
            self.state.store(LockState::Unlocked as u8, Ordering::Release);
            let index = self.waiter.load(Ordering::Acquire);
            if index == NO_WAITER {
                return None;
            }
            self.waiter.store(NO_WAITER, Ordering::Release);
            let generation = self.generation.load(Ordering::Acquire);
            Some((ThreadId::from_index(index), generation))
        });
        let woken = waiter
            .is_some_and(|(id, generation)| scheduler.restart_generation(id, generation));
        drop(suspend);
        if woken {
            scheduler.yield_and_start();
        }
    }

    pub fn state(&self) -> LockState {
        critical_section::<A, _>(|| match self.state.load(Ordering::Acquire) {
            0 => LockState::Unlocked,
            _ => LockState::Locked,
        })
    }

    /// The contender currently parked, if any.
    pub fn parked(&self) -> Option<ThreadId> {
        critical_section::<A, _>(|| match self.waiter.load(Ordering::Acquire) {
            NO_WAITER => None,
            index => Some(ThreadId::from_index(index)),
        })
    }

    /// Acquires the lock and releases it when the scope ends.
    pub fn scope(&self) -> LockScope<'_, 'a, A> {
        // Unbounded waits never time out.
        let _ = self.lock(0);
        LockScope { mutex: self }
    }

    pub fn try_scope(&self, timeout_ms: u32) -> ThreadResult<LockScope<'_, 'a, A>> {
        self.lock(timeout_ms)?;
        Ok(LockScope { mutex: self })
    }
}

impl<A: Arch> fmt::Debug for RawMutex<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMutex")
            .field("state", &self.state())
            .field("parked", &self.parked())
            .finish()
    }
}

/// Holds a [`RawMutex`] for as long as it lives.
#[must_use = "the lock is released as soon as the scope is dropped"]
pub struct LockScope<'m, 'a, A: Arch> {
    mutex: &'m RawMutex<'a, A>,
}

impl<A: Arch> Drop for LockScope<'_, '_, A> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Mutex owning the data it protects.
pub struct Mutex<'a, A: Arch, T> {
    raw: RawMutex<'a, A>,
    data: UnsafeCell<T>,
}

unsafe impl<A: Arch, T: Send> Sync for Mutex<'_, A, T> {}

impl<'a, A: Arch, T> Mutex<'a, A, T> {
    pub const fn new(scheduler: &'a Scheduler<A>, data: T) -> Self {
        Mutex {
            raw: RawMutex::new(scheduler),
            data: UnsafeCell::new(data),
        }
    }

    /// Waits as long as it takes to acquire the lock.
    pub fn lock(&self) -> MutexGuard<'_, 'a, A, T> {
        let _ = self.raw.lock(0);
        MutexGuard { mutex: self }
    }

    pub fn lock_timeout(&self, timeout_ms: u32) -> ThreadResult<MutexGuard<'_, 'a, A, T>> {
        self.raw.lock(timeout_ms)?;
        Ok(MutexGuard { mutex: self })
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, 'a, A, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn raw(&self) -> &RawMutex<'a, A> {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct MutexGuard<'m, 'a, A: Arch, T> {
    mutex: &'m Mutex<'a, A, T>,
}

impl<A: Arch, T> Deref for MutexGuard<'_, '_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<A: Arch, T> DerefMut for MutexGuard<'_, '_, A, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<A: Arch, T> Drop for MutexGuard<'_, '_, A, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{self, SimArch};
    use crate::error::ThreadError;
    use crate::thread::ThreadState;

    extern "C" fn entry(_arg: usize) {}

    #[test]
    fn test_try_lock_unlock() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let mutex = RawMutex::new(&scheduler);
        assert_eq!(mutex.state(), LockState::Unlocked);
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        assert_eq!(mutex.state(), LockState::Locked);
        mutex.unlock();
        assert_eq!(mutex.state(), LockState::Unlocked);
        assert!(mutex.try_lock());
    }

    #[test]
    fn test_unlock_when_unlocked_is_noop() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let mutex = RawMutex::new(&scheduler);
        mutex.unlock();
        assert_eq!(mutex.state(), LockState::Unlocked);
        assert_eq!(sim::trap_count(), 0);
    }

    #[test]
    fn test_lock_timeout_bounds() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let mutex = RawMutex::new(&scheduler);
        assert!(mutex.try_lock());

        let start = scheduler.now_millis();
        assert_eq!(mutex.lock(10), Err(ThreadError::Timeout));
        let elapsed = scheduler.now_millis() - start;
        assert!((10..=11).contains(&elapsed), "gave up after {elapsed} ms");
        assert_eq!(mutex.parked(), None, "timed locks never park");
    }

    #[test]
    fn test_main_thread_never_parks() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let mutex = RawMutex::new(&scheduler);
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock_or_park(true));
        assert_eq!(mutex.parked(), None);
        assert_eq!(scheduler.state(ThreadId::MAIN), ThreadState::Running);
    }

    #[test]
    fn test_park_and_wake() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let mutex = RawMutex::new(&scheduler);
        let worker = scheduler.create(entry, 0).unwrap();
        assert!(mutex.try_lock());

        // Switch to the worker and let it contend.
        scheduler.yield_now();
        assert_eq!(scheduler.id(), worker);
        assert!(!mutex.try_lock_or_park(true));
        assert_eq!(mutex.parked(), Some(worker));
        assert_eq!(scheduler.state(worker), ThreadState::Suspended);

        // Suspended threads are skipped.
        scheduler.yield_now();
        assert_eq!(scheduler.id(), ThreadId::MAIN);
        scheduler.yield_now();
        assert_eq!(scheduler.id(), ThreadId::MAIN);

        scheduler.stop();
        mutex.unlock();
        assert_eq!(mutex.parked(), None);
        assert_eq!(scheduler.state(worker), ThreadState::Running);
        // The wake-up switch goes straight to the waiter and restarts the system.
        assert_eq!(scheduler.id(), worker);
        assert_eq!(scheduler.activity(), crate::preemption::Activity::Started);
        assert!(mutex.try_lock());
    }

    #[test]
    fn test_single_parked_slot() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let mutex = RawMutex::new(&scheduler);
        let first = scheduler.create(entry, 0).unwrap();
        let second = scheduler.create(entry, 0).unwrap();
        assert!(mutex.try_lock());

        scheduler.yield_now();
        assert_eq!(scheduler.id(), first);
        assert!(!mutex.try_lock_or_park(true));

        scheduler.yield_now();
        assert_eq!(scheduler.id(), second);
        assert!(!mutex.try_lock_or_park(true));

        // The second contender falls back to polling.
        assert_eq!(mutex.parked(), Some(first));
        assert_eq!(scheduler.state(second), ThreadState::Running);
    }

    #[test]
    fn test_lock_scope_releases() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let mutex = RawMutex::new(&scheduler);
        {
            let _scope = mutex.scope();
            assert_eq!(mutex.state(), LockState::Locked);
        }
        assert_eq!(mutex.state(), LockState::Unlocked);

        let held = mutex.try_scope(5).unwrap();
        assert!(matches!(mutex.try_scope(2), Err(ThreadError::Timeout)));
        drop(held);
        assert_eq!(mutex.state(), LockState::Unlocked);
    }

    #[test]
    fn test_data_mutex_guard() {
        sim::reset();
        let scheduler = Scheduler::<SimArch>::new();
        let mutex = Mutex::new(&scheduler, 0u32);
        {
            let mut guard = mutex.lock();
            *guard += 5;
            assert!(mutex.try_lock().is_none());
        }
        *mutex.lock_timeout(1).unwrap() += 1;
        assert_eq!(*mutex.try_lock().unwrap(), 6);
        assert_eq!(mutex.into_inner(), 6);
    }
}
