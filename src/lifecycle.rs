//! Thread creation, termination and state control.

use alloc::vec::Vec;
use core::mem;

use log::{debug, info, warn};

use crate::arch::Arch;
use crate::context::{min_stack_size, write_initial_frame, InitialFrame};
use crate::error::{ThreadError, ThreadResult};
use crate::preemption::Activity;
use crate::scheduler::Scheduler;
use crate::thread::{StackMemory, Thread, ThreadEntry, ThreadId, ThreadState, MAX_THREADS};

/// Where a new thread's stack comes from.
pub(crate) enum StackRequest {
    /// Allocate the configured default size.
    Default,
    /// Allocate exactly this many bytes.
    Size(usize),
    /// Run on caller-provided memory.
    Buffer(&'static mut [u8]),
}

fn allocate_stack(size: usize, needed: usize) -> ThreadResult<StackMemory> {
    if size < needed {
        return Err(ThreadError::StackTooSmall);
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| ThreadError::OutOfMemory)?;
    buf.resize(size, 0u8);
    Ok(StackMemory::Owned(buf.into_boxed_slice()))
}

impl<A: Arch> Scheduler<A> {
    /// Creates a thread running `entry(arg)` on a stack of the default size.
    ///
    /// # Arguments
    ///
    /// * `entry` - Function the thread starts in; returning from it ends the
    ///   thread
    /// * `arg` - Value passed to `entry`
    ///
    /// # Returns
    ///
    /// The id of the slot the thread was placed in, or `MaxThreadsReached`,
    /// `StackTooSmall` or `OutOfMemory`.
    pub fn create(&self, entry: ThreadEntry, arg: usize) -> ThreadResult<ThreadId> {
        self.create_thread(entry as usize, arg, StackRequest::Default, None)
            .map(|(id, _)| id)
    }

    /// Creates a thread with a freshly allocated stack of `stack_size` bytes.
    pub fn create_with_stack(
        &self,
        entry: ThreadEntry,
        arg: usize,
        stack_size: usize,
    ) -> ThreadResult<ThreadId> {
        self.create_thread(entry as usize, arg, StackRequest::Size(stack_size), None)
            .map(|(id, _)| id)
    }

    /// Creates a thread running on `stack`, which is never freed.
    pub fn create_with_buffer(
        &self,
        entry: ThreadEntry,
        arg: usize,
        stack: &'static mut [u8],
    ) -> ThreadResult<ThreadId> {
        self.create_thread(entry as usize, arg, StackRequest::Buffer(stack), None)
            .map(|(id, _)| id)
    }

    /// Populates the first reusable slot. Returns the id and the generation
    /// the slot was given.
    ///
    /// Preemption is stopped for the whole operation. If it was started, or
    /// nothing had been started yet, the scheduler is started on success.
    pub(crate) fn create_thread(
        &self,
        entry: usize,
        arg: usize,
        request: StackRequest,
        slice: Option<u32>,
    ) -> ThreadResult<(ThreadId, u32)> {
        let previous = self.stop();
        let result = self.populate_slot(entry, arg, request, slice);
        match (&result, previous) {
            (Ok(_), Activity::Started | Activity::FirstRun) => {
                self.start();
            }
            _ => {
                self.restore(previous);
            }
        }
        result
    }

    fn populate_slot(
        &self,
        entry: usize,
        arg: usize,
        request: StackRequest,
        slice: Option<u32>,
    ) -> ThreadResult<(ThreadId, u32)> {
        // A killed thread may still be the one executing; its stack is off
        // limits until it has been switched out.
        let claimed = self.with(|inner| {
            let current = inner.current;
            let slot = (1..MAX_THREADS)
                .find(|&n| n != current && inner.threads[n].state.is_reusable())?;
            let old = mem::replace(&mut inner.threads[slot].stack, StackMemory::None);
            Some((slot, old, inner.config))
        });
        let Some((slot, old, config)) = claimed else {
            warn!("no free thread slot");
            return Err(ThreadError::MaxThreadsReached);
        };
        // Released outside the critical section.
        drop(old);

        let needed = min_stack_size(config.stack_margin);
        let mut stack = match request {
            StackRequest::Buffer(buf) => StackMemory::Borrowed(buf),
            StackRequest::Default => allocate_stack(config.stack_size, needed)?,
            StackRequest::Size(size) => allocate_stack(size, needed)?,
        };

        let frame = InitialFrame::new(entry, arg, A::exit_routine());
        let sp = stack
            .as_mut_slice()
            .and_then(|buf| write_initial_frame(buf, &frame, config.stack_margin))
            .ok_or(ThreadError::StackTooSmall)?;
        let ticks = slice.map_or(config.slice_ticks(), |t| t.saturating_sub(1));
        debug!("thread #{} stack {:?}, sp {:#x}", slot, stack, sp);

        let generation = self.with(|inner| {
            let thread = &mut inner.threads[slot];
            thread.stack = stack;
            thread.sp = sp;
            thread.ticks = ticks;
            thread.cycles_accum = 0;
            thread.cycles_start = 0;
            thread.generation = thread.generation.wrapping_add(1);
            thread.state = ThreadState::Running;
            thread.generation
        });

        info!("created thread #{} ({} ticks per slice)", slot, ticks + 1);
        Ok((ThreadId::from_index(slot), generation))
    }

    /// Marks a thread ended. It keeps executing until its next switch, after
    /// which it is never scheduled again.
    pub fn kill(&self, id: ThreadId) -> ThreadResult<()> {
        if id.is_main() {
            return Err(ThreadError::ReservedThread);
        }
        self.with(|inner| {
            let thread = &mut inner.threads[id.get()];
            if thread.state == ThreadState::Empty {
                return Err(ThreadError::InvalidThreadId);
            }
            thread.state = ThreadState::Ended;
            Ok(())
        })?;
        debug!("killed thread {}", id);
        Ok(())
    }

    /// Excludes a running thread from scheduling from its next switch on.
    pub fn suspend(&self, id: ThreadId) -> ThreadResult<()> {
        self.toggle(id, ThreadState::Running, ThreadState::Suspended)
    }

    /// Makes a suspended thread eligible for scheduling again.
    pub fn restart(&self, id: ThreadId) -> ThreadResult<()> {
        self.toggle(id, ThreadState::Suspended, ThreadState::Running)
    }

    fn toggle(&self, id: ThreadId, from: ThreadState, to: ThreadState) -> ThreadResult<()> {
        if id.is_main() {
            return Err(ThreadError::ReservedThread);
        }
        self.with(|inner| {
            let thread = &mut inner.threads[id.get()];
            match thread.state {
                ThreadState::Empty => Err(ThreadError::InvalidThreadId),
                state if state == from || state == to => {
                    thread.state = to;
                    Ok(())
                }
                _ => Err(ThreadError::ThreadNotRunnable),
            }
        })?;
        debug!("thread {} now {:?}", id, to);
        Ok(())
    }

    pub fn state(&self, id: ThreadId) -> ThreadState {
        self.with(|inner| inner.threads[id.get()].state)
    }

    /// Overrides a thread's state directly.
    ///
    /// The main thread can only be set running, and a slot without a stack
    /// cannot be made running or suspended.
    pub fn set_state(&self, id: ThreadId, state: ThreadState) -> ThreadResult<()> {
        if id.is_main() && state != ThreadState::Running {
            return Err(ThreadError::ReservedThread);
        }
        self.with(|inner| {
            let thread = &mut inner.threads[id.get()];
            if state.is_alive() && !id.is_main() && matches!(thread.stack, StackMemory::None) {
                return Err(ThreadError::InvalidThreadId);
            }
            thread.state = state;
            Ok(())
        })
    }

    /// Yields until `id` is no longer running.
    ///
    /// # Arguments
    ///
    /// * `id` - Thread to wait for; must not be the calling thread
    /// * `timeout_ms` - Longest wait in milliseconds, or 0 to wait forever
    ///
    /// # Returns
    ///
    /// The state the thread left running for, `Timeout` if it was still
    /// running when the timeout expired, or `InvalidThreadId` for a slot that
    /// was never populated.
    pub fn wait(&self, id: ThreadId, timeout_ms: u32) -> ThreadResult<ThreadState> {
        if id == self.id() {
            return Err(ThreadError::CurrentThread);
        }
        if self.state(id) == ThreadState::Empty {
            return Err(ThreadError::InvalidThreadId);
        }
        self.poll_until(timeout_ms, || self.state(id) != ThreadState::Running)?;
        Ok(self.state(id))
    }

    /// Bytes of stack in use by a switched-out thread.
    pub fn stack_used(&self, id: ThreadId) -> ThreadResult<usize> {
        self.inspect_stack(id, |t| t.stack_used())
    }

    /// Bytes left below the saved stack pointer of a switched-out thread.
    pub fn stack_remaining(&self, id: ThreadId) -> ThreadResult<usize> {
        self.inspect_stack(id, |t| t.stack_remaining())
    }

    fn inspect_stack(
        &self,
        id: ThreadId,
        f: impl FnOnce(&Thread) -> usize,
    ) -> ThreadResult<usize> {
        self.with(|inner| {
            if id.get() == inner.current {
                return Err(ThreadError::CurrentThread);
            }
            let thread = &inner.threads[id.get()];
            if thread.state == ThreadState::Empty {
                return Err(ThreadError::InvalidThreadId);
            }
            Ok(f(thread))
        })
    }

    /// Cycles spent executing `id`, including the slice in progress if it is
    /// the current thread.
    pub fn cycles_used(&self, id: ThreadId) -> ThreadResult<u64> {
        let now = A::cycle_count();
        self.with(|inner| {
            let thread = &inner.threads[id.get()];
            if thread.state == ThreadState::Empty {
                return Err(ThreadError::InvalidThreadId);
            }
            let mut cycles = thread.cycles_accum;
            if id.get() == inner.current {
                cycles += now.wrapping_sub(thread.cycles_start) as u64;
            }
            Ok(cycles)
        })
    }

    pub(crate) fn generation(&self, id: ThreadId) -> u32 {
        self.with(|inner| inner.threads[id.get()].generation)
    }

    /// State of `id`, or `None` if the slot no longer holds the occupant
    /// created at `generation`.
    pub(crate) fn state_of(&self, id: ThreadId, generation: u32) -> Option<ThreadState> {
        self.with(|inner| {
            let thread = &inner.threads[id.get()];
            (thread.generation == generation).then_some(thread.state)
        })
    }

    /// Ends `id` if it is still the live occupant created at `generation`.
    /// Returns whether it was killed.
    pub(crate) fn kill_generation(&self, id: ThreadId, generation: u32) -> bool {
        if id.is_main() {
            return false;
        }
        let killed = self.with(|inner| {
            let thread = &mut inner.threads[id.get()];
            if thread.generation != generation || !thread.state.is_alive() {
                return false;
            }
            thread.state = ThreadState::Ended;
            true
        });
        if killed {
            debug!("killed thread {}", id);
        }
        killed
    }

    /// Restarts `id` if it is still the suspended occupant created at
    /// `generation`. Returns whether it was restarted.
    pub(crate) fn restart_generation(&self, id: ThreadId, generation: u32) -> bool {
        if id.is_main() {
            return false;
        }
        self.with(|inner| {
            let thread = &mut inner.threads[id.get()];
            if thread.generation != generation || thread.state != ThreadState::Suspended {
                return false;
            }
            thread.state = ThreadState::Running;
            true
        })
    }

    /// Retires the executing thread once its entry function has returned.
    ///
    /// The thread is `Ending` until it is switched out, and `Ended` (its slot
    /// reusable) from then on. The caller must never return into the
    /// thread's frames afterwards.
    pub(crate) fn exit_current(&self) {
        let id = self.with(|inner| {
            let current = inner.current;
            if current != 0 {
                inner.threads[current].state = ThreadState::Ending;
            }
            current
        });
        if id != 0 {
            debug!("thread #{} returned", id);
        }
    }
}
