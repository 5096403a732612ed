//! Thread builder for configuring thread creation.

use alloc::boxed::Box;

use crate::arch::Arch;
use crate::error::ThreadResult;
use crate::handle::JoinHandle;
use crate::lifecycle::StackRequest;
use crate::scheduler::Scheduler;
use crate::thread::ThreadEntry;

/// Builder for configuring and creating new threads.
///
/// Unset parameters fall back to the scheduler's current defaults.
#[derive(Debug, Default)]
pub struct ThreadBuilder {
    stack_size: Option<usize>,
    stack: Option<&'static mut [u8]>,
    time_slice: Option<u32>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a stack of `size` bytes.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Run on caller-provided memory instead of allocating. Takes precedence
    /// over [`stack_size`](Self::stack_size).
    pub fn stack_buffer(mut self, stack: &'static mut [u8]) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Slice length in ticks.
    pub fn time_slice(mut self, ticks: u32) -> Self {
        self.time_slice = Some(ticks);
        self
    }

    fn request(&mut self) -> StackRequest {
        match (self.stack.take(), self.stack_size) {
            (Some(buf), _) => StackRequest::Buffer(buf),
            (None, Some(size)) => StackRequest::Size(size),
            (None, None) => StackRequest::Default,
        }
    }

    /// Spawns `entry(arg)`.
    pub fn spawn_raw<A: Arch>(
        mut self,
        scheduler: &Scheduler<A>,
        entry: ThreadEntry,
        arg: usize,
    ) -> ThreadResult<JoinHandle<'_, A>> {
        let request = self.request();
        let (id, generation) =
            scheduler.create_thread(entry as usize, arg, request, self.time_slice)?;
        Ok(JoinHandle::new(scheduler, id, generation))
    }

    /// Spawns a thread running `f`.
    ///
    /// The closure is boxed and handed to the thread as its argument. If the
    /// thread is killed before it first runs, the box is never freed.
    pub fn spawn<A, F>(self, scheduler: &Scheduler<A>, f: F) -> ThreadResult<JoinHandle<'_, A>>
    where
        A: Arch,
        F: FnOnce() + Send + 'static,
    {
        let closure = Box::into_raw(Box::new(f));
        let result = self.spawn_raw(scheduler, run_closure::<F>, closure as usize);
        if result.is_err() {
            // SAFETY: the thread was never created, so the box is still ours.
            drop(unsafe { Box::from_raw(closure) });
        }
        result
    }
}

/// Entry point of closure threads; `arg` is the boxed closure.
extern "C" fn run_closure<F: FnOnce()>(arg: usize) {
    // SAFETY: `arg` came from `Box::into_raw` in `spawn` and each thread
    // starts exactly once.
    let f = unsafe { Box::from_raw(arg as *mut F) };
    f()
}

impl<A: Arch> Scheduler<A> {
    /// Spawns a thread running `f` with default parameters.
    pub fn spawn<F>(&self, f: F) -> ThreadResult<JoinHandle<'_, A>>
    where
        F: FnOnce() + Send + 'static,
    {
        ThreadBuilder::new().spawn(self, f)
    }
}
