use alloc::boxed::Box;
use core::fmt;

use crate::error::ThreadError;

/// Number of slots in the thread table, including the main thread.
pub const MAX_THREADS: usize = 8;

/// Entry point signature for raw threads; the argument is passed in r0.
pub type ThreadEntry = extern "C" fn(usize);

/// Stable index of a slot in the thread table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    /// The bootstrap execution context. Always running, never created or
    /// destroyed through the lifecycle API.
    pub const MAIN: ThreadId = ThreadId(0);

    pub const fn new(index: usize) -> Option<Self> {
        if index < MAX_THREADS {
            Some(ThreadId(index))
        } else {
            None
        }
    }

    pub(crate) const fn from_index(index: usize) -> Self {
        debug_assert!(index < MAX_THREADS);
        ThreadId(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<usize> for ThreadId {
    type Error = ThreadError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        ThreadId::new(index).ok_or(ThreadError::InvalidThreadId)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Slot never used or fully reclaimed.
    Empty = 0,
    /// Eligible for scheduling.
    Running = 1,
    /// Terminated; the slot may be reused by the next create.
    Ended = 2,
    /// Entry function has returned, but the thread has not been switched out
    /// yet and its stack is still live. Becomes `Ended` at that switch.
    Ending = 3,
    /// Alive but skipped by the scheduler.
    Suspended = 4,
}

impl ThreadState {
    pub fn is_reusable(self) -> bool {
        matches!(self, ThreadState::Empty | ThreadState::Ended)
    }

    pub fn is_alive(self) -> bool {
        matches!(self, ThreadState::Running | ThreadState::Suspended)
    }
}

/// Memory backing a thread's call stack.
pub enum StackMemory {
    None,
    /// Allocated by the scheduler; dropped when the slot is reused.
    Owned(Box<[u8]>),
    /// Supplied by the caller; never freed.
    Borrowed(&'static mut [u8]),
    /// Bounds of a stack the scheduler neither owns nor can address as a
    /// slice, i.e. the main stack.
    Region { base: usize, size: usize },
}

impl StackMemory {
    pub fn base(&self) -> usize {
        match self {
            StackMemory::None => 0,
            StackMemory::Owned(buf) => buf.as_ptr() as usize,
            StackMemory::Borrowed(buf) => buf.as_ptr() as usize,
            StackMemory::Region { base, .. } => *base,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            StackMemory::None => 0,
            StackMemory::Owned(buf) => buf.len(),
            StackMemory::Borrowed(buf) => buf.len(),
            StackMemory::Region { size, .. } => *size,
        }
    }

    pub fn top(&self) -> usize {
        self.base() + self.size()
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, StackMemory::Owned(_))
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            StackMemory::Owned(buf) => Some(buf),
            StackMemory::Borrowed(buf) => Some(buf),
            StackMemory::None | StackMemory::Region { .. } => None,
        }
    }
}

impl fmt::Debug for StackMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            StackMemory::None => "None",
            StackMemory::Owned(_) => "Owned",
            StackMemory::Borrowed(_) => "Borrowed",
            StackMemory::Region { .. } => "Region",
        };
        write!(f, "{}({:#x}..{:#x})", kind, self.base(), self.top())
    }
}

/// Thread control block.
#[derive(Debug)]
pub struct Thread {
    pub state: ThreadState,
    pub stack: StackMemory,
    /// Saved stack pointer; the register context lives directly above it.
    /// Stale while the thread is executing.
    pub sp: usize,
    /// Time slice in ticks, stored as the number of decrements before a
    /// preemption is due (a slice of N ticks is stored as N - 1).
    pub ticks: u32,
    pub cycles_start: u32,
    pub cycles_accum: u64,
    /// Bumped every time the slot is populated, so stale handles can tell
    /// their thread apart from a later occupant of the same slot.
    pub generation: u32,
}

impl Thread {
    pub const fn empty() -> Self {
        Thread {
            state: ThreadState::Empty,
            stack: StackMemory::None,
            sp: 0,
            ticks: 0,
            cycles_start: 0,
            cycles_accum: 0,
            generation: 0,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ThreadState::Running
    }

    pub fn stack_used(&self) -> usize {
        self.stack.top().saturating_sub(self.sp)
    }

    pub fn stack_remaining(&self) -> usize {
        self.sp.saturating_sub(self.stack.base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_thread_id_bounds() {
        assert_eq!(ThreadId::new(0), Some(ThreadId::MAIN));
        assert!(ThreadId::new(MAX_THREADS - 1).is_some());
        assert!(ThreadId::new(MAX_THREADS).is_none());
        assert!(ThreadId::MAIN.is_main());
        assert_eq!(ThreadId::try_from(MAX_THREADS), Err(ThreadError::InvalidThreadId));
        assert_eq!(ThreadId::try_from(2).map(ThreadId::get), Ok(2));
    }

    #[test]
    fn test_thread_states() {
        assert!(ThreadState::Empty.is_reusable());
        assert!(ThreadState::Ended.is_reusable());
        assert!(!ThreadState::Ending.is_reusable());
        assert!(!ThreadState::Suspended.is_reusable());
        assert!(ThreadState::Suspended.is_alive());
        assert!(!ThreadState::Ending.is_alive());
    }

    #[test]
    fn test_stack_accounting() {
        let buf = vec![0u8; 512].into_boxed_slice();
        let mut thread = Thread::empty();
        thread.stack = StackMemory::Owned(buf);
        thread.sp = thread.stack.top() - 100;

        assert_eq!(thread.stack_used(), 100);
        assert_eq!(thread.stack_remaining(), 412);
        assert!(thread.stack.is_owned());
    }

    #[test]
    fn test_thread_is_runnable() {
        let mut thread = Thread::empty();
        assert!(!thread.is_runnable());

        thread.state = ThreadState::Running;
        assert!(thread.is_runnable());

        thread.state = ThreadState::Suspended;
        assert!(!thread.is_runnable());

        thread.state = ThreadState::Ended;
        assert!(!thread.is_runnable());
    }
}
