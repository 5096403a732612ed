//! Error type shared by every fallible scheduler operation.

use core::fmt;

/// Reason a thread or scheduler operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// Every user slot is occupied by a live thread.
    MaxThreadsReached,
    /// The id is out of range or names a slot that was never populated.
    InvalidThreadId,
    /// The operation is not allowed on the main thread (slot 0).
    ReservedThread,
    /// The stack cannot hold the initial frame plus the safety margin.
    StackTooSmall,
    /// Allocating an owned stack failed.
    OutOfMemory,
    /// A bounded wait expired before its condition held.
    Timeout,
    /// The thread is not running or suspended.
    ThreadNotRunnable,
    /// The operation targets the thread that is executing.
    CurrentThread,
    /// The port cannot provide the requested tick source.
    TimerUnavailable,
}

impl ThreadError {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadError::MaxThreadsReached => "Maximum number of threads reached",
            ThreadError::InvalidThreadId => "Invalid thread ID provided",
            ThreadError::ReservedThread => "Operation not permitted on the main thread",
            ThreadError::StackTooSmall => "Stack too small for the initial frame",
            ThreadError::OutOfMemory => "Stack allocation failed",
            ThreadError::Timeout => "Timed out",
            ThreadError::ThreadNotRunnable => "Thread is not runnable",
            ThreadError::CurrentThread => "Thread is currently executing",
            ThreadError::TimerUnavailable => "Tick source unavailable",
        }
    }
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for ThreadError {}

pub type ThreadResult<T> = Result<T, ThreadError>;
