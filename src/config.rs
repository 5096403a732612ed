//! Tunables of the scheduler.

pub const DEFAULT_STACK_SIZE: usize = 1024;
pub const DEFAULT_MAIN_STACK_SIZE: usize = 10240;
pub const DEFAULT_TIME_SLICE: u32 = 10;
pub const DEFAULT_TICK_MICROS: u32 = 100;
pub const DEFAULT_STACK_MARGIN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Stack size for threads created without an explicit size.
    pub stack_size: usize,
    /// Slice length in ticks given to new threads.
    pub time_slice: u32,
    /// Tick length used when switching to the microsecond timer.
    pub tick_micros: u32,
    /// Size assumed for the main stack, below its top.
    pub main_stack_size: usize,
    /// Headroom below which a switched-out thread counts as overflowed.
    pub stack_margin: usize,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            time_slice: DEFAULT_TIME_SLICE,
            tick_micros: DEFAULT_TICK_MICROS,
            main_stack_size: DEFAULT_MAIN_STACK_SIZE,
            stack_margin: DEFAULT_STACK_MARGIN,
        }
    }

    pub const fn with_stack_size(self, stack_size: usize) -> Self {
        Config { stack_size, ..self }
    }

    pub const fn with_time_slice(self, time_slice: u32) -> Self {
        Config { time_slice, ..self }
    }

    pub const fn with_tick_micros(self, tick_micros: u32) -> Self {
        Config { tick_micros, ..self }
    }

    pub const fn with_main_stack_size(self, main_stack_size: usize) -> Self {
        Config {
            main_stack_size,
            ..self
        }
    }

    pub const fn with_stack_margin(self, stack_margin: usize) -> Self {
        Config {
            stack_margin,
            ..self
        }
    }

    /// Stored form of the configured slice; see [`crate::thread::Thread::ticks`].
    pub(crate) const fn slice_ticks(&self) -> u32 {
        self.time_slice.saturating_sub(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
