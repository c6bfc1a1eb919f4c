use core::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    pub const fn new(nanos: u64) -> Self {
        Instant { nanos }
    }

    pub fn elapsed_nanos<C: Clock>(self, clock: &C) -> u64 {
        clock.current_nanos().wrapping_sub(self.nanos)
    }

    pub fn elapsed<C: Clock>(self, clock: &C) -> Duration {
        Duration::from_nanos(self.elapsed_nanos(clock))
    }

    pub fn elapsed_ms<C: Clock>(self, clock: &C) -> u32 {
        (self.elapsed_nanos(clock) / 1_000_000) as u32
    }

    pub fn nanos(self) -> u64 {
        self.nanos
    }

    pub fn ms(self) -> u32 {
        (self.nanos / 1_000_000) as u32
    }
}

pub enum TimeDirection {
    Forward(Duration),
    Backward(Duration),
}

/// A monotonic time source.
///
/// The data-link layer only ever asks for `time_get_ms`-equivalent
/// millisecond timestamps (see `current_ms`); the nanosecond resolution is
/// kept for hosts that have it (the test harness's monotonic clock) so
/// that higher-resolution callers are not forced to round early.
pub trait Clock {
    fn current_nanos(&self) -> u64;

    fn current_instant(&self) -> Instant {
        Instant { nanos: self.current_nanos() }
    }

    fn current_ms(&self) -> u32 {
        (self.current_nanos() / 1_000_000) as u32
    }
}
