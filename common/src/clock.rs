/// Milliseconds since boot. Wraps after roughly 49.7 days.
pub type Millis = u32;

/// Monotonic time source for the supervisor.
///
/// Millisecond readings wrap at `u32::MAX`; every duration in the crate is
/// computed with [`elapsed`] so a wrap between two readings is harmless.
pub trait Clock {
    fn now_ms(&self) -> Millis;

    /// Microseconds since boot, used for PWM phase.
    fn now_us(&self) -> u64;

    /// Yields between two scheduler passes. Implementations may sleep,
    /// busy-wait or, in simulation, advance virtual time.
    fn relax(&self, quantum_us: u32);

    fn elapsed(&self, mark: Millis) -> Millis {
        elapsed(self.now_ms(), mark)
    }
}

/// Wrap-safe `now - mark`.
pub const fn elapsed(now: Millis, mark: Millis) -> Millis {
    now.wrapping_sub(mark)
}
