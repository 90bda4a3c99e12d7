//! Timeouts of blocking operations
//!
//! A timeout is expressed in *ticks*, the unit of the port's clock. The tick
//! count wraps around, so elapsed times are always computed by wrapping
//! subtraction.

/// A tick count.
pub type Ticks = u32;

/// Specifies how long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Give up after the specified number of ticks. `Ticks(0)` means "never
    /// block".
    Ticks(Ticks),
    /// Wait indefinitely.
    Forever,
}

impl Timeout {
    /// Never block.
    pub const NO_WAIT: Self = Self::Ticks(0);

    /// Get a flag indicating whether this timeout forbids blocking.
    #[inline]
    pub fn is_no_wait(self) -> bool {
        self == Self::NO_WAIT
    }
}

impl From<Ticks> for Timeout {
    #[inline]
    fn from(x: Ticks) -> Self {
        Self::Ticks(x)
    }
}

/// Remembers when a blocking operation started so that the operation can be
/// restarted with the residual timeout after being interrupted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: Ticks,
    timeout: Timeout,
}

impl Deadline {
    #[inline]
    pub(crate) fn new(now: Ticks, timeout: Timeout) -> Self {
        Self { start: now, timeout }
    }

    /// Get the portion of the timeout that hasn't elapsed yet at `now`.
    pub(crate) fn remaining(&self, now: Ticks) -> Timeout {
        match self.timeout {
            Timeout::Forever => Timeout::Forever,
            Timeout::Ticks(ticks) => {
                let elapsed = now.wrapping_sub(self.start);
                Timeout::Ticks(ticks.saturating_sub(elapsed))
            }
        }
    }
}
