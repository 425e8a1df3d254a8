//! Environment abstraction for deterministic testing.
//!
//! Decouples client logic from system resources (time, randomness). State
//! machines take the current instant as an argument; only driver code calls
//! [`Environment::sleep`]. Production uses the tokio clock, simulation uses a
//! manually advanced virtual clock with a seeded RNG.

use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Monotonic instant usable by the state machines.
///
/// Blanket-implemented for every type with the required arithmetic, so
/// `std::time::Instant`, `tokio::time::Instant` and simulated instants all
/// qualify.
pub trait MonotonicInstant:
    Copy + Ord + Send + Sync + Debug + Add<Duration, Output = Self> + Sub<Output = Duration>
{
}

impl<T> MonotonicInstant for T where
    T: Copy + Ord + Send + Sync + Debug + Add<Duration, Output = T> + Sub<Output = Duration>
{
}

/// Abstract environment providing time, randomness and async sleep.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `wall_clock()` advances with `now()` (simulations derive it from the
///   virtual clock)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    type Instant: MonotonicInstant;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time, used for message timestamps, token expiry and
    /// cache staleness.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Seconds since the Unix epoch.
    fn unix_now(&self) -> i64 {
        self.wall_clock().timestamp()
    }

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (retry loops, runtimes) may call this.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`, e.g. for tab identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
