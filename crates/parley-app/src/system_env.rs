//! Production Environment implementation using the tokio clock and OS RNG.
//!
//! `SystemEnv` uses `tokio::time::Instant` rather than `std::time::Instant`
//! so runtime tests can pause and advance time with tokio's test utilities.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_core::Environment;

/// Production environment: tokio time, chrono wall clock, getrandom.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
