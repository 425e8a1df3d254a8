//! Property-based tests for the backoff schedule and retry loop

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parley_core::{Backoff, Environment, RetryPolicy, Retryable, retry_with_backoff};
use proptest::prelude::*;

#[derive(Clone)]
struct TestEnv;

impl Environment for TestEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async move { tokio::time::sleep(duration).await }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(7);
    }
}

#[derive(Debug)]
struct Failure {
    retryable: bool,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failure (retryable: {})", self.retryable)
    }
}

impl Retryable for Failure {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

fn arbitrary_backoff() -> impl Strategy<Value = Backoff> {
    (1u64..10_000, 1u64..120_000).prop_map(|(base, cap)| {
        Backoff::new(Duration::from_millis(base), Duration::from_millis(base.max(cap)))
    })
}

/// Property: delays never decrease as attempts grow
#[test]
fn prop_delay_monotonic() {
    proptest!(|(backoff in arbitrary_backoff(), attempt in 1u32..200)| {
        prop_assert!(backoff.delay(attempt) <= backoff.delay(attempt + 1));
    });
}

/// Property: no delay exceeds the cap, and the first delay is the base
#[test]
fn prop_delay_capped() {
    proptest!(|(backoff in arbitrary_backoff(), attempt in any::<u32>())| {
        prop_assert!(backoff.delay(attempt) <= backoff.cap);
        prop_assert_eq!(backoff.delay(1), backoff.base);
    });
}

/// Property: each delay is double the previous one until the cap is reached
#[test]
fn prop_delay_doubles_below_cap() {
    proptest!(|(backoff in arbitrary_backoff(), attempt in 1u32..20)| {
        let current = backoff.delay(attempt);
        let next = backoff.delay(attempt + 1);
        prop_assert_eq!(next, (current * 2).min(backoff.cap));
    });
}

#[tokio::test(start_paused = true)]
async fn retries_until_budget_spent() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::service();
    let started = tokio::time::Instant::now();

    let counter = Arc::clone(&calls);
    let outcome = retry_with_backoff(&TestEnv, &policy, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(Failure { retryable: true }) }
    })
    .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 1s + 2s of backoff between the three attempts
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn non_retryable_fails_immediately() {
    let started = tokio::time::Instant::now();
    let outcome = retry_with_backoff(&TestEnv, &RetryPolicy::chat_store(), |_| async {
        Err::<(), _>(Failure { retryable: false })
    })
    .await;

    assert_eq!(outcome.attempts(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn succeeds_on_last_allowed_attempt() {
    let outcome = retry_with_backoff(&TestEnv, &RetryPolicy::chat_store(), |attempt| async move {
        if attempt < 4 { Err(Failure { retryable: true }) } else { Ok(attempt) }
    })
    .await;

    assert_eq!(outcome.into_result().unwrap(), 4);
}
