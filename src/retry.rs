// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Broker outages are treated as transient: connection attempts are retried
//! forever with a linearly growing delay instead of surfacing an error.

use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::error;

/// Default delay before the first retry and growth per attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Retries an operation until it succeeds.
///
/// The delay starts at `initial_delay` and grows by `increment` after every
/// failed attempt. Without a `max_delay` the growth is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    increment: Duration,
    max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: DEFAULT_RETRY_DELAY,
            increment: DEFAULT_RETRY_DELAY,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, increment: Duration) -> Self {
        RetryPolicy {
            initial_delay,
            increment,
            max_delay: None,
        }
    }

    /// Caps the delay between two attempts.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay to wait after the attempt following one that waited `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.saturating_add(self.increment);
        match self.max_delay {
            Some(max) => next.min(max),
            None => next,
        }
    }

    /// Invokes `operation` until it returns `Ok`, logging every failure.
    ///
    /// Never gives up; callers that need to stop must drop the future.
    pub async fn retry_until_success<T, E, F, Fut>(&self, mut operation: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut delay = match self.max_delay {
            Some(max) => self.initial_delay.min(max),
            None => self.initial_delay,
        };
        let mut attempt: u64 = 1;

        loop {
            match operation().await {
                Ok(value) => return value,
                Err(err) => {
                    error!(
                        error = %err,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "operation failed, retrying"
                    );
                    sleep(delay).await;
                    delay = self.next_delay(delay);
                    attempt += 1;
                }
            }
        }
    }
}
