// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policies
//!
//! A retry policy decides, for a failed delivery, whether the message gets
//! another attempt and how long to wait before it. Policies are pure and
//! stateless: the attempt number travels with the message in the `attempt`
//! header, starting at 1 for the first delivery.

use crate::timespan::TimeSpan;

/// Decides whether a failed attempt is retried and with which delay.
pub trait RetryPolicy: Send + Sync {
    /// Returns `true` when the message that just failed `attempt` may be retried.
    fn can_retry(&self, attempt: u32) -> bool;

    /// Returns how long to hold the message before delivering `attempt`.
    fn get_delay(&self, attempt: u32) -> TimeSpan;
}

/// Retries up to `max_attempts` times, waiting `attempt × coefficient`
/// between attempts, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct LinearRetryPolicy {
    max_attempts: u32,
    coefficient: TimeSpan,
    max_delay: TimeSpan,
}

impl Default for LinearRetryPolicy {
    fn default() -> Self {
        LinearRetryPolicy {
            max_attempts: 3,
            coefficient: TimeSpan::from_seconds(5),
            max_delay: TimeSpan::from_hours(1),
        }
    }
}

impl LinearRetryPolicy {
    /// Creates a policy allowing `max_attempts` retries with the default
    /// 5 seconds coefficient.
    pub fn new(max_attempts: u32) -> Self {
        LinearRetryPolicy {
            max_attempts,
            ..Default::default()
        }
    }

    /// Sets the delay added per attempt.
    pub fn coefficient(mut self, coefficient: TimeSpan) -> Self {
        self.coefficient = coefficient;
        self
    }

    /// Sets the upper bound of any computed delay.
    pub fn max_delay(mut self, max_delay: TimeSpan) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl RetryPolicy for LinearRetryPolicy {
    fn can_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    fn get_delay(&self, attempt: u32) -> TimeSpan {
        let linear = TimeSpan::from_milliseconds(
            self.coefficient
                .total_milliseconds()
                .saturating_mul(u64::from(attempt)),
        );

        std::cmp::min(self.max_delay, linear)
    }
}
