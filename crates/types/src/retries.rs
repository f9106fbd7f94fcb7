// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Back-off policies used between retries of table store operations.

use std::borrow::Cow;
use std::cmp;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;
use serde_with::{DurationMilliSeconds, serde_as};

const DEFAULT_JITTER_MULTIPLIER: f32 = 0.3;

/// This struct represents the policy to execute retries.
///
/// ```rust
/// use std::time::Duration;
/// use agentmsg_types::retries::RetryPolicy;
///
/// let retry_policy = RetryPolicy::fixed_delay(Duration::from_millis(100), Some(10));
/// let mut retry_iter = retry_policy.into_iter();
///
/// loop {
/// # let operation_succeeded = true;
///     if operation_succeeded {
///         break;
///     }
///
///     if let Some(next_timer) = retry_iter.next() {
///         // sleep for next_timer
///     } else {
///         // retries exhausted
///         break;
///     }
/// }
/// ```
#[serde_as]
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// No delay and no retries.
    #[default]
    None,
    /// Retry with a fixed delay strategy.
    FixedDelay {
        /// Interval between retries in milliseconds.
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        interval: Duration,
        /// Number of maximum attempts before giving up. Infinite retries if unset.
        max_attempts: Option<NonZeroUsize>,
    },
    /// Retry with an exponential strategy. The next retry is computed as
    /// `min(last_retry_interval * factor, max_interval)`.
    Exponential {
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<NonZeroUsize>,
        #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
        #[serde(default)]
        max_interval: Option<Duration>,
    },
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval,
            max_attempts: max_attempts.and_then(NonZeroUsize::new),
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval,
            factor,
            max_attempts: max_attempts.and_then(NonZeroUsize::new),
            max_interval,
        }
    }

    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    pub fn iter(&self) -> RetryIter<'_> {
        RetryIter {
            policy: Cow::Borrowed(self),
            attempts: 0,
            last_retry: None,
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter<'static>;

    fn into_iter(self) -> Self::IntoIter {
        RetryIter {
            policy: Cow::Owned(self),
            attempts: 0,
            last_retry: None,
        }
    }
}

#[derive(Debug)]
pub struct RetryIter<'a> {
    policy: Cow<'a, RetryPolicy>,
    attempts: usize,
    last_retry: Option<Duration>,
}

impl RetryIter<'_> {
    /// The number of attempts on this retry iterator so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn last_retry(&self) -> Option<Duration> {
        self.last_retry
    }
}

impl Iterator for RetryIter<'_> {
    type Item = Duration;

    /// adds up to 1/3 target duration as jitter
    fn next(&mut self) -> Option<Self::Item> {
        self.attempts += 1;
        match self.policy.as_ref() {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay {
                interval,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|limit| self.attempts > limit.into()) {
                    None
                } else {
                    Some(with_jitter(*interval, DEFAULT_JITTER_MULTIPLIER))
                }
            }
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_attempts,
                max_interval,
            } => {
                if max_attempts.is_some_and(|limit| self.attempts > limit.into()) {
                    return None;
                }
                let next_retry = match self.last_retry {
                    Some(last_retry) => cmp::min(
                        last_retry.mul_f32(*factor),
                        max_interval.unwrap_or(Duration::MAX),
                    ),
                    None => *initial_interval,
                };
                self.last_retry = Some(next_retry);
                Some(with_jitter(next_retry, DEFAULT_JITTER_MULTIPLIER))
            }
        }
    }
}

// Jitter ranges from 3ms to (max_multiplier * duration). The +3ms floor keeps delays off
// round values which otherwise line up retries of concurrent agents.
static MIN_JITTER: Duration = Duration::from_millis(3);

pub fn with_jitter(duration: Duration, max_multiplier: f32) -> Duration {
    let max_jitter = duration.mul_f32(max_multiplier);
    if max_jitter <= MIN_JITTER {
        duration + MIN_JITTER
    } else {
        let jitter = rand::rng().random_range(MIN_JITTER..max_jitter);
        duration + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within_jitter(expected: Duration, actual: Duration) -> bool {
        let min_inc_jitter = expected + MIN_JITTER;
        let max_inc_jitter = expected + expected.mul_f32(DEFAULT_JITTER_MULTIPLIER);
        actual >= min_inc_jitter && actual <= max_inc_jitter
    }

    #[test]
    fn no_retry_policy() {
        assert!(RetryPolicy::None.into_iter().next().is_none());
    }

    #[test]
    fn fixed_delay_retry_policy() {
        let actuals = RetryPolicy::fixed_delay(Duration::from_millis(100), Some(10))
            .into_iter()
            .collect::<Vec<_>>();
        assert_eq!(actuals.len(), 10);
        assert!(
            actuals
                .iter()
                .all(|actual| within_jitter(Duration::from_millis(100), *actual))
        );
    }

    #[test]
    fn exponential_retry_policy_is_capped() {
        let expected = [
            Duration::from_millis(100),
            Duration::from_millis(100).mul_f32(2.0),
            Duration::from_millis(100).mul_f32(2.0).mul_f32(2.0),
            Duration::from_millis(500),
            Duration::from_millis(500),
        ];
        let actuals = RetryPolicy::exponential(
            Duration::from_millis(100),
            2.0,
            Some(5),
            Some(Duration::from_millis(500)),
        )
        .into_iter()
        .collect::<Vec<_>>();

        assert_eq!(actuals.len(), expected.len());
        for (expected, actual) in expected.iter().zip(actuals.iter()) {
            assert!(within_jitter(*expected, *actual));
        }
    }

    #[test]
    fn unbounded_policy_keeps_yielding() {
        let mut iter = RetryPolicy::exponential(
            Duration::from_millis(10),
            2.0,
            None,
            Some(Duration::from_millis(40)),
        )
        .into_iter();
        for _ in 0..100 {
            assert!(iter.next().is_some());
        }
        assert_eq!(iter.attempts(), 100);
        assert_eq!(iter.last_retry(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn serde_round_trip_uses_millis() {
        let policy = RetryPolicy::fixed_delay(Duration::from_millis(250), Some(3));
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"type":"fixed-delay","interval":250,"max-attempts":3}"#);
        assert_eq!(serde_json::from_str::<RetryPolicy>(&json).unwrap(), policy);
    }
}
