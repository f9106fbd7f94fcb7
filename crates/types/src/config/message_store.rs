// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::retries::RetryPolicy;

/// Durability requested for writes to the backing message tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum Durability {
    /// Committed on a majority of replicas and synced to disk.
    #[default]
    #[display("commit-sync")]
    CommitSync,
    /// Committed on a majority of replicas, disk sync deferred.
    #[display("commit-no-sync")]
    CommitNoSync,
}

/// # Message store options
///
/// Tuning of the retry loops and the iteration of the service message manager.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct MessageStoreOptions {
    /// # Maximum posting attempts
    ///
    /// Upper bound of attempts of one `post_request`/`post_response` call, including attempts
    /// which lost a concurrent read-modify-write race.
    pub max_attempts: NonZeroUsize,

    /// # Tries per table operation
    ///
    /// Number of tries of a single table store operation before a transient fault is
    /// surfaced to the enclosing loop.
    pub op_retries: NonZeroUsize,

    /// # Back-off between retries
    ///
    /// Delays applied between retries of table operations and between posting attempts.
    /// Only the delays are taken from this policy; the number of tries is governed by
    /// `max-attempts` and `op-retries`.
    pub retry_backoff: RetryPolicy,

    /// # Scan batch size
    ///
    /// Number of rows fetched per range scan while iterating messages.
    pub scan_batch_size: NonZeroUsize,

    /// # Default scan timeout
    ///
    /// Timeout applied to each range scan when the caller does not supply one.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub default_scan_timeout: humantime::Duration,

    /// # Log suppression window
    ///
    /// Window within which repeated warnings with the same key are only logged once.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub log_suppression_window: humantime::Duration,

    /// # Log suppression capacity
    ///
    /// Maximum number of distinct keys tracked by the rate-limited logger.
    pub log_suppression_max_keys: NonZeroUsize,

    /// # Write durability
    pub durability: Durability,
}

impl MessageStoreOptions {
    pub const DEFAULT_MAX_ATTEMPTS: usize = 1024;
    pub const DEFAULT_OP_RETRIES: usize = 10;

    pub fn max_attempts(&self) -> usize {
        self.max_attempts.get()
    }

    pub fn op_retries(&self) -> usize {
        self.op_retries.get()
    }

    pub fn scan_batch_size(&self) -> usize {
        self.scan_batch_size.get()
    }

    pub fn default_scan_timeout(&self) -> Duration {
        *self.default_scan_timeout
    }

    pub fn log_suppression_window(&self) -> Duration {
        *self.log_suppression_window
    }
}

impl Default for MessageStoreOptions {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroUsize::new(Self::DEFAULT_MAX_ATTEMPTS).expect("non-zero"),
            op_retries: NonZeroUsize::new(Self::DEFAULT_OP_RETRIES).expect("non-zero"),
            retry_backoff: RetryPolicy::exponential(
                Duration::from_millis(10),
                2.0,
                None,
                Some(Duration::from_secs(1)),
            ),
            scan_batch_size: NonZeroUsize::new(100).expect("non-zero"),
            default_scan_timeout: Duration::from_secs(5).into(),
            log_suppression_window: Duration::from_secs(60).into(),
            log_suppression_max_keys: NonZeroUsize::new(1024).expect("non-zero"),
            durability: Durability::default(),
        }
    }
}
