// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use agentmsg_types::errors::{
    BoxedMaybeRetryableError, GenericError, IntoMaybeRetryable, MaybeRetryableError,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot complete the operation right now, e.g. while a shard elects a new
    /// leader.
    #[error("table store unavailable: {0}")]
    Unavailable(GenericError),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("other error: {0}")]
    Other(BoxedMaybeRetryableError),
}

impl StoreError {
    pub fn unavailable(error: impl Into<GenericError>) -> Self {
        StoreError::Unavailable(error.into())
    }

    pub fn retryable<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Other(Box::new(error.into_retryable()))
    }

    pub fn terminal<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Other(Box::new(error.into_terminal()))
    }
}

impl MaybeRetryableError for StoreError {
    fn retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => true,
            StoreError::UnknownTable(_) => false,
            StoreError::Other(err) => err.retryable(),
        }
    }
}
