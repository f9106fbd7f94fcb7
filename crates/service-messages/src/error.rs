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

use agentmsg_table_store::StoreError;
use agentmsg_types::errors::MaybeRetryableError;

use crate::codec::CodecError;
use crate::message::{MessageTable, RequestId};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service message tables are not ready: {0}")]
    NotReady(String),
    #[error("service message manager is shut down")]
    ShutDown,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(
        "failed posting to {table} table for request id {request_id} after {attempts} attempts \
        ({faults} transient faults) in {elapsed:?}"
    )]
    RetriesExhausted {
        table: MessageTable,
        request_id: RequestId,
        attempts: usize,
        faults: usize,
        elapsed: Duration,
        #[source]
        last_fault: Option<StoreError>,
    },
}

impl MaybeRetryableError for ServiceError {
    fn retryable(&self) -> bool {
        match self {
            ServiceError::NotReady(_) | ServiceError::RetriesExhausted { .. } => true,
            ServiceError::Store(err) => err.retryable(),
            ServiceError::ShutDown
            | ServiceError::Codec(_)
            | ServiceError::InvalidArgument(_) => false,
        }
    }
}
