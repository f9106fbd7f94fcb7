// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable request/response messaging between service agents.
//!
//! Agents exchange messages through two tables of the database's own versioned table store.
//! Requests have a single writer. Responses may be written by every agent of a group and are
//! merged with an optimistic read-modify-write protocol on top of the row version token.

pub mod codec;
mod error;
mod iterator;
mod manager;
pub mod message;
mod metric_definitions;
mod protocol;
mod rate_limited_log;

pub use agentmsg_types::SerialVersion;
pub use codec::{CodecError, MessageBody, ResponseBody, StoredMessage};
pub use error::ServiceError;
pub use iterator::{MessageIterator, RequestIterator, ResponseIterator};
pub use manager::ServiceManager;
pub use message::{
    DEFAULT_START_REQUEST_ID, MergeError, MessageHeader, MessageTable, Request, RequestId,
    Response, ResponseKind, ServiceMessage, ServiceType, UNUSED_REQUEST_ID, VERSION_REQUEST_ID,
};
pub use metric_definitions::{STATUS_COMPLETED, STATUS_FAILED, describe_metrics};
pub use protocol::{CodecErrorPolicy, ServiceProtocol};
pub use rate_limited_log::RateLimitedLogger;
