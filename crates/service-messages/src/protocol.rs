// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tracing::error;

use agentmsg_types::SerialVersion;

use crate::codec::{CodecError, MessageBody, ResponseBody};
use crate::message::{MessageTable, RequestId, ServiceType};

/// Decision of a [`ServiceProtocol`] about a payload which could not be encoded or decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum CodecErrorPolicy {
    /// Treat the affected message as absent and carry on.
    #[strum(serialize = "ignore")]
    Ignore,
    /// Surface the error to the caller as [`crate::ServiceError::Codec`].
    #[default]
    #[strum(serialize = "fail")]
    Fail,
}

/// Capabilities an agent supplies to its [`crate::ServiceManager`].
pub trait ServiceProtocol: Send + Sync + 'static {
    type Request: MessageBody;
    type Response: ResponseBody;

    fn service_type(&self) -> ServiceType;

    /// Newest payload serial version this agent can read. Payloads are written with this
    /// version.
    fn max_serial_version(&self) -> SerialVersion;

    /// Invoked whenever a payload of `table` could not be encoded or decoded.
    fn handle_codec_error(
        &self,
        table: MessageTable,
        request_id: RequestId,
        error: &CodecError,
    ) -> CodecErrorPolicy {
        error!(
            service_type = %self.service_type(),
            %table,
            request_id,
            %error,
            "Failed to process service message payload"
        );
        CodecErrorPolicy::Fail
    }

    /// Invoked when a stored response was replaced instead of merged because the writers
    /// disagree about the group size.
    fn on_merge_skipped(
        &self,
        _request_id: RequestId,
        _stored_group_size: u32,
        _incoming_group_size: u32,
    ) {
    }
}
