// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_histogram};

// values of label `status` in METRICS
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

pub(crate) const SERVICE_MESSAGES_POST_DURATION: &str =
    "agentmsg.service_messages.post_duration.seconds";
pub(crate) const SERVICE_MESSAGES_GET_DURATION: &str =
    "agentmsg.service_messages.get_duration.seconds";

pub(crate) const SERVICE_MESSAGES_POST_TOTAL: &str = "agentmsg.service_messages.post.total";
pub(crate) const SERVICE_MESSAGES_GET_TOTAL: &str = "agentmsg.service_messages.get.total";
pub(crate) const SERVICE_MESSAGES_CONFLICT_TOTAL: &str =
    "agentmsg.service_messages.conflict.total";
pub(crate) const SERVICE_MESSAGES_MERGE_SKIPPED_TOTAL: &str =
    "agentmsg.service_messages.merge_skipped.total";
pub(crate) const SERVICE_MESSAGES_TRANSIENT_FAULT_TOTAL: &str =
    "agentmsg.service_messages.transient_fault.total";
pub(crate) const SERVICE_MESSAGES_CODEC_ERROR_TOTAL: &str =
    "agentmsg.service_messages.codec_error.total";

pub fn describe_metrics() {
    describe_histogram!(
        SERVICE_MESSAGES_POST_DURATION,
        Unit::Seconds,
        "Duration of posting a service message in seconds, including all retries"
    );

    describe_histogram!(
        SERVICE_MESSAGES_GET_DURATION,
        Unit::Seconds,
        "Duration of reading a service message in seconds"
    );

    describe_counter!(
        SERVICE_MESSAGES_POST_TOTAL,
        Unit::Count,
        "Number of posted service messages by table and status"
    );

    describe_counter!(
        SERVICE_MESSAGES_GET_TOTAL,
        Unit::Count,
        "Number of service message reads by table and status"
    );

    describe_counter!(
        SERVICE_MESSAGES_CONFLICT_TOTAL,
        Unit::Count,
        "Number of lost read-modify-write races"
    );

    describe_counter!(
        SERVICE_MESSAGES_MERGE_SKIPPED_TOTAL,
        Unit::Count,
        "Number of responses which replaced a stored response of different group size"
    );

    describe_counter!(
        SERVICE_MESSAGES_TRANSIENT_FAULT_TOTAL,
        Unit::Count,
        "Number of transient table store faults observed by the service manager"
    );

    describe_counter!(
        SERVICE_MESSAGES_CODEC_ERROR_TOTAL,
        Unit::Count,
        "Number of service message payloads which failed to encode or decode"
    );
}
