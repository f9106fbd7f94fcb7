// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use agentmsg_service_messages::{
    CodecError, CodecErrorPolicy, MessageTable, RequestId, Response, ResponseBody,
    SerialVersion, ServiceManager, ServiceProtocol, ServiceType, StoredMessage,
    flexbuffers_message_body,
};
use agentmsg_table_store::{InMemoryTableStore, PrimaryKey, Row};
use agentmsg_types::config::{MessageStoreOptions, MessageStoreOptionsBuilder};
use agentmsg_types::retries::RetryPolicy;
use agentmsg_types::time::MillisSinceEpoch;

pub const SERIAL_VERSION: SerialVersion = SerialVersion::new(2);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    pub table: String,
}

flexbuffers_message_body!(SyncRequest);

pub fn sync(table: &str) -> SyncRequest {
    SyncRequest {
        table: table.to_owned(),
    }
}

/// Set of agents which acknowledged a request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Acks(pub BTreeSet<String>);

flexbuffers_message_body!(Acks);

impl ResponseBody for Acks {
    fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }
}

pub fn acks(agents: &[&str]) -> Acks {
    Acks(agents.iter().map(|agent| (*agent).to_owned()).collect())
}

pub struct TestProtocol {
    service_type: ServiceType,
    codec_error_policy: CodecErrorPolicy,
    pub codec_errors: Mutex<Vec<(MessageTable, RequestId)>>,
    pub skipped_merges: Mutex<Vec<(RequestId, u32, u32)>>,
}

impl TestProtocol {
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            codec_error_policy: CodecErrorPolicy::Fail,
            codec_errors: Mutex::default(),
            skipped_merges: Mutex::default(),
        }
    }

    pub fn with_codec_error_policy(mut self, policy: CodecErrorPolicy) -> Self {
        self.codec_error_policy = policy;
        self
    }
}

impl ServiceProtocol for TestProtocol {
    type Request = SyncRequest;
    type Response = Acks;

    fn service_type(&self) -> ServiceType {
        self.service_type
    }

    fn max_serial_version(&self) -> SerialVersion {
        SERIAL_VERSION
    }

    fn handle_codec_error(
        &self,
        table: MessageTable,
        request_id: RequestId,
        _error: &CodecError,
    ) -> CodecErrorPolicy {
        self.codec_errors.lock().push((table, request_id));
        self.codec_error_policy
    }

    fn on_merge_skipped(
        &self,
        request_id: RequestId,
        stored_group_size: u32,
        incoming_group_size: u32,
    ) {
        self.skipped_merges
            .lock()
            .push((request_id, stored_group_size, incoming_group_size));
    }
}

pub type TestManager = ServiceManager<TestProtocol, InMemoryTableStore>;

pub fn store() -> InMemoryTableStore {
    InMemoryTableStore::with_tables(&[
        MessageTable::REQUEST_TABLE_NAME,
        MessageTable::RESPONSE_TABLE_NAME,
    ])
}

pub fn options() -> MessageStoreOptionsBuilder {
    let mut builder = MessageStoreOptionsBuilder::default();
    builder.retry_backoff(RetryPolicy::fixed_delay(Duration::from_millis(10), None));
    builder
}

pub fn manager(store: &InMemoryTableStore) -> TestManager {
    manager_with(
        store,
        TestProtocol::new(ServiceType::MultiRegionTable),
        options().build().expect("valid options"),
    )
}

pub fn manager_with(
    store: &InMemoryTableStore,
    protocol: TestProtocol,
    options: MessageStoreOptions,
) -> TestManager {
    ServiceManager::new(protocol, store.clone(), options)
}

pub fn non_zero(value: usize) -> NonZeroUsize {
    NonZeroUsize::new(value).expect("non-zero")
}

pub fn response_row(request_id: RequestId, group_size: u32, agents: &[&str]) -> Row {
    Response::new(
        ServiceType::MultiRegionTable,
        request_id,
        group_size,
        acks(agents),
    )
    .to_row(SERIAL_VERSION)
    .expect("encodable response")
}

/// A row which no reader supporting [`SERIAL_VERSION`] can decode.
pub fn undecodable_row(request_id: RequestId) -> Row {
    Row {
        request_id,
        service_type: ServiceType::MultiRegionTable.ordinal(),
        timestamp: MillisSinceEpoch::now(),
        payload: Bytes::from_static(&[0, 9, 0xde, 0xad]),
    }
}

pub fn stored_response(store: &InMemoryTableStore, request_id: RequestId) -> Option<Response<Acks>> {
    store
        .stored(
            MessageTable::RESPONSE_TABLE_NAME,
            PrimaryKey::new(ServiceType::MultiRegionTable.ordinal(), request_id),
        )
        .map(|versioned_row| {
            Response::from_row(&versioned_row.row, SERIAL_VERSION).expect("decodable response")
        })
}
