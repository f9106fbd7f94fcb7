// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tests asserting on emitted log lines. They install their own subscriber through
//! `traced_test` and therefore live in a test binary of their own.

mod common;

use googletest::prelude::*;
use tracing_test::traced_test;

use agentmsg_service_messages::{MessageTable, Response, ServiceType};
use agentmsg_table_store::StoreOp;

use crate::common::*;

#[tokio::test]
#[traced_test]
async fn mismatched_group_size_replaces_stored_response() {
    let store = store();
    let manager = manager(&store);

    store.insert(MessageTable::RESPONSE_TABLE_NAME, response_row(5, 3, &["a", "b"]));

    let response = Response::new(ServiceType::MultiRegionTable, 5, 2, acks(&["d"]));
    manager.post_response(&response, false).await.unwrap();

    let stored = stored_response(&store, 5).expect("response exists");
    assert_eq!(stored.body(), &acks(&["d"]));
    assert_eq!(stored.group_size(), 2);
    assert_eq!(*manager.protocol().skipped_merges.lock(), vec![(5, 3, 2)]);
    assert!(logs_contain(
        "Skipping merge of responses with different group sizes"
    ));

    // with overwrite the replacement is unconditional
    let response = Response::new(ServiceType::MultiRegionTable, 5, 4, acks(&["e"]));
    manager.post_response(&response, true).await.unwrap();

    let stored = stored_response(&store, 5).expect("response exists");
    assert_eq!(stored.body(), &acks(&["e"]));
    assert_that!(store.op_count(StoreOp::Put), eq(1));
    assert_that!(store.op_count(StoreOp::PutIfVersion), eq(1));
    assert_eq!(manager.protocol().skipped_merges.lock().len(), 2);
    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|line| line.contains("Skipping merge of responses"))
            .count()
        {
            2 => Ok(()),
            n => Err(format!("Expected 2 matching logs, but found {n}")),
        }
    });
}

#[tokio::test]
#[traced_test]
async fn equal_group_sizes_merge_without_skip_log() {
    let store = store();
    let manager = manager(&store);

    store.insert(MessageTable::RESPONSE_TABLE_NAME, response_row(6, 3, &["a"]));

    let response = Response::new(ServiceType::MultiRegionTable, 6, 3, acks(&["b"]));
    manager.post_response(&response, false).await.unwrap();

    let stored = stored_response(&store, 6).expect("response exists");
    assert_eq!(stored.body(), &acks(&["a", "b"]));
    assert!(manager.protocol().skipped_merges.lock().is_empty());
    assert!(!logs_contain("Skipping merge of responses"));
}
