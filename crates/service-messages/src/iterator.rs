// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::time::Duration;

use futures::Stream;
use tracing::debug;

use agentmsg_table_store::{TableStore, VersionedRow};

use crate::codec::StoredMessage;
use crate::error::ServiceError;
use crate::manager::ServiceManager;
use crate::message::{Request, RequestId, Response};
use crate::protocol::{CodecErrorPolicy, ServiceProtocol};

pub type RequestIterator<P, S> =
    MessageIterator<P, S, Request<<P as ServiceProtocol>::Request>>;
pub type ResponseIterator<P, S> =
    MessageIterator<P, S, Response<<P as ServiceProtocol>::Response>>;

/// Forward-only iteration over the messages of one service type, fetched lazily in batches.
///
/// The iteration ends at the end of the table, at the first scan failure or at the first row
/// which cannot be decoded. An ended iterator stays ended; create a new one to scan again.
pub struct MessageIterator<P, S, M> {
    manager: ServiceManager<P, S>,
    next_request_id: RequestId,
    timeout: Duration,
    buffered: VecDeque<VersionedRow>,
    exhausted: bool,
    terminated: bool,
    _message: PhantomData<fn() -> M>,
}

impl<P, S, M> MessageIterator<P, S, M>
where
    P: ServiceProtocol,
    S: TableStore,
    M: StoredMessage,
{
    pub(crate) fn new(
        manager: ServiceManager<P, S>,
        start_request_id: RequestId,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            next_request_id: start_request_id,
            timeout,
            buffered: VecDeque::new(),
            exhausted: false,
            terminated: false,
            _message: PhantomData,
        }
    }

    /// Returns the next message, or [`None`] once the iteration ended.
    pub async fn next(&mut self) -> Option<Result<M, ServiceError>> {
        if self.terminated {
            return None;
        }

        loop {
            if let Some(versioned_row) = self.buffered.pop_front() {
                let request_id = versioned_row.row.request_id;
                return match M::from_row(&versioned_row.row, self.manager.max_serial_version()) {
                    Ok(message) => Some(Ok(message)),
                    Err(err) => {
                        self.terminate();
                        match self.manager.on_codec_error(M::TABLE, request_id, &err) {
                            CodecErrorPolicy::Ignore => {
                                debug!(
                                    table = %M::TABLE,
                                    request_id,
                                    "Ending iteration at undecodable message"
                                );
                                None
                            }
                            CodecErrorPolicy::Fail => Some(Err(err.into())),
                        }
                    }
                };
            }

            if self.exhausted {
                self.terminate();
                return None;
            }

            if let Err(err) = self.fetch_batch().await {
                self.terminate();
                return Some(Err(err));
            }
        }
    }

    /// Turns the iterator into a [`Stream`] of messages.
    pub fn into_stream(self) -> impl Stream<Item = Result<M, ServiceError>> {
        futures::stream::unfold(self, |mut iter| async move {
            let item = iter.next().await?;
            Some((item, iter))
        })
    }

    async fn fetch_batch(&mut self) -> Result<(), ServiceError> {
        let start = self.next_request_id;
        let rows = self
            .manager
            .scan(
                M::TABLE,
                start,
                self.manager.scan_batch_size(),
                self.timeout,
            )
            .await?;

        match rows.last() {
            Some(last) => match last.row.request_id.checked_add(1) {
                Some(next_request_id) => self.next_request_id = next_request_id,
                None => self.exhausted = true,
            },
            None => self.exhausted = true,
        }

        // rows before the start marker are never handed out
        self.buffered.extend(
            rows.into_iter()
                .filter(|versioned_row| versioned_row.row.request_id >= start),
        );
        Ok(())
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.buffered.clear();
    }
}
