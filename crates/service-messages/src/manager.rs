// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use agentmsg_table_store::{
    Consistency, PrimaryKey, Row, ScanRange, StoreError, TableHandle, TableStore, VersionedRow,
    WriteOptions,
};
use agentmsg_types::SerialVersion;
use agentmsg_types::config::MessageStoreOptions;
use agentmsg_types::errors::MaybeRetryableError;

use crate::codec::{CodecError, StoredMessage};
use crate::error::ServiceError;
use crate::iterator::{MessageIterator, RequestIterator, ResponseIterator};
use crate::message::{
    DEFAULT_START_REQUEST_ID, MessageTable, Request, RequestId, Response, ResponseKind,
    ServiceMessage, ServiceType, UNUSED_REQUEST_ID, VERSION_REQUEST_ID,
};
use crate::metric_definitions::{
    SERVICE_MESSAGES_CODEC_ERROR_TOTAL, SERVICE_MESSAGES_CONFLICT_TOTAL,
    SERVICE_MESSAGES_GET_DURATION, SERVICE_MESSAGES_GET_TOTAL,
    SERVICE_MESSAGES_MERGE_SKIPPED_TOTAL, SERVICE_MESSAGES_POST_DURATION,
    SERVICE_MESSAGES_POST_TOTAL, SERVICE_MESSAGES_TRANSIENT_FAULT_TOTAL, STATUS_COMPLETED,
    STATUS_FAILED, describe_metrics,
};
use crate::protocol::{CodecErrorPolicy, ServiceProtocol};
use crate::rate_limited_log::RateLimitedLogger;

/// Result of a single posting attempt which did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    /// Lost a race against a concurrent writer of the same key.
    Conflict,
}

/// Posts, reads and iterates the request and response messages of one service type.
///
/// The manager is cheap to clone; clones share the resolved tables and the shutdown state.
pub struct ServiceManager<P, S> {
    inner: Arc<Inner<P, S>>,
}

impl<P, S> Clone for ServiceManager<P, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<P, S> {
    protocol: P,
    store: S,
    options: MessageStoreOptions,
    request_table: OnceCell<TableHandle>,
    response_table: OnceCell<TableHandle>,
    shutdown: CancellationToken,
    log: RateLimitedLogger,
}

impl<P: ServiceProtocol, S: TableStore> ServiceManager<P, S> {
    pub fn new(protocol: P, store: S, options: MessageStoreOptions) -> Self {
        describe_metrics();
        let log = RateLimitedLogger::new(
            options.log_suppression_window(),
            options.log_suppression_max_keys.get(),
        );
        Self {
            inner: Arc::new(Inner {
                protocol,
                store,
                options,
                request_table: OnceCell::new(),
                response_table: OnceCell::new(),
                shutdown: CancellationToken::new(),
                log,
            }),
        }
    }

    pub fn options(&self) -> &MessageStoreOptions {
        &self.inner.options
    }

    pub fn protocol(&self) -> &P {
        &self.inner.protocol
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn service_type(&self) -> ServiceType {
        self.inner.protocol.service_type()
    }

    /// Makes all pending and future operations fail with [`ServiceError::ShutDown`].
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!(service_type = %self.service_type(), "Shutting down service message manager");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Fails with [`ServiceError::NotReady`] unless both message tables exist.
    pub async fn check_for_ready(&self) -> Result<(), ServiceError> {
        self.table(MessageTable::Requests).await?;
        self.table(MessageTable::Responses).await?;
        Ok(())
    }

    /// Writes `request`. Without `overwrite` an existing request with the same id is kept.
    pub async fn post_request(
        &self,
        request: &Request<P::Request>,
        overwrite: bool,
    ) -> Result<(), ServiceError> {
        self.post_message(ServiceMessage::Request(request), overwrite)
            .await
    }

    /// Writes `response`, merging it into a stored response of the same group size.
    pub async fn post_response(
        &self,
        response: &Response<P::Response>,
        overwrite: bool,
    ) -> Result<(), ServiceError> {
        self.post_message(ServiceMessage::Response(response), overwrite)
            .await
    }

    pub async fn get_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<Request<P::Request>>, ServiceError> {
        self.get_message(request_id).await
    }

    pub async fn get_response(
        &self,
        request_id: RequestId,
    ) -> Result<Option<Response<P::Response>>, ServiceError> {
        self.get_message(request_id).await
    }

    /// Reads the group agent version response of this service type.
    pub async fn get_response_agent_version(
        &self,
    ) -> Result<Option<Response<P::Response>>, ServiceError> {
        let response = self.get_response(VERSION_REQUEST_ID).await?;
        match response {
            Some(response) if response.kind() != ResponseKind::GroupAgentVersion => {
                Err(ServiceError::InvalidArgument(format!(
                    "response at request id {VERSION_REQUEST_ID} is of kind '{}', expected '{}'",
                    response.kind(),
                    ResponseKind::GroupAgentVersion
                )))
            }
            response => Ok(response),
        }
    }

    /// Iterates the requests of this service type in ascending request id order, starting at
    /// `start_request_id` (inclusive). Ids below [`DEFAULT_START_REQUEST_ID`] are never returned.
    ///
    /// `timeout` bounds each scan of the request table; the configured default scan timeout is
    /// used if absent.
    pub fn request_iterator(
        &self,
        start_request_id: Option<RequestId>,
        timeout: Option<Duration>,
    ) -> RequestIterator<P, S> {
        MessageIterator::new(
            self.clone(),
            normalize_start(start_request_id),
            timeout.unwrap_or_else(|| self.inner.options.default_scan_timeout()),
        )
    }

    /// Iterates the responses of this service type. See [`Self::request_iterator`].
    pub fn response_iterator(
        &self,
        start_request_id: Option<RequestId>,
        timeout: Option<Duration>,
    ) -> ResponseIterator<P, S> {
        MessageIterator::new(
            self.clone(),
            normalize_start(start_request_id),
            timeout.unwrap_or_else(|| self.inner.options.default_scan_timeout()),
        )
    }

    pub(crate) fn max_serial_version(&self) -> SerialVersion {
        self.inner.protocol.max_serial_version()
    }

    pub(crate) fn scan_batch_size(&self) -> NonZeroUsize {
        self.inner.options.scan_batch_size
    }

    /// Hands a codec failure to the protocol and returns its decision.
    pub(crate) fn on_codec_error(
        &self,
        table: MessageTable,
        request_id: RequestId,
        err: &CodecError,
    ) -> CodecErrorPolicy {
        counter!(SERVICE_MESSAGES_CODEC_ERROR_TOTAL, "table" => <&'static str>::from(table))
            .increment(1);
        self.inner
            .protocol
            .handle_codec_error(table, request_id, err)
    }

    /// Fetches the next batch of rows of `table` starting at `start_request_id`. Each try of the
    /// scan is bounded by `timeout`; transient faults are retried like any other table operation.
    pub(crate) async fn scan(
        &self,
        table: MessageTable,
        start_request_id: RequestId,
        limit: NonZeroUsize,
        timeout: Duration,
    ) -> Result<Vec<VersionedRow>, ServiceError> {
        if self.is_shut_down() {
            return Err(ServiceError::ShutDown);
        }

        let handle = self.table(table).await?;
        let store = &self.inner.store;
        let range = ScanRange {
            service_type: self.service_type().ordinal(),
            start_request_id,
            limit,
        };

        let scan = self.execute(move || async move {
            match tokio::time::timeout(timeout, store.scan(handle, range, timeout)).await {
                Ok(rows) => rows,
                Err(_elapsed) => Err(StoreError::Timeout(timeout)),
            }
        });

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ServiceError::ShutDown),
            rows = scan => rows,
        }
    }

    /// Resolves the handle of `table` once. Unresolvable tables are looked up again on the
    /// next call.
    async fn table(&self, table: MessageTable) -> Result<&TableHandle, ServiceError> {
        let cell = match table {
            MessageTable::Requests => &self.inner.request_table,
            MessageTable::Responses => &self.inner.response_table,
        };

        cell.get_or_try_init(|| async {
            let store = &self.inner.store;
            let name = table.table_name();
            match self.execute(move || store.resolve_table(name)).await? {
                Some(handle) => {
                    debug!(%table, %handle, "Resolved service message table");
                    Ok(handle)
                }
                None => Err(ServiceError::NotReady(format!(
                    "table '{name}' does not exist"
                ))),
            }
        })
        .await
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions::new(self.inner.options.durability)
    }

    /// Runs `op` against the table store. Transient faults are retried up to
    /// `op-retries` tries in total; shutdown is checked before every try.
    async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let op_retries = self.inner.options.op_retries();
        let mut delays = self.inner.options.retry_backoff.iter();
        let mut tries = 0;

        loop {
            if self.is_shut_down() {
                return Err(ServiceError::ShutDown);
            }

            tries += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable() && tries < op_retries => {
                    counter!(SERVICE_MESSAGES_TRANSIENT_FAULT_TOTAL).increment(1);
                    debug!(%err, tries, "Transient table store fault; retrying");
                    self.backoff(delays.next()).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Sleeps for `delay` unless the manager shuts down first.
    async fn backoff(&self, delay: Option<Duration>) -> Result<(), ServiceError> {
        let Some(delay) = delay else {
            return Ok(());
        };

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ServiceError::ShutDown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn get_message<M: StoredMessage>(
        &self,
        request_id: RequestId,
    ) -> Result<Option<M>, ServiceError> {
        let start_time = Instant::now();
        let result: Result<Option<M>, ServiceError> = async {
            let table = self.table(M::TABLE).await?;
            let store = &self.inner.store;
            let key = PrimaryKey::new(self.service_type().ordinal(), request_id);

            let Some(versioned_row) = self
                .execute(move || store.get(table, key, Consistency::Absolute))
                .await?
            else {
                return Ok(None);
            };

            match M::from_row(&versioned_row.row, self.max_serial_version()) {
                Ok(message) => Ok(Some(message)),
                Err(err) => match self.on_codec_error(M::TABLE, request_id, &err) {
                    CodecErrorPolicy::Ignore => Ok(None),
                    CodecErrorPolicy::Fail => Err(err.into()),
                },
            }
        }
        .await;

        let status = if result.is_ok() {
            STATUS_COMPLETED
        } else {
            STATUS_FAILED
        };
        let table: &'static str = M::TABLE.into();
        histogram!(SERVICE_MESSAGES_GET_DURATION, "table" => table).record(start_time.elapsed());
        counter!(SERVICE_MESSAGES_GET_TOTAL, "table" => table, "status" => status).increment(1);

        result
    }

    async fn post_message(
        &self,
        message: ServiceMessage<'_, P::Request, P::Response>,
        overwrite: bool,
    ) -> Result<(), ServiceError> {
        let start_time = Instant::now();
        let result = self.post(message, overwrite).await;

        let status = if result.is_ok() {
            STATUS_COMPLETED
        } else {
            STATUS_FAILED
        };
        let table: &'static str = message.table().into();
        histogram!(SERVICE_MESSAGES_POST_DURATION, "table" => table)
            .record(start_time.elapsed());
        counter!(SERVICE_MESSAGES_POST_TOTAL, "table" => table, "status" => status).increment(1);

        result
    }

    async fn post(
        &self,
        message: ServiceMessage<'_, P::Request, P::Response>,
        overwrite: bool,
    ) -> Result<(), ServiceError> {
        if self.is_shut_down() {
            return Err(ServiceError::ShutDown);
        }

        let header = message.header();
        if header.service_type() != self.service_type() {
            return Err(ServiceError::InvalidArgument(format!(
                "cannot post a message of service type '{}' through the manager of '{}'",
                header.service_type(),
                self.service_type()
            )));
        }

        let table = message.table();
        let request_id = header.request_id();
        if request_id == UNUSED_REQUEST_ID {
            return Err(ServiceError::InvalidArgument(format!(
                "request id {UNUSED_REQUEST_ID} is reserved and cannot be posted"
            )));
        }
        let serial_version = self.max_serial_version();

        let encoded = match message {
            ServiceMessage::Request(request) => request.to_row(serial_version),
            ServiceMessage::Response(response) => response.to_row(serial_version),
        };
        let row = match encoded {
            Ok(row) => row,
            Err(err) => {
                return match self.on_codec_error(table, request_id, &err) {
                    CodecErrorPolicy::Ignore => Ok(()),
                    CodecErrorPolicy::Fail => Err(err.into()),
                };
            }
        };

        let handle = self.table(table).await?;
        let max_attempts = self.inner.options.max_attempts();
        let mut delays = self.inner.options.retry_backoff.iter();
        let start_time = Instant::now();
        let mut attempts = 0;
        let mut faults = 0;
        let mut last_fault = None;

        while attempts < max_attempts {
            attempts += 1;

            let outcome = match message {
                ServiceMessage::Request(_) => self.write_direct(handle, &row, overwrite).await,
                ServiceMessage::Response(response) if response.is_lead_version_claim() => {
                    self.write_direct(handle, &row, true).await
                }
                ServiceMessage::Response(response) => {
                    self.read_modify_write(handle, response, &row, overwrite)
                        .await
                }
            };

            match outcome {
                Ok(Outcome::Done) => return Ok(()),
                Ok(Outcome::Conflict) => {
                    counter!(SERVICE_MESSAGES_CONFLICT_TOTAL, "table" => <&'static str>::from(table))
                        .increment(1);
                    debug!(
                        %table,
                        request_id,
                        attempts,
                        "Concurrent update of service message; retrying"
                    );
                }
                Err(ServiceError::Store(err)) if err.retryable() => {
                    faults += 1;
                    self.inner.log.warn(
                        &format!("{}/{table}", self.service_type()),
                        format_args!(
                            "Posting to {table} table failed for request id {request_id} \
                            (attempt {attempts}/{max_attempts}): {err}"
                        ),
                    );
                    last_fault = Some(err);
                    self.backoff(delays.next()).await?;
                }
                Err(err) => return Err(err),
            }
        }

        Err(ServiceError::RetriesExhausted {
            table,
            request_id,
            attempts,
            faults,
            elapsed: start_time.elapsed(),
            last_fault,
        })
    }

    async fn write_direct(
        &self,
        table: &TableHandle,
        row: &Row,
        overwrite: bool,
    ) -> Result<Outcome, ServiceError> {
        let store = &self.inner.store;
        let options = self.write_options();

        if overwrite {
            self.execute(move || store.put(table, row.clone(), options))
                .await?;
        } else if self
            .execute(move || store.put_if_absent(table, row.clone(), options))
            .await?
            .is_none()
        {
            debug!(key = %row.primary_key(), %table, "Message exists already; keeping it");
        }

        Ok(Outcome::Done)
    }

    async fn read_modify_write(
        &self,
        table: &TableHandle,
        incoming: &Response<P::Response>,
        incoming_row: &Row,
        overwrite: bool,
    ) -> Result<Outcome, ServiceError> {
        let store = &self.inner.store;
        let options = self.write_options();
        let key = incoming_row.primary_key();
        let request_id = incoming.request_id();

        let Some(stored) = self
            .execute(move || store.get(table, key, Consistency::Absolute))
            .await?
        else {
            let version = self
                .execute(move || store.put_if_absent(table, incoming_row.clone(), options))
                .await?;
            return Ok(conditional_outcome(version.is_some()));
        };

        let stored_response =
            match Response::<P::Response>::from_row(&stored.row, self.max_serial_version()) {
                Ok(response) => Some(response),
                Err(err) => match self.on_codec_error(MessageTable::Responses, request_id, &err) {
                    CodecErrorPolicy::Ignore => None,
                    CodecErrorPolicy::Fail => return Err(err.into()),
                },
            };

        let expected = &stored.version;
        match stored_response {
            Some(mut stored_response) if stored_response.group_size() == incoming.group_size() => {
                stored_response
                    .merge(incoming.clone())
                    .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?;

                let merged_row = match stored_response.to_row(self.max_serial_version()) {
                    Ok(row) => row,
                    Err(err) => {
                        return match self.on_codec_error(
                            MessageTable::Responses,
                            request_id,
                            &err,
                        ) {
                            CodecErrorPolicy::Ignore => Ok(Outcome::Done),
                            CodecErrorPolicy::Fail => Err(err.into()),
                        };
                    }
                };

                let merged_row = &merged_row;
                let version = self
                    .execute(move || {
                        store.put_if_version(table, merged_row.clone(), expected, options)
                    })
                    .await?;
                Ok(conditional_outcome(version.is_some()))
            }
            stored_response => {
                if let Some(stored_response) = stored_response {
                    info!(
                        service_type = %self.service_type(),
                        request_id,
                        stored_group_size = stored_response.group_size(),
                        incoming_group_size = incoming.group_size(),
                        "Skipping merge of responses with different group sizes; replacing the stored response"
                    );
                    counter!(SERVICE_MESSAGES_MERGE_SKIPPED_TOTAL).increment(1);
                    self.inner.protocol.on_merge_skipped(
                        request_id,
                        stored_response.group_size(),
                        incoming.group_size(),
                    );
                }

                if overwrite {
                    self.execute(move || store.put(table, incoming_row.clone(), options))
                        .await?;
                    Ok(Outcome::Done)
                } else {
                    let version = self
                        .execute(move || {
                            store.put_if_version(table, incoming_row.clone(), expected, options)
                        })
                        .await?;
                    Ok(conditional_outcome(version.is_some()))
                }
            }
        }
    }
}

fn conditional_outcome(written: bool) -> Outcome {
    if written {
        Outcome::Done
    } else {
        Outcome::Conflict
    }
}

fn normalize_start(start_request_id: Option<RequestId>) -> RequestId {
    start_request_id
        .filter(|id| *id >= DEFAULT_START_REQUEST_ID)
        .unwrap_or(DEFAULT_START_REQUEST_ID)
}
