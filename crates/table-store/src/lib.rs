// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Interface of the replicated, versioned table store which backs the service message tables.
//!
//! Every stored row carries an opaque [`Version`] token which changes on every successful write.
//! Conditional writes ([`TableStore::put_if_absent`], [`TableStore::put_if_version`]) turn the
//! token into a compare-and-swap primitive.

mod error;
#[cfg(any(test, feature = "test-util"))]
mod memory;

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use agentmsg_types::config::Durability;
use agentmsg_types::time::MillisSinceEpoch;

pub use error::StoreError;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{FaultInjection, InMemoryTableStore, StoreOp};

/// Two-part primary key of a message row. Rows are ordered by service type first and by request
/// id second, which is the order exposed by [`TableStore::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("({service_type}, {request_id})")]
pub struct PrimaryKey {
    pub service_type: u8,
    pub request_id: i64,
}

impl PrimaryKey {
    pub const fn new(service_type: u8, request_id: i64) -> Self {
        Self {
            service_type,
            request_id,
        }
    }
}

/// A message row as persisted by the table store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub request_id: i64,
    /// Ordinal of the owning service type.
    pub service_type: u8,
    pub timestamp: MillisSinceEpoch,
    pub payload: Bytes,
}

impl Row {
    pub fn primary_key(&self) -> PrimaryKey {
        PrimaryKey::new(self.service_type, self.request_id)
    }
}

/// Opaque version token of a stored row.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Version(Bytes);

impl Version {
    pub fn from_bytes(token: impl Into<Bytes>) -> Self {
        Version(token.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self})")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRow {
    pub row: Row,
    pub version: Version,
}

impl VersionedRow {
    pub fn new(row: Row, version: Version) -> Self {
        Self { row, version }
    }
}

/// Read consistency requested from the table store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Consistency {
    /// Observe the most recently committed write of the key.
    #[default]
    Absolute,
    /// Any replica may answer.
    Eventual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub durability: Durability,
}

impl WriteOptions {
    pub fn new(durability: Durability) -> Self {
        Self { durability }
    }
}

/// Range of a forward scan within one service type partition. Only the service type prefix of
/// the primary key scopes the scan; `start_request_id` is the inclusive start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    pub service_type: u8,
    pub start_request_id: i64,
    pub limit: NonZeroUsize,
}

/// Resolved handle to a backing table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableHandle {
    id: u64,
    name: Arc<str>,
}

impl TableHandle {
    pub fn new(id: u64, name: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Versioned table store abstraction. Implementations need to support reads with absolute
/// consistency and atomic compare and swap writes per primary key.
///
/// Implementations report [`StoreError::Unavailable`] or [`StoreError::Timeout`] when an
/// operation cannot complete right now; a write which returned successfully is durable.
#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    /// Resolves the table with the given name. Returns [`None`] if the table does not exist
    /// (yet).
    async fn resolve_table(&self, name: &str) -> Result<Option<TableHandle>, StoreError>;

    /// Gets the row and its current version for the given key. If the row is not present, then
    /// return [`None`].
    async fn get(
        &self,
        table: &TableHandle,
        key: PrimaryKey,
        consistency: Consistency,
    ) -> Result<Option<VersionedRow>, StoreError>;

    /// Unconditionally writes the row and returns its new version.
    async fn put(
        &self,
        table: &TableHandle,
        row: Row,
        options: WriteOptions,
    ) -> Result<Version, StoreError>;

    /// Writes the row only if no row exists under its key. Returns [`None`] if a row exists.
    async fn put_if_absent(
        &self,
        table: &TableHandle,
        row: Row,
        options: WriteOptions,
    ) -> Result<Option<Version>, StoreError>;

    /// Writes the row only if the stored row has the `expected` version. Returns [`None`] if the
    /// stored version differs or the row is gone.
    async fn put_if_version(
        &self,
        table: &TableHandle,
        row: Row,
        expected: &Version,
        options: WriteOptions,
    ) -> Result<Option<Version>, StoreError>;

    /// Returns up to `range.limit` rows of `range.service_type` with a request id of at least
    /// `range.start_request_id`, ascending by request id. An empty result marks the end of the
    /// range. `timeout` bounds how long the call may block.
    async fn scan(
        &self,
        table: &TableHandle,
        range: ScanRange,
        timeout: Duration,
    ) -> Result<Vec<VersionedRow>, StoreError>;
}

static_assertions::assert_obj_safe!(TableStore);

#[async_trait]
impl<T: TableStore + ?Sized> TableStore for Arc<T> {
    async fn resolve_table(&self, name: &str) -> Result<Option<TableHandle>, StoreError> {
        (**self).resolve_table(name).await
    }

    async fn get(
        &self,
        table: &TableHandle,
        key: PrimaryKey,
        consistency: Consistency,
    ) -> Result<Option<VersionedRow>, StoreError> {
        (**self).get(table, key, consistency).await
    }

    async fn put(
        &self,
        table: &TableHandle,
        row: Row,
        options: WriteOptions,
    ) -> Result<Version, StoreError> {
        (**self).put(table, row, options).await
    }

    async fn put_if_absent(
        &self,
        table: &TableHandle,
        row: Row,
        options: WriteOptions,
    ) -> Result<Option<Version>, StoreError> {
        (**self).put_if_absent(table, row, options).await
    }

    async fn put_if_version(
        &self,
        table: &TableHandle,
        row: Row,
        expected: &Version,
        options: WriteOptions,
    ) -> Result<Option<Version>, StoreError> {
        (**self).put_if_version(table, row, expected, options).await
    }

    async fn scan(
        &self,
        table: &TableHandle,
        range: ScanRange,
        timeout: Duration,
    ) -> Result<Vec<VersionedRow>, StoreError> {
        (**self).scan(table, range, timeout).await
    }
}
