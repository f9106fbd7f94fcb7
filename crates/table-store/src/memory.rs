// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::{
    Consistency, PrimaryKey, Row, ScanRange, StoreError, TableHandle, TableStore, Version,
    VersionedRow, WriteOptions,
};

/// Operations of the [`TableStore`] interface, used to count calls and to target injected
/// faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ResolveTable,
    Get,
    Put,
    PutIfAbsent,
    PutIfVersion,
    Scan,
}

/// Transient faults the in-memory store reports instead of executing data operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultInjection {
    #[default]
    Disabled,
    /// Fail the next `n` data operations.
    Next(usize),
    /// Fail every data operation.
    Always,
}

/// Simple in-memory [`TableStore`] for tests. Generates monotonically increasing version tokens.
#[derive(Clone, Default)]
pub struct InMemoryTableStore(Arc<Mutex<Inner>>);

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Table>,
    next_table_id: u64,
    next_version: u64,
    faults: FaultInjection,
    scan_delay: Option<Duration>,
    // applied right before the next conditional write to emulate a concurrent writer
    interleaved_writes: Vec<(String, Row)>,
    op_counts: HashMap<StoreOp, usize>,
}

struct Table {
    handle: TableHandle,
    rows: BTreeMap<PrimaryKey, (Version, Row)>,
}

impl Inner {
    fn next_version(&mut self) -> Version {
        self.next_version += 1;
        Version::from_bytes(self.next_version.to_be_bytes().to_vec())
    }

    fn count(&mut self, op: StoreOp) {
        *self.op_counts.entry(op).or_default() += 1;
    }

    fn maybe_fail(&mut self, op: StoreOp) -> Result<(), StoreError> {
        let fail = match self.faults {
            FaultInjection::Disabled => false,
            FaultInjection::Always => true,
            FaultInjection::Next(0) => {
                self.faults = FaultInjection::Disabled;
                false
            }
            FaultInjection::Next(n) => {
                self.faults = if n == 1 {
                    FaultInjection::Disabled
                } else {
                    FaultInjection::Next(n - 1)
                };
                true
            }
        };

        if fail {
            debug!(?op, "injecting transient fault");
            Err(StoreError::unavailable(format!("injected fault on {op:?}")))
        } else {
            Ok(())
        }
    }

    fn table_mut(&mut self, table: &TableHandle) -> Result<&mut Table, StoreError> {
        self.tables
            .get_mut(table.name())
            .filter(|t| t.handle == *table)
            .ok_or_else(|| StoreError::UnknownTable(table.name().to_owned()))
    }

    fn apply_interleaved_writes(&mut self) {
        for (table, row) in std::mem::take(&mut self.interleaved_writes) {
            let version = self.next_version();
            if let Some(table) = self.tables.get_mut(&table) {
                table.rows.insert(row.primary_key(), (version, row));
            }
        }
    }
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store in which the given tables already exist.
    pub fn with_tables(names: &[&str]) -> Self {
        let store = Self::new();
        for name in names {
            store.create_table(name);
        }
        store
    }

    /// Creates the table if it does not exist yet and returns its handle.
    pub fn create_table(&self, name: &str) -> TableHandle {
        let mut inner = self.0.lock();
        if let Some(table) = inner.tables.get(name) {
            return table.handle.clone();
        }
        inner.next_table_id += 1;
        let handle = TableHandle::new(inner.next_table_id, name);
        inner.tables.insert(
            name.to_owned(),
            Table {
                handle: handle.clone(),
                rows: BTreeMap::new(),
            },
        );
        handle
    }

    pub fn inject_faults(&self, faults: FaultInjection) {
        self.0.lock().faults = faults;
    }

    /// Delays every scan by the given duration before it returns.
    pub fn set_scan_delay(&self, delay: Option<Duration>) {
        self.0.lock().scan_delay = delay;
    }

    /// Stores `row` into `table` right before the next conditional write executes, as if another
    /// writer won the race between a read and the conditional write.
    pub fn interleave_write(&self, table: &str, row: Row) {
        self.0.lock().interleaved_writes.push((table.to_owned(), row));
    }

    /// Number of calls of the given operation, including calls which failed.
    pub fn op_count(&self, op: StoreOp) -> usize {
        self.0.lock().op_counts.get(&op).copied().unwrap_or_default()
    }

    /// Returns the row stored under `key` in the named table, bypassing fault injection.
    pub fn stored(&self, table: &str, key: PrimaryKey) -> Option<VersionedRow> {
        let inner = self.0.lock();
        inner
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&key))
            .map(|(version, row)| VersionedRow::new(row.clone(), version.clone()))
    }

    /// Writes a row unconditionally, bypassing fault injection.
    pub fn insert(&self, table: &str, row: Row) -> Version {
        let mut inner = self.0.lock();
        let version = inner.next_version();
        if let Some(table) = inner.tables.get_mut(table) {
            table
                .rows
                .insert(row.primary_key(), (version.clone(), row));
        }
        version
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    #[instrument(level = "trace", skip(self))]
    async fn resolve_table(&self, name: &str) -> Result<Option<TableHandle>, StoreError> {
        let mut inner = self.0.lock();
        inner.count(StoreOp::ResolveTable);
        Ok(inner.tables.get(name).map(|table| table.handle.clone()))
    }

    #[instrument(level = "trace", skip(self))]
    async fn get(
        &self,
        table: &TableHandle,
        key: PrimaryKey,
        _consistency: Consistency,
    ) -> Result<Option<VersionedRow>, StoreError> {
        let mut inner = self.0.lock();
        inner.count(StoreOp::Get);
        inner.maybe_fail(StoreOp::Get)?;

        let table = inner.table_mut(table)?;
        Ok(table
            .rows
            .get(&key)
            .map(|(version, row)| VersionedRow::new(row.clone(), version.clone())))
    }

    #[instrument(level = "trace", skip(self, row), fields(key = %row.primary_key()))]
    async fn put(
        &self,
        table: &TableHandle,
        row: Row,
        _options: WriteOptions,
    ) -> Result<Version, StoreError> {
        let mut inner = self.0.lock();
        inner.count(StoreOp::Put);
        inner.maybe_fail(StoreOp::Put)?;

        let version = inner.next_version();
        let table = inner.table_mut(table)?;
        table
            .rows
            .insert(row.primary_key(), (version.clone(), row));
        Ok(version)
    }

    #[instrument(level = "trace", skip(self, row), fields(key = %row.primary_key()))]
    async fn put_if_absent(
        &self,
        table: &TableHandle,
        row: Row,
        _options: WriteOptions,
    ) -> Result<Option<Version>, StoreError> {
        let mut inner = self.0.lock();
        inner.count(StoreOp::PutIfAbsent);
        inner.maybe_fail(StoreOp::PutIfAbsent)?;
        inner.apply_interleaved_writes();

        let version = inner.next_version();
        let table = inner.table_mut(table)?;
        let key = row.primary_key();
        if table.rows.contains_key(&key) {
            debug!(%key, "put_if_absent: row exists");
            return Ok(None);
        }
        table.rows.insert(key, (version.clone(), row));
        Ok(Some(version))
    }

    #[instrument(level = "trace", skip(self, row), fields(key = %row.primary_key()))]
    async fn put_if_version(
        &self,
        table: &TableHandle,
        row: Row,
        expected: &Version,
        _options: WriteOptions,
    ) -> Result<Option<Version>, StoreError> {
        let mut inner = self.0.lock();
        inner.count(StoreOp::PutIfVersion);
        inner.maybe_fail(StoreOp::PutIfVersion)?;
        inner.apply_interleaved_writes();

        let version = inner.next_version();
        let table = inner.table_mut(table)?;
        let key = row.primary_key();
        match table.rows.get(&key) {
            Some((current, _)) if current == expected => {
                table.rows.insert(key, (version.clone(), row));
                Ok(Some(version))
            }
            current => {
                debug!(%key, %expected, actual = ?current.map(|(v, _)| v), "put_if_version: version mismatch");
                Ok(None)
            }
        }
    }

    #[instrument(level = "trace", skip(self))]
    async fn scan(
        &self,
        table: &TableHandle,
        range: ScanRange,
        timeout: Duration,
    ) -> Result<Vec<VersionedRow>, StoreError> {
        let (rows, delay) = {
            let mut inner = self.0.lock();
            inner.count(StoreOp::Scan);
            inner.maybe_fail(StoreOp::Scan)?;
            let delay = inner.scan_delay;

            let table = inner.table_mut(table)?;
            let start = PrimaryKey::new(range.service_type, range.start_request_id);
            let end = PrimaryKey::new(range.service_type, i64::MAX);
            let rows = table
                .rows
                .range(start..=end)
                .take(range.limit.get())
                .map(|(_, (version, row))| VersionedRow::new(row.clone(), version.clone()))
                .collect::<Vec<_>>();
            (rows, delay)
        };

        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(StoreError::Timeout(timeout));
            }
            tokio::time::sleep(delay).await;
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use bytes::Bytes;
    use googletest::prelude::*;
    use test_log::test;

    use agentmsg_types::errors::MaybeRetryableError;
    use agentmsg_types::time::MillisSinceEpoch;

    use super::*;

    fn row(request_id: i64, payload: &'static str) -> Row {
        Row {
            request_id,
            service_type: 0,
            timestamp: MillisSinceEpoch::new(42),
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    #[test(tokio::test)]
    async fn unknown_tables_do_not_resolve() {
        let store = InMemoryTableStore::new();
        assert!(store.resolve_table("requests").await.unwrap().is_none());

        let handle = store.create_table("requests");
        assert_eq!(
            store.resolve_table("requests").await.unwrap(),
            Some(handle.clone())
        );
        // creating twice returns the existing handle
        assert_eq!(store.create_table("requests"), handle);
    }

    #[test(tokio::test)]
    async fn conditional_writes() {
        let store = InMemoryTableStore::new();
        let table = store.create_table("responses");
        let options = WriteOptions::default();

        let v1 = store
            .put_if_absent(&table, row(1, "a"), options)
            .await
            .unwrap()
            .expect("absent");
        assert!(
            store
                .put_if_absent(&table, row(1, "b"), options)
                .await
                .unwrap()
                .is_none()
        );

        let v2 = store
            .put_if_version(&table, row(1, "c"), &v1, options)
            .await
            .unwrap()
            .expect("version matches");
        assert_ne!(v1, v2);

        // stale version is rejected
        assert!(
            store
                .put_if_version(&table, row(1, "d"), &v1, options)
                .await
                .unwrap()
                .is_none()
        );

        let stored = store
            .get(&table, PrimaryKey::new(0, 1), Consistency::Absolute)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, v2);
        assert_eq!(stored.row.payload, Bytes::from_static(b"c"));
    }

    #[test(tokio::test)]
    async fn interleaved_write_wins_the_race() {
        let store = InMemoryTableStore::new();
        let table = store.create_table("responses");
        let v1 = store.insert("responses", row(1, "a"));

        store.interleave_write("responses", row(1, "concurrent"));
        let result = store
            .put_if_version(&table, row(1, "mine"), &v1, WriteOptions::default())
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(
            store
                .stored("responses", PrimaryKey::new(0, 1))
                .unwrap()
                .row
                .payload,
            Bytes::from_static(b"concurrent")
        );
    }

    #[test(tokio::test)]
    async fn scan_is_scoped_and_ordered() {
        let store = InMemoryTableStore::new();
        let table = store.create_table("requests");
        for id in [5, -1, 3, 1, 4] {
            store.insert("requests", row(id, "x"));
        }
        store.insert(
            "requests",
            Row {
                service_type: 1,
                ..row(2, "other service")
            },
        );

        let rows = store
            .scan(
                &table,
                ScanRange {
                    service_type: 0,
                    start_request_id: 3,
                    limit: NonZeroUsize::new(2).unwrap(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let ids = rows.iter().map(|r| r.row.request_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test(tokio::test)]
    async fn injected_faults_are_transient() {
        let store = InMemoryTableStore::new();
        let table = store.create_table("requests");
        store.inject_faults(FaultInjection::Next(2));

        for _ in 0..2 {
            let err = store
                .get(&table, PrimaryKey::new(0, 1), Consistency::Absolute)
                .await
                .unwrap_err();
            assert!(err.retryable());
        }
        assert!(
            store
                .get(&table, PrimaryKey::new(0, 1), Consistency::Absolute)
                .await
                .is_ok()
        );
        assert_that!(store.op_count(StoreOp::Get), eq(3));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_scans_time_out() {
        let store = InMemoryTableStore::new();
        let table = store.create_table("requests");
        store.set_scan_delay(Some(Duration::from_secs(10)));

        let err = store
            .scan(
                &table,
                ScanRange {
                    service_type: 0,
                    start_request_id: 1,
                    limit: NonZeroUsize::new(10).unwrap(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }
}
