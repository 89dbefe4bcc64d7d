//! In-memory append-only store for tests and examples.
//!
//! [`Store`] keeps the whole log in a vector guarded by a single lock. The
//! version check and the append happen under the same write guard, which is
//! what makes the optimistic check race-free.
//!
//! # Example
//!
//! ```
//! use chronicle_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! ```

use std::{collections::HashMap, convert::Infallible, sync::Arc};

use nonempty::NonEmpty;
use parking_lot::RwLock;
use serde_json::Value;

use crate::store::{
    AppendOnlyStore, AppendOutcome, StreamRecord, TimeRange, check_version, stage_records,
    timestamp_now,
};

/// In-memory store that keeps every record in global order.
///
/// Cloning the store shares the underlying log.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    records: Vec<StreamRecord>,
    /// Index into `records` for each stream.
    streams: HashMap<String, Vec<usize>>,
}

impl Inner {
    fn stream_version(&self, stream_id: &str) -> u64 {
        self.streams
            .get(stream_id)
            .and_then(|indexes| indexes.last())
            .and_then(|&index| self.records.get(index))
            .map_or(0, |record| record.version)
    }

    fn next_id(&self) -> u64 {
        self.records.last().map_or(1, |record| record.id + 1)
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

impl Store {
    fn append_now(
        &self,
        stream_id: &str,
        data: NonEmpty<Value>,
        expected_version: u64,
    ) -> AppendOutcome<Infallible> {
        let mut inner = self.inner.write();
        check_version(stream_id, expected_version, inner.stream_version(stream_id))?;

        let mut next_id = inner.next_id();
        let records = stage_records(
            stream_id,
            data,
            expected_version,
            &mut next_id,
            timestamp_now(),
        );

        let first_index = inner.records.len();
        inner.records.extend(records.iter().cloned());
        inner
            .streams
            .entry(stream_id.to_string())
            .or_default()
            .extend(first_index..first_index + records.len());
        drop(inner);

        tracing::debug!(records_appended = records.len(), "records appended to stream");
        Ok(records)
    }
}

impl AppendOnlyStore for Store {
    type Error = Infallible;

    #[tracing::instrument(skip(self, data), fields(record_count = data.len()))]
    fn append<'a>(
        &'a self,
        stream_id: &'a str,
        data: NonEmpty<Value>,
        expected_version: u64,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + 'a {
        std::future::ready(self.append_now(stream_id, data, expected_version))
    }

    fn read_records<'a>(
        &'a self,
        stream_id: &'a str,
        after_version: u64,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<StreamRecord>, Self::Error>> + Send + 'a {
        let inner = self.inner.read();
        let records: Vec<StreamRecord> = inner
            .streams
            .get(stream_id)
            .into_iter()
            .flatten()
            .filter_map(|&index| inner.records.get(index))
            .filter(|record| record.version > after_version)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        drop(inner);
        std::future::ready(Ok(records))
    }

    fn read_all_records(
        &self,
        skip: usize,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<StreamRecord>, Self::Error>> + Send + '_ {
        let records = self
            .inner
            .read()
            .records
            .iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        std::future::ready(Ok(records))
    }

    fn read_all_records_in_range(
        &self,
        range: TimeRange,
    ) -> impl Future<Output = Result<Vec<StreamRecord>, Self::Error>> + Send + '_ {
        let records = self
            .inner
            .read()
            .records
            .iter()
            .filter(|record| range.contains(record.timestamp))
            .cloned()
            .collect();
        std::future::ready(Ok(records))
    }
}
