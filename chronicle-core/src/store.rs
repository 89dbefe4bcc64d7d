//! Persistence layer abstractions.
//!
//! This module describes the physical storage contract
//! ([`AppendOnlyStore`]), the record format ([`StreamRecord`]) and a
//! reference in-memory implementation. Stores know nothing about aggregates
//! or events; they keep opaque JSON payloads in per-stream order and hand out
//! the version and global id of each record.
use std::future::Future;

pub use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::concurrency::ConcurrencyConflict;

pub mod inmemory;

/// One immutable entry of the append-only log.
///
/// The serialized form is the line format of the file backend:
/// `{"id":1,"streamId":"counter:c1","version":1,"data":{..},"timestamp":..}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    /// Global sequence number, strictly increasing across all streams.
    pub id: u64,
    pub stream_id: String,
    /// 1-based, strictly increasing within `stream_id`.
    pub version: u64,
    pub data: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Timestamp window for [`AppendOnlyStore::read_all_records_in_range`].
///
/// Both bounds are exclusive; a missing bound is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub after_ts: Option<i64>,
    pub before_ts: Option<i64>,
}

impl TimeRange {
    #[must_use]
    pub const fn after(mut self, ts: i64) -> Self {
        self.after_ts = Some(ts);
        self
    }

    #[must_use]
    pub const fn before(mut self, ts: i64) -> Self {
        self.before_ts = Some(ts);
        self
    }

    #[must_use]
    pub fn contains(&self, ts: i64) -> bool {
        self.after_ts.is_none_or(|after| ts > after)
            && self.before_ts.is_none_or(|before| ts < before)
    }
}

/// Error from append operations with version checking.
#[derive(Debug, Error)]
pub enum AppendError<StoreError>
where
    StoreError: std::error::Error,
{
    /// Concurrency conflict - another writer modified the stream.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error> AppendError<StoreError> {
    /// Create a store error variant.
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Convenience alias for append outcomes returned by stores.
pub type AppendOutcome<Err> = Result<Vec<StreamRecord>, AppendError<Err>>;

/// Abstraction over the physical, append-only record log.
///
/// # Contract
///
/// - `append` is a critical section: reading the current stream version,
///   comparing it with `expected_version` and writing the new records happen
///   atomically with respect to every other `append` on the same store.
/// - Versions of the appended records are `expected_version + 1 ..=
///   expected_version + n`.
/// - Global ids continue a single counter shared by all streams. The stores
///   in this crate family hand out contiguous ids starting at 1, so skipping
///   `n` records of the global log is the same as reading ids `> n`.
/// - All `n` records are durable before `append` returns, or none are.
pub trait AppendOnlyStore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append `data` to `stream_id` if its current version is
    /// `expected_version` (0 for a stream that was never written).
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if the version doesn't match, or
    /// [`AppendError::Store`] if persistence fails.
    fn append<'a>(
        &'a self,
        stream_id: &'a str,
        data: NonEmpty<Value>,
        expected_version: u64,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + 'a;

    /// Records of one stream with `version > after_version`, in stream
    /// order, at most `limit` of them.
    fn read_records<'a>(
        &'a self,
        stream_id: &'a str,
        after_version: u64,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<StreamRecord>, Self::Error>> + Send + 'a;

    /// The global log in id order, skipping the first `skip` records.
    fn read_all_records(
        &self,
        skip: usize,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<StreamRecord>, Self::Error>> + Send + '_;

    /// Every record whose timestamp falls inside `range`.
    ///
    /// This is a full scan of the log; it is not backed by an index.
    fn read_all_records_in_range(
        &self,
        range: TimeRange,
    ) -> impl Future<Output = Result<Vec<StreamRecord>, Self::Error>> + Send + '_;
}

/// Build the records for an accepted append.
///
/// Shared by the store implementations so version and id assignment cannot
/// drift between backends. `next_id` is advanced past the new records.
#[must_use]
pub fn stage_records(
    stream_id: &str,
    data: NonEmpty<Value>,
    expected_version: u64,
    next_id: &mut u64,
    timestamp: i64,
) -> Vec<StreamRecord> {
    let mut version = expected_version;
    data.into_iter()
        .map(|data| {
            version += 1;
            let id = *next_id;
            *next_id += 1;
            StreamRecord {
                id,
                stream_id: stream_id.to_string(),
                version,
                data,
                timestamp,
            }
        })
        .collect()
}

/// Check `expected` against the persisted version of a stream.
///
/// # Errors
///
/// Returns the [`ConcurrencyConflict`] describing the mismatch.
pub fn check_version(
    stream_id: &str,
    expected: u64,
    actual: u64,
) -> Result<(), ConcurrencyConflict> {
    if expected == actual {
        return Ok(());
    }
    tracing::debug!(stream_id, expected, actual, "version mismatch, rejecting append");
    Err(ConcurrencyConflict {
        stream_id: stream_id.to_string(),
        expected,
        actual,
    })
}

/// Current wall-clock time in epoch milliseconds, as stamped on new records.
#[must_use]
pub fn timestamp_now() -> i64 {
    crate::event::now_millis()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn time_range_bounds_are_exclusive() {
        let range = TimeRange::default().after(10).before(20);
        assert!(!range.contains(10));
        assert!(range.contains(11));
        assert!(range.contains(19));
        assert!(!range.contains(20));
        assert!(TimeRange::default().contains(i64::MIN));
    }

    #[test]
    fn stage_records_assigns_contiguous_versions_and_ids() {
        let mut next_id = 8;
        let records = stage_records(
            "counter:c1",
            NonEmpty::from((json!(1), vec![json!(2), json!(3)])),
            4,
            &mut next_id,
            123,
        );

        let versions: Vec<u64> = records.iter().map(|r| r.version).collect();
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(versions, vec![5, 6, 7]);
        assert_eq!(ids, vec![8, 9, 10]);
        assert_eq!(next_id, 11);
        assert!(records.iter().all(|r| r.timestamp == 123));
    }

    #[test]
    fn check_version_reports_both_versions() {
        let conflict = check_version("counter:c1", 1, 3).unwrap_err();
        assert_eq!(conflict.stream_id, "counter:c1");
        assert_eq!(conflict.expected, 1);
        assert_eq!(conflict.actual, 3);
        assert!(check_version("counter:c1", 3, 3).is_ok());
    }

    #[test]
    fn stream_record_uses_camel_case_fields() {
        let record = StreamRecord {
            id: 1,
            stream_id: "counter:c1".to_string(),
            version: 1,
            data: json!({"name": "incremented"}),
            timestamp: 5,
        };
        let line = serde_json::to_string(&record).unwrap();
        assert!(line.contains("\"streamId\":\"counter:c1\""));
    }
}
