use std::{
    collections::HashMap,
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use chronicle_core::store::{
    AppendError, AppendOnlyStore, AppendOutcome, NonEmpty, StreamRecord, TimeRange, check_version,
    stage_records, timestamp_now,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    fs,
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use crate::Error;

/// Where a [`FileStore`] keeps its log.
///
/// Deserializable so the path can come from any configuration source.
#[derive(Clone, Debug, Deserialize)]
pub struct FileStoreConfig {
    pub filepath: PathBuf,
}

/// The parsed log and how much of the file it covers.
#[derive(Debug, Default)]
struct LogContents {
    records: Vec<StreamRecord>,
    file_len: u64,
    /// Length of the file up to the last complete record.
    valid_len: u64,
    /// The last record was written without its trailing newline.
    missing_newline: bool,
}

impl LogContents {
    const fn needs_repair(&self) -> bool {
        self.valid_len < self.file_len || self.missing_newline
    }
}

/// Stream versions and the next global id, derived from the file.
#[derive(Debug, Default)]
struct Index {
    next_id: u64,
    versions: HashMap<String, u64>,
}

impl Index {
    fn build(records: &[StreamRecord]) -> Self {
        let mut index = Self {
            next_id: 1,
            versions: HashMap::new(),
        };
        index.extend(records);
        index
    }

    fn extend(&mut self, records: &[StreamRecord]) {
        for record in records {
            self.next_id = self.next_id.max(record.id + 1);
            self.versions.insert(record.stream_id.clone(), record.version);
        }
    }

    fn version(&self, stream_id: &str) -> u64 {
        self.versions.get(stream_id).copied().unwrap_or(0)
    }
}

/// Append-only store writing newline-delimited JSON [`StreamRecord`]s.
///
/// The parent directory and the file are created on the first append. Every
/// append is flushed with `sync_data` before it is acknowledged.
///
/// The version check, id assignment and write all happen while holding one
/// lock, which is also taken by reads so they never observe a partial line.
/// The index is built from the file on first use and kept in memory after
/// that. A failed write is cut back off the file and drops the index, and a
/// torn last line found while rebuilding the index is truncated away.
///
/// Cloning the store shares the lock and the index.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: Arc<PathBuf>,
    index: Arc<Mutex<Option<Index>>>,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            index: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn from_config(config: FileStoreConfig) -> Self {
        Self::new(config.filepath)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the log.
    ///
    /// A final line without its newline is what an interrupted append leaves
    /// behind. It is dropped if it does not parse; any other bad line is
    /// [`Error::Corrupt`].
    async fn read_file(&self) -> Result<LogContents, Error> {
        let contents = match fs::read(self.path.as_path()).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LogContents::default()),
            Err(e) => return Err(e.into()),
        };

        let mut log = LogContents {
            records: Vec::new(),
            file_len: contents.len() as u64,
            valid_len: contents.len() as u64,
            missing_newline: false,
        };
        let mut offset = 0;
        for (number, line) in contents.split_inclusive(|&b| b == b'\n').enumerate() {
            let line_start = offset;
            offset += line.len();
            let terminated = line.ends_with(b"\n");
            if line.trim_ascii().is_empty() {
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(record) => {
                    log.records.push(record);
                    log.missing_newline = !terminated;
                }
                Err(source) if !terminated => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = number + 1,
                        error = %source,
                        "ignoring torn record at end of log"
                    );
                    log.valid_len = line_start as u64;
                }
                Err(source) => {
                    return Err(Error::Corrupt {
                        path: self.path.to_path_buf(),
                        line: number + 1,
                        source,
                    });
                }
            }
        }
        Ok(log)
    }

    /// Cut a torn tail off the file and restore the final newline, so the
    /// next append starts on a fresh line.
    async fn repair_tail(&self, log: &LogContents) -> Result<(), Error> {
        if !log.needs_repair() {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.path.as_path())
            .await?;
        if log.valid_len < log.file_len {
            tracing::warn!(
                path = %self.path.display(),
                from = log.file_len,
                to = log.valid_len,
                "truncating torn tail"
            );
            file.set_len(log.valid_len).await?;
        }
        if log.missing_newline {
            file.seek(SeekFrom::End(0)).await?;
            file.write_all(b"\n").await?;
        }
        file.sync_data().await?;
        Ok(())
    }

    /// Append `records` as one write. On failure the file is cut back to its
    /// previous length so no part of the batch survives.
    async fn write_lines(&self, records: &[StreamRecord]) -> Result<(), Error> {
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record).map_err(Error::Serialization)?;
            buffer.push(b'\n');
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())
            .await?;
        let original_len = file.metadata().await?.len();

        let written = match file.write_all(&buffer).await {
            Ok(()) => file.sync_data().await,
            Err(e) => Err(e),
        };
        if let Err(err) = written {
            if let Err(rollback_err) = rollback(&file, original_len).await {
                tracing::error!(
                    error = %rollback_err,
                    original_len,
                    "failed to roll back partial append"
                );
            }
            return Err(err.into());
        }
        Ok(())
    }

    async fn append_locked(
        &self,
        index: &mut Option<Index>,
        stream_id: &str,
        data: NonEmpty<Value>,
        expected_version: u64,
    ) -> AppendOutcome<Error> {
        let current = match index.take() {
            Some(current) => current,
            None => {
                let log = self.read_file().await.map_err(AppendError::store)?;
                self.repair_tail(&log).await.map_err(AppendError::store)?;
                tracing::debug!(record_count = log.records.len(), "index rebuilt from file");
                Index::build(&log.records)
            }
        };
        let current = index.insert(current);

        check_version(stream_id, expected_version, current.version(stream_id))?;

        let mut next_id = current.next_id;
        let records = stage_records(
            stream_id,
            data,
            expected_version,
            &mut next_id,
            timestamp_now(),
        );

        if let Err(err) = self.write_lines(&records).await {
            // Rebuild from disk in case the rollback did not complete.
            *index = None;
            tracing::error!(error = %err, "append failed, index dropped");
            return Err(AppendError::store(err));
        }

        current.extend(&records);
        Ok(records)
    }
}

async fn rollback(file: &fs::File, original_len: u64) -> std::io::Result<()> {
    file.set_len(original_len).await?;
    file.sync_all().await
}

impl AppendOnlyStore for FileStore {
    type Error = Error;

    #[tracing::instrument(
        skip(self, data),
        fields(path = %self.path.display(), record_count = data.len())
    )]
    async fn append<'a>(
        &'a self,
        stream_id: &'a str,
        data: NonEmpty<Value>,
        expected_version: u64,
    ) -> AppendOutcome<Error> {
        let mut index = self.index.lock().await;
        let records = self
            .append_locked(&mut index, stream_id, data, expected_version)
            .await?;
        drop(index);

        tracing::debug!(records_appended = records.len(), "records appended to file");
        Ok(records)
    }

    async fn read_records<'a>(
        &'a self,
        stream_id: &'a str,
        after_version: u64,
        limit: Option<usize>,
    ) -> Result<Vec<StreamRecord>, Error> {
        let guard = self.index.lock().await;
        let records = self.read_file().await?.records;
        drop(guard);

        Ok(records
            .into_iter()
            .filter(|record| record.stream_id == stream_id && record.version > after_version)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn read_all_records(
        &self,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<StreamRecord>, Error> {
        let guard = self.index.lock().await;
        let records = self.read_file().await?.records;
        drop(guard);

        Ok(records
            .into_iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    async fn read_all_records_in_range(&self, range: TimeRange) -> Result<Vec<StreamRecord>, Error> {
        let guard = self.index.lock().await;
        let records = self.read_file().await?.records;
        drop(guard);

        let matching: Vec<StreamRecord> = records
            .into_iter()
            .filter(|record| range.contains(record.timestamp))
            .collect();
        tracing::trace!(record_count = matching.len(), "range scan finished");
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(id: u64, stream_id: &str, version: u64) -> StreamRecord {
        StreamRecord {
            id,
            stream_id: stream_id.to_string(),
            version,
            data: json!({}),
            timestamp: 0,
        }
    }

    #[test]
    fn index_tracks_latest_version_and_next_id() {
        let index = Index::build(&[
            record(1, "counter:a", 1),
            record(2, "counter:b", 1),
            record(3, "counter:a", 2),
        ]);
        assert_eq!(index.next_id, 4);
        assert_eq!(index.version("counter:a"), 2);
        assert_eq!(index.version("counter:b"), 1);
        assert_eq!(index.version("counter:c"), 0);
    }

    #[test]
    fn empty_index_starts_at_one() {
        assert_eq!(Index::build(&[]).next_id, 1);
    }

    #[tokio::test]
    async fn rollback_cuts_the_file_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(&path, b"{\"kept\":true}\n").await.unwrap();

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        let original_len = file.metadata().await.unwrap().len();
        file.write_all(b"{\"partial\":").await.unwrap();
        rollback(&file, original_len).await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"{\"kept\":true}\n");
    }

    #[tokio::test]
    async fn torn_tail_is_reported_for_repair() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("events.jsonl"));
        let line = serde_json::to_string(&record(1, "s:1", 1)).unwrap();
        fs::write(store.path(), format!("{line}\n{{\"id\":2"))
            .await
            .unwrap();

        let log = store.read_file().await.unwrap();
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.valid_len, line.len() as u64 + 1);
        assert!(log.needs_repair());
    }

    #[test]
    fn config_deserializes_filepath() {
        let config: FileStoreConfig =
            serde_json::from_value(json!({ "filepath": "data/events.jsonl" })).unwrap();
        assert_eq!(FileStore::from_config(config).path(), Path::new("data/events.jsonl"));
    }
}
