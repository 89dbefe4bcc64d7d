use std::path::PathBuf;

/// Error type for the file backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading, writing or syncing the file failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A record or checkpoint could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    /// A line of the log is not a valid record.
    #[error("corrupt record at {}:{line}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}
