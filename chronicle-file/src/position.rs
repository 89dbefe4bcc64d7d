use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chronicle_core::projection::PositionStore;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};

use crate::Error;

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    position: u64,
}

/// Projection positions kept as one JSON checkpoint file per projection.
///
/// Updates are written to a temporary file, synced, and renamed over the
/// checkpoint, so a crash mid-write leaves the previous position in place.
#[derive(Clone, Debug)]
pub struct FilePositionStore {
    dir: PathBuf,
}

impl FilePositionStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identifiers map to file names one-to-one: bytes outside `[A-Za-z0-9-_.]`
    /// are written as `%XX`, so `a/b` and `a_b` get different files.
    fn checkpoint_path(&self, identifier: &str) -> PathBuf {
        let mut file_name = String::with_capacity(identifier.len());
        for byte in identifier.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("%{byte:02X}"));
            }
        }
        self.dir.join(format!("{file_name}.position.json"))
    }
}

impl PositionStore for FilePositionStore {
    type Error = Error;

    async fn load<'a>(&'a self, identifier: &'a str) -> Result<u64, Error> {
        let path = self.checkpoint_path(identifier);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|source| Error::Corrupt {
                path,
                line: 1,
                source,
            })?;
        Ok(checkpoint.position)
    }

    #[tracing::instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn update<'a>(&'a self, identifier: &'a str, position: u64) -> Result<(), Error> {
        let path = self.checkpoint_path(identifier);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(&Checkpoint { position }).map_err(Error::Serialization)?;

        fs::create_dir_all(&self.dir).await?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_data().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        tracing::trace!("position checkpoint written");
        Ok(())
    }
}
