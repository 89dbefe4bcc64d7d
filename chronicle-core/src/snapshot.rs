//! Snapshots of aggregate state.
//!
//! A [`Snapshot`] records the serialized state of one aggregate at a given
//! stream version, so loading only has to replay the events after it. The
//! aggregate's [`SnapshotCodec`](crate::aggregate::SnapshotCodec) decides the
//! serialized form; a [`SnapshotStore`] decides where snapshots live and
//! when a new one is worth taking.
//!
//! - [`NoSnapshots`] never stores anything and is the repository default.
//! - [`inmemory`] keeps snapshots in memory under a [`SnapshotPolicy`].
//!
//! [`SnapshotPolicy`]: inmemory::SnapshotPolicy

use std::convert::Infallible;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::event::AggregateId;

pub mod inmemory;

/// Serialized aggregate state at `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub aggregate: AggregateId,
    /// Number of events folded into the snapshot.
    pub version: u64,
    pub snapshot: S,
}

/// Snapshot persistence with a built-in policy.
///
/// The repository calls [`offer_snapshot`](SnapshotStore::offer_snapshot)
/// after every successful save; the store decides whether to invoke the
/// (possibly expensive) `create_snapshot` callback at all.
pub trait SnapshotStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the most recent snapshot for `aggregate`, if any.
    fn load<D>(
        &self,
        aggregate: &AggregateId,
    ) -> impl Future<Output = Result<Option<Snapshot<D>>, Self::Error>> + Send
    where
        D: DeserializeOwned + Send;

    /// Whether to store a snapshot, with lazy snapshot creation.
    ///
    /// # Errors
    ///
    /// [`OfferSnapshotError::Create`] if `create_snapshot` fails,
    /// [`OfferSnapshotError::Snapshot`] if persistence fails.
    fn offer_snapshot<CE, D, Create>(
        &self,
        aggregate: &AggregateId,
        events_since_last_snapshot: u64,
        create_snapshot: Create,
    ) -> impl Future<Output = Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>> + Send
    where
        CE: std::error::Error + Send + Sync + 'static,
        D: Serialize + Send,
        Create: FnOnce() -> Result<Snapshot<D>, CE> + Send;
}

/// Result of offering a snapshot to a store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotOffer {
    Declined,
    Stored,
}

/// Error returned by [`SnapshotStore::offer_snapshot`].
#[derive(Debug, thiserror::Error)]
pub enum OfferSnapshotError<SnapshotError, CreateError>
where
    SnapshotError: std::error::Error + 'static,
    CreateError: std::error::Error + 'static,
{
    #[error("failed to create snapshot: {0}")]
    Create(#[source] CreateError),
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] SnapshotError),
}

/// Snapshot store that never stores anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSnapshots;

impl SnapshotStore for NoSnapshots {
    type Error = Infallible;

    async fn load<D>(&self, _aggregate: &AggregateId) -> Result<Option<Snapshot<D>>, Infallible>
    where
        D: DeserializeOwned + Send,
    {
        Ok(None)
    }

    async fn offer_snapshot<CE, D, Create>(
        &self,
        _aggregate: &AggregateId,
        _events_since_last_snapshot: u64,
        _create_snapshot: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Infallible, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        D: Serialize + Send,
        Create: FnOnce() -> Result<Snapshot<D>, CE> + Send,
    {
        Ok(SnapshotOffer::Declined)
    }
}
