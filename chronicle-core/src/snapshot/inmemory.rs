//! In-memory snapshot store.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use super::{OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore};
use crate::event::AggregateId;

/// When a snapshot offer is accepted.
///
/// - [`SnapshotPolicy::Always`]: after every save. Highest storage cost,
///   minimal replay.
/// - [`SnapshotPolicy::EveryNEvents`]: once `n` events accumulated since the
///   last snapshot.
/// - [`SnapshotPolicy::Never`]: load-only, for snapshots written elsewhere.
#[derive(Clone, Debug)]
pub enum SnapshotPolicy {
    Always,
    EveryNEvents(u64),
    Never,
}

impl SnapshotPolicy {
    #[must_use]
    pub const fn should_snapshot(&self, events_since: u64) -> bool {
        match self {
            Self::Always => true,
            Self::EveryNEvents(threshold) => events_since >= *threshold,
            Self::Never => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}

type SharedSnapshots = Arc<RwLock<HashMap<AggregateId, Snapshot<Value>>>>;

/// Snapshot store keeping one JSON snapshot per aggregate.
///
/// ```
/// use chronicle_core::snapshot::inmemory;
///
/// let snapshots = inmemory::Store::every(100);
/// ```
#[derive(Clone, Debug)]
pub struct Store {
    snapshots: SharedSnapshots,
    policy: SnapshotPolicy,
}

impl Store {
    #[must_use]
    pub fn with_policy(policy: SnapshotPolicy) -> Self {
        Self {
            snapshots: SharedSnapshots::default(),
            policy,
        }
    }

    #[must_use]
    pub fn always() -> Self {
        Self::with_policy(SnapshotPolicy::Always)
    }

    /// Accept an offer once `n` events were saved since the last snapshot.
    #[must_use]
    pub fn every(n: u64) -> Self {
        Self::with_policy(SnapshotPolicy::EveryNEvents(n))
    }

    #[must_use]
    pub fn never() -> Self {
        Self::with_policy(SnapshotPolicy::Never)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::always()
    }
}

impl SnapshotStore for Store {
    type Error = Error;

    #[tracing::instrument(skip(self), fields(aggregate = %aggregate))]
    async fn load<D>(&self, aggregate: &AggregateId) -> Result<Option<Snapshot<D>>, Error>
    where
        D: DeserializeOwned + Send,
    {
        let stored = self.snapshots.read().get(aggregate).cloned();
        let snapshot = stored
            .map(|stored| {
                serde_json::from_value(stored.snapshot).map(|snapshot| Snapshot {
                    aggregate: stored.aggregate,
                    version: stored.version,
                    snapshot,
                })
            })
            .transpose()
            .map_err(Error::Deserialization)?;
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(skip(self, create_snapshot), fields(aggregate = %aggregate))]
    async fn offer_snapshot<CE, D, Create>(
        &self,
        aggregate: &AggregateId,
        events_since_last_snapshot: u64,
        create_snapshot: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        D: Serialize + Send,
        Create: FnOnce() -> Result<Snapshot<D>, CE> + Send,
    {
        if !self.policy.should_snapshot(events_since_last_snapshot) {
            return Ok(SnapshotOffer::Declined);
        }

        let snapshot = create_snapshot().map_err(OfferSnapshotError::Create)?;
        let stored = Snapshot {
            snapshot: serde_json::to_value(&snapshot.snapshot)
                .map_err(|e| OfferSnapshotError::Snapshot(Error::Serialization(e)))?,
            aggregate: snapshot.aggregate,
            version: snapshot.version,
        };

        let offer = {
            let mut snapshots = self.snapshots.write();
            match snapshots.get(aggregate) {
                Some(existing) if existing.version >= stored.version => SnapshotOffer::Declined,
                _ => {
                    snapshots.insert(aggregate.clone(), stored);
                    SnapshotOffer::Stored
                }
            }
        };

        tracing::debug!(events_since_last_snapshot, ?offer, "snapshot offer evaluated");
        Ok(offer)
    }
}
