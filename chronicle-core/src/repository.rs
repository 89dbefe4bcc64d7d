//! Application service orchestration.
//!
//! [`Repository`] ties one [`Aggregate`] definition to an [`EventStore`]: it
//! loads instances by replay, runs commands and saves the resulting events
//! with the optimistic version check. Conflicts are returned to the caller
//! unchanged; retrying is an application decision.
//!
//! Snapshot support is opt-in through [`Repository::with_snapshots`], which
//! keeps the default repository free of serde bounds on the snapshot form.

use std::convert::Infallible;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, AggregateError, AggregateState, SnapshotCodec},
    concurrency::ConcurrencyConflict,
    event::{AggregateEvent, AggregateId, Command, DomainEvent},
    event_store::{EventStore, EventStoreError},
    snapshot::{NoSnapshots, OfferSnapshotError, SnapshotOffer, SnapshotStore},
    store::AppendOnlyStore,
};

/// Errors returned by [`Repository`] operations.
#[derive(Debug, Error)]
pub enum RepositoryError<StoreError, SnapshotError = Infallible>
where
    StoreError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    #[error("aggregate rejected command: {0}")]
    Aggregate(#[from] AggregateError),
    /// The stream moved on between load and save.
    #[error(transparent)]
    Concurrency(ConcurrencyConflict),
    #[error("event store error: {0}")]
    Store(#[source] EventStoreError<StoreError>),
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] SnapshotError),
}

impl<StoreError, SnapshotError> From<EventStoreError<StoreError>>
    for RepositoryError<StoreError, SnapshotError>
where
    StoreError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    fn from(err: EventStoreError<StoreError>) -> Self {
        match err {
            EventStoreError::Concurrency(conflict) => Self::Concurrency(conflict),
            other => Self::Store(other),
        }
    }
}

impl<StoreError, SnapshotError> RepositoryError<StoreError, SnapshotError>
where
    StoreError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    /// The conflict, if this error is one.
    #[must_use]
    pub const fn as_conflict(&self) -> Option<&ConcurrencyConflict> {
        match self {
            Self::Concurrency(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Snapshot-enabled repository mode wrapper.
pub struct Snapshots<SS>(pub SS);

/// Loads, commands and saves instances of one aggregate.
pub struct Repository<T, C, S, M = NoSnapshots> {
    aggregate: Aggregate<T, C>,
    events: EventStore<S>,
    snapshots: M,
}

struct Loaded<T> {
    state: AggregateState<T>,
    events_since_snapshot: u64,
}

impl<T, C, S> Repository<T, C, S>
where
    S: AppendOnlyStore,
{
    #[must_use]
    pub const fn new(aggregate: Aggregate<T, C>, events: EventStore<S>) -> Self {
        Self {
            aggregate,
            events,
            snapshots: NoSnapshots,
        }
    }

    /// Load from and offer to `snapshots` when reading and saving.
    #[must_use]
    pub fn with_snapshots<SS>(self, snapshots: SS) -> Repository<T, C, S, Snapshots<SS>>
    where
        SS: SnapshotStore,
    {
        Repository {
            aggregate: self.aggregate,
            events: self.events,
            snapshots: Snapshots(snapshots),
        }
    }
}

impl<T, C, S, M> Repository<T, C, S, M>
where
    T: Clone + Send + Sync + 'static,
    C: SnapshotCodec<T>,
    S: AppendOnlyStore,
{
    pub const fn aggregate(&self) -> &Aggregate<T, C> {
        &self.aggregate
    }

    pub const fn event_store(&self) -> &EventStore<S> {
        &self.events
    }

    /// A fresh random instance id.
    #[must_use]
    pub fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn aggregate_id(&self, id: &str) -> AggregateId {
        AggregateId::new(self.aggregate.name(), id)
    }

    /// Persist `events` for instance `id` at `expected_version`.
    pub async fn save(
        &self,
        id: &str,
        events: Vec<DomainEvent>,
        expected_version: u64,
        metadata: Option<Value>,
    ) -> Result<Vec<AggregateEvent>, RepositoryError<S::Error>> {
        Ok(self
            .events
            .save(&self.aggregate_id(id), events, expected_version, metadata)
            .await?)
    }

    async fn replay<SE>(
        &self,
        id: &AggregateId,
        snapshot: Option<crate::snapshot::Snapshot<C::Serialized>>,
    ) -> Result<Loaded<T>, RepositoryError<S::Error, SE>>
    where
        SE: std::error::Error + 'static,
    {
        let after_version = snapshot.as_ref().map_or(0, |s| s.version);
        let events = self.events.load_events(id, after_version).await?;
        let state = self.aggregate.rehydrate(id, &events, snapshot.as_ref())?;
        tracing::trace!(
            aggregate = %id,
            version = state.version,
            replayed = events.len(),
            "aggregate loaded"
        );
        Ok(Loaded {
            state,
            events_since_snapshot: events.len() as u64,
        })
    }

    /// Run `command` against `loaded` and save the result at the version it
    /// was loaded at.
    async fn run_command<SE>(
        &self,
        loaded: &Loaded<T>,
        command: &Command,
    ) -> Result<Vec<AggregateEvent>, RepositoryError<S::Error, SE>>
    where
        SE: std::error::Error + 'static,
    {
        let events = self.aggregate.apply_command(&loaded.state, command).await?;
        Ok(self
            .events
            .save(
                &loaded.state.id,
                events,
                loaded.state.version,
                command.metadata.clone(),
            )
            .await?)
    }
}

impl<T, C, S> Repository<T, C, S, NoSnapshots>
where
    T: Clone + Send + Sync + 'static,
    C: SnapshotCodec<T>,
    S: AppendOnlyStore,
{
    /// Load instance `id` by replaying its stream.
    #[tracing::instrument(skip(self), fields(aggregate = %self.aggregate.name()))]
    pub async fn get_by_id(&self, id: &str) -> Result<AggregateState<T>, RepositoryError<S::Error>> {
        Ok(self
            .replay::<Infallible>(&self.aggregate_id(id), None)
            .await?
            .state)
    }

    /// Load, run `command`, save with `expected_version = state.version`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Concurrency`] when another writer saved to the
    /// same instance in between; the caller decides whether to retry.
    #[tracing::instrument(
        skip(self, command),
        fields(aggregate = %self.aggregate.name(), command = %command.name)
    )]
    pub async fn execute(
        &self,
        id: &str,
        command: &Command,
    ) -> Result<Vec<AggregateEvent>, RepositoryError<S::Error>> {
        let loaded = self
            .replay::<Infallible>(&self.aggregate_id(id), None)
            .await?;
        self.run_command(&loaded, command).await
    }
}

impl<T, C, S, SS> Repository<T, C, S, Snapshots<SS>>
where
    T: Clone + Send + Sync + 'static,
    C: SnapshotCodec<T>,
    C::Serialized: Serialize + DeserializeOwned,
    S: AppendOnlyStore,
    SS: SnapshotStore,
{
    pub const fn snapshot_store(&self) -> &SS {
        &self.snapshots.0
    }

    async fn load_with_snapshot(
        &self,
        id: &AggregateId,
    ) -> Result<Loaded<T>, RepositoryError<S::Error, SS::Error>> {
        let snapshot = self
            .snapshots
            .0
            .load::<C::Serialized>(id)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    error = %e,
                    "failed to load snapshot, falling back to full replay"
                );
            })
            .ok()
            .flatten();
        self.replay(id, snapshot).await
    }

    /// Load instance `id` from its latest snapshot plus the events after it.
    #[tracing::instrument(skip(self), fields(aggregate = %self.aggregate.name()))]
    pub async fn get_by_id(
        &self,
        id: &str,
    ) -> Result<AggregateState<T>, RepositoryError<S::Error, SS::Error>> {
        Ok(self.load_with_snapshot(&self.aggregate_id(id)).await?.state)
    }

    /// [`execute`](Repository::execute) followed by a snapshot offer.
    #[tracing::instrument(
        skip(self, command),
        fields(aggregate = %self.aggregate.name(), command = %command.name)
    )]
    pub async fn execute(
        &self,
        id: &str,
        command: &Command,
    ) -> Result<Vec<AggregateEvent>, RepositoryError<S::Error, SS::Error>> {
        let loaded = self.load_with_snapshot(&self.aggregate_id(id)).await?;
        let saved = self.run_command::<SS::Error>(&loaded, command).await?;
        if saved.is_empty() {
            return Ok(saved);
        }

        let state = saved.iter().try_fold(loaded.state.clone(), |state, event| {
            self.aggregate.apply_event(&state, &event.event)
        })?;
        let events_since_snapshot = loaded.events_since_snapshot + saved.len() as u64;

        let offer = self
            .snapshots
            .0
            .offer_snapshot(&state.id, events_since_snapshot, || {
                self.aggregate.take_snapshot(&state)
            })
            .await;
        match offer {
            Ok(SnapshotOffer::Stored) => {
                tracing::debug!(version = state.version, "snapshot stored");
            }
            Ok(SnapshotOffer::Declined) => {}
            Err(OfferSnapshotError::Create(e)) => return Err(RepositoryError::Aggregate(e)),
            Err(OfferSnapshotError::Snapshot(e)) => return Err(RepositoryError::Snapshot(e)),
        }
        Ok(saved)
    }
}
