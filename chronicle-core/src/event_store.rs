//! Domain-level view of the append-only log.
//!
//! [`EventStore`] maps [`DomainEvent`]s to physical [`StreamRecord`]s and
//! back, derives stream ids from [`AggregateId`]s, and publishes every
//! persisted event on an [`EventBus`] once the append has succeeded.

use std::{pin::Pin, sync::Arc};

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{
    bus::{EventBus, EventReceiver},
    concurrency::ConcurrencyConflict,
    event::{AggregateEvent, AggregateId, DomainEvent},
    store::{AppendError, AppendOnlyStore, NonEmpty, StreamRecord, TimeRange},
};

/// Stream of live events, see [`EventStore::live`].
pub type LiveEvents =
    Pin<Box<dyn Stream<Item = Result<Arc<AggregateEvent>, BroadcastStreamRecvError>> + Send>>;

/// Errors returned by [`EventStore`] operations.
#[derive(Debug, Error)]
pub enum EventStoreError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// The stream moved on since the caller read it.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    #[error("failed to encode event `{name}`: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode record {id} of stream `{stream_id}`: {source}")]
    Decode {
        id: u64,
        stream_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl<StoreError> From<AppendError<StoreError>> for EventStoreError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    fn from(err: AppendError<StoreError>) -> Self {
        match err {
            AppendError::Conflict(conflict) => Self::Concurrency(conflict),
            AppendError::Store(err) => Self::Store(err),
        }
    }
}

/// Payload stored in [`StreamRecord::data`] for every event.
#[derive(Serialize, Deserialize)]
struct EventRecord {
    name: String,
    aggregate: AggregateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

/// Event persistence on top of an [`AppendOnlyStore`].
///
/// Cloning shares the underlying store, bus and ordering lock.
#[derive(Clone)]
pub struct EventStore<S> {
    store: S,
    bus: EventBus,
    // Held across append and publish so live delivery follows id order.
    ordering: Arc<Mutex<()>>,
}

impl<S> EventStore<S>
where
    S: AppendOnlyStore,
{
    pub fn new(store: S, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            ordering: Arc::new(Mutex::new(())),
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Persist `events` for `aggregate` at `expected_version` and publish
    /// them to live subscribers.
    ///
    /// An empty `events` is a no-op and returns an empty vector.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::Concurrency`] when the stream is not at
    /// `expected_version`; nothing is written or published in that case.
    #[tracing::instrument(
        skip(self, events, metadata),
        fields(aggregate = %aggregate, event_count = events.len())
    )]
    pub async fn save(
        &self,
        aggregate: &AggregateId,
        events: Vec<DomainEvent>,
        expected_version: u64,
        metadata: Option<Value>,
    ) -> Result<Vec<AggregateEvent>, EventStoreError<S::Error>> {
        let Some(events) = NonEmpty::from_vec(events) else {
            tracing::trace!("nothing to save");
            return Ok(Vec::new());
        };

        let encode =
            |event: &DomainEvent| encode_event::<S::Error>(aggregate, event, metadata.as_ref());
        let head = encode(&events.head)?;
        let tail = events.tail.iter().map(&encode).collect::<Result<Vec<_>, _>>()?;
        let payload = NonEmpty::from((head, tail));

        let stream_id = aggregate.stream_id();
        let ordering = self.ordering.lock().await;
        let records = self
            .store
            .append(&stream_id, payload, expected_version)
            .await?;

        let persisted: Vec<AggregateEvent> = records
            .into_iter()
            .zip(events)
            .map(|(record, event)| AggregateEvent {
                id: record.id,
                aggregate: aggregate.clone(),
                version: record.version,
                timestamp: record.timestamp,
                event,
                metadata: metadata.clone(),
            })
            .collect();

        for event in &persisted {
            self.bus.publish(Arc::new(event.clone()));
        }
        drop(ordering);

        tracing::debug!(
            version = persisted.last().map(|e| e.version),
            "events saved"
        );
        Ok(persisted)
    }

    /// Events of one aggregate with `version > after_version`.
    pub async fn load_events(
        &self,
        aggregate: &AggregateId,
        after_version: u64,
    ) -> Result<Vec<AggregateEvent>, EventStoreError<S::Error>> {
        let records = self
            .store
            .read_records(&aggregate.stream_id(), after_version, None)
            .await
            .map_err(EventStoreError::Store)?;
        decode_all(records)
    }

    /// Every event in the log with `id > after_id`, in id order.
    #[tracing::instrument(skip(self))]
    pub async fn load_all_events(
        &self,
        after_id: u64,
    ) -> Result<Vec<AggregateEvent>, EventStoreError<S::Error>> {
        let skip = usize::try_from(after_id).unwrap_or(usize::MAX);
        let records = self
            .store
            .read_all_records(skip, None)
            .await
            .map_err(EventStoreError::Store)?;
        let events = decode_all::<S::Error>(records.into_iter().filter(|r| r.id > after_id))?;
        tracing::trace!(event_count = events.len(), "loaded events from the log");
        Ok(events)
    }

    /// Events whose append time falls strictly inside `range`.
    pub async fn load_events_in_range(
        &self,
        range: TimeRange,
    ) -> Result<Vec<AggregateEvent>, EventStoreError<S::Error>> {
        let records = self
            .store
            .read_all_records_in_range(range)
            .await
            .map_err(EventStoreError::Store)?;
        decode_all(records)
    }

    /// Receiver for events saved from now on.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    /// Events saved from now on, as a [`Stream`].
    ///
    /// A subscriber that falls more than the bus capacity behind receives a
    /// [`BroadcastStreamRecvError::Lagged`] item and continues with newer
    /// events.
    #[must_use]
    pub fn live(&self) -> LiveEvents {
        Box::pin(BroadcastStream::new(self.bus.subscribe()))
    }
}

fn encode_event<E>(
    aggregate: &AggregateId,
    event: &DomainEvent,
    metadata: Option<&Value>,
) -> Result<Value, EventStoreError<E>>
where
    E: std::error::Error + 'static,
{
    let record = EventRecord {
        name: event.name.clone(),
        aggregate: aggregate.clone(),
        data: event.data.clone(),
        metadata: metadata.cloned(),
    };
    serde_json::to_value(record).map_err(|source| EventStoreError::Encode {
        name: event.name.clone(),
        source,
    })
}

fn decode_record<E>(record: StreamRecord) -> Result<AggregateEvent, EventStoreError<E>>
where
    E: std::error::Error + 'static,
{
    let StreamRecord {
        id,
        stream_id,
        version,
        data,
        timestamp,
    } = record;
    let EventRecord {
        name,
        aggregate,
        data,
        metadata,
    } = serde_json::from_value(data).map_err(|source| EventStoreError::Decode {
        id,
        stream_id,
        source,
    })?;
    Ok(AggregateEvent {
        id,
        aggregate,
        version,
        timestamp,
        event: DomainEvent { name, data },
        metadata,
    })
}

fn decode_all<E>(
    records: impl IntoIterator<Item = StreamRecord>,
) -> Result<Vec<AggregateEvent>, EventStoreError<E>>
where
    E: std::error::Error + 'static,
{
    records.into_iter().map(decode_record).collect()
}
