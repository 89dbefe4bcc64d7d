#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use chronicle_core::test;
pub use chronicle_core::{
    aggregate,
    aggregate::{
        Aggregate, AggregateError, AggregateState, CommandContext, CommandHandler, DomainError,
    },
    bus,
    bus::EventBus,
    concurrency::ConcurrencyConflict,
    event,
    event::{AggregateEvent, AggregateId, Command, DomainEvent},
    event_store,
    event_store::{EventStore, EventStoreError},
    projection,
    projection::{Projection, ProjectionError, ProjectionHandle, ProjectionState, ReadModel},
    repository,
    repository::{Repository, RepositoryError},
};

pub mod store {

    pub use chronicle_core::store::{
        AppendError, AppendOnlyStore, NonEmpty, StreamRecord, TimeRange,
    };

    // Building blocks for AppendOnlyStore implementors only.
    #[doc(hidden)]
    pub use chronicle_core::store::{AppendOutcome, check_version, stage_records, timestamp_now};

    #[cfg(feature = "file")]
    #[cfg_attr(docsrs, doc(cfg(feature = "file")))]
    pub mod file {
        pub use chronicle_file::{Error, FileStore, FileStoreConfig};
    }

    pub use chronicle_core::store::inmemory;
}

pub mod snapshot {

    pub use chronicle_core::snapshot::{
        NoSnapshots, OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore,
    };

    pub use chronicle_core::snapshot::inmemory;
}

pub mod position {

    pub use chronicle_core::projection::{InMemoryPositions, PositionStore};

    #[cfg(feature = "file")]
    #[cfg_attr(docsrs, doc(cfg(feature = "file")))]
    pub use chronicle_file::FilePositionStore;
}
