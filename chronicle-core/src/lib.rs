//! Core types and engines for the chronicle event-sourcing library.
//!
//! - [`aggregate`] - Pure command-side engine (`Aggregate`, `CommandHandler`)
//! - [`store`] - Append-only log with optimistic concurrency (`AppendOnlyStore`)
//! - [`event_store`] - Domain events on top of the log, plus live publication
//! - [`bus`] - In-process broadcast of persisted events (`EventBus`)
//! - [`projection`] - Catch-up then live read models (`Projection`)
//! - [`repository`] - Load, command, save (`Repository`)
//! - [`snapshot`] - Snapshot storage abstraction (`SnapshotStore`)
//! - [`event`] - Identities, commands and events
//! - [`concurrency`] - The conflict raised by stale writers
//!
//! # Example
//!
//! ```
//! use chronicle_core::{bus::EventBus, event_store::EventStore, store::inmemory};
//!
//! let events = EventStore::new(inmemory::Store::new(), EventBus::new());
//! let _live = events.subscribe();
//! ```
//!
//! Most users should depend on the `chronicle` crate, which re-exports these
//! types together with the file backend.

pub mod aggregate;
pub mod bus;
pub mod concurrency;
pub mod event;
pub mod event_store;
pub mod projection;
pub mod repository;
pub mod snapshot;
pub mod store;
