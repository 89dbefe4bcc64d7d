//! File-backed implementations for chronicle.
//!
//! - [`FileStore`] - an [`AppendOnlyStore`] keeping one JSON record per line
//! - [`FilePositionStore`] - a [`PositionStore`] keeping one checkpoint file
//!   per projection
//!
//! Both are meant for a single process. Two processes appending to the same
//! file are not coordinated.
//!
//! [`AppendOnlyStore`]: chronicle_core::store::AppendOnlyStore
//! [`PositionStore`]: chronicle_core::projection::PositionStore

mod error;
mod position;
mod store;

pub use error::Error;
pub use position::FilePositionStore;
pub use store::{FileStore, FileStoreConfig};
