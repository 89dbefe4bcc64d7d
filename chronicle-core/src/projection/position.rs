//! Persisted projection positions.
//!
//! A position is the global id of the last event a projection considered.
//! It only moves forward, except when a rebuild resets it to 0.

use std::{collections::HashMap, convert::Infallible, sync::Arc};

use parking_lot::Mutex;

/// Durable storage for projection positions, keyed by projection name.
pub trait PositionStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The stored position, or 0 if the projection never ran.
    fn load<'a>(
        &'a self,
        identifier: &'a str,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;

    fn update<'a>(
        &'a self,
        identifier: &'a str,
        position: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// Positions held in memory.
///
/// Cloning shares the underlying map, so a clone kept by a test observes the
/// updates of a running projection.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPositions {
    positions: Arc<Mutex<HashMap<String, u64>>>,
}

impl InMemoryPositions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position of `identifier`, without going through the trait.
    #[must_use]
    pub fn get(&self, identifier: &str) -> u64 {
        self.positions.lock().get(identifier).copied().unwrap_or(0)
    }
}

impl PositionStore for InMemoryPositions {
    type Error = Infallible;

    fn load<'a>(
        &'a self,
        identifier: &'a str,
    ) -> impl Future<Output = Result<u64, Infallible>> + Send + 'a {
        std::future::ready(Ok(self.get(identifier)))
    }

    fn update<'a>(
        &'a self,
        identifier: &'a str,
        position: u64,
    ) -> impl Future<Output = Result<(), Infallible>> + Send + 'a {
        self.positions.lock().insert(identifier.to_string(), position);
        std::future::ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_position_is_zero() {
        let positions = InMemoryPositions::new();
        assert_eq!(positions.load("totals").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn updates_are_shared_between_clones() {
        let positions = InMemoryPositions::new();
        let observer = positions.clone();
        positions.update("totals", 7).await.unwrap();
        assert_eq!(observer.get("totals"), 7);
        assert_eq!(observer.get("other"), 0);
    }
}
