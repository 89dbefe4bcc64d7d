//! Read-side projections.
//!
//! A [`Projection`] feeds persisted events into a [`ReadModel`] through
//! handlers keyed by event type (`"aggregate.event"`, lower-cased). Starting
//! a projection runs three phases:
//!
//! 1. subscribe to the live bus, before anything is read;
//! 2. catch up from the stored position by reading the log;
//! 3. drain what the subscription buffered meanwhile, then tail it live.
//!
//! Every event is applied at most once: anything at or below the position is
//! skipped. If the live subscription lags, or an event arrives that is not
//! the direct successor of the position, the projection goes back to the log
//! and catches up before continuing.
//!
//! ```ignore
//! let projection = Projection::builder("totals", Totals::default())
//!     .on("counter.incremented", |totals, event| {
//!         *totals.by_counter.entry(event.aggregate.id.clone()).or_default() += 1;
//!         Ok(())
//!     })
//!     .build(events.clone(), InMemoryPositions::new());
//!
//! let handle = projection.start().await?;
//! handle.wait_for(last_id).await?;
//! let projection = handle.stop().await?;
//! ```

use std::{collections::HashMap, sync::Arc};

use futures_core::future::BoxFuture;
use thiserror::Error;
use tokio::{
    sync::{
        RwLock, oneshot,
        broadcast::error::{RecvError, TryRecvError},
        watch,
    },
    task::JoinHandle,
};

use crate::{
    bus::EventReceiver,
    event::AggregateEvent,
    event_store::EventStore,
    store::AppendOnlyStore,
};

mod position;

pub use position::{InMemoryPositions, PositionStore};

/// Error type produced by projection handlers and read models.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while running a projection.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("projection `{projection}` failed to start: {source}")]
    Start {
        projection: String,
        #[source]
        source: Box<ProjectionError>,
    },
    #[error("failed to apply event {event_id} ({event_type}): {source}")]
    Apply {
        event_type: String,
        event_id: u64,
        #[source]
        source: BoxError,
    },
    #[error("projection `{projection}` failed to rebuild: {source}")]
    Rebuild {
        projection: String,
        #[source]
        source: Box<ProjectionError>,
    },
    #[error("position store error: {0}")]
    Position(#[source] BoxError),
    #[error("failed to load events: {0}")]
    Store(#[source] BoxError),
    #[error("failed to reset read model: {0}")]
    Reset(#[source] BoxError),
    #[error("projection `{0}` is not running")]
    NotRunning(String),
    #[error("projection task panicked")]
    TaskPanicked,
}

impl ProjectionError {
    fn position(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Position(Box::new(err))
    }

    fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store(Box::new(err))
    }
}

/// The sink a projection writes into.
pub trait ReadModel: Send + Sync + 'static {
    /// Drop everything built so far. Called by [`Projection::rebuild`].
    fn reset(&mut self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Lifecycle of a projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionState {
    NotStarted,
    Rebuilding,
    CatchingUp,
    Live,
    Stopped,
}

#[derive(Clone, Copy, Debug)]
struct Progress {
    position: u64,
    state: ProjectionState,
}

type SyncHandler<M> = Arc<dyn Fn(&mut M, &AggregateEvent) -> Result<(), BoxError> + Send + Sync>;
type AsyncHandler<M> = Arc<
    dyn for<'a> Fn(&'a mut M, &'a AggregateEvent) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync,
>;

enum Handler<M> {
    Sync(SyncHandler<M>),
    Async(AsyncHandler<M>),
}

/// Builder returned by [`Projection::builder`].
pub struct ProjectionBuilder<M> {
    name: String,
    model: M,
    handlers: HashMap<String, Handler<M>>,
}

impl<M> ProjectionBuilder<M>
where
    M: ReadModel,
{
    /// Handle events of `event_type` (`"aggregate.event"`, any case).
    #[must_use]
    pub fn on<F>(mut self, event_type: &str, handler: F) -> Self
    where
        F: Fn(&mut M, &AggregateEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.handlers
            .insert(event_type.to_lowercase(), Handler::Sync(Arc::new(handler)));
        self
    }

    /// Like [`on`](Self::on), for handlers that await.
    #[must_use]
    pub fn on_async<F>(mut self, event_type: &str, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut M, &'a AggregateEvent) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .insert(event_type.to_lowercase(), Handler::Async(Arc::new(handler)));
        self
    }

    pub fn build<S, P>(self, events: EventStore<S>, positions: P) -> Projection<M, S, P>
    where
        S: AppendOnlyStore,
        P: PositionStore,
    {
        let (progress, _) = watch::channel(Progress {
            position: 0,
            state: ProjectionState::NotStarted,
        });
        Projection {
            name: self.name,
            model: Arc::new(RwLock::new(self.model)),
            handlers: self.handlers,
            events,
            positions,
            position: 0,
            progress,
        }
    }
}

/// A read model kept up to date from the event log.
pub struct Projection<M, S, P> {
    name: String,
    model: Arc<RwLock<M>>,
    handlers: HashMap<String, Handler<M>>,
    events: EventStore<S>,
    positions: P,
    position: u64,
    progress: watch::Sender<Progress>,
}

impl<M> Projection<M, (), ()>
where
    M: ReadModel,
{
    /// Start describing a projection named `name` (also its position key).
    pub fn builder(name: impl Into<String>, model: M) -> ProjectionBuilder<M> {
        ProjectionBuilder {
            name: name.into(),
            model,
            handlers: HashMap::new(),
        }
    }
}

impl<M, S, P> Projection<M, S, P>
where
    M: ReadModel,
    S: AppendOnlyStore + 'static,
    P: PositionStore,
{
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle on the read model, for queries.
    #[must_use]
    pub const fn model(&self) -> &Arc<RwLock<M>> {
        &self.model
    }

    /// Last event id applied in this process.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn state(&self) -> ProjectionState {
        self.progress.borrow().state
    }

    fn set_state(&self, state: ProjectionState) {
        self.progress.send_modify(|progress| progress.state = state);
    }

    /// Catch up from the stored position, then follow the live bus in a
    /// background task.
    #[tracing::instrument(skip(self), fields(projection = %self.name))]
    pub async fn start(mut self) -> Result<ProjectionHandle<M, S, P>, ProjectionError> {
        let receiver = match self.prepare().await {
            Ok(receiver) => receiver,
            Err(source) => {
                return Err(ProjectionError::Start {
                    projection: self.name.clone(),
                    source: Box::new(source),
                });
            }
        };

        self.set_state(ProjectionState::Live);
        tracing::debug!(position = self.position, "projection live");

        let (stop_tx, stop_rx) = oneshot::channel();
        let name = self.name.clone();
        let model = Arc::clone(&self.model);
        let progress = self.progress.subscribe();
        let task = tokio::spawn(self.run_live(receiver, stop_rx));

        Ok(ProjectionHandle {
            name,
            model,
            progress,
            stop_tx: Some(stop_tx),
            task,
        })
    }

    /// Reset the read model and the position, then [`start`](Self::start).
    #[tracing::instrument(skip(self), fields(projection = %self.name))]
    pub async fn rebuild(mut self) -> Result<ProjectionHandle<M, S, P>, ProjectionError> {
        let name = self.name.clone();
        let wrap = |source| ProjectionError::Rebuild {
            projection: name.clone(),
            source: Box::new(source),
        };

        self.set_state(ProjectionState::Rebuilding);
        self.reset().await.map_err(wrap)?;
        tracing::debug!("read model reset, rebuilding from the start of the log");
        self.start().await.map_err(wrap)
    }

    async fn reset(&mut self) -> Result<(), ProjectionError> {
        self.model
            .write()
            .await
            .reset()
            .await
            .map_err(ProjectionError::Reset)?;
        self.positions
            .update(&self.name, 0)
            .await
            .map_err(ProjectionError::position)?;
        self.position = 0;
        self.progress.send_modify(|progress| progress.position = 0);
        Ok(())
    }

    async fn prepare(&mut self) -> Result<EventReceiver, ProjectionError> {
        let mut receiver = self.events.subscribe();

        self.position = self
            .positions
            .load(&self.name)
            .await
            .map_err(ProjectionError::position)?;
        self.progress
            .send_modify(|progress| progress.position = self.position);

        self.catch_up().await?;
        self.drain(&mut receiver).await?;
        Ok(receiver)
    }

    async fn catch_up(&mut self) -> Result<(), ProjectionError> {
        self.set_state(ProjectionState::CatchingUp);
        let events = self
            .events
            .load_all_events(self.position)
            .await
            .map_err(ProjectionError::store)?;
        tracing::debug!(
            from = self.position,
            event_count = events.len(),
            "catching up"
        );
        for event in &events {
            self.apply(event).await?;
        }
        Ok(())
    }

    /// Apply whatever the subscription buffered during catch-up.
    async fn drain(&mut self, receiver: &mut EventReceiver) -> Result<(), ProjectionError> {
        loop {
            match receiver.try_recv() {
                Ok(event) => self.handle_live(&event).await?,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscription lagged during catch-up");
                    self.catch_up().await?;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn handle_live(&mut self, event: &AggregateEvent) -> Result<(), ProjectionError> {
        if event.id <= self.position {
            tracing::trace!(event_id = event.id, "skipping already applied event");
            return Ok(());
        }
        if event.id > self.position + 1 {
            tracing::debug!(
                event_id = event.id,
                position = self.position,
                "gap in live events, catching up"
            );
            self.catch_up().await?;
            self.set_state(ProjectionState::Live);
            return Ok(());
        }
        self.apply(event).await
    }

    async fn run_live(
        mut self,
        mut receiver: EventReceiver,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> Result<Self, ProjectionError> {
        let result = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    tracing::debug!(projection = %self.name, "projection stopped");
                    break Ok(());
                }
                received = receiver.recv() => {
                    let step = match received {
                        Ok(event) => self.handle_live(&event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                projection = %self.name,
                                skipped,
                                "live subscription lagged, catching up"
                            );
                            self.catch_up()
                                .await
                                .map(|()| self.set_state(ProjectionState::Live))
                        }
                        Err(RecvError::Closed) => {
                            tracing::debug!(projection = %self.name, "event bus closed");
                            break Ok(());
                        }
                    };
                    if let Err(e) = step {
                        break Err(e);
                    }
                }
            }
        };

        self.set_state(ProjectionState::Stopped);
        if let Err(ref e) = result {
            tracing::error!(projection = %self.name, error = %e, "projection stopped on error");
        }
        result.map(|()| self)
    }

    /// Run the handler for `event`, then persist `position = event.id`.
    ///
    /// Events at or below the current position are ignored. A failing
    /// handler leaves the position where it was.
    pub async fn apply(&mut self, event: &AggregateEvent) -> Result<(), ProjectionError> {
        if event.id <= self.position {
            return Ok(());
        }

        let event_type = event.event_type();
        if let Some(handler) = self.handlers.get(&event_type) {
            let mut model = self.model.write().await;
            let result = match handler {
                Handler::Sync(handle) => handle(&mut *model, event),
                Handler::Async(handle) => handle(&mut *model, event).await,
            };
            drop(model);
            result.map_err(|source| ProjectionError::Apply {
                event_type,
                event_id: event.id,
                source,
            })?;
        } else {
            tracing::trace!(event_type, "no handler registered");
        }

        self.positions
            .update(&self.name, event.id)
            .await
            .map_err(ProjectionError::position)?;
        self.position = event.id;
        self.progress
            .send_modify(|progress| progress.position = event.id);
        Ok(())
    }
}

/// Handle to a running projection.
///
/// Dropping the handle does **not** stop the projection. Call
/// [`stop`](Self::stop) for a graceful shutdown.
pub struct ProjectionHandle<M, S, P> {
    name: String,
    model: Arc<RwLock<M>>,
    progress: watch::Receiver<Progress>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<Projection<M, S, P>, ProjectionError>>,
}

impl<M, S, P> ProjectionHandle<M, S, P> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn model(&self) -> &Arc<RwLock<M>> {
        &self.model
    }

    /// Last event id applied.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.progress.borrow().position
    }

    #[must_use]
    pub fn state(&self) -> ProjectionState {
        self.progress.borrow().state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait until the projection has applied (or skipped) event `id`.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::NotRunning`] if the projection stops first.
    pub async fn wait_for(&self, id: u64) -> Result<(), ProjectionError> {
        let mut progress = self.progress.clone();
        let reached = progress
            .wait_for(|p| p.position >= id || p.state == ProjectionState::Stopped)
            .await
            .map(|p| p.position >= id)
            .unwrap_or(false);
        if reached {
            Ok(())
        } else {
            Err(ProjectionError::NotRunning(self.name.clone()))
        }
    }

    /// Stop the live loop and hand the projection back, so it can be
    /// restarted or rebuilt.
    ///
    /// # Errors
    ///
    /// The error that ended the live loop, if any.
    pub async fn stop(mut self) -> Result<Projection<M, S, P>, ProjectionError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|_| ProjectionError::TaskPanicked)?
    }
}
