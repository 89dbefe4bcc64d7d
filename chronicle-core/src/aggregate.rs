//! Command-side domain engine.
//!
//! An [`Aggregate`] is a definition, not an instance: a name, an initial
//! state, command handlers and reducers. Instances only exist as
//! [`AggregateState`] values, produced by [`Aggregate::initial_state`] and
//! [`Aggregate::rehydrate`] and never stored directly.
//!
//! Command handlers run against a [`CommandContext`]. Each call to
//! [`CommandContext::publish`] records an event and immediately folds it
//! through the reducer, so code that runs after a publish observes its
//! effect.
//!
//! ```
//! use chronicle_core::{
//!     aggregate::{Aggregate, CommandHandler},
//!     event::{AggregateId, DomainEvent},
//! };
//! use serde_json::json;
//!
//! let counter = Aggregate::builder("counter", 0_i64)
//!     .command(
//!         "increment",
//!         CommandHandler::from_fn(|ctx, _cmd| {
//!             ctx.publish("incremented", None)?;
//!             Ok(())
//!         }),
//!     )
//!     .reducer("incremented", |value, _event| value + 1)
//!     .build();
//!
//! let id = AggregateId::new("counter", "c1");
//! let events = [DomainEvent::bare("incremented"), DomainEvent::bare("incremented")];
//! let state = counter.rehydrate(&id, &events, None).unwrap();
//! assert_eq!(state.state, 2);
//! assert_eq!(state.version, 2);
//! ```

use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap},
    convert::Infallible,
    sync::Arc,
};

use futures_core::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::{
    event::{AggregateId, Command, DomainEvent},
    snapshot::Snapshot,
};

/// A business rule rejected the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DomainError(pub String);

impl DomainError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors raised while handling commands or folding events.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("aggregate `{aggregate}` has no handler for command `{command}`")]
    UnknownCommand { aggregate: String, command: String },
    #[error("aggregate `{aggregate}` has no reducer for event `{event}`")]
    UnknownEvent { aggregate: String, event: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("invalid payload for command `{command}`: {source}")]
    CommandValidation {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot codec failed: {0}")]
    Snapshot(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl AggregateError {
    /// Shorthand for a [`DomainError`].
    #[must_use]
    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain(DomainError::new(message))
    }
}

/// One aggregate instance as seen by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AggregateState<T> {
    pub id: AggregateId,
    /// `true` once at least one event has been folded (or a snapshot loaded).
    pub exists: bool,
    /// Number of events folded into `state`.
    pub version: u64,
    pub state: T,
}

type Reducer<T> = Arc<dyn Fn(&T, &DomainEvent) -> T + Send + Sync>;
type Reducers<T> = HashMap<String, Reducer<T>>;

fn fold<T>(
    aggregate: &str,
    reducers: &Reducers<T>,
    current: &AggregateState<T>,
    event: &DomainEvent,
) -> Result<AggregateState<T>, AggregateError> {
    let reduce = reducers
        .get(&event.name)
        .ok_or_else(|| AggregateError::UnknownEvent {
            aggregate: aggregate.to_string(),
            event: event.name.clone(),
        })?;
    Ok(AggregateState {
        id: current.id.clone(),
        exists: true,
        version: current.version + 1,
        state: reduce(&current.state, event),
    })
}

/// Working instance handed to command handlers.
///
/// Holds the state as of the last publish, plus the events published so far
/// for the current command.
pub struct CommandContext<T> {
    aggregate: String,
    current: AggregateState<T>,
    reducers: Arc<Reducers<T>>,
    published: Vec<DomainEvent>,
}

impl<T> CommandContext<T> {
    #[must_use]
    pub const fn current(&self) -> &AggregateState<T> {
        &self.current
    }

    #[must_use]
    pub const fn state(&self) -> &T {
        &self.current.state
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.current.version
    }

    #[must_use]
    pub const fn exists(&self) -> bool {
        self.current.exists
    }

    #[must_use]
    pub const fn id(&self) -> &AggregateId {
        &self.current.id
    }

    /// Events published so far, in call order.
    #[must_use]
    pub fn published(&self) -> &[DomainEvent] {
        &self.published
    }

    /// Record an event and fold it into the working state.
    ///
    /// Returns the updated working instance.
    ///
    /// # Errors
    ///
    /// [`AggregateError::UnknownEvent`] when no reducer handles `name`.
    pub fn publish(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Option<Value>>,
    ) -> Result<&AggregateState<T>, AggregateError> {
        self.publish_event(DomainEvent {
            name: name.into(),
            data: data.into(),
        })
    }

    /// [`publish`](Self::publish) for an already built event.
    pub fn publish_event(
        &mut self,
        event: DomainEvent,
    ) -> Result<&AggregateState<T>, AggregateError> {
        self.current = fold(&self.aggregate, &self.reducers, &self.current, &event)?;
        tracing::trace!(event = %event.name, version = self.current.version, "event published");
        self.published.push(event);
        Ok(&self.current)
    }
}

type SyncFn<T> =
    Arc<dyn Fn(&mut CommandContext<T>, &Command) -> Result<(), AggregateError> + Send + Sync>;
type AsyncFn<T> = Arc<
    dyn for<'a> Fn(&'a mut CommandContext<T>, &'a Command) -> BoxFuture<'a, Result<(), AggregateError>>
        + Send
        + Sync,
>;
type Step<T> =
    Box<dyn FnMut(&AggregateState<T>) -> Result<Option<DomainEvent>, AggregateError> + Send>;
type AsyncStep<T> = Box<
    dyn FnMut(AggregateState<T>) -> BoxFuture<'static, Result<Option<DomainEvent>, AggregateError>>
        + Send,
>;
type ValidateFn = Arc<dyn Fn(&Command) -> Result<(), AggregateError> + Send + Sync>;

enum HandlerKind<T> {
    Sync(SyncFn<T>),
    Async(AsyncFn<T>),
    Yielding(Arc<dyn Fn(&Command) -> Step<T> + Send + Sync>),
    AsyncYielding(Arc<dyn Fn(&Command) -> AsyncStep<T> + Send + Sync>),
    Validate(ValidateFn),
    Sequence(Vec<CommandHandler<T>>),
}

/// A command handler in one of the supported shapes.
///
/// Every shape runs against the same [`CommandContext`] contract, so they
/// can be freely mixed inside a [`sequence`](Self::sequence).
pub struct CommandHandler<T>(HandlerKind<T>);

impl<T> Clone for CommandHandler<T> {
    fn clone(&self) -> Self {
        Self(match &self.0 {
            HandlerKind::Sync(f) => HandlerKind::Sync(Arc::clone(f)),
            HandlerKind::Async(f) => HandlerKind::Async(Arc::clone(f)),
            HandlerKind::Yielding(f) => HandlerKind::Yielding(Arc::clone(f)),
            HandlerKind::AsyncYielding(f) => HandlerKind::AsyncYielding(Arc::clone(f)),
            HandlerKind::Validate(f) => HandlerKind::Validate(Arc::clone(f)),
            HandlerKind::Sequence(steps) => HandlerKind::Sequence(steps.clone()),
        })
    }
}

impl<T> CommandHandler<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A plain synchronous handler.
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(&mut CommandContext<T>, &Command) -> Result<(), AggregateError>
            + Send
            + Sync
            + 'static,
    {
        Self(HandlerKind::Sync(Arc::new(handler)))
    }

    /// A handler that may await between publishes.
    ///
    /// ```ignore
    /// async fn reserve(ctx: &mut CommandContext<Stock>, cmd: &Command) -> Result<(), AggregateError> {
    ///     let quantity = lookup(cmd).await;
    ///     ctx.publish("reserved", json!({ "quantity": quantity }))?;
    ///     Ok(())
    /// }
    ///
    /// CommandHandler::from_async(|ctx, cmd| Box::pin(reserve(ctx, cmd)))
    /// ```
    pub fn from_async<F>(handler: F) -> Self
    where
        F: for<'a> Fn(
                &'a mut CommandContext<T>,
                &'a Command,
            ) -> BoxFuture<'a, Result<(), AggregateError>>
            + Send
            + Sync
            + 'static,
    {
        Self(HandlerKind::Async(Arc::new(handler)))
    }

    /// A multi-step handler.
    ///
    /// For each command `factory` returns a step closure. The engine calls it
    /// with the current working instance; every `Some(event)` is published
    /// before the next call, and `None` ends the command.
    pub fn yielding<F, S>(factory: F) -> Self
    where
        F: Fn(&Command) -> S + Send + Sync + 'static,
        S: FnMut(&AggregateState<T>) -> Result<Option<DomainEvent>, AggregateError>
            + Send
            + 'static,
    {
        Self(HandlerKind::Yielding(Arc::new(move |command: &Command| {
            Box::new(factory(command)) as Step<T>
        })))
    }

    /// The suspending variant of [`yielding`](Self::yielding): each step
    /// receives an owned copy of the working instance and returns a future.
    pub fn yielding_async<F, S>(factory: F) -> Self
    where
        F: Fn(&Command) -> S + Send + Sync + 'static,
        S: FnMut(
                AggregateState<T>,
            ) -> BoxFuture<'static, Result<Option<DomainEvent>, AggregateError>>
            + Send
            + 'static,
    {
        Self(HandlerKind::AsyncYielding(Arc::new(move |command: &Command| {
            Box::new(factory(command)) as AsyncStep<T>
        })))
    }

    /// Run `steps` in order on a shared working instance, stopping at the
    /// first failure.
    #[must_use]
    pub const fn sequence(steps: Vec<Self>) -> Self {
        Self(HandlerKind::Sequence(steps))
    }

    /// A step that checks that the command payload deserializes into `V`.
    #[must_use]
    pub fn validate<V>() -> Self
    where
        V: DeserializeOwned + 'static,
    {
        Self(HandlerKind::Validate(Arc::new(|command: &Command| {
            serde_json::from_value::<V>(command.data.clone())
                .map(drop)
                .map_err(|source| AggregateError::CommandValidation {
                    command: command.name.clone(),
                    source,
                })
        })))
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut CommandContext<T>,
        command: &'a Command,
    ) -> BoxFuture<'a, Result<(), AggregateError>> {
        Box::pin(async move {
            match &self.0 {
                HandlerKind::Sync(handler) => handler(ctx, command),
                HandlerKind::Async(handler) => handler(ctx, command).await,
                HandlerKind::Yielding(factory) => {
                    let mut step = factory(command);
                    while let Some(event) = step(ctx.current())? {
                        ctx.publish_event(event)?;
                    }
                    Ok(())
                }
                HandlerKind::AsyncYielding(factory) => {
                    let mut step = factory(command);
                    while let Some(event) = step(ctx.current().clone()).await? {
                        ctx.publish_event(event)?;
                    }
                    Ok(())
                }
                HandlerKind::Validate(check) => check(command),
                HandlerKind::Sequence(steps) => {
                    for step in steps {
                        step.run(ctx, command).await?;
                    }
                    Ok(())
                }
            }
        })
    }
}

/// Converts aggregate state to and from its snapshot representation.
pub trait SnapshotCodec<T>: Send + Sync {
    type Serialized: Clone + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    fn serialize(&self, state: &T) -> Result<Self::Serialized, Self::Error>;
    fn deserialize(&self, snapshot: &Self::Serialized) -> Result<T, Self::Error>;
}

/// Identity codec: the snapshot is a copy of the state.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCodec;

impl<T> SnapshotCodec<T> for NoCodec
where
    T: Clone + Send + Sync,
{
    type Error = Infallible;
    type Serialized = T;

    fn serialize(&self, state: &T) -> Result<T, Infallible> {
        Ok(state.clone())
    }

    fn deserialize(&self, snapshot: &T) -> Result<T, Infallible> {
        Ok(snapshot.clone())
    }
}

/// Stores the state as a JSON value.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T> SnapshotCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    type Error = serde_json::Error;
    type Serialized = Value;

    fn serialize(&self, state: &T) -> Result<Value, serde_json::Error> {
        serde_json::to_value(state)
    }

    fn deserialize(&self, snapshot: &Value) -> Result<T, serde_json::Error> {
        serde_json::from_value(snapshot.clone())
    }
}

/// Aggregate definition: handlers, reducers and snapshot codec.
#[derive(Clone)]
pub struct Aggregate<T, C = NoCodec> {
    name: String,
    initial: T,
    commands: BTreeMap<String, CommandHandler<T>>,
    reducers: Arc<Reducers<T>>,
    codec: C,
}

/// Builder returned by [`Aggregate::builder`].
pub struct AggregateBuilder<T, C = NoCodec> {
    name: String,
    initial: T,
    commands: BTreeMap<String, CommandHandler<T>>,
    reducers: Reducers<T>,
    codec: C,
}

impl<T, C> AggregateBuilder<T, C> {
    #[must_use]
    pub fn command(mut self, name: impl Into<String>, handler: CommandHandler<T>) -> Self {
        self.commands.insert(name.into(), handler);
        self
    }

    #[must_use]
    pub fn reducer<F>(mut self, event: impl Into<String>, reduce: F) -> Self
    where
        F: Fn(&T, &DomainEvent) -> T + Send + Sync + 'static,
    {
        self.reducers.insert(event.into(), Arc::new(reduce));
        self
    }

    /// Use `codec` for [`Aggregate::take_snapshot`] and snapshot restores.
    #[must_use]
    pub fn snapshots<C2>(self, codec: C2) -> AggregateBuilder<T, C2> {
        AggregateBuilder {
            name: self.name,
            initial: self.initial,
            commands: self.commands,
            reducers: self.reducers,
            codec,
        }
    }

    #[must_use]
    pub fn build(self) -> Aggregate<T, C> {
        Aggregate {
            name: self.name,
            initial: self.initial,
            commands: self.commands,
            reducers: Arc::new(self.reducers),
            codec: self.codec,
        }
    }
}

impl<T> Aggregate<T, NoCodec> {
    pub fn builder(name: impl Into<String>, initial: T) -> AggregateBuilder<T, NoCodec> {
        AggregateBuilder {
            name: name.into(),
            initial,
            commands: BTreeMap::new(),
            reducers: HashMap::new(),
            codec: NoCodec,
        }
    }
}

impl<T, C> Aggregate<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: SnapshotCodec<T>,
{
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared command names, sorted.
    #[must_use]
    pub fn commands(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// The blank instance: `exists == false`, `version == 0`.
    #[must_use]
    pub fn initial_state(&self, id: &AggregateId) -> AggregateState<T> {
        AggregateState {
            id: id.clone(),
            exists: false,
            version: 0,
            state: self.initial.clone(),
        }
    }

    /// Fold one event.
    ///
    /// # Errors
    ///
    /// [`AggregateError::UnknownEvent`] when no reducer handles the event.
    pub fn apply_event(
        &self,
        state: &AggregateState<T>,
        event: &DomainEvent,
    ) -> Result<AggregateState<T>, AggregateError> {
        fold(&self.name, &self.reducers, state, event)
    }

    /// Rebuild an instance from `snapshot` (or the blank state) plus
    /// `events`, folded in order.
    pub fn rehydrate<E>(
        &self,
        id: &AggregateId,
        events: &[E],
        snapshot: Option<&Snapshot<C::Serialized>>,
    ) -> Result<AggregateState<T>, AggregateError>
    where
        E: Borrow<DomainEvent>,
    {
        let start = match snapshot {
            Some(snapshot) => AggregateState {
                id: id.clone(),
                exists: snapshot.version > 0,
                version: snapshot.version,
                state: self
                    .codec
                    .deserialize(&snapshot.snapshot)
                    .map_err(|e| AggregateError::Snapshot(Box::new(e)))?,
            },
            None => self.initial_state(id),
        };
        events
            .iter()
            .try_fold(start, |state, event| self.apply_event(&state, event.borrow()))
    }

    pub fn take_snapshot(
        &self,
        state: &AggregateState<T>,
    ) -> Result<Snapshot<C::Serialized>, AggregateError> {
        let snapshot = self
            .codec
            .serialize(&state.state)
            .map_err(|e| AggregateError::Snapshot(Box::new(e)))?;
        Ok(Snapshot {
            aggregate: state.id.clone(),
            version: state.version,
            snapshot,
        })
    }

    /// Run the handler registered for `command.name` and return the events it
    /// published, in order.
    ///
    /// A failing handler yields no events, including events published by
    /// earlier steps of a sequence.
    ///
    /// # Errors
    ///
    /// [`AggregateError::UnknownCommand`] when no handler is registered, or
    /// whatever the handler returned.
    pub async fn apply_command(
        &self,
        instance: &AggregateState<T>,
        command: &Command,
    ) -> Result<Vec<DomainEvent>, AggregateError> {
        let handler =
            self.commands
                .get(&command.name)
                .ok_or_else(|| AggregateError::UnknownCommand {
                    aggregate: self.name.clone(),
                    command: command.name.clone(),
                })?;

        let mut ctx = CommandContext {
            aggregate: self.name.clone(),
            current: instance.clone(),
            reducers: Arc::clone(&self.reducers),
            published: Vec::new(),
        };
        handler.run(&mut ctx, command).await?;

        tracing::debug!(
            aggregate = %instance.id,
            command = %command.name,
            event_count = ctx.published.len(),
            "command applied"
        );
        Ok(ctx.published)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    #[derive(Deserialize)]
    struct IncrementBy {
        #[allow(dead_code)]
        by: i64,
    }

    fn by(event: &DomainEvent) -> i64 {
        event.field("by").as_i64().unwrap_or(0)
    }

    fn counter() -> Aggregate<Counter> {
        Aggregate::builder("counter", Counter::default())
            .command(
                "increment",
                CommandHandler::from_fn(|ctx, _cmd| {
                    ctx.publish("incremented", None)?;
                    Ok(())
                }),
            )
            .command(
                "incrementByEven",
                CommandHandler::from_fn(|ctx, cmd| {
                    let by = cmd.data["by"].as_i64().unwrap_or(0);
                    if by % 2 != 0 {
                        return Err(AggregateError::domain("Must be even"));
                    }
                    ctx.publish("incrementedBy", json!({ "by": by }))?;
                    Ok(())
                }),
            )
            .command(
                "double",
                CommandHandler::yielding(|cmd| {
                    let times = cmd.data["times"].as_u64().unwrap_or(1);
                    let mut done = 0;
                    move |current: &AggregateState<Counter>| -> Result<Option<DomainEvent>, AggregateError> {
                        if done == times {
                            return Ok(None);
                        }
                        done += 1;
                        Ok(Some(DomainEvent::new(
                            "incrementedBy",
                            json!({ "by": current.state.value }),
                        )))
                    }
                }),
            )
            .command(
                "incrementBy",
                CommandHandler::sequence(vec![
                    CommandHandler::validate::<IncrementBy>(),
                    CommandHandler::from_fn(|ctx, cmd| {
                        ctx.publish("incrementedBy", json!({ "by": cmd.data["by"] }))?;
                        Ok(())
                    }),
                ]),
            )
            .command(
                "incrementTwiceThenFail",
                CommandHandler::sequence(vec![
                    CommandHandler::from_fn(|ctx, _cmd| {
                        ctx.publish("incremented", None)?;
                        ctx.publish("incremented", None)?;
                        Ok(())
                    }),
                    CommandHandler::from_fn(|_ctx, _cmd| Err(AggregateError::domain("boom"))),
                    CommandHandler::from_fn(|ctx, _cmd| {
                        ctx.publish("incremented", None)?;
                        Ok(())
                    }),
                ]),
            )
            .command(
                "publishUnknown",
                CommandHandler::from_fn(|ctx, _cmd| {
                    ctx.publish("exploded", None)?;
                    Ok(())
                }),
            )
            .reducer("incremented", |state: &Counter, _| Counter {
                value: state.value + 1,
            })
            .reducer("incrementedBy", |state: &Counter, event| Counter {
                value: state.value + by(event),
            })
            .build()
    }

    fn id() -> AggregateId {
        AggregateId::new("counter", "c1")
    }

    fn at(value: i64, version: u64) -> AggregateState<Counter> {
        AggregateState {
            id: id(),
            exists: version > 0,
            version,
            state: Counter { value },
        }
    }

    #[test]
    fn commands_are_listed_sorted() {
        assert_eq!(
            counter().commands(),
            vec![
                "double",
                "increment",
                "incrementBy",
                "incrementByEven",
                "incrementTwiceThenFail",
                "publishUnknown",
            ]
        );
    }

    #[test]
    fn initial_state_is_blank() {
        let state = counter().initial_state(&id());
        assert!(!state.exists);
        assert_eq!(state.version, 0);
        assert_eq!(state.state, Counter::default());
    }

    #[test]
    fn rehydrate_folds_events_in_order() {
        let events = [
            DomainEvent::new("incrementedBy", json!({"by": 9})),
            DomainEvent::new("incrementedBy", json!({"by": 2})),
            DomainEvent::new("incrementedBy", json!({"by": 5})),
        ];
        let state = counter().rehydrate(&id(), &events, None).unwrap();
        assert_eq!(state.state.value, 16);
        assert_eq!(state.version, 3);
        assert!(state.exists);
    }

    #[test]
    fn rehydrate_starts_from_snapshot() {
        let snapshot = Snapshot {
            aggregate: id(),
            version: 100,
            snapshot: Counter { value: 159 },
        };
        let events = [
            DomainEvent::new("incrementedBy", json!({"by": 9})),
            DomainEvent::new("incrementedBy", json!({"by": 2})),
            DomainEvent::new("incrementedBy", json!({"by": 5})),
        ];
        let state = counter()
            .rehydrate(&id(), &events, Some(&snapshot))
            .unwrap();
        assert_eq!(state.state.value, 175);
        assert_eq!(state.version, 103);
    }

    #[test]
    fn apply_event_returns_a_new_state() {
        let before = at(1, 1);
        let after = counter()
            .apply_event(&before, &DomainEvent::bare("incremented"))
            .unwrap();
        assert_eq!(before.state.value, 1);
        assert_eq!(after.state.value, 2);
        assert_eq!(after.version, 2);
    }

    #[test]
    fn unknown_event_is_rejected() {
        let err = counter()
            .apply_event(&at(0, 0), &DomainEvent::bare("exploded"))
            .unwrap_err();
        assert!(matches!(
            err,
            AggregateError::UnknownEvent { ref event, .. } if event == "exploded"
        ));
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let err = counter()
            .apply_command(&at(0, 0), &Command::new("explode", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AggregateError::UnknownCommand { ref command, .. } if command == "explode"
        ));
    }

    #[tokio::test]
    async fn domain_errors_propagate() {
        let err = counter()
            .apply_command(&at(0, 0), &Command::new("incrementByEven", json!({"by": 3})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Must be even");
    }

    #[tokio::test]
    async fn yielding_handler_observes_each_publish() {
        let events = counter()
            .apply_command(&at(1, 1), &Command::new("double", json!({"times": 2})))
            .await
            .unwrap();
        assert_eq!(
            events,
            vec![
                DomainEvent::new("incrementedBy", json!({"by": 1})),
                DomainEvent::new("incrementedBy", json!({"by": 2})),
            ]
        );
    }

    #[tokio::test]
    async fn validation_step_rejects_bad_payload() {
        let err = counter()
            .apply_command(&at(0, 0), &Command::new("incrementBy", json!({"by": "two"})))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::CommandValidation { .. }));

        let events = counter()
            .apply_command(&at(0, 0), &Command::new("incrementBy", json!({"by": 2})))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn failing_sequence_step_discards_all_events() {
        let err = counter()
            .apply_command(&at(0, 0), &Command::new("incrementTwiceThenFail", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn a_failing_step_stops_the_steps_after_it() {
        let later_runs = Arc::new(AtomicUsize::new(0));
        let later_step = || {
            let later_runs = Arc::clone(&later_runs);
            CommandHandler::<Counter>::from_fn(move |ctx, _cmd| {
                later_runs.fetch_add(1, Ordering::SeqCst);
                ctx.publish("incremented", None)?;
                Ok(())
            })
        };
        let aggregate = Aggregate::builder("counter", Counter::default())
            .command(
                "incrementBy",
                CommandHandler::sequence(vec![
                    CommandHandler::validate::<IncrementBy>(),
                    later_step(),
                ]),
            )
            .command(
                "failThenIncrement",
                CommandHandler::sequence(vec![
                    CommandHandler::from_fn(|_ctx, _cmd| Err(AggregateError::domain("rejected"))),
                    later_step(),
                ]),
            )
            .reducer("incremented", |state: &Counter, _| Counter {
                value: state.value + 1,
            })
            .build();

        let err = aggregate
            .apply_command(&at(0, 0), &Command::new("incrementBy", json!({"by": "two"})))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::CommandValidation { .. }));
        assert_eq!(later_runs.load(Ordering::SeqCst), 0);

        let err = aggregate
            .apply_command(&at(0, 0), &Command::new("failThenIncrement", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::Domain(_)));
        assert_eq!(later_runs.load(Ordering::SeqCst), 0);

        aggregate
            .apply_command(&at(0, 0), &Command::new("incrementBy", json!({"by": 2})))
            .await
            .unwrap();
        assert_eq!(later_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_at_version_zero_is_not_an_existing_instance() {
        let aggregate = Aggregate::builder("counter", Counter::default())
            .reducer("incremented", |state: &Counter, _| Counter {
                value: state.value + 1,
            })
            .snapshots(JsonCodec)
            .build();
        let blank = aggregate.take_snapshot(&aggregate.initial_state(&id())).unwrap();
        assert_eq!(blank.version, 0);

        let restored = aggregate.rehydrate::<DomainEvent>(&id(), &[], Some(&blank)).unwrap();
        assert!(!restored.exists);
        assert_eq!(restored.version, 0);

        let resumed = aggregate
            .rehydrate(&id(), &[DomainEvent::bare("incremented")], Some(&blank))
            .unwrap();
        assert!(resumed.exists);
        assert_eq!(resumed.version, 1);
    }

    #[tokio::test]
    async fn publishing_an_unknown_event_fails_the_command() {
        let err = counter()
            .apply_command(&at(0, 0), &Command::new("publishUnknown", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::UnknownEvent { .. }));
    }

    #[test]
    fn json_codec_round_trips_state() {
        let aggregate = Aggregate::builder("counter", Counter::default())
            .reducer("incremented", |state: &Counter, _| Counter {
                value: state.value + 1,
            })
            .snapshots(JsonCodec)
            .build();
        let snapshot = aggregate.take_snapshot(&at(59, 25)).unwrap();
        assert_eq!(snapshot.snapshot, json!({"value": 59}));
        assert_eq!(snapshot.version, 25);

        let restored = aggregate
            .rehydrate(&id(), &[DomainEvent::bare("incremented")], Some(&snapshot))
            .unwrap();
        assert_eq!(restored.state.value, 60);
        assert_eq!(restored.version, 26);
    }
}
