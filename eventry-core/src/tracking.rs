//! Tracked commits: a transactional outbox for event handlers.
//!
//! [`TrackedStore`] decorates an [`AggregateStore`] so that every committed
//! business event atomically gains its own [`EventState`] aggregate (the
//! delivery ledger) and an `unhandled` handler-state row per registered
//! handler subscribed to the event's kind. Either the whole bundle lands or
//! none of it does, so handlers can poll
//! [`unhandled_events`](TrackedStore::unhandled_events) without ever seeing
//! an event the ledger does not know about.
//!
//! Handler transitions (`start`, `finish`, `fail`, `reset`) go through the
//! same engine: load the `EventState`, set the transition fact (its `apply`
//! enforces the precondition battery), then persist the fact and the state
//! row in one transaction. Concurrent transitions conflict on the ledger's
//! revisions and re-check from scratch, so races settle exactly like the
//! sequential case.

use chrono::Utc;
use nonempty::NonEmpty;
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
    aggregate::Aggregate,
    error::{Error, ErrorKind},
    event::{Event, EventPayload},
    handling::{EventState, HandlerState, HandlingEvent, HandlingFailure, HandlingPolicies},
    storage::{EventStream, StorageTx, StreamQuery, TrackingStorage, TrackingTx},
    store::AggregateStore,
    stream::{AggregateFeed, FeedOptions},
};

/// An [`AggregateStore`] that tracks per-handler delivery state.
#[derive(Debug, Clone)]
pub struct TrackedStore<S: TrackingStorage> {
    store: AggregateStore<S>,
    handlers: Vec<Handler>,
    policies: HandlingPolicies,
}

#[derive(Debug, Clone)]
struct Handler {
    name: String,
    event_kinds: Vec<String>,
}

impl<S: TrackingStorage> TrackedStore<S> {
    #[must_use]
    pub fn new(store: AggregateStore<S>) -> Self {
        Self {
            store,
            handlers: Vec::new(),
            policies: HandlingPolicies::default(),
        }
    }

    /// Register a handler and the event kinds it subscribes to.
    #[must_use]
    pub fn with_handler(mut self, name: impl Into<String>, event_kinds: &[&str]) -> Self {
        self.handlers.push(Handler {
            name: name.into(),
            event_kinds: event_kinds.iter().map(|&kind| kind.to_owned()).collect(),
        });
        self
    }

    #[must_use]
    pub fn with_policies(mut self, policies: HandlingPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// The undecorated store.
    #[must_use]
    pub fn store(&self) -> &AggregateStore<S> {
        &self.store
    }

    /// Persist the handler registry so queries can filter by subscription.
    pub async fn register_handlers(&self) -> Result<(), Error> {
        for handler in &self.handlers {
            self.store
                .storage()
                .register_handler(&handler.name, &handler.event_kinds)
                .await?;
        }
        Ok(())
    }

    fn handlers_for(&self, event_kind: &str) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|handler| handler.event_kinds.iter().any(|kind| kind == event_kind))
            .map(|handler| handler.name.clone())
            .collect()
    }

    /// Commit the aggregate's uncommitted events together with their
    /// delivery ledgers.
    ///
    /// Revision conflicts reconcile and retry exactly like
    /// [`AggregateStore::commit`]; the ledger writes from a failed attempt
    /// roll back with it.
    #[tracing::instrument(
        skip(self, aggregate),
        fields(
            aggregate_kind = A::KIND,
            aggregate_id = %aggregate.base().id(),
            events_len = aggregate.base().uncommitted().len()
        )
    )]
    pub async fn commit<A>(&self, aggregate: &mut A) -> Result<(), Error>
    where
        A: Aggregate + DeserializeOwned,
    {
        let mut attempts = 0u32;
        loop {
            let Some(batch) = NonEmpty::from_vec(aggregate.base().uncommitted().to_vec()) else {
                return Ok(());
            };
            match self.commit_tracked(&batch).await {
                Ok(()) => {
                    aggregate.base_mut().mark_committed();
                    return Ok(());
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    attempts += 1;
                    if let Some(limit) = self.store.commit_retry_limit() {
                        if attempts > limit {
                            return Err(Error::resource_exhausted(format!(
                                "commit contention on {}/{} after {attempts} attempts",
                                A::KIND,
                                aggregate.base().id()
                            )));
                        }
                    }
                    tracing::debug!(attempt = attempts, "tracked commit conflict, reconciling");
                    self.store.reconcile(aggregate).await?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One transaction: business batch, one ledger per event, one
    /// `unhandled` state row per subscribed handler.
    async fn commit_tracked(&self, batch: &NonEmpty<Event>) -> Result<(), Error> {
        let mut tx = self.store.storage().begin().await?;
        tx.save_events(batch).await?;
        for event in batch {
            let mut ledger = EventState::with_policies(self.policies.clone());
            self.store.attach(&mut ledger, event.id);
            ledger.set_event(HandlingEvent::Unhandled {
                event_kind: event.kind.clone(),
                at: event.timestamp,
            })?;
            if let Some(facts) = NonEmpty::from_vec(ledger.base_mut().take_uncommitted()) {
                tx.save_events(&facts).await?;
            }
            let handlers = self.handlers_for(&event.kind);
            if !handlers.is_empty() {
                tx.put_handler_states(event.id, &handlers, HandlerState::Unhandled, event.timestamp)
                    .await?;
            }
        }
        tx.commit().await
    }

    /// Claim an event for `handler`.
    ///
    /// Fails with [`Error::FailedPrecondition`] while another worker holds
    /// it or the retry backoff has not elapsed, [`Error::AlreadyExists`]
    /// once finished, and [`Error::ResourceExhausted`] past the failure cap.
    pub async fn start_handling(&self, event_id: Uuid, handler: &str) -> Result<(), Error> {
        self.transition(
            event_id,
            HandlingEvent::Started {
                handler: handler.to_owned(),
                at: Utc::now(),
            },
        )
        .await
        .map(drop)
    }

    /// Mark the event as successfully handled by `handler`.
    pub async fn finish_handling(&self, event_id: Uuid, handler: &str) -> Result<(), Error> {
        self.transition(
            event_id,
            HandlingEvent::Finished {
                handler: handler.to_owned(),
                at: Utc::now(),
            },
        )
        .await
        .map(drop)
    }

    /// Record a handling failure: the ledger transitions to `failed` and a
    /// failure row carrying the error's message and kind is appended.
    pub async fn handling_failed(
        &self,
        event_id: Uuid,
        handler: &str,
        error: &Error,
    ) -> Result<(), Error> {
        self.transition(
            event_id,
            HandlingEvent::Failed {
                handler: handler.to_owned(),
                at: Utc::now(),
                message: error.to_string(),
                code: error.kind().as_str().to_owned(),
            },
        )
        .await
        .map(drop)
    }

    /// Zero the failure count and return the handler to `unhandled`, lifting
    /// the failure cap for operator-driven redelivery.
    pub async fn reset_failures(&self, event_id: Uuid, handler: &str) -> Result<(), Error> {
        self.transition(
            event_id,
            HandlingEvent::FailuresReset {
                handler: handler.to_owned(),
                at: Utc::now(),
            },
        )
        .await
        .map(drop)
    }

    /// The delivery ledger for one event. Unknown ids are
    /// [`Error::NotFound`].
    pub async fn event_state(&self, event_id: Uuid) -> Result<EventState, Error> {
        let mut ledger = EventState::with_policies(self.policies.clone());
        self.store.load_into(&mut ledger, event_id).await?;
        Ok(ledger)
    }

    /// Events none of this store's handlers have started yet.
    pub async fn unhandled_events(&self, limit: i64) -> Result<Vec<Event>, Error> {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name.as_str()).collect();
        self.store.storage().unhandled_events(&names, limit).await
    }

    /// Events whose latest attempt by one of this store's handlers failed.
    pub async fn failed_events(&self, limit: i64) -> Result<Vec<Event>, Error> {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name.as_str()).collect();
        self.store.storage().failed_events(&names, limit).await
    }

    #[tracing::instrument(skip(self, fact), fields(event_id = %event_id, fact_kind = fact.kind()))]
    async fn transition(&self, event_id: Uuid, fact: HandlingEvent) -> Result<EventState, Error> {
        let mut attempts = 0u32;
        loop {
            let mut ledger = EventState::with_policies(self.policies.clone());
            self.store.load_into(&mut ledger, event_id).await?;
            ledger.set_event(fact.clone())?;
            let Some(batch) = NonEmpty::from_vec(ledger.base_mut().take_uncommitted()) else {
                return Ok(ledger);
            };
            match self.apply_transition(&ledger, &batch, &fact).await {
                Ok(()) => return Ok(ledger),
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    attempts += 1;
                    if let Some(limit) = self.store.commit_retry_limit() {
                        if attempts > limit {
                            return Err(Error::resource_exhausted(format!(
                                "transition contention on event {event_id} after {attempts} \
                                 attempts"
                            )));
                        }
                    }
                    tracing::debug!(attempt = attempts, "transition conflict, reloading");
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One transaction: the transition facts, the upserted state row and
    /// (for failures) a failure log row.
    async fn apply_transition(
        &self,
        ledger: &EventState,
        batch: &NonEmpty<Event>,
        fact: &HandlingEvent,
    ) -> Result<(), Error> {
        let (handler, state, at) = match fact {
            HandlingEvent::Started { handler, at } => (handler, HandlerState::Started, *at),
            HandlingEvent::Finished { handler, at } => (handler, HandlerState::Finished, *at),
            HandlingEvent::Failed { handler, at, .. } => (handler, HandlerState::Failed, *at),
            HandlingEvent::FailuresReset { handler, at } => {
                (handler, HandlerState::Unhandled, *at)
            }
            HandlingEvent::Unhandled { .. } => {
                return Err(Error::invalid_argument(
                    "initial facts are recorded at commit time",
                ));
            }
        };

        let mut tx = self.store.storage().begin().await?;
        tx.save_events(batch).await?;
        tx.put_handler_states(ledger.base().id(), &[handler.clone()], state, at)
            .await?;
        if let HandlingEvent::Failed {
            handler,
            at,
            message,
            code,
        } = fact
        {
            let retries = ledger
                .progress(handler)
                .map_or(0, |progress| progress.total_failures);
            tx.record_failure(&HandlingFailure {
                event_id: ledger.base().id(),
                handler: handler.clone(),
                at: *at,
                message: message.clone(),
                code: code.clone(),
                retries: retries as i32,
            })
            .await?;
        }
        tx.commit().await
    }

    /// See [`AggregateStore::attach`].
    pub fn attach<A: Aggregate>(&self, aggregate: &mut A, id: Uuid) {
        self.store.attach(aggregate, id);
    }

    /// See [`AggregateStore::load`].
    pub async fn load<A: Aggregate>(&self, id: Uuid) -> Result<A, Error> {
        self.store.load(id).await
    }

    /// See [`AggregateStore::load_with_snapshot`].
    pub async fn load_with_snapshot<A>(&self, id: Uuid) -> Result<A, Error>
    where
        A: Aggregate + DeserializeOwned,
    {
        self.store.load_with_snapshot(id).await
    }

    /// See [`AggregateStore::save_snapshot`].
    pub async fn save_snapshot<A>(&self, aggregate: &A) -> Result<(), Error>
    where
        A: Aggregate + Serialize,
    {
        self.store.save_snapshot(aggregate).await
    }

    /// See [`AggregateStore::stream_events`].
    pub fn stream_events(&self, query: StreamQuery) -> EventStream<'_> {
        self.store.stream_events(query)
    }

    /// See [`AggregateStore::stream_aggregates`].
    pub fn stream_aggregates(
        &self,
        aggregate_kind: impl Into<String>,
        options: FeedOptions,
    ) -> AggregateFeed {
        self.store.stream_aggregates(aggregate_kind, options)
    }
}
