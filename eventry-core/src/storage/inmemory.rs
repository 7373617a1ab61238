//! In-memory storage backend.
//!
//! Backs unit tests and examples; verifies the same invariants the Postgres
//! backend enforces with constraints (revision uniqueness, registry rows for
//! first revisions, handler-state upserts). Not meant for production use.

use std::{
    collections::{HashMap, HashSet},
    future::ready,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use nonempty::NonEmpty;
use uuid::Uuid;

use crate::{
    error::Error,
    event::{Event, Snapshot},
    handling::{HandlerState, HandlingFailure},
    storage::{
        EventStream, RegistryEntry, Storage, StorageTx, StreamQuery, TrackingStorage, TrackingTx,
    },
};

/// A shared, clonable in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<StoredEvent>,
    revisions: HashSet<(String, Uuid, i64)>,
    registry: Vec<RegistryRow>,
    snapshots: Vec<Snapshot>,
    handler_states: HashMap<(Uuid, String), StateRow>,
    failures: Vec<HandlingFailure>,
    handlers: HashMap<String, Vec<String>>,
    next_event_row: i64,
    next_registry_row: i64,
}

#[derive(Debug)]
struct StoredEvent {
    row: i64,
    event: Event,
}

#[derive(Debug)]
struct RegistryRow {
    row: i64,
    aggregate_kind: String,
    aggregate_id: Uuid,
}

#[derive(Debug)]
struct StateRow {
    state: HandlerState,
    updated_at: DateTime<Utc>,
}

fn revision_key(event: &Event) -> (String, Uuid, i64) {
    (
        event.aggregate_kind.clone(),
        event.aggregate_id,
        event.revision,
    )
}

fn revision_taken(event: &Event) -> Error {
    Error::already_exists(format!(
        "revision {} of {}/{} is already written",
        event.revision, event.aggregate_kind, event.aggregate_id
    ))
}

impl Inner {
    fn check_free<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> Result<(), Error> {
        for event in events {
            if self.revisions.contains(&revision_key(event)) {
                return Err(revision_taken(event));
            }
        }
        Ok(())
    }

    fn insert_events(&mut self, events: Vec<Event>) {
        for event in events {
            if event.revision == 1 {
                self.next_registry_row += 1;
                self.registry.push(RegistryRow {
                    row: self.next_registry_row,
                    aggregate_kind: event.aggregate_kind.clone(),
                    aggregate_id: event.aggregate_id,
                });
            }
            self.revisions.insert(revision_key(&event));
            self.next_event_row += 1;
            self.events.push(StoredEvent {
                row: self.next_event_row,
                event,
            });
        }
    }

    fn put_handler_states(
        &mut self,
        event_id: Uuid,
        handlers: Vec<String>,
        state: HandlerState,
        at: DateTime<Utc>,
    ) {
        for handler in handlers {
            self.handler_states.insert(
                (event_id, handler),
                StateRow {
                    state,
                    updated_at: at,
                },
            );
        }
    }

    /// Events whose row for one of `handlers` is in `state`, deduplicated by
    /// event id, ascending by insertion row.
    fn events_in_state(&self, handlers: &[&str], state: HandlerState, limit: i64) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for stored in &self.events {
            if out.len() as i64 >= limit {
                break;
            }
            if !seen.insert(stored.event.id) {
                continue;
            }
            let matches = handlers.iter().any(|handler| {
                self.handler_states
                    .get(&(stored.event.id, (*handler).to_owned()))
                    .is_some_and(|row| row.state == state)
            });
            if matches {
                out.push(stored.event.clone());
            }
        }
        out
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("in-memory store lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("in-memory store lock poisoned")
    }
}

impl Storage for Store {
    type Tx = Tx;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, Error>> + Send {
        ready(Ok(Tx {
            store: self.clone(),
            staged: Vec::new(),
        }))
    }

    fn list_events(
        &self,
        aggregate_kind: &str,
        aggregate_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Event>, Error>> + Send {
        ready(Ok(self.collect_events(aggregate_kind, aggregate_id, 0)))
    }

    fn list_events_after(
        &self,
        aggregate_kind: &str,
        aggregate_id: Uuid,
        revision: i64,
    ) -> impl Future<Output = Result<Vec<Event>, Error>> + Send {
        ready(Ok(self.collect_events(aggregate_kind, aggregate_id, revision)))
    }

    fn latest_snapshot(
        &self,
        aggregate_kind: &str,
        aggregate_id: Uuid,
        schema_version: i16,
    ) -> impl Future<Output = Result<Snapshot, Error>> + Send {
        let result = self
            .read()
            .snapshots
            .iter()
            .filter(|snapshot| {
                snapshot.aggregate_kind == aggregate_kind
                    && snapshot.aggregate_id == aggregate_id
                    && snapshot.schema_version == schema_version
            })
            .max_by_key(|snapshot| snapshot.timestamp)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "no snapshot for {aggregate_kind}/{aggregate_id} at schema version \
                     {schema_version}"
                ))
            });
        ready(result)
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> impl Future<Output = Result<(), Error>> + Send {
        self.write().snapshots.push(snapshot.clone());
        ready(Ok(()))
    }

    fn registry_page(
        &self,
        aggregate_kind: &str,
        after_row: i64,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<RegistryEntry>, Error>> + Send {
        let page = self
            .read()
            .registry
            .iter()
            .filter(|row| row.aggregate_kind == aggregate_kind && row.row > after_row)
            .take(limit.max(0) as usize)
            .map(|row| RegistryEntry {
                row: row.row,
                aggregate_id: row.aggregate_id,
            })
            .collect();
        ready(Ok(page))
    }

    fn stream_events(&self, query: StreamQuery) -> EventStream<'_> {
        let matching: Vec<_> = self
            .read()
            .events
            .iter()
            .filter(|stored| matches_query(&stored.event, &query))
            .map(|stored| Ok(stored.event.clone()))
            .collect();
        futures::stream::iter(matching).boxed()
    }
}

impl Store {
    fn collect_events(&self, aggregate_kind: &str, aggregate_id: Uuid, after: i64) -> Vec<Event> {
        let inner = self.read();
        let mut rows: Vec<_> = inner
            .events
            .iter()
            .filter(|stored| {
                stored.event.aggregate_kind == aggregate_kind
                    && stored.event.aggregate_id == aggregate_id
                    && stored.event.revision > after
            })
            .collect();
        rows.sort_by_key(|stored| (stored.event.timestamp, stored.row));
        rows.into_iter().map(|stored| stored.event.clone()).collect()
    }
}

fn matches_query(event: &Event, query: &StreamQuery) -> bool {
    let kind_of = |set: &[String], value: &str| set.is_empty() || set.iter().any(|k| k == value);
    kind_of(&query.aggregate_kinds, &event.aggregate_kind)
        && (query.aggregate_ids.is_empty() || query.aggregate_ids.contains(&event.aggregate_id))
        && kind_of(&query.kinds, &event.kind)
        && !query.exclude_kinds.iter().any(|k| k == &event.kind)
}

impl TrackingStorage for Store {
    fn register_handler(
        &self,
        name: &str,
        event_kinds: &[String],
    ) -> impl Future<Output = Result<(), Error>> + Send {
        self.write()
            .handlers
            .insert(name.to_owned(), event_kinds.to_vec());
        ready(Ok(()))
    }

    fn unhandled_events(
        &self,
        handlers: &[&str],
        limit: i64,
    ) -> impl Future<Output = Result<Vec<Event>, Error>> + Send {
        ready(Ok(self
            .read()
            .events_in_state(handlers, HandlerState::Unhandled, limit)))
    }

    fn failed_events(
        &self,
        handlers: &[&str],
        limit: i64,
    ) -> impl Future<Output = Result<Vec<Event>, Error>> + Send {
        ready(Ok(self
            .read()
            .events_in_state(handlers, HandlerState::Failed, limit)))
    }
}

/// Staged writes, applied atomically on [`commit`](StorageTx::commit).
#[derive(Debug)]
pub struct Tx {
    store: Store,
    staged: Vec<Staged>,
}

#[derive(Debug)]
enum Staged {
    Events(Vec<Event>),
    HandlerStates {
        event_id: Uuid,
        handlers: Vec<String>,
        state: HandlerState,
        at: DateTime<Utc>,
    },
    Failure(HandlingFailure),
}

impl Tx {
    fn staged_events(&self) -> impl Iterator<Item = &Event> {
        self.staged.iter().filter_map(|staged| match staged {
            Staged::Events(events) => Some(events.iter()),
            _ => None,
        })
        .flatten()
    }

    fn stage_events(&mut self, events: &NonEmpty<Event>) -> Result<(), Error> {
        {
            let inner = self.store.read();
            for event in events {
                let key = revision_key(event);
                if inner.revisions.contains(&key) {
                    return Err(revision_taken(event));
                }
                if self.staged_events().any(|staged| revision_key(staged) == key) {
                    return Err(revision_taken(event));
                }
            }
        }
        self.staged
            .push(Staged::Events(events.iter().cloned().collect()));
        Ok(())
    }

    fn apply(self) -> Result<(), Error> {
        let mut inner = self.store.write();
        // Racing writers may have taken a staged revision since it was
        // validated; the whole transaction fails in that case.
        for staged in &self.staged {
            if let Staged::Events(events) = staged {
                inner.check_free(events.iter())?;
            }
        }
        for staged in self.staged {
            match staged {
                Staged::Events(events) => inner.insert_events(events),
                Staged::HandlerStates {
                    event_id,
                    handlers,
                    state,
                    at,
                } => inner.put_handler_states(event_id, handlers, state, at),
                Staged::Failure(failure) => inner.failures.push(failure),
            }
        }
        Ok(())
    }
}

impl StorageTx for Tx {
    fn save_events(
        &mut self,
        events: &NonEmpty<Event>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        ready(self.stage_events(events))
    }

    fn commit(self) -> impl Future<Output = Result<(), Error>> + Send {
        ready(self.apply())
    }

    fn rollback(self) -> impl Future<Output = Result<(), Error>> + Send {
        drop(self.staged);
        ready(Ok(()))
    }
}

impl TrackingTx for Tx {
    fn put_handler_states(
        &mut self,
        event_id: Uuid,
        handlers: &[String],
        state: HandlerState,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        self.staged.push(Staged::HandlerStates {
            event_id,
            handlers: handlers.to_vec(),
            state,
            at,
        });
        ready(Ok(()))
    }

    fn record_failure(
        &mut self,
        failure: &HandlingFailure,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        self.staged.push(Staged::Failure(failure.clone()));
        ready(Ok(()))
    }
}
