//! The aggregate contract: domain state rebuilt from an event stream.
//!
//! An aggregate is a [`Default`] type holding an [`AggregateBase`] for
//! bookkeeping (identity, revision, event buffers) next to its domain fields.
//! State changes go through [`Aggregate::set_event`], which applies the
//! payload and, only if the transition is accepted, queues a synthesized
//! [`Event`] for the next commit.
//!
//! # Example
//!
//! ```
//! use eventry_core::{
//!     aggregate::{Aggregate, AggregateBase},
//!     error::Error,
//!     event::{self, EventPayload},
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! #[serde(tag = "fact", rename_all = "snake_case")]
//! enum CounterEvent {
//!     Incremented { by: u64 },
//! }
//!
//! impl EventPayload for CounterEvent {
//!     const KINDS: &'static [&'static str] = &["counter.incremented"];
//!
//!     fn kind(&self) -> &'static str {
//!         "counter.incremented"
//!     }
//!
//!     fn encode(&self) -> Result<Vec<u8>, Error> {
//!         event::encode_json(self)
//!     }
//!
//!     fn decode(kind: &str, data: &[u8]) -> Result<Self, Error> {
//!         event::check_kind::<Self>(kind)?;
//!         event::decode_json(data)
//!     }
//! }
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Counter {
//!     base: AggregateBase,
//!     value: u64,
//! }
//!
//! impl Aggregate for Counter {
//!     const KIND: &'static str = "counter";
//!     type Event = CounterEvent;
//!
//!     fn apply(&mut self, event: &Self::Event) -> Result<(), Error> {
//!         match event {
//!             CounterEvent::Incremented { by } => self.value += by,
//!         }
//!         Ok(())
//!     }
//!
//!     fn base(&self) -> &AggregateBase {
//!         &self.base
//!     }
//!
//!     fn base_mut(&mut self) -> &mut AggregateBase {
//!         &mut self.base
//!     }
//! }
//!
//! let mut counter = Counter::default();
//! counter.set_event(CounterEvent::Incremented { by: 3 })?;
//! assert_eq!(counter.value, 3);
//! assert_eq!(counter.base().revision(), 1);
//! assert_eq!(counter.base().uncommitted().len(), 1);
//! # Ok::<(), Error>(())
//! ```

use std::{fmt, mem, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Error,
    event::{Event, EventPayload},
};

/// Source of event identifiers.
///
/// Stores hold one generator and stamp it onto every aggregate they attach,
/// so tests can substitute a deterministic sequence.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Uuid;
}

/// The default generator: random UUIDv4.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn generate(&self) -> Uuid {
        Uuid::new_v4()
    }
}

fn default_id_generator() -> Arc<dyn IdGenerator> {
    Arc::new(RandomIds)
}

/// Bookkeeping shared by every aggregate: identity, revision, timestamps and
/// the uncommitted/committed event buffers.
///
/// Only `id`, `revision` and `timestamp` serialize; buffers and the generator
/// handle are skipped, so aggregates embedding a base can derive
/// `Serialize`/`Deserialize` for snapshotting.
#[derive(Clone, Serialize, Deserialize)]
pub struct AggregateBase {
    id: Uuid,
    revision: i64,
    timestamp: DateTime<Utc>,
    #[serde(skip, default = "default_id_generator")]
    ids: Arc<dyn IdGenerator>,
    #[serde(skip)]
    uncommitted: Vec<Event>,
    #[serde(skip)]
    committed: Vec<Event>,
}

impl Default for AggregateBase {
    fn default() -> Self {
        Self::new(Uuid::nil())
    }
}

impl fmt::Debug for AggregateBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateBase")
            .field("id", &self.id)
            .field("revision", &self.revision)
            .field("timestamp", &self.timestamp)
            .field("uncommitted", &self.uncommitted)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl AggregateBase {
    /// A fresh base for `id` at revision 0, using random event ids.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self::with_ids(id, default_id_generator())
    }

    /// A fresh base for `id` drawing event ids from `ids`.
    #[must_use]
    pub fn with_ids(id: Uuid, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            id,
            revision: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            ids,
            uncommitted: Vec::new(),
            committed: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Revision of the newest event applied or queued. 0 means no history.
    #[must_use]
    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Timestamp of the newest event applied or queued.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Events queued by [`Aggregate::set_event`] and not yet persisted.
    #[must_use]
    pub fn uncommitted(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Events persisted by the most recent commit.
    #[must_use]
    pub fn committed(&self) -> &[Event] {
        &self.committed
    }

    /// Move the uncommitted buffer into the committed one.
    ///
    /// Called by the store after a successful commit; only useful directly
    /// when persisting through some other channel.
    pub fn mark_committed(&mut self) {
        self.committed = mem::take(&mut self.uncommitted);
    }

    pub(crate) fn take_uncommitted(&mut self) -> Vec<Event> {
        mem::take(&mut self.uncommitted)
    }

    /// Synthesize the next event and queue it.
    pub(crate) fn record(&mut self, aggregate_kind: &str, event_kind: &str, data: Vec<u8>) {
        let event = Event {
            id: self.ids.generate(),
            kind: event_kind.to_owned(),
            aggregate_kind: aggregate_kind.to_owned(),
            aggregate_id: self.id,
            revision: self.revision + 1,
            timestamp: Utc::now(),
            data,
        };
        self.revision = event.revision;
        self.timestamp = event.timestamp;
        self.uncommitted.push(event);
    }

    /// Track a stored event that was just applied during a load.
    pub(crate) fn advance_to(&mut self, event: &Event) {
        self.revision = event.revision;
        self.timestamp = event.timestamp;
    }

    /// Re-queue a conflicted event at the current head.
    ///
    /// Identity and payload survive; revision and timestamp are reissued so
    /// the event lands after whatever won the race.
    pub(crate) fn requeue(&mut self, event: Event) {
        let event = Event {
            revision: self.revision + 1,
            timestamp: Utc::now(),
            ..event
        };
        self.revision = event.revision;
        self.timestamp = event.timestamp;
        self.uncommitted.push(event);
    }

    /// Restore identity after deserializing snapshot state.
    pub(crate) fn hydrate(
        &mut self,
        id: Uuid,
        revision: i64,
        timestamp: DateTime<Utc>,
        ids: Arc<dyn IdGenerator>,
    ) {
        self.id = id;
        self.revision = revision;
        self.timestamp = timestamp;
        self.ids = ids;
    }
}

/// Domain state folded from an event stream.
pub trait Aggregate: Default + Send + Sync {
    /// Aggregate kind, e.g. `"account"`. Namespaces streams and snapshots.
    const KIND: &'static str;

    /// Bumped when the serialized shape of the aggregate changes, so
    /// snapshots written by older shapes are ignored.
    const SCHEMA_VERSION: i16 = 1;

    /// The aggregate's event enum.
    type Event: EventPayload;

    /// Fold one event into the state.
    ///
    /// Must be deterministic: it runs both when an event is first set and on
    /// every later replay. Returning an error rejects the transition; state
    /// must be left unchanged in that case.
    fn apply(&mut self, event: &Self::Event) -> Result<(), Error>;

    fn base(&self) -> &AggregateBase;

    fn base_mut(&mut self) -> &mut AggregateBase;

    /// Apply `payload` and queue the resulting event for the next commit.
    ///
    /// Encoding or apply failures leave the aggregate untouched.
    fn set_event(&mut self, payload: Self::Event) -> Result<(), Error> {
        let data = payload.encode()?;
        self.apply(&payload)?;
        self.base_mut().record(Self::KIND, payload.kind(), data);
        Ok(())
    }
}
