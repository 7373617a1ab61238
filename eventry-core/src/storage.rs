//! Storage traits: the seam between the store and its backends.
//!
//! A backend persists opaque [`Event`] and [`Snapshot`] records and never
//! interprets payload bytes. Backend errors are classified into the
//! [`Error`](crate::error::Error) taxonomy at this boundary; callers above it
//! reason only in taxonomy terms.
//!
//! [`Storage`] covers the aggregate lifecycle; [`TrackingStorage`] extends it
//! with the handler-state bookkeeping used by
//! [`TrackedStore`](crate::tracking::TrackedStore).

pub mod inmemory;

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use futures::Stream;
pub use nonempty::NonEmpty;
use uuid::Uuid;

use crate::{
    error::Error,
    event::{Event, Snapshot},
    handling::{HandlerState, HandlingFailure},
};

/// Default page size for registry pagination.
pub const DEFAULT_PAGE_SIZE: i64 = 1000;

/// A pull stream of events, paged lazily by the backend.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<Event, Error>> + Send + 'a>>;

/// Filters for [`Storage::stream_events`]. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamQuery {
    /// Restrict to these aggregate kinds.
    pub aggregate_kinds: Vec<String>,
    /// Restrict to these aggregate ids.
    pub aggregate_ids: Vec<Uuid>,
    /// Restrict to these event kinds.
    pub kinds: Vec<String>,
    /// Drop these event kinds. Applied after `kinds`.
    pub exclude_kinds: Vec<String>,
}

impl StreamQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn aggregate_kinds<I, T>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.aggregate_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn aggregate_ids<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = Uuid>,
    {
        self.aggregate_ids = ids.into_iter().collect();
        self
    }

    #[must_use]
    pub fn kinds<I, T>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn exclude_kinds<I, T>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.exclude_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }
}

/// One row of the aggregate registry: which aggregates of a kind exist.
///
/// `row` is the backend's monotonic insertion id, used as the keyset cursor
/// for [`Storage::registry_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub row: i64,
    pub aggregate_id: Uuid,
}

/// An open backend transaction.
///
/// The handle is exclusively owned by one call chain; dropping it without
/// calling [`commit`](Self::commit) discards every staged write.
pub trait StorageTx: Send {
    /// Stage a batch of events.
    ///
    /// Every event with `revision == 1` also stages an aggregate-registry
    /// row. A revision already taken by a stored or staged event fails with
    /// [`Error::AlreadyExists`].
    fn save_events(
        &mut self,
        events: &NonEmpty<Event>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), Error>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// An event and snapshot backend.
///
/// Implementations are cheap handles (a pool or an `Arc`) and are cloned
/// freely by the store and the feed workers.
pub trait Storage: Clone + Send + Sync + 'static {
    type Tx: StorageTx;

    /// Open a transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, Error>> + Send;

    /// Persist a batch of events in a single transaction.
    ///
    /// Same semantics as staging through [`StorageTx::save_events`] and
    /// committing.
    fn save_events(
        &self,
        events: &NonEmpty<Event>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            let mut tx = self.begin().await?;
            tx.save_events(events).await?;
            tx.commit().await
        }
    }

    /// All events of one aggregate, ascending by insertion order.
    fn list_events(
        &self,
        aggregate_kind: &str,
        aggregate_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Event>, Error>> + Send;

    /// Events of one aggregate with `revision > revision`, ascending.
    fn list_events_after(
        &self,
        aggregate_kind: &str,
        aggregate_id: Uuid,
        revision: i64,
    ) -> impl Future<Output = Result<Vec<Event>, Error>> + Send;

    /// The most recent snapshot (by timestamp) for the given schema version.
    ///
    /// Absence is [`Error::NotFound`].
    fn latest_snapshot(
        &self,
        aggregate_kind: &str,
        aggregate_id: Uuid,
        schema_version: i16,
    ) -> impl Future<Output = Result<Snapshot, Error>> + Send;

    /// Append a snapshot. Earlier snapshots are kept.
    fn save_snapshot(&self, snapshot: &Snapshot) -> impl Future<Output = Result<(), Error>> + Send;

    /// One keyset page of the aggregate registry, ascending by `row`,
    /// starting strictly after `after_row`.
    fn registry_page(
        &self,
        aggregate_kind: &str,
        after_row: i64,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<RegistryEntry>, Error>> + Send;

    /// Stream stored events matching `query`, ascending by insertion id.
    ///
    /// The stream pages internally; dropping it abandons unread pages.
    fn stream_events(&self, query: StreamQuery) -> EventStream<'_>;
}

/// Transaction extension for handler-state bookkeeping.
pub trait TrackingTx: StorageTx {
    /// Upsert the `(event_id, handler)` state rows for `handlers`.
    fn put_handler_states(
        &mut self,
        event_id: Uuid,
        handlers: &[String],
        state: HandlerState,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Append one row to the failure log.
    fn record_failure(
        &mut self,
        failure: &HandlingFailure,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Backend extension for stores that track per-handler event state.
pub trait TrackingStorage: Storage<Tx: TrackingTx> {
    /// Declare which event kinds `name` subscribes to, replacing any
    /// previous declaration.
    fn register_handler(
        &self,
        name: &str,
        event_kinds: &[String],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Events at least one of `handlers` has not started yet, ascending by
    /// insertion id, deduplicated.
    fn unhandled_events(
        &self,
        handlers: &[&str],
        limit: i64,
    ) -> impl Future<Output = Result<Vec<Event>, Error>> + Send;

    /// Events whose latest attempt by one of `handlers` failed.
    fn failed_events(
        &self,
        handlers: &[&str],
        limit: i64,
    ) -> impl Future<Output = Result<Vec<Event>, Error>> + Send;
}

/// Pager over the aggregate registry.
///
/// Yields pages of ids in insertion order and remembers its own cursor; a
/// short page marks the cursor exhausted.
#[derive(Debug)]
pub struct RegistryCursor<S> {
    storage: S,
    aggregate_kind: String,
    after_row: i64,
    page_size: i64,
    done: bool,
}

impl<S: Storage> RegistryCursor<S> {
    #[must_use]
    pub fn new(storage: S, aggregate_kind: impl Into<String>) -> Self {
        Self {
            storage,
            aggregate_kind: aggregate_kind.into(),
            after_row: 0,
            page_size: DEFAULT_PAGE_SIZE,
            done: false,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The next page, or `None` once the registry is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RegistryEntry>>, Error> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .storage
            .registry_page(&self.aggregate_kind, self.after_row, self.page_size)
            .await?;
        if (page.len() as i64) < self.page_size {
            self.done = true;
        }
        match page.last() {
            Some(last) => {
                self.after_row = last.row;
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }
}
