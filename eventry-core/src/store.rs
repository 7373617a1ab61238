//! The aggregate store: load, snapshot and commit orchestration over a
//! [`Storage`] backend.
//!
//! Commits are optimistic. The store saves whatever revisions the aggregate
//! synthesized; if another writer claimed one of them, the backend reports
//! [`AlreadyExists`](crate::error::Error::AlreadyExists) and the store
//! reconciles: reload the aggregate, re-apply the pending payloads on top of
//! the winner's history and save again. Callers normally never observe the
//! conflict.

use std::sync::Arc;

use chrono::Utc;
use nonempty::NonEmpty;
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
    aggregate::{Aggregate, AggregateBase, IdGenerator, RandomIds},
    error::{Error, ErrorKind},
    event::{self, Event, Snapshot},
    storage::{EventStream, Storage, StreamQuery},
};

/// Aggregate lifecycle orchestration over a storage backend.
///
/// Cheap to clone; clones share the backend handle and the id generator.
#[derive(Clone)]
pub struct AggregateStore<S> {
    storage: S,
    ids: Arc<dyn IdGenerator>,
    commit_retry_limit: Option<u32>,
}

impl<S: std::fmt::Debug> std::fmt::Debug for AggregateStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("storage", &self.storage)
            .field("commit_retry_limit", &self.commit_retry_limit)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> AggregateStore<S> {
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            ids: Arc::new(RandomIds),
            commit_retry_limit: None,
        }
    }

    /// Replace the event id generator. Mostly useful in tests.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Bound the commit retry loop: `limit` reconciliations, `limit + 1`
    /// save attempts, then [`Error::ResourceExhausted`].
    ///
    /// Unset, commits retry until they win or hit a non-conflict error.
    #[must_use]
    pub fn with_commit_retry_limit(mut self, limit: u32) -> Self {
        self.commit_retry_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub(crate) fn commit_retry_limit(&self) -> Option<u32> {
        self.commit_retry_limit
    }

    /// Install a fresh base carrying `id` and the store's id generator.
    pub fn attach<A: Aggregate>(&self, aggregate: &mut A, id: Uuid) {
        *aggregate.base_mut() = AggregateBase::with_ids(id, Arc::clone(&self.ids));
    }

    /// Load an aggregate by replaying its whole event stream.
    ///
    /// No stored events is [`Error::NotFound`].
    pub async fn load<A: Aggregate>(&self, id: Uuid) -> Result<A, Error> {
        let mut aggregate = A::default();
        self.load_into(&mut aggregate, id).await?;
        Ok(aggregate)
    }

    /// [`load`](Self::load) into an existing instance, discarding its state.
    #[tracing::instrument(skip(self, aggregate), fields(aggregate_kind = A::KIND, aggregate_id = %id))]
    pub async fn load_into<A: Aggregate>(&self, aggregate: &mut A, id: Uuid) -> Result<(), Error> {
        self.attach(aggregate, id);
        let events = self.storage.list_events(A::KIND, id).await?;
        if events.is_empty() {
            return Err(Error::not_found(format!(
                "no events for {}/{id}",
                A::KIND
            )));
        }
        replay(aggregate, &events)
    }

    /// Load from the latest snapshot, replaying only the events after it.
    ///
    /// Falls back to a plain [`load`](Self::load) when no snapshot matches
    /// the aggregate's schema version.
    pub async fn load_with_snapshot<A>(&self, id: Uuid) -> Result<A, Error>
    where
        A: Aggregate + DeserializeOwned,
    {
        let mut aggregate = A::default();
        self.load_with_snapshot_into(&mut aggregate, id).await?;
        Ok(aggregate)
    }

    /// [`load_with_snapshot`](Self::load_with_snapshot) into an existing
    /// instance.
    #[tracing::instrument(skip(self, aggregate), fields(aggregate_kind = A::KIND, aggregate_id = %id))]
    pub async fn load_with_snapshot_into<A>(
        &self,
        aggregate: &mut A,
        id: Uuid,
    ) -> Result<(), Error>
    where
        A: Aggregate + DeserializeOwned,
    {
        let snapshot = match self
            .storage
            .latest_snapshot(A::KIND, id, A::SCHEMA_VERSION)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return self.load_into(aggregate, id).await;
            }
            Err(error) => return Err(error),
        };

        // Snapshot state bypasses `apply`; the base is rebuilt from the
        // snapshot row, then only the tail of the stream is replayed.
        *aggregate = event::decode_json(&snapshot.data)?;
        aggregate.base_mut().hydrate(
            snapshot.aggregate_id,
            snapshot.revision,
            snapshot.timestamp,
            Arc::clone(&self.ids),
        );
        let tail = self
            .storage
            .list_events_after(A::KIND, id, snapshot.revision)
            .await?;
        replay(aggregate, &tail)
    }

    /// Append a snapshot of the aggregate at its current revision.
    #[tracing::instrument(
        skip(self, aggregate),
        fields(aggregate_kind = A::KIND, aggregate_id = %aggregate.base().id())
    )]
    pub async fn save_snapshot<A>(&self, aggregate: &A) -> Result<(), Error>
    where
        A: Aggregate + Serialize,
    {
        let snapshot = Snapshot {
            aggregate_id: aggregate.base().id(),
            aggregate_kind: A::KIND.to_owned(),
            schema_version: A::SCHEMA_VERSION,
            revision: aggregate.base().revision(),
            timestamp: Utc::now(),
            data: event::encode_json(aggregate)?,
        };
        self.storage.save_snapshot(&snapshot).await
    }

    /// Persist the aggregate's uncommitted events.
    ///
    /// An empty buffer returns `Ok` without touching storage. Revision
    /// conflicts reconcile and retry; see the module docs.
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
            match self.storage.save_events(&batch).await {
                Ok(()) => {
                    aggregate.base_mut().mark_committed();
                    return Ok(());
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    attempts += 1;
                    if let Some(limit) = self.commit_retry_limit {
                        if attempts > limit {
                            return Err(Error::resource_exhausted(format!(
                                "commit contention on {}/{} after {attempts} attempts",
                                A::KIND,
                                aggregate.base().id()
                            )));
                        }
                    }
                    tracing::debug!(attempt = attempts, "commit conflict, reconciling");
                    self.reconcile(aggregate).await?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Rebuild a conflicted aggregate on top of the winner's history and
    /// re-queue its pending events at fresh revisions.
    ///
    /// Event ids and payload bytes survive; the re-applied payloads run
    /// through `apply` again, so domain invariants broken by the winning
    /// events reject the commit here.
    pub(crate) async fn reconcile<A>(&self, aggregate: &mut A) -> Result<(), Error>
    where
        A: Aggregate + DeserializeOwned,
    {
        let pending = aggregate.base_mut().take_uncommitted();
        let id = aggregate.base().id();
        *aggregate = A::default();
        self.load_with_snapshot_into(aggregate, id).await?;
        for event in pending {
            let payload: A::Event = event.payload()?;
            aggregate.apply(&payload)?;
            aggregate.base_mut().requeue(event);
        }
        Ok(())
    }

    /// Stream stored events matching `query` straight from the backend.
    pub fn stream_events(&self, query: StreamQuery) -> EventStream<'_> {
        self.storage.stream_events(query)
    }
}

/// Fold stored events into the aggregate, checking that revisions continue
/// gap-free from its current position.
pub(crate) fn replay<A: Aggregate>(aggregate: &mut A, events: &[Event]) -> Result<(), Error> {
    for event in events {
        let expected = aggregate.base().revision() + 1;
        if event.revision != expected {
            return Err(Error::internal(format!(
                "event stream for {}/{} has revision {} where {expected} was expected",
                event.aggregate_kind, event.aggregate_id, event.revision
            )));
        }
        let payload: A::Event = event.payload()?;
        aggregate.apply(&payload)?;
        aggregate.base_mut().advance_to(event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::{
        event::{EventPayload, check_kind, decode_json, encode_json},
        storage::inmemory,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "fact", rename_all = "snake_case")]
    enum TillEvent {
        Opened { float: i64 },
        CashedIn { amount: i64 },
        PaidOut { amount: i64 },
    }

    impl EventPayload for TillEvent {
        const KINDS: &'static [&'static str] =
            &["till.opened", "till.cashed-in", "till.paid-out"];

        fn kind(&self) -> &'static str {
            match self {
                Self::Opened { .. } => "till.opened",
                Self::CashedIn { .. } => "till.cashed-in",
                Self::PaidOut { .. } => "till.paid-out",
            }
        }

        fn encode(&self) -> Result<Vec<u8>, Error> {
            encode_json(self)
        }

        fn decode(kind: &str, data: &[u8]) -> Result<Self, Error> {
            check_kind::<Self>(kind)?;
            decode_json(data)
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Till {
        base: AggregateBase,
        balance: i64,
    }

    impl Aggregate for Till {
        const KIND: &'static str = "till";
        type Event = TillEvent;

        fn apply(&mut self, event: &Self::Event) -> Result<(), Error> {
            match event {
                TillEvent::Opened { float } => self.balance = *float,
                TillEvent::CashedIn { amount } => self.balance += amount,
                TillEvent::PaidOut { amount } => {
                    if *amount > self.balance {
                        return Err(Error::invalid_argument("till cannot go negative"));
                    }
                    self.balance -= amount;
                }
            }
            Ok(())
        }

        fn base(&self) -> &AggregateBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut AggregateBase {
            &mut self.base
        }
    }

    struct SequentialIds(AtomicU64);

    impl IdGenerator for SequentialIds {
        fn generate(&self) -> Uuid {
            Uuid::from_u128(u128::from(self.0.fetch_add(1, Ordering::Relaxed)))
        }
    }

    fn store() -> AggregateStore<inmemory::Store> {
        AggregateStore::new(inmemory::Store::new())
    }

    #[tokio::test]
    async fn loading_an_unknown_aggregate_is_not_found() {
        let err = store().load::<Till>(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn commit_then_load_round_trips() {
        let store = store();
        let id = Uuid::new_v4();

        let mut till = Till::default();
        store.attach(&mut till, id);
        till.set_event(TillEvent::Opened { float: 100 }).unwrap();
        till.set_event(TillEvent::CashedIn { amount: 40 }).unwrap();
        store.commit(&mut till).await.unwrap();

        assert!(till.base().uncommitted().is_empty());
        assert_eq!(till.base().committed().len(), 2);

        let loaded: Till = store.load(id).await.unwrap();
        assert_eq!(loaded.balance, 140);
        assert_eq!(loaded.base().revision(), 2);
        assert_eq!(loaded.base().id(), id);
    }

    #[tokio::test]
    async fn empty_commit_is_a_no_op() {
        let store = store();
        let id = Uuid::new_v4();
        let mut till = Till::default();
        store.attach(&mut till, id);

        store.commit(&mut till).await.unwrap();

        assert_eq!(
            store.load::<Till>(id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn conflicting_commit_reconciles_onto_the_winners_history() {
        let store = store();
        let id = Uuid::new_v4();

        let mut first = Till::default();
        store.attach(&mut first, id);
        first.set_event(TillEvent::Opened { float: 100 }).unwrap();
        store.commit(&mut first).await.unwrap();

        // Two copies race for revision 2; `second` wins.
        let mut second: Till = store.load(id).await.unwrap();
        second.set_event(TillEvent::CashedIn { amount: 10 }).unwrap();
        store.commit(&mut second).await.unwrap();

        first.set_event(TillEvent::CashedIn { amount: 5 }).unwrap();
        let pending_id = first.base().uncommitted()[0].id;
        store.commit(&mut first).await.unwrap();

        // The conflicted event kept its identity but moved to revision 3.
        assert_eq!(first.base().committed().len(), 1);
        assert_eq!(first.base().committed()[0].id, pending_id);
        assert_eq!(first.base().committed()[0].revision, 3);

        let settled: Till = store.load(id).await.unwrap();
        assert_eq!(settled.balance, 115);
        assert_eq!(settled.base().revision(), 3);
    }

    #[tokio::test]
    async fn reconcile_reruns_domain_invariants() {
        let store = store();
        let id = Uuid::new_v4();

        let mut first = Till::default();
        store.attach(&mut first, id);
        first.set_event(TillEvent::Opened { float: 100 }).unwrap();
        store.commit(&mut first).await.unwrap();

        let mut second: Till = store.load(id).await.unwrap();
        second.set_event(TillEvent::PaidOut { amount: 90 }).unwrap();
        store.commit(&mut second).await.unwrap();

        // Valid against this copy's stale balance, invalid after the payout.
        first.set_event(TillEvent::PaidOut { amount: 50 }).unwrap();
        let err = store.commit(&mut first).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let settled: Till = store.load(id).await.unwrap();
        assert_eq!(settled.balance, 10);
    }

    #[tokio::test]
    async fn bounded_retry_surfaces_contention() {
        let storage = inmemory::Store::new();
        let store = AggregateStore::new(storage.clone()).with_commit_retry_limit(0);
        let unbounded = AggregateStore::new(storage);
        let id = Uuid::new_v4();

        let mut first = Till::default();
        store.attach(&mut first, id);
        first.set_event(TillEvent::Opened { float: 100 }).unwrap();
        store.commit(&mut first).await.unwrap();

        let mut second: Till = unbounded.load(id).await.unwrap();
        second.set_event(TillEvent::CashedIn { amount: 1 }).unwrap();
        unbounded.commit(&mut second).await.unwrap();

        first.set_event(TillEvent::CashedIn { amount: 2 }).unwrap();
        let err = store.commit(&mut first).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("commit contention"));
    }

    #[tokio::test]
    async fn gap_in_the_stream_is_internal() {
        let storage = inmemory::Store::new();
        let store = AggregateStore::new(storage.clone());
        let id = Uuid::new_v4();

        let gapped = |revision: i64| Event {
            id: Uuid::new_v4(),
            kind: "till.opened".to_owned(),
            aggregate_kind: "till".to_owned(),
            aggregate_id: id,
            revision,
            timestamp: Utc::now(),
            data: encode_json(&TillEvent::Opened { float: 1 }).unwrap(),
        };
        storage
            .save_events(&NonEmpty::from_vec(vec![gapped(1), gapped(3)]).unwrap())
            .await
            .unwrap();

        let err = store.load::<Till>(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("revision 3"));
    }

    #[tokio::test]
    async fn snapshot_load_replays_only_the_tail() {
        let store = store();
        let id = Uuid::new_v4();

        let mut till = Till::default();
        store.attach(&mut till, id);
        till.set_event(TillEvent::Opened { float: 100 }).unwrap();
        till.set_event(TillEvent::CashedIn { amount: 50 }).unwrap();
        store.commit(&mut till).await.unwrap();
        store.save_snapshot(&till).await.unwrap();

        till.set_event(TillEvent::PaidOut { amount: 30 }).unwrap();
        store.commit(&mut till).await.unwrap();

        let loaded: Till = store.load_with_snapshot(id).await.unwrap();
        assert_eq!(loaded.balance, 120);
        assert_eq!(loaded.base().revision(), 3);

        // Same result as a full replay.
        let replayed: Till = store.load(id).await.unwrap();
        assert_eq!(replayed.balance, loaded.balance);
    }

    #[tokio::test]
    async fn snapshot_of_a_stale_schema_version_is_ignored() {
        let storage = inmemory::Store::new();
        let store = AggregateStore::new(storage.clone());
        let id = Uuid::new_v4();

        let mut till = Till::default();
        store.attach(&mut till, id);
        till.set_event(TillEvent::Opened { float: 100 }).unwrap();
        store.commit(&mut till).await.unwrap();

        // A snapshot from some older shape of the type.
        storage
            .save_snapshot(&Snapshot {
                aggregate_id: id,
                aggregate_kind: "till".to_owned(),
                schema_version: Till::SCHEMA_VERSION - 1,
                revision: 9,
                timestamp: Utc::now(),
                data: b"{\"legacy\":true}".to_vec(),
            })
            .await
            .unwrap();

        let loaded: Till = store.load_with_snapshot(id).await.unwrap();
        assert_eq!(loaded.balance, 100);
        assert_eq!(loaded.base().revision(), 1);
    }

    #[tokio::test]
    async fn injected_generator_stamps_committed_events() {
        let store =
            store().with_id_generator(Arc::new(SequentialIds(AtomicU64::new(1))));
        let id = Uuid::new_v4();

        let mut till = Till::default();
        store.attach(&mut till, id);
        till.set_event(TillEvent::Opened { float: 1 }).unwrap();
        till.set_event(TillEvent::CashedIn { amount: 1 }).unwrap();
        store.commit(&mut till).await.unwrap();

        let ids: Vec<_> = till.base().committed().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
    }
}
