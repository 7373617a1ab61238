//! Integration tests for the `PostgreSQL` storage backend.
//!
//! These tests spin up a `PostgreSQL` container with testcontainers; run them
//! with `cargo test -- --ignored` on a machine with Docker available.

// The single-element arm of `nonempty!` in nonempty 0.11 expands to an
// `alloc::`-prefixed path, so the calling crate must link `alloc` explicitly.
extern crate alloc;

use chrono::{Duration, Utc};
use eventry_core::{
    aggregate::{Aggregate, AggregateBase},
    error::{Error, ErrorKind},
    event::{self, Event, EventPayload, Snapshot},
    handling::HandlerState,
    storage::{RegistryCursor, Storage, StreamQuery},
    store::AggregateStore,
    tracking::TrackedStore,
};
use eventry_postgres::Store;
use futures::TryStreamExt;
use nonempty::nonempty;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Test helper to set up a `PostgreSQL` container and connection pool.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }

    async fn store(&self) -> Store {
        let store = Store::new(self.pool.clone());
        store.migrate().await.unwrap();
        store
    }
}

fn test_event(aggregate_id: Uuid, revision: i64, kind: &str) -> Event {
    Event {
        id: Uuid::new_v4(),
        kind: kind.to_owned(),
        aggregate_kind: "parcel".to_owned(),
        aggregate_id,
        revision,
        timestamp: Utc::now(),
        data: br#"{"fact":"registered"}"#.to_vec(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fact", rename_all = "snake_case")]
enum ParcelEvent {
    Registered { weight_grams: u32 },
    Delivered,
}

impl EventPayload for ParcelEvent {
    const KINDS: &'static [&'static str] = &["parcel.registered", "parcel.delivered"];

    fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "parcel.registered",
            Self::Delivered => "parcel.delivered",
        }
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        event::encode_json(self)
    }

    fn decode(kind: &str, data: &[u8]) -> Result<Self, Error> {
        event::check_kind::<Self>(kind)?;
        event::decode_json(data)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Parcel {
    base: AggregateBase,
    weight_grams: u32,
    delivered: bool,
}

impl Aggregate for Parcel {
    const KIND: &'static str = "parcel";
    type Event = ParcelEvent;

    fn apply(&mut self, event: &Self::Event) -> Result<(), Error> {
        match event {
            ParcelEvent::Registered { weight_grams } => self.weight_grams = *weight_grams,
            ParcelEvent::Delivered => self.delivered = true,
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

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn migrate_creates_empty_tables() {
    let db = TestDb::new().await;
    db.store().await;

    for table in [
        "es_events",
        "es_aggregates",
        "es_snapshots",
        "es_handler_states",
        "es_handling_failures",
        "es_handlers",
    ] {
        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0, "{table} should start empty");
    }
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn migrate_is_idempotent() {
    let db = TestDb::new().await;
    let store = db.store().await;
    store.migrate().await.unwrap();

    // The schema still works after a re-run.
    let events = nonempty![test_event(Uuid::new_v4(), 1, "parcel.registered")];
    store.save_events(&events).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn save_and_list_round_trip() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let aggregate_id = Uuid::new_v4();

    let first = test_event(aggregate_id, 1, "parcel.registered");
    let second = test_event(aggregate_id, 2, "parcel.delivered");
    let events = nonempty![first.clone(), second.clone()];
    store.save_events(&events).await.unwrap();

    let listed = store.list_events("parcel", aggregate_id).await.unwrap();
    assert_eq!(listed, vec![first, second.clone()]);

    let tail = store
        .list_events_after("parcel", aggregate_id, 1)
        .await
        .unwrap();
    assert_eq!(tail, vec![second]);

    assert!(
        store
            .list_events("parcel", Uuid::new_v4())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn conflicting_revisions_roll_the_batch_back() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let aggregate_id = Uuid::new_v4();

    let events = nonempty![test_event(aggregate_id, 1, "parcel.registered")];
    store.save_events(&events).await.unwrap();

    // Revision 1 is taken, so the whole batch must fail, revision 2 included.
    let conflicting = nonempty![
        test_event(aggregate_id, 1, "parcel.registered"),
        test_event(aggregate_id, 2, "parcel.delivered"),
    ];
    let error = store.save_events(&conflicting).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AlreadyExists);

    let listed = store.list_events("parcel", aggregate_id).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn registry_pages_follow_insertion_order() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        let aggregate_id = Uuid::new_v4();
        let events = nonempty![test_event(aggregate_id, 1, "parcel.registered")];
        store.save_events(&events).await.unwrap();
        ids.push(aggregate_id);
    }
    // A second revision must not add a registry row.
    let events = nonempty![test_event(ids[0], 2, "parcel.delivered")];
    store.save_events(&events).await.unwrap();

    let mut cursor = RegistryCursor::new(store, "parcel").with_page_size(2);
    let mut seen = Vec::new();
    while let Some(page) = cursor.next_page().await.unwrap() {
        assert!(page.len() <= 2);
        seen.extend(page.into_iter().map(|entry| entry.aggregate_id));
    }
    assert_eq!(seen, ids);
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn latest_snapshot_wins_per_schema_version() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let aggregate_id = Uuid::new_v4();

    let stale = Snapshot {
        aggregate_id,
        aggregate_kind: "parcel".to_owned(),
        schema_version: 1,
        revision: 1,
        timestamp: Utc::now() - Duration::seconds(60),
        data: br#"{"revision":1}"#.to_vec(),
    };
    let fresh = Snapshot {
        revision: 4,
        timestamp: Utc::now(),
        data: br#"{"revision":4}"#.to_vec(),
        ..stale.clone()
    };
    store.save_snapshot(&stale).await.unwrap();
    store.save_snapshot(&fresh).await.unwrap();

    let loaded = store
        .latest_snapshot("parcel", aggregate_id, 1)
        .await
        .unwrap();
    assert_eq!(loaded, fresh);

    let error = store
        .latest_snapshot("parcel", aggregate_id, 2)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn stream_applies_kind_filters() {
    let db = TestDb::new().await;
    let store = db.store().await;

    for _ in 0..3 {
        let aggregate_id = Uuid::new_v4();
        let events = nonempty![
            test_event(aggregate_id, 1, "parcel.registered"),
            test_event(aggregate_id, 2, "parcel.delivered"),
        ];
        store.save_events(&events).await.unwrap();
    }

    let all: Vec<Event> = store
        .stream_events(StreamQuery::new())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all.len(), 6);

    let registered: Vec<Event> = store
        .stream_events(StreamQuery::new().kinds(["parcel.registered"]))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(registered.len(), 3);
    assert!(registered.iter().all(|e| e.kind == "parcel.registered"));

    let excluded: Vec<Event> = store
        .stream_events(StreamQuery::new().exclude_kinds(["parcel.registered"]))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(excluded.len(), 3);
    assert!(excluded.iter().all(|e| e.kind == "parcel.delivered"));
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn conflicting_commits_reconcile() {
    let db = TestDb::new().await;
    let store = AggregateStore::new(db.store().await);
    let id = Uuid::new_v4();

    let mut parcel = Parcel::default();
    store.attach(&mut parcel, id);
    parcel
        .set_event(ParcelEvent::Registered { weight_grams: 600 })
        .unwrap();
    store.commit(&mut parcel).await.unwrap();

    let mut stale: Parcel = store.load(id).await.unwrap();
    parcel.set_event(ParcelEvent::Delivered).unwrap();
    store.commit(&mut parcel).await.unwrap();

    // The stale copy conflicts on revision 2 and reconciles onto revision 3.
    stale.set_event(ParcelEvent::Delivered).unwrap();
    store.commit(&mut stale).await.unwrap();
    assert_eq!(stale.base().revision(), 3);

    let settled: Parcel = store.load(id).await.unwrap();
    assert_eq!(settled.base().revision(), 3);
    assert!(settled.delivered);
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn snapshot_loads_replay_only_the_tail() {
    let db = TestDb::new().await;
    let store = AggregateStore::new(db.store().await);
    let id = Uuid::new_v4();

    let mut parcel = Parcel::default();
    store.attach(&mut parcel, id);
    parcel
        .set_event(ParcelEvent::Registered { weight_grams: 2500 })
        .unwrap();
    store.commit(&mut parcel).await.unwrap();
    store.save_snapshot(&parcel).await.unwrap();

    parcel.set_event(ParcelEvent::Delivered).unwrap();
    store.commit(&mut parcel).await.unwrap();

    let loaded: Parcel = store.load_with_snapshot(id).await.unwrap();
    assert_eq!(loaded.base().revision(), 2);
    assert_eq!(loaded.weight_grams, 2500);
    assert!(loaded.delivered);
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn tracked_commits_and_transitions_round_trip() {
    let db = TestDb::new().await;
    let tracked = TrackedStore::new(AggregateStore::new(db.store().await))
        .with_handler("courier", &["parcel.registered"]);
    tracked.register_handlers().await.unwrap();

    let id = Uuid::new_v4();
    let mut parcel = Parcel::default();
    tracked.attach(&mut parcel, id);
    parcel
        .set_event(ParcelEvent::Registered { weight_grams: 1200 })
        .unwrap();
    tracked.commit(&mut parcel).await.unwrap();
    let event_id = parcel.base().committed()[0].id;

    let unhandled = tracked.unhandled_events(10).await.unwrap();
    assert_eq!(unhandled.len(), 1);
    assert_eq!(unhandled[0].id, event_id);

    tracked.start_handling(event_id, "courier").await.unwrap();
    tracked.finish_handling(event_id, "courier").await.unwrap();

    assert!(tracked.unhandled_events(10).await.unwrap().is_empty());
    let ledger = tracked.event_state(event_id).await.unwrap();
    assert_eq!(ledger.state_of("courier"), HandlerState::Finished);
    assert_eq!(ledger.event_kind(), Some("parcel.registered"));
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn failures_append_to_the_failure_log() {
    let db = TestDb::new().await;
    let tracked = TrackedStore::new(AggregateStore::new(db.store().await))
        .with_handler("courier", &["parcel.registered"]);
    tracked.register_handlers().await.unwrap();

    let mut parcel = Parcel::default();
    tracked.attach(&mut parcel, Uuid::new_v4());
    parcel
        .set_event(ParcelEvent::Registered { weight_grams: 80 })
        .unwrap();
    tracked.commit(&mut parcel).await.unwrap();
    let event_id = parcel.base().committed()[0].id;

    tracked.start_handling(event_id, "courier").await.unwrap();
    tracked
        .handling_failed(event_id, "courier", &Error::unavailable("van broke down"))
        .await
        .unwrap();

    let failed = tracked.failed_events(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, event_id);

    let row: (String, String, i32) = sqlx::query_as(
        "SELECT message, code, retries FROM es_handling_failures WHERE event_id = $1",
    )
    .bind(event_id)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert!(row.0.contains("van broke down"));
    assert_eq!(row.1, "unavailable");
    assert_eq!(row.2, 1);
}
