//! Bulk hydration: stream every aggregate of a kind out of storage.
//!
//! A producer task pages the aggregate registry and fans entries out to a
//! bounded pool of hydration workers; records arrive on a bounded channel in
//! no particular order. The feed is pull-based with backpressure end to end:
//! a slow consumer stalls the workers, which stall the pager.
//!
//! Used for rebuilding projections, schema migrations and warming snapshot
//! caches.

use std::{sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    aggregate::{Aggregate, AggregateBase},
    error::{Error, ErrorKind},
    event::{self, Event, Snapshot},
    storage::{RegistryCursor, Storage},
    store::{AggregateStore, replay},
};

/// Delay before retrying a registry page that failed with a retryable error.
const PAGE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Tuning for [`AggregateStore::stream_aggregates`].
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Concurrent hydration workers.
    pub workers: usize,
    /// Registry page size.
    pub page_size: i64,
    /// Capacity of the record channel.
    pub buffer: usize,
    /// When set, workers fetch the latest snapshot at this schema version
    /// and list only the events after it.
    pub snapshots: Option<i16>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            page_size: 1000,
            buffer: 10,
            snapshots: None,
        }
    }
}

/// Everything needed to rebuild one aggregate: its snapshot (when requested
/// and present) and the stored events after it.
#[derive(Debug, Clone)]
pub struct AggregateRecord {
    pub aggregate_id: Uuid,
    pub snapshot: Option<Snapshot>,
    pub events: Vec<Event>,
}

impl AggregateRecord {
    /// Fold the record into a typed aggregate.
    pub fn hydrate<A>(&self) -> Result<A, Error>
    where
        A: Aggregate + DeserializeOwned,
    {
        let mut aggregate = A::default();
        match &self.snapshot {
            Some(snapshot) => {
                aggregate = event::decode_json(&snapshot.data)?;
                aggregate.base_mut().hydrate(
                    snapshot.aggregate_id,
                    snapshot.revision,
                    snapshot.timestamp,
                    Arc::new(crate::aggregate::RandomIds),
                );
            }
            None => *aggregate.base_mut() = AggregateBase::new(self.aggregate_id),
        }
        replay(&mut aggregate, &self.events)?;
        Ok(aggregate)
    }
}

/// A running feed of [`AggregateRecord`]s.
///
/// Dropping the feed cancels the producer and its workers.
#[derive(Debug)]
pub struct AggregateFeed {
    records: mpsc::Receiver<AggregateRecord>,
    token: CancellationToken,
}

impl AggregateFeed {
    /// The next record, or `None` once the feed has drained or failed.
    pub async fn next(&mut self) -> Option<AggregateRecord> {
        self.records.recv().await
    }

    /// Stop paging and hydrating. Already-buffered records stay readable.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for AggregateFeed {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<S: Storage> AggregateStore<S> {
    /// Stream every aggregate of `aggregate_kind` as raw records.
    ///
    /// Spawns onto the current Tokio runtime. An empty registry yields a
    /// feed that closes immediately; hydration errors cancel the feed after
    /// logging.
    pub fn stream_aggregates(
        &self,
        aggregate_kind: impl Into<String>,
        options: FeedOptions,
    ) -> AggregateFeed {
        let (records, receiver) = mpsc::channel(options.buffer.max(1));
        let token = CancellationToken::new();
        let pump = Pump {
            storage: self.storage().clone(),
            aggregate_kind: aggregate_kind.into(),
            options,
            records,
            token: token.clone(),
        };
        tokio::spawn(pump.run());
        AggregateFeed {
            records: receiver,
            token,
        }
    }
}

struct Pump<S> {
    storage: S,
    aggregate_kind: String,
    options: FeedOptions,
    records: mpsc::Sender<AggregateRecord>,
    token: CancellationToken,
}

impl<S: Storage> Pump<S> {
    #[tracing::instrument(skip(self), fields(aggregate_kind = %self.aggregate_kind))]
    async fn run(self) {
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut workers = JoinSet::new();
        let mut cursor = RegistryCursor::new(self.storage.clone(), self.aggregate_kind.clone())
            .with_page_size(self.options.page_size);

        'pages: loop {
            if self.token.is_cancelled() {
                break;
            }
            let page = match cursor.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(error) if error.is_retryable() => {
                    tracing::warn!(%error, "registry page failed, retrying");
                    tokio::time::sleep(PAGE_RETRY_DELAY).await;
                    continue;
                }
                Err(error) => {
                    tracing::error!(%error, "registry paging failed");
                    self.token.cancel();
                    break;
                }
            };

            for entry in page {
                let permit = tokio::select! {
                    () = self.token.cancelled() => break 'pages,
                    permit = Arc::clone(&semaphore).acquire_owned() => {
                        match permit {
                            Ok(permit) => permit,
                            Err(_) => break 'pages,
                        }
                    }
                };
                let worker = Worker {
                    storage: self.storage.clone(),
                    aggregate_kind: self.aggregate_kind.clone(),
                    snapshots: self.options.snapshots,
                    records: self.records.clone(),
                    token: self.token.clone(),
                };
                workers.spawn(async move {
                    let _permit = permit;
                    worker.hydrate(entry.aggregate_id).await;
                });
            }
        }

        // In-flight workers finish before the channel closes, so accepted
        // registry entries are never silently dropped.
        while workers.join_next().await.is_some() {}
    }
}

struct Worker<S> {
    storage: S,
    aggregate_kind: String,
    snapshots: Option<i16>,
    records: mpsc::Sender<AggregateRecord>,
    token: CancellationToken,
}

impl<S: Storage> Worker<S> {
    async fn hydrate(self, aggregate_id: Uuid) {
        match self.record(aggregate_id).await {
            Ok(record) => {
                if self.records.send(record).await.is_err() {
                    // Consumer dropped the feed.
                    self.token.cancel();
                }
            }
            Err(error) => {
                tracing::error!(%error, aggregate_id = %aggregate_id, "hydration failed");
                self.token.cancel();
            }
        }
    }

    async fn record(&self, aggregate_id: Uuid) -> Result<AggregateRecord, Error> {
        let snapshot = match self.snapshots {
            Some(schema_version) => {
                match self
                    .storage
                    .latest_snapshot(&self.aggregate_kind, aggregate_id, schema_version)
                    .await
                {
                    Ok(snapshot) => Some(snapshot),
                    Err(error) if error.kind() == ErrorKind::NotFound => None,
                    Err(error) => return Err(error),
                }
            }
            None => None,
        };
        let events = match &snapshot {
            Some(snapshot) => {
                self.storage
                    .list_events_after(&self.aggregate_kind, aggregate_id, snapshot.revision)
                    .await?
            }
            None => self.storage.list_events(&self.aggregate_kind, aggregate_id).await?,
        };
        Ok(AggregateRecord {
            aggregate_id,
            snapshot,
            events,
        })
    }
}
