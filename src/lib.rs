#![doc = include_str!("../README.md")]

pub use eventry_core::{
    aggregate,
    aggregate::{Aggregate, AggregateBase, IdGenerator},
    error,
    error::{Error, ErrorKind},
    event,
    event::{Event, EventPayload, Snapshot},
    handling,
    handling::{EventState, HandlerState, HandlingPolicies, HandlingPolicy},
    store,
    store::AggregateStore,
    stream,
    stream::{AggregateFeed, AggregateRecord, FeedOptions},
    tracking,
    tracking::TrackedStore,
};

pub mod storage {

    pub use eventry_core::storage::{
        DEFAULT_PAGE_SIZE, EventStream, NonEmpty, RegistryCursor, RegistryEntry, Storage,
        StorageTx, StreamQuery, TrackingStorage, TrackingTx,
    };

    pub use eventry_core::storage::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use eventry_postgres::{Store, Tx};
    }
}
