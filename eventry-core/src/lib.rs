//! Core engine of the Eventry event-sourced aggregate store.
//!
//! This crate holds the storage-agnostic pieces:
//!
//! - [`event`] - event and snapshot records, and the payload codec boundary
//! - [`aggregate`] - the aggregate contract (`Aggregate`, `AggregateBase`)
//! - [`store`] - load, snapshot and optimistic-commit orchestration
//! - [`storage`] - backend traits plus the in-memory reference backend
//! - [`stream`] - bulk hydration feeds over the aggregate registry
//! - [`handling`] / [`tracking`] - per-handler delivery ledgers and the
//!   transactional outbox
//! - [`error`] - the error taxonomy shared across the stack
//!
//! # Example
//!
//! ```
//! use eventry_core::{storage::inmemory, store::AggregateStore};
//!
//! let store = AggregateStore::new(inmemory::Store::new());
//! ```
//!
//! Most users should depend on the `eventry` crate, which re-exports these
//! types next to the Postgres backend.

pub mod aggregate;
pub mod error;
pub mod event;
pub mod handling;
pub mod storage;
pub mod store;
pub mod stream;
pub mod tracking;
