//! Event and snapshot records, and the payload codec boundary.
//!
//! The store treats payload bytes as opaque: [`EventPayload`] implementations
//! own the wire format. The usual shape is a serde-tagged enum whose
//! `encode`/`decode` delegate to the JSON helpers here, decoded exactly once
//! per stored event and matched exhaustively in
//! [`Aggregate::apply`](crate::aggregate::Aggregate::apply).
//!
//! # Example
//!
//! ```
//! use eventry_core::{
//!     error::Error,
//!     event::{self, EventPayload},
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! #[serde(tag = "fact", rename_all = "snake_case")]
//! enum TurnstileEvent {
//!     CoinInserted { value: u32 },
//!     ArmPushed,
//! }
//!
//! impl EventPayload for TurnstileEvent {
//!     const KINDS: &'static [&'static str] = &["turnstile.coin", "turnstile.push"];
//!
//!     fn kind(&self) -> &'static str {
//!         match self {
//!             Self::CoinInserted { .. } => "turnstile.coin",
//!             Self::ArmPushed => "turnstile.push",
//!         }
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
//! ```

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::Error;

/// A single immutable fact recorded against an aggregate.
///
/// Revisions are 1-based and gap-free per `(aggregate_kind, aggregate_id)`;
/// the storage layer enforces uniqueness of the triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Identifier from the attached [`IdGenerator`](crate::aggregate::IdGenerator).
    pub id: Uuid,
    /// Event kind, e.g. `"account.opened"`.
    pub kind: String,
    /// Kind of the aggregate this event belongs to.
    pub aggregate_kind: String,
    /// Identifier of the aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// 1-based position within the aggregate's history.
    pub revision: i64,
    /// Wall-clock time the event was synthesized.
    pub timestamp: DateTime<Utc>,
    /// Opaque encoded payload.
    pub data: Vec<u8>,
}

impl Event {
    /// Decode the payload once into the aggregate's event enum.
    pub fn payload<P: EventPayload>(&self) -> Result<P, Error> {
        P::decode(&self.kind, &self.data)
    }
}

/// Point-in-time encoding of an entire aggregate.
///
/// Snapshots are append-only; loads pick the most recent row (by timestamp)
/// for an `(aggregate_id, aggregate_kind, schema_version)` triple, so stale
/// schema versions never shadow current ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub aggregate_id: Uuid,
    pub aggregate_kind: String,
    /// Structural version of the aggregate type that produced the state.
    pub schema_version: i16,
    /// Revision the aggregate had when the snapshot was taken.
    pub revision: i64,
    pub timestamp: DateTime<Utc>,
    /// Encoded aggregate state.
    pub data: Vec<u8>,
}

/// Self-describing event payload: a closed set of kinds with a codec.
pub trait EventPayload: Sized + Send + Sync {
    /// Every kind this payload type decodes.
    const KINDS: &'static [&'static str];

    /// The kind string for this value.
    fn kind(&self) -> &'static str;

    /// Encode to payload bytes. Failures classify as [`Error::Internal`].
    fn encode(&self) -> Result<Vec<u8>, Error>;

    /// Decode payload bytes recorded under `kind`.
    ///
    /// A kind outside [`Self::KINDS`] classifies as [`Error::Internal`]: it
    /// means the stream holds a fact this build does not know about.
    fn decode(kind: &str, data: &[u8]) -> Result<Self, Error>;
}

/// Serialize a payload (or aggregate state) as JSON bytes.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::internal(format!("encode payload: {e}")))
}

/// Deserialize JSON payload bytes.
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(data).map_err(|e| Error::internal(format!("decode payload: {e}")))
}

/// Reject kinds outside the payload's closed set before touching the bytes.
pub fn check_kind<P: EventPayload>(kind: &str) -> Result<(), Error> {
    if P::KINDS.contains(&kind) {
        Ok(())
    } else {
        Err(Error::internal(format!(
            "unknown event kind {kind:?}, expected one of {:?}",
            P::KINDS
        )))
    }
}
