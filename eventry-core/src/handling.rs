//! Per-handler delivery state, event-sourced through the same engine.
//!
//! Every stored business event owns one [`EventState`] aggregate (aggregate
//! id = the event's id) recording how far each registered handler got with
//! it: `Unhandled → Started → {Finished | Failed}`, with `Failed → Started`
//! retries and a reset path back to `Unhandled`.
//!
//! The transition rules live in [`Aggregate::apply`], so they replay
//! deterministically: every [`HandlingEvent`] carries the wall-clock time it
//! was issued (`at`), and the checks compare event time against event time,
//! never against the clock of whoever replays the stream.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    aggregate::{Aggregate, AggregateBase},
    error::Error,
    event::{self, EventPayload},
};

/// Where a handler stands with one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    #[default]
    Unhandled,
    Started,
    Finished,
    Failed,
}

impl HandlerState {
    /// Stable lowercase name, as persisted in handler-state rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unhandled => "unhandled",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// Limits applied when a handler tries to start on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlingPolicy {
    /// Starts are refused once an event has failed more often than this.
    pub max_failures: u32,
    /// Base of the exponential backoff between retries.
    pub min_fail_interval: Duration,
    /// How long a started handler owns an event before another worker may
    /// take over.
    pub max_handling_time: Duration,
}

impl Default for HandlingPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            min_fail_interval: Duration::from_secs(2),
            max_handling_time: Duration::from_secs(10),
        }
    }
}

/// A default [`HandlingPolicy`] plus per-event-kind overrides.
#[derive(Debug, Clone, Default)]
pub struct HandlingPolicies {
    default: HandlingPolicy,
    by_kind: HashMap<String, HandlingPolicy>,
}

impl HandlingPolicies {
    #[must_use]
    pub fn new(default: HandlingPolicy) -> Self {
        Self {
            default,
            by_kind: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, event_kind: impl Into<String>, policy: HandlingPolicy) -> Self {
        self.by_kind.insert(event_kind.into(), policy);
        self
    }

    /// The policy for `event_kind`, falling back to the default.
    #[must_use]
    pub fn for_kind(&self, event_kind: Option<&str>) -> HandlingPolicy {
        event_kind
            .and_then(|kind| self.by_kind.get(kind))
            .copied()
            .unwrap_or(self.default)
    }
}

/// Facts recorded against an [`EventState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fact", rename_all = "snake_case")]
pub enum HandlingEvent {
    /// Initial fact, written in the same transaction as the tracked event.
    Unhandled {
        event_kind: String,
        at: DateTime<Utc>,
    },
    Started {
        handler: String,
        at: DateTime<Utc>,
    },
    Finished {
        handler: String,
        at: DateTime<Utc>,
    },
    Failed {
        handler: String,
        at: DateTime<Utc>,
        message: String,
        code: String,
    },
    FailuresReset {
        handler: String,
        at: DateTime<Utc>,
    },
}

impl EventPayload for HandlingEvent {
    const KINDS: &'static [&'static str] = &[
        "handling.unhandled",
        "handling.started",
        "handling.finished",
        "handling.failed",
        "handling.failures-reset",
    ];

    fn kind(&self) -> &'static str {
        match self {
            Self::Unhandled { .. } => "handling.unhandled",
            Self::Started { .. } => "handling.started",
            Self::Finished { .. } => "handling.finished",
            Self::Failed { .. } => "handling.failed",
            Self::FailuresReset { .. } => "handling.failures-reset",
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

/// One handler's progress with one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerProgress {
    pub state: HandlerState,
    /// Failures since the last reset.
    pub total_failures: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One row of the failure log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlingFailure {
    pub event_id: Uuid,
    pub handler: String,
    pub at: DateTime<Utc>,
    pub message: String,
    /// Stable error-kind name, see
    /// [`ErrorKind::as_str`](crate::error::ErrorKind::as_str).
    pub code: String,
    /// Failure count for this handler at the time of the failure.
    pub retries: i32,
}

/// Delivery state of one stored event, per handler.
///
/// The aggregate id is the tracked event's id. Policies are runtime
/// configuration, injected with [`with_policies`](Self::with_policies) before
/// loading; they are not part of the event stream.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EventState {
    base: AggregateBase,
    event_kind: Option<String>,
    handlers: HashMap<String, HandlerProgress>,
    #[serde(skip)]
    policies: HandlingPolicies,
}

impl EventState {
    #[must_use]
    pub fn with_policies(policies: HandlingPolicies) -> Self {
        Self {
            policies,
            ..Self::default()
        }
    }

    /// Kind of the tracked event, once the initial fact has been applied.
    #[must_use]
    pub fn event_kind(&self) -> Option<&str> {
        self.event_kind.as_deref()
    }

    #[must_use]
    pub fn progress(&self, handler: &str) -> Option<&HandlerProgress> {
        self.handlers.get(handler)
    }

    /// Current state for `handler`; handlers without history are `Unhandled`.
    #[must_use]
    pub fn state_of(&self, handler: &str) -> HandlerState {
        self.handlers
            .get(handler)
            .map_or(HandlerState::Unhandled, |progress| progress.state)
    }

    fn check_start(&self, handler: &str, at: DateTime<Utc>) -> Result<(), Error> {
        let Some(progress) = self.handlers.get(handler) else {
            return Ok(());
        };
        let policy = self.policies.for_kind(self.event_kind.as_deref());

        match progress.state {
            HandlerState::Started => {
                // Beyond the handling window the starter is presumed hung
                // and the event may be taken over.
                if let Some(started_at) = progress.started_at {
                    if at - started_at < interval(policy.max_handling_time) {
                        return Err(Error::failed_precondition(format!(
                            "{handler} is already handling this event"
                        )));
                    }
                }
            }
            HandlerState::Finished => {
                return Err(Error::already_exists(format!(
                    "event is already handled by {handler}"
                )));
            }
            HandlerState::Unhandled | HandlerState::Failed => {}
        }

        if progress.total_failures > policy.max_failures {
            return Err(Error::resource_exhausted(format!(
                "{handler} failed this event more than {} times",
                policy.max_failures
            )));
        }
        if progress.total_failures > 0 {
            if let Some(failed_at) = progress.failed_at {
                let backoff = policy
                    .min_fail_interval
                    .saturating_mul(2u32.saturating_pow(progress.total_failures - 1));
                if at - failed_at < interval(backoff) {
                    return Err(Error::failed_precondition(format!(
                        "{handler} retry is inside the backoff window"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn interval(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl Aggregate for EventState {
    const KIND: &'static str = "event-state";

    type Event = HandlingEvent;

    fn apply(&mut self, event: &Self::Event) -> Result<(), Error> {
        match event {
            HandlingEvent::Unhandled { event_kind, .. } => {
                self.event_kind = Some(event_kind.clone());
            }
            HandlingEvent::Started { handler, at } => {
                self.check_start(handler, *at)?;
                let progress = self.handlers.entry(handler.clone()).or_default();
                progress.state = HandlerState::Started;
                progress.started_at = Some(*at);
            }
            HandlingEvent::Finished { handler, at } => {
                let progress = self.handlers.entry(handler.clone()).or_default();
                progress.state = HandlerState::Finished;
                progress.finished_at = Some(*at);
            }
            HandlingEvent::Failed { handler, at, .. } => {
                let progress = self.handlers.entry(handler.clone()).or_default();
                progress.state = HandlerState::Failed;
                progress.total_failures += 1;
                progress.failed_at = Some(*at);
            }
            HandlingEvent::FailuresReset { handler, .. } => {
                let progress = self.handlers.entry(handler.clone()).or_default();
                progress.state = HandlerState::Unhandled;
                progress.total_failures = 0;
                progress.failed_at = None;
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
