//! Gear state machine events
//!
//! Gears report their lifecycle as versioned state transitions. Events are
//! merged under last-writer-wins keyed on the event time; stale or
//! unknown-version events are dropped.

use serde::{Deserialize, Serialize};

use super::time::EpochMillis;

/// State-event protocol version
pub const STATE_EVENT_VERSION: u32 = 1;

/// Gear lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    Unknown,
    ShuttingDown,
    Sleeping,
    Resetting,
    Ready,
    Recording,
    WaitingForResponse,
    Streaming,
    Calling,
    Interrupted,
}

impl State {
    /// Whether the gear is in the middle of an interaction
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            State::Recording | State::WaitingForResponse | State::Streaming | State::Calling
        )
    }

    /// Whether the gear may start recording from this state
    pub fn can_record(&self) -> bool {
        matches!(self, State::Ready | State::Streaming)
    }
}

/// Optional cause attached to a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateCause {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calling_initiated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calling_resume: Option<bool>,
}

/// A single state transition on the wire
///
/// `time` is set by the producer at emission; `update_at` is set by the
/// application layer and may differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    #[serde(rename = "v")]
    pub version: u32,
    #[serde(rename = "t")]
    pub time: EpochMillis,
    #[serde(rename = "s")]
    pub state: State,
    #[serde(rename = "c", skip_serializing_if = "Option::is_none", default)]
    pub cause: Option<StateCause>,
    #[serde(rename = "ut")]
    pub update_at: EpochMillis,
}

impl StateEvent {
    /// Build an event for `state` stamped with the current time
    pub fn now(state: State) -> Self {
        let t = EpochMillis::now();
        Self {
            version: STATE_EVENT_VERSION,
            time: t,
            state,
            cause: None,
            update_at: t,
        }
    }

    pub fn with_cause(mut self, cause: StateCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Merge an incoming event under last-writer-wins
    ///
    /// The incoming event is accepted only when its version is 1 and its
    /// time is not older than the current one; otherwise it is dropped.
    /// Returns true iff the state value actually changed.
    pub fn merge_with(&mut self, other: &StateEvent) -> bool {
        if other.version != STATE_EVENT_VERSION || other.time < self.time {
            return false;
        }
        let changed = self.state != other.state;
        *self = other.clone();
        changed
    }
}

impl Default for StateEvent {
    fn default() -> Self {
        Self {
            version: STATE_EVENT_VERSION,
            time: EpochMillis::ZERO,
            state: State::Unknown,
            cause: None,
            update_at: EpochMillis::ZERO,
        }
    }
}
