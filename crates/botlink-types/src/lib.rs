//! `botlink-types` – shared vocabulary for every botlink crate.
//!
//! Nothing in here knows about tasks, channels, or transports.  It only
//! names the states, messages and errors that the stream loops, the control
//! arbiter and the action allocator exchange.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle states
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a single streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamState {
    /// No call is open.  `start` is allowed.
    #[default]
    Idle,
    /// The call is being opened on the background task.
    Starting,
    /// The call is open and inbound messages are being delivered.
    Active,
    /// Cancellation was requested; the background task is unwinding.
    Ending,
    /// The last run terminated with a captured fault.  `start` is allowed.
    Faulted,
}

impl StreamState {
    /// `true` only while inbound messages are being delivered.
    pub fn is_active(self) -> bool {
        matches!(self, StreamState::Active)
    }

    /// `true` when a fresh run may be started from this state.
    pub fn can_start(self) -> bool {
        matches!(self, StreamState::Idle | StreamState::Faulted)
    }
}

/// Ownership of the device's behavior control, as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControlState {
    #[default]
    Unowned,
    Requesting,
    Owned,
    Releasing,
}

/// How aggressively the device should suppress its autonomous behaviors
/// while this client holds control.
///
/// The device arbitrates; the client only forwards the value and checks it
/// for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Default,
    ReserveControl,
    OverrideBehaviors,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Default => write!(f, "default"),
            Priority::ReserveControl => write!(f, "reserve_control"),
            Priority::OverrideBehaviors => write!(f, "override_behaviors"),
        }
    }
}

impl FromStr for Priority {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Ok(Priority::Default),
            "reserve_control" => Ok(Priority::ReserveControl),
            "override_behaviors" => Ok(Priority::OverrideBehaviors),
            other => Err(LinkError::Config(format!("unknown control priority '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control arbitration messages
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound messages written on the behavior-control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ControlRequest {
    /// Ask the device for behavior control at `priority`.
    Request { priority: Priority },
    /// Hand control back to the device.
    Release,
}

/// Inbound messages read from the behavior-control stream.
///
/// `Unknown` covers any shape the client does not understand yet; it is
/// never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ControlResponse {
    Granted,
    Lost,
    /// Control held at [`Priority::ReserveControl`] was taken back.
    ReservedControlLost,
    KeepAlive,
    StreamEnd,
    Unknown,
}

/// Why control is no longer held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossReason {
    /// The device revoked or denied control.
    Revoked,
    /// Reserved control was revoked.
    ReservedControlLost,
    /// The control stream terminated.
    Disconnected,
}

// ─────────────────────────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────────────────────────

/// Correlation id carried by SDK-issued actions.
pub type ActionTag = u32;

/// First tag of the sub-range reserved for SDK-originated actions.
pub const FIRST_SDK_TAG: ActionTag = 2_000_001;
/// Last tag of the sub-range reserved for SDK-originated actions.
pub const LAST_SDK_TAG: ActionTag = 3_000_000;

/// An action request with its correlation tag embedded.
///
/// `P` is the feature-specific parameter payload; the core never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest<P> {
    pub tag: ActionTag,
    pub params: P,
}

/// Final outcome of an action as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Completed,
    Cancelled,
    Failed { code: i32 },
}

impl ActionStatus {
    pub fn is_success(self) -> bool {
        matches!(self, ActionStatus::Completed)
    }
}

/// Completion message correlated back to a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCompletion {
    pub tag: ActionTag,
    pub status: ActionStatus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus events
// ─────────────────────────────────────────────────────────────────────────────

/// Envelope for everything published on the in-process event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"botlink-kernel::control"`
    pub source: String,
    pub payload: LinkEventPayload,
}

impl LinkEvent {
    /// Stamp a fresh event with a new id and the current time.
    pub fn new(source: impl Into<String>, payload: LinkEventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// State transitions reported by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkEventPayload {
    StreamStarted { stream: String },
    StreamEnded { stream: String, fault: Option<LinkError> },
    ControlGranted { priority: Priority },
    ControlLost { reason: LossReason },
    ControlReleased,
    ActionStarted { tag: ActionTag },
    ActionFinished { tag: ActionTag, status: ActionStatus },
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
///
/// Denied or lost control is a protocol outcome, not an error, and therefore
/// has no variant here.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkError {
    #[error("Transport fault on {stream}: {details}")]
    Transport { stream: String, details: String },

    #[error("Stream {0} is closed")]
    StreamClosed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Message handler on {0} panicked")]
    HandlerPanicked(String),

    #[error("Stream {0} is already active")]
    AlreadyActive(String),

    #[error("Control request at {priority} priority timed out after {timeout_ms} ms")]
    ControlTimeout { priority: Priority, timeout_ms: u64 },

    #[error("Control request superseded by a newer request")]
    ControlSuperseded,

    #[error("Behavior control is not held by this client")]
    ControlNotOwned,

    #[error("Not supported by device firmware: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LinkError {
    /// Shorthand for a [`LinkError::Transport`] fault.
    pub fn transport(stream: impl Into<String>, details: impl fmt::Display) -> Self {
        LinkError::Transport {
            stream: stream.into(),
            details: details.to_string(),
        }
    }

    /// `true` for errors that only mean "someone asked us to stop".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LinkError::Cancelled)
    }
}
