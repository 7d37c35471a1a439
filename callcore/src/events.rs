//! Events flowing into and out of a call session.

use crate::candidate::CandidateRecord;
use crate::description::SessionDescription;
use crate::error::CallErrorKind;
use crate::session::SessionId;
use crate::state::CallStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A change to a subscribed session document, as pushed by the signaling channel.
///
/// Changes of one field arrive in the order they were written. Candidates
/// arrive in `seq` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SessionChange {
    Answer(SessionDescription),
    Status {
        status: CallStatus,
        end_time: Option<DateTime<Utc>>,
    },
    Candidate(CandidateRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Description of a local or remote media track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
}

/// What a call session reports to the collaborator that drives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    StatusChanged {
        session_id: SessionId,
        status: CallStatus,
    },
    /// Both descriptions are set and buffered candidates have been applied;
    /// the transport reports a usable path.
    Connected { session_id: SessionId },
    RemoteTrack {
        session_id: SessionId,
        track: TrackInfo,
    },
    /// The attempt reached a terminal status. `error` names the failure that
    /// forced it, if any. `session_id` is `None` when the attempt aborted
    /// before a record was written.
    Terminated {
        session_id: Option<SessionId>,
        status: CallStatus,
        error: Option<CallErrorKind>,
    },
}

impl CallEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}
