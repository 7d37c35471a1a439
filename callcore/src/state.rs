//! Call status machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a persisted call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Offer persisted, waiting for the receiver.
    Calling,
    /// Receiver persisted an answer.
    Answered,
    /// Either party hung up, or the attempt failed.
    Ended,
    /// Receiver refused the call before answering.
    Declined,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined)
    }

    pub fn can_answer(&self) -> bool {
        matches!(self, Self::Calling)
    }

    pub fn can_decline(&self) -> bool {
        matches!(self, Self::Calling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calling => "calling",
            Self::Answered => "answered",
            Self::Ended => "ended",
            Self::Declined => "declined",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move a session between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// The receiver's answer became visible.
    AnswerObserved,
    /// The receiver refused the call.
    Declined,
    /// Local or remote hang-up.
    Ended,
    /// Transport failure, timeout or a fatal protocol error.
    Failed,
}

impl CallStatus {
    /// Compute the status reached by applying `transition`.
    ///
    /// Terminal statuses accept no transition at all.
    pub fn apply(self, transition: CallTransition) -> Result<CallStatus, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Calling, CallTransition::AnswerObserved) => Self::Answered,
            (Self::Calling, CallTransition::Declined) => Self::Declined,
            (Self::Calling | Self::Answered, CallTransition::Ended | CallTransition::Failed) => {
                Self::Ended
            }
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_state: current.to_string(),
                    attempted: format!("{:?}", attempted),
                });
            }
        };
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
