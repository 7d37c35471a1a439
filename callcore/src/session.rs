//! The durable call record and the field-level rules guarding it.

use crate::candidate::{CandidateRecord, IceCandidate};
use crate::description::SessionDescription;
use crate::error::SignalingError;
use crate::state::CallStatus;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, immutable session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 128 random bits, upper-case hex.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end of the call a party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyRole {
    Caller,
    Receiver,
}

impl PartyRole {
    pub fn peer(&self) -> PartyRole {
        match self {
            Self::Caller => Self::Receiver,
            Self::Receiver => Self::Caller,
        }
    }
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => f.write_str("caller"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Fixed at creation; decides whether a camera is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Voice,
    Video,
}

impl MediaKind {
    pub fn wants_camera(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Fields the caller supplies when persisting a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCallSession {
    pub caller_id: String,
    pub receiver_id: String,
    pub media_kind: MediaKind,
    pub offer: SessionDescription,
}

/// Partial update merged into an existing session.
///
/// Only `answer`, `status` and `end_time` are writable after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl SessionUpdate {
    pub fn answered(answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
            status: Some(CallStatus::Answered),
            end_time: None,
        }
    }

    pub fn ended(at: DateTime<Utc>) -> Self {
        Self {
            answer: None,
            status: Some(CallStatus::Ended),
            end_time: Some(at),
        }
    }

    pub fn declined() -> Self {
        Self {
            answer: None,
            status: Some(CallStatus::Declined),
            end_time: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.answer.is_none() && self.status.is_none() && self.end_time.is_none()
    }
}

/// The single durable record of a call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: SessionId,
    pub caller_id: String,
    pub receiver_id: String,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub candidates: Vec<CandidateRecord>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn create(id: SessionId, new: NewCallSession) -> Self {
        Self {
            id,
            caller_id: new.caller_id,
            receiver_id: new.receiver_id,
            media_kind: new.media_kind,
            status: CallStatus::Calling,
            offer: Some(new.offer),
            answer: None,
            candidates: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// True if this session and `(a, b)` share the same unordered party pair.
    pub fn involves_pair(&self, a: &str, b: &str) -> bool {
        (self.caller_id == a && self.receiver_id == b)
            || (self.caller_id == b && self.receiver_id == a)
    }

    pub fn role_of(&self, party_id: &str) -> Option<PartyRole> {
        if self.caller_id == party_id {
            Some(PartyRole::Caller)
        } else if self.receiver_id == party_id {
            Some(PartyRole::Receiver)
        } else {
            None
        }
    }

    /// Merge `update`, enforcing the record's write rules.
    ///
    /// On error the record is left untouched.
    pub fn merge(&mut self, update: &SessionUpdate) -> Result<(), SignalingError> {
        if update.is_empty() {
            return Err(SignalingError::Rejected("empty update".into()));
        }
        if self.status.is_terminal() {
            return Err(SignalingError::Rejected(format!(
                "session {} is {}",
                self.id, self.status
            )));
        }
        if let Some(answer) = &update.answer {
            if self.answer.is_some() {
                return Err(SignalingError::Rejected("answer already set".into()));
            }
            if self.offer.is_none() {
                return Err(SignalingError::Rejected("answer without offer".into()));
            }
            if !answer.is_answer() {
                return Err(SignalingError::Rejected(
                    "answer field must hold an answer".into(),
                ));
            }
            if update.status != Some(CallStatus::Answered) {
                return Err(SignalingError::Rejected(
                    "an answer must move the session to answered".into(),
                ));
            }
        }
        if let Some(status) = update.status {
            let answer_present = self.answer.is_some() || update.answer.is_some();
            if status == CallStatus::Answered && !answer_present {
                return Err(SignalingError::Rejected(
                    "answered status requires an answer".into(),
                ));
            }
            if status == CallStatus::Calling && self.status != CallStatus::Calling {
                return Err(SignalingError::Rejected(format!(
                    "cannot move from {} back to calling",
                    self.status
                )));
            }
            if status == CallStatus::Declined && self.status != CallStatus::Calling {
                return Err(SignalingError::Rejected(format!(
                    "cannot decline a session that is {}",
                    self.status
                )));
            }
        }
        if update.end_time.is_some() && update.status != Some(CallStatus::Ended) {
            return Err(SignalingError::Rejected(
                "endTime is only set together with the ended status".into(),
            ));
        }

        if let Some(answer) = &update.answer {
            self.answer = Some(answer.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
            if status == CallStatus::Ended {
                self.end_time = Some(update.end_time.unwrap_or_else(Utc::now));
            }
        }
        Ok(())
    }

    /// Append a candidate at the next sequence number.
    pub fn append_candidate(
        &mut self,
        origin: PartyRole,
        candidate: IceCandidate,
    ) -> Result<CandidateRecord, SignalingError> {
        if self.status.is_terminal() {
            return Err(SignalingError::Rejected(format!(
                "session {} is {}",
                self.id, self.status
            )));
        }
        let record = CandidateRecord {
            seq: self.candidates.len() as u64,
            origin,
            candidate,
        };
        self.candidates.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session() -> CallSession {
        CallSession::create(
            SessionId::new("AC90CFD09DF712D981142B172706F9F2"),
            NewCallSession {
                caller_id: "alice".into(),
                receiver_id: "bob".into(),
                media_kind: MediaKind::Video,
                offer: SessionDescription::offer("v=0\r\n"),
            },
        )
    }

    #[test]
    fn test_generated_ids_are_distinct_hex() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_session_is_calling_with_offer() {
        let session = make_session();
        assert_eq!(session.status, CallStatus::Calling);
        assert!(session.offer.is_some());
        assert!(session.answer.is_none());
        assert!(session.end_time.is_none());
        assert_eq!(session.role_of("bob"), Some(PartyRole::Receiver));
        assert!(session.involves_pair("bob", "alice"));
    }

    #[test]
    fn test_answer_is_write_once() {
        let mut session = make_session();
        session
            .merge(&SessionUpdate::answered(SessionDescription::answer("v=0 a")))
            .unwrap();
        assert_eq!(session.status, CallStatus::Answered);

        let err = session
            .merge(&SessionUpdate {
                answer: Some(SessionDescription::answer("v=0 b")),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, SignalingError::Rejected(_)));
        assert_eq!(session.answer.unwrap().sdp, "v=0 a");
    }

    #[test]
    fn test_answered_status_requires_answer() {
        let mut session = make_session();
        let update = SessionUpdate {
            status: Some(CallStatus::Answered),
            ..Default::default()
        };
        assert!(session.merge(&update).is_err());
        assert_eq!(session.status, CallStatus::Calling);
    }

    #[test]
    fn test_answer_without_answered_status_rejected() {
        let mut session = make_session();
        let err = session
            .merge(&SessionUpdate {
                answer: Some(SessionDescription::answer("v=0 a")),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, SignalingError::Rejected(_)));
        assert_eq!(session.status, CallStatus::Calling);
        assert!(session.answer.is_none());

        let err = session
            .merge(&SessionUpdate {
                answer: Some(SessionDescription::answer("v=0 a")),
                status: Some(CallStatus::Ended),
                end_time: None,
            })
            .unwrap_err();
        assert!(matches!(err, SignalingError::Rejected(_)));
        assert!(session.answer.is_none());
        assert_eq!(session.status, CallStatus::Calling);
    }

    #[test]
    fn test_empty_update_rejected() {
        let mut session = make_session();
        assert!(SessionUpdate::default().is_empty());
        assert!(session.merge(&SessionUpdate::default()).is_err());
        assert_eq!(session.status, CallStatus::Calling);
    }

    #[test]
    fn test_peer_role_is_the_other_end() {
        assert_eq!(PartyRole::Caller.peer(), PartyRole::Receiver);
        assert_eq!(PartyRole::Receiver.peer(), PartyRole::Caller);
    }

    #[test]
    fn test_ended_sets_end_time_and_freezes_record() {
        let mut session = make_session();
        session.merge(&SessionUpdate::ended(Utc::now())).unwrap();
        assert_eq!(session.status, CallStatus::Ended);
        assert!(session.end_time.is_some());

        assert!(session.merge(&SessionUpdate::declined()).is_err());
        assert!(
            session
                .append_candidate(PartyRole::Caller, IceCandidate::new("candidate:1"))
                .is_err()
        );
    }

    #[test]
    fn test_decline_after_answer_rejected() {
        let mut session = make_session();
        session
            .merge(&SessionUpdate::answered(SessionDescription::answer("v=0")))
            .unwrap();
        assert!(session.merge(&SessionUpdate::declined()).is_err());
    }

    #[test]
    fn test_candidates_get_sequential_numbers() {
        let mut session = make_session();
        let first = session
            .append_candidate(PartyRole::Caller, IceCandidate::new("candidate:a"))
            .unwrap();
        let second = session
            .append_candidate(PartyRole::Receiver, IceCandidate::new("candidate:b"))
            .unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(session.candidates.len(), 2);
    }
}
