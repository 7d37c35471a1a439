//! Call-related error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by signaling channel implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling channel unavailable: {0}")]
    Unavailable(String),

    #[error("an active session already exists between {caller_id} and {receiver_id}")]
    DuplicateActiveSession {
        caller_id: String,
        receiver_id: String,
    },

    #[error("session not found: {0}")]
    NotFound(String),

    /// The write broke one of the record's rules (write-once fields, terminal status).
    #[error("write rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("media permission denied: {0}")]
    MediaPermissionDenied(String),

    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("remote description already set")]
    AlreadyNegotiated,

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("an active session already exists between {caller_id} and {receiver_id}")]
    DuplicateActiveSession {
        caller_id: String,
        receiver_id: String,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("call attempt cancelled")]
    Cancelled,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),
}

/// Copyable discriminant of [`CallError`], carried in reported events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallErrorKind {
    MediaPermissionDenied,
    MediaUnavailable,
    NegotiationFailed,
    InvalidState,
    AlreadyNegotiated,
    SignalingUnavailable,
    DuplicateActiveSession,
    SessionNotFound,
    Timeout,
    TransportFailed,
    Cancelled,
}

impl CallError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            Self::MediaPermissionDenied(_) => CallErrorKind::MediaPermissionDenied,
            Self::MediaUnavailable(_) => CallErrorKind::MediaUnavailable,
            Self::NegotiationFailed(_) => CallErrorKind::NegotiationFailed,
            Self::InvalidState(_) | Self::InvalidTransition(_) => CallErrorKind::InvalidState,
            Self::AlreadyNegotiated => CallErrorKind::AlreadyNegotiated,
            Self::SignalingUnavailable(_) => CallErrorKind::SignalingUnavailable,
            Self::DuplicateActiveSession { .. } => CallErrorKind::DuplicateActiveSession,
            Self::SessionNotFound(_) => CallErrorKind::SessionNotFound,
            Self::Timeout(_) => CallErrorKind::Timeout,
            Self::TransportFailed(_) => CallErrorKind::TransportFailed,
            Self::Cancelled => CallErrorKind::Cancelled,
        }
    }

    /// Local device problems abort an attempt before anything is persisted.
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Self::MediaPermissionDenied(_) | Self::MediaUnavailable(_)
        )
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Unavailable(msg) => Self::SignalingUnavailable(msg),
            SignalingError::DuplicateActiveSession {
                caller_id,
                receiver_id,
            } => Self::DuplicateActiveSession {
                caller_id,
                receiver_id,
            },
            SignalingError::NotFound(id) => Self::SessionNotFound(id),
            SignalingError::Rejected(msg) => Self::InvalidState(msg),
        }
    }
}
