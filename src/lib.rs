//! Peer-to-peer call session negotiation and signaling relay.
//!
//! Core data model and protocol rules live in `callcore`; this crate adds the
//! tokio runtime pieces: media acquisition, peer connections, the candidate
//! relay, the signaling channel and the per-call actor.

pub use callcore::{
    CallError, CallErrorKind, CallEvent, CallSession, CallStatus, CandidateRecord, IceCandidate,
    MediaKind, PartyRole, SessionChange, SessionDescription, SessionId, SessionUpdate,
    SignalingError, TrackInfo, TrackKind,
};

pub mod calls;
pub mod config;

pub use config::{CallConfig, IceServer};
