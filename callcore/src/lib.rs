//! Platform-agnostic data model for peer-to-peer call negotiation.
//!
//! This crate holds the durable call record, its status machine, the
//! negotiation blobs exchanged through the signaling channel and the error
//! taxonomy. It has no async runtime dependency; the `callrelay` crate builds
//! the media, negotiation and actor layers on top of it.

pub mod candidate;
pub mod description;
pub mod error;
pub mod events;
pub mod session;
pub mod state;

pub use candidate::{CandidateRecord, CandidateType, IceCandidate};
pub use description::{SdpType, SessionDescription};
pub use error::{CallError, CallErrorKind, SignalingError};
pub use events::{CallEvent, SessionChange, TrackInfo, TrackKind};
pub use session::{CallSession, MediaKind, NewCallSession, PartyRole, SessionId, SessionUpdate};
pub use state::{CallStatus, CallTransition, InvalidTransition};
