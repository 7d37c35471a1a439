//! Peer-to-peer call negotiation over a store-and-forward signaling channel.
//!
//! # Architecture
//!
//! - [`MediaEndpoint`]: scoped acquisition and release of capture devices
//! - [`SessionDescriptionNegotiator`]: offer/answer over one [`PeerConnection`]
//! - [`CandidateRelay`]: trickled candidates, buffered until a remote description exists
//! - [`SignalingChannel`]: the external session store, with an in-memory implementation
//! - [`CallSessionStateMachine`]: one actor per call attempt, driven through a [`CallHandle`]
//! - [`CallManager`]: registry of one party's attempts
//!
//! # Flow
//!
//! The caller acquires media, creates an offer and persists it in a new
//! session, then subscribes to that session. The receiver reads the offer,
//! persists an answer and subscribes as well. Both sides trickle candidates
//! through the session until their peer connection reports connected.

mod handle;
mod machine;
mod manager;
mod negotiator;
mod relay;

pub mod media;
pub mod peer;
pub mod signaling;

pub use handle::{CallHandle, CallSnapshot};
pub use machine::{CallContext, CallSessionStateMachine};
pub use manager::CallManager;
pub use media::{CaptureDevices, LocalMediaHandle, MediaEndpoint, MediaTrack, SimulatedDevices};
pub use negotiator::SessionDescriptionNegotiator;
pub use peer::{
    LoopbackPeerFactory, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
};
pub use relay::{CandidateRelay, RemoteCandidateOutcome};
pub use signaling::{InMemorySignalingChannel, SignalingChannel, Subscription};
