//! Peer connection seam.
//!
//! The negotiator drives a [`PeerConnection`] the same way a browser drives
//! `RTCPeerConnection`: attach tracks, create and set descriptions, feed remote
//! candidates. Asynchronous outputs (local candidates, state changes, remote
//! tracks) are pushed as [`PeerEvent`]s into the channel handed to the factory.

mod loopback;

pub use loopback::{LoopbackPeerConnection, LoopbackPeerFactory};

use crate::config::IceServer;
use async_trait::async_trait;
use callcore::{IceCandidate, SessionDescription, TrackInfo};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack(TrackInfo),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer connection is closed")]
    Closed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("no remote description set")]
    NoRemoteDescription,
    #[error("description generation failed: {0}")]
    Generation(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &TrackInfo) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    async fn connection_state(&self) -> PeerConnectionState;
    /// Tear down the transport. Idempotent.
    async fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, PeerError>;
}
