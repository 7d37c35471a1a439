//! Offer/answer production and consumption over one peer connection.

use super::media::LocalMediaHandle;
use super::peer::{PeerConnection, PeerConnectionState, PeerError};
use callcore::{CallError, IceCandidate, SessionDescription};
use log::{debug, info};

fn map_peer_error(err: PeerError) -> CallError {
    match err {
        PeerError::Closed => CallError::InvalidState("peer connection closed".into()),
        PeerError::NoRemoteDescription => {
            CallError::InvalidState("no remote description set".into())
        }
        PeerError::InvalidDescription(msg)
        | PeerError::Generation(msg)
        | PeerError::InvalidCandidate(msg) => CallError::NegotiationFailed(msg),
    }
}

/// Owns the peer connection of one call attempt and sequences its
/// description exchange.
pub struct SessionDescriptionNegotiator {
    peer: Box<dyn PeerConnection>,
    local: Option<SessionDescription>,
    remote_set: bool,
    answer_attempted: bool,
    closed: bool,
}

impl SessionDescriptionNegotiator {
    pub fn new(peer: Box<dyn PeerConnection>) -> Self {
        Self {
            peer,
            local: None,
            remote_set: false,
            answer_attempted: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.closed {
            return Err(CallError::InvalidState("negotiator closed".into()));
        }
        Ok(())
    }

    async fn attach(&self, handle: &LocalMediaHandle) -> Result<(), CallError> {
        for track in handle.tracks() {
            self.peer
                .add_track(track.info())
                .await
                .map_err(map_peer_error)?;
        }
        Ok(())
    }

    /// Attach local tracks to the connection and produce the offer.
    pub async fn create_offer(
        &mut self,
        handle: &LocalMediaHandle,
    ) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        if self.local.is_some() || self.answer_attempted {
            return Err(CallError::InvalidState(
                "local description already created".into(),
            ));
        }
        self.attach(handle).await?;
        let offer = self.peer.create_offer().await.map_err(map_peer_error)?;
        self.peer
            .set_local_description(&offer)
            .await
            .map_err(map_peer_error)?;
        debug!("Created offer ({} bytes)", offer.sdp.len());
        self.local = Some(offer.clone());
        Ok(offer)
    }

    /// Apply the caller's offer and produce an answer. Allowed once per connection.
    pub async fn accept_offer_and_create_answer(
        &mut self,
        offer: &SessionDescription,
        handle: &LocalMediaHandle,
    ) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        if self.answer_attempted || self.local.is_some() || self.remote_set {
            return Err(CallError::InvalidState(
                "offer already accepted on this connection".into(),
            ));
        }
        self.answer_attempted = true;
        if !offer.is_offer() {
            return Err(CallError::NegotiationFailed(
                "remote description is not an offer".into(),
            ));
        }

        self.peer
            .set_remote_description(offer)
            .await
            .map_err(map_peer_error)?;
        self.remote_set = true;
        self.attach(handle).await?;

        let answer = self.peer.create_answer().await.map_err(map_peer_error)?;
        self.peer
            .set_local_description(&answer)
            .await
            .map_err(map_peer_error)?;
        debug!("Created answer ({} bytes)", answer.sdp.len());
        self.local = Some(answer.clone());
        Ok(answer)
    }

    /// Apply the receiver's answer on the caller's connection.
    pub async fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), CallError> {
        self.ensure_open()?;
        match &self.local {
            Some(local) if local.is_offer() => {}
            _ => {
                return Err(CallError::InvalidState(
                    "no local offer to answer".into(),
                ));
            }
        }
        if self.remote_set {
            return Err(CallError::AlreadyNegotiated);
        }
        self.peer
            .set_remote_description(answer)
            .await
            .map_err(map_peer_error)?;
        self.remote_set = true;
        info!("Remote answer applied");
        Ok(())
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_set
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        self.ensure_open()?;
        self.peer
            .add_ice_candidate(candidate)
            .await
            .map_err(map_peer_error)
    }

    pub async fn connection_state(&self) -> PeerConnectionState {
        self.peer.connection_state().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tear down the transport. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.peer.close().await;
        debug!("Negotiator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::{MediaEndpoint, SimulatedDevices};
    use crate::calls::peer::{LoopbackPeerFactory, PeerConnectionFactory, PeerEvent};
    use crate::config::CallConfig;
    use callcore::MediaKind;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Fixture {
        factory: LoopbackPeerFactory,
        endpoint: MediaEndpoint,
        _events: Vec<mpsc::UnboundedReceiver<PeerEvent>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                factory: LoopbackPeerFactory::new(),
                endpoint: MediaEndpoint::new(Arc::new(SimulatedDevices::new())),
                _events: Vec::new(),
            }
        }

        fn negotiator(&mut self) -> SessionDescriptionNegotiator {
            let (tx, rx) = mpsc::unbounded_channel();
            self._events.push(rx);
            let peer = self
                .factory
                .create(&CallConfig::default().ice_servers, tx)
                .unwrap();
            SessionDescriptionNegotiator::new(peer)
        }
    }

    #[tokio::test]
    async fn test_offer_then_answer_then_second_answer_fails() {
        let mut fx = Fixture::new();
        let media = fx.endpoint.acquire(MediaKind::Video).await.unwrap();
        let mut caller = fx.negotiator();
        let mut receiver = fx.negotiator();

        let offer = caller.create_offer(&media).await.unwrap();
        assert!(offer.is_offer());
        assert!(offer.sdp.contains("m=video"));

        let answer = receiver
            .accept_offer_and_create_answer(&offer, &media)
            .await
            .unwrap();
        assert!(answer.is_answer());
        assert!(receiver.has_remote_description());

        caller.accept_answer(&answer).await.unwrap();
        assert!(caller.has_remote_description());

        let err = caller.accept_answer(&answer).await.unwrap_err();
        assert_eq!(err, CallError::AlreadyNegotiated);
    }

    #[tokio::test]
    async fn test_accept_answer_without_offer_is_invalid_state() {
        let mut fx = Fixture::new();
        let mut negotiator = fx.negotiator();
        let err = negotiator
            .accept_answer(&SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_second_accept_offer_is_invalid_state() {
        let mut fx = Fixture::new();
        let media = fx.endpoint.acquire(MediaKind::Voice).await.unwrap();
        let mut caller = fx.negotiator();
        let mut receiver = fx.negotiator();
        let offer = caller.create_offer(&media).await.unwrap();

        receiver
            .accept_offer_and_create_answer(&offer, &media)
            .await
            .unwrap();
        let err = receiver
            .accept_offer_and_create_answer(&offer, &media)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_generation_failure_is_negotiation_failed() {
        let mut fx = Fixture::new();
        fx.factory.fail_descriptions(true);
        let media = fx.endpoint.acquire(MediaKind::Voice).await.unwrap();
        let mut caller = fx.negotiator();

        let err = caller.create_offer(&media).await.unwrap_err();
        assert!(matches!(err, CallError::NegotiationFailed(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let mut fx = Fixture::new();
        let media = fx.endpoint.acquire(MediaKind::Voice).await.unwrap();
        let mut negotiator = fx.negotiator();

        negotiator.close().await;
        negotiator.close().await;
        assert!(negotiator.is_closed());
        assert_eq!(fx.factory.open_connections(), 0);
        assert!(negotiator.create_offer(&media).await.is_err());
    }
}
