//! In-process peer connection.
//!
//! Produces well-formed SDP and host (plus server-reflexive, when STUN servers
//! are configured) candidates, and reports `Connected` once both descriptions
//! are set and at least one remote candidate has been applied. No packets are
//! sent; this backend exists so the signaling core can run end to end without
//! a platform media stack.

use super::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent};
use crate::config::IceServer;
use async_trait::async_trait;
use callcore::{IceCandidate, SdpType, SessionDescription, TrackInfo, TrackKind};
use log::{debug, trace, warn};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

#[derive(Default)]
struct FactoryShared {
    created: AtomicUsize,
    open: AtomicUsize,
    fail_descriptions: AtomicBool,
    connectivity_broken: AtomicBool,
    connectivity_stalled: AtomicBool,
    applied: Mutex<HashMap<usize, Vec<IceCandidate>>>,
}

impl FactoryShared {
    fn record_applied(&self, index: usize, candidate: &IceCandidate) {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        applied.entry(index).or_default().push(candidate.clone());
    }
}

/// Creates [`LoopbackPeerConnection`]s and keeps counters for inspection.
#[derive(Clone, Default)]
pub struct LoopbackPeerFactory {
    shared: Arc<FactoryShared>,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections created and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn created_connections(&self) -> usize {
        self.shared.created.load(Ordering::Acquire)
    }

    /// Make offer/answer generation fail on every connection.
    pub fn fail_descriptions(&self, fail: bool) {
        self.shared.fail_descriptions.store(fail, Ordering::Release);
    }

    /// Connections that would otherwise connect report `Failed` instead.
    pub fn break_connectivity(&self, broken: bool) {
        self.shared
            .connectivity_broken
            .store(broken, Ordering::Release);
    }

    /// Connections stay `Connecting` forever, as if no candidate pair ever
    /// answered its checks.
    pub fn stall_connectivity(&self, stalled: bool) {
        self.shared
            .connectivity_stalled
            .store(stalled, Ordering::Release);
    }

    /// Remote candidates applied by the `index`-th created connection, in order.
    pub fn applied_candidates(&self, index: usize) -> Vec<IceCandidate> {
        let applied = self.shared.applied.lock().unwrap_or_else(|e| e.into_inner());
        applied.get(&index).cloned().unwrap_or_default()
    }
}

impl PeerConnectionFactory for LoopbackPeerFactory {
    fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        let index = self.shared.created.fetch_add(1, Ordering::AcqRel);
        self.shared.open.fetch_add(1, Ordering::AcqRel);
        let has_stun = ice_servers
            .iter()
            .flat_map(|s| s.urls.iter())
            .any(|u| u.starts_with("stun:") || u.starts_with("turn:"));
        Ok(Box::new(LoopbackPeerConnection {
            index,
            has_stun,
            events,
            shared: self.shared.clone(),
            state: AsyncMutex::new(ConnectionState::new()),
        }))
    }
}

struct ConnectionState {
    tracks: Vec<TrackInfo>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    status: PeerConnectionState,
    ufrag: String,
    pwd: String,
    session_version: u64,
}

impl ConnectionState {
    fn new() -> Self {
        let mut rng = rand::rng();
        Self {
            tracks: Vec::new(),
            local: None,
            remote: None,
            remote_candidates: 0,
            status: PeerConnectionState::New,
            ufrag: random_token(4),
            pwd: random_token(24),
            session_version: rng.random_range(1_000_000..u32::MAX as u64),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub struct LoopbackPeerConnection {
    index: usize,
    has_stun: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
    shared: Arc<FactoryShared>,
    state: AsyncMutex<ConnectionState>,
}

impl LoopbackPeerConnection {
    fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            debug!("Peer event receiver dropped (connection {})", self.index);
        }
    }

    fn set_status(&self, state: &mut ConnectionState, status: PeerConnectionState) {
        if state.status != status {
            state.status = status;
            self.emit(PeerEvent::StateChanged(status));
        }
    }

    fn check_connected(&self, state: &mut ConnectionState) {
        let ready = state.local.is_some() && state.remote.is_some() && state.remote_candidates > 0;
        if !ready || state.status != PeerConnectionState::Connecting {
            return;
        }
        if self.shared.connectivity_stalled.load(Ordering::Acquire) {
            trace!("Loopback connection {} still checking", self.index);
            return;
        }
        if self.shared.connectivity_broken.load(Ordering::Acquire) {
            warn!("Loopback connection {} failed ICE checks", self.index);
            self.set_status(state, PeerConnectionState::Failed);
        } else {
            self.set_status(state, PeerConnectionState::Connected);
        }
    }

    fn build_sdp(&self, state: &ConnectionState) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            state.session_version
        );
        let mids: Vec<String> = (0..state.tracks.len()).map(|i| i.to_string()).collect();
        sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));
        for (mid, track) in state.tracks.iter().enumerate() {
            let (media, rtpmap) = match track.kind {
                TrackKind::Audio => ("audio", "111 opus/48000/2"),
                TrackKind::Video => ("video", "96 VP8/90000"),
            };
            let payload = rtpmap.split(' ').next().unwrap_or_default();
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF {payload}\r\n\
                 c=IN IP4 0.0.0.0\r\n\
                 a=mid:{mid}\r\n\
                 a=ice-ufrag:{}\r\n\
                 a=ice-pwd:{}\r\n\
                 a=msid:- {}\r\n\
                 a=sendrecv\r\n\
                 a=rtpmap:{rtpmap}\r\n",
                state.ufrag, state.pwd, track.id
            ));
        }
        sdp
    }

    fn local_candidates(&self, state: &ConnectionState) -> Vec<IceCandidate> {
        let mut candidates = Vec::new();
        for mid in 0..state.tracks.len() {
            let port = 50_000 + (self.index as u16 % 100) * 10 + mid as u16;
            candidates.push(
                IceCandidate::new(format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {port} typ host",
                    mid + 1
                ))
                .with_sdp_mid(mid.to_string())
                .with_sdp_m_line_index(mid as u16)
                .with_username_fragment(state.ufrag.clone()),
            );
            if self.has_stun {
                candidates.push(
                    IceCandidate::new(format!(
                        "candidate:{} 1 udp 1686052607 203.0.113.{} {port} typ srflx raddr 127.0.0.1 rport {port}",
                        mid + 11,
                        self.index % 250 + 1
                    ))
                    .with_sdp_mid(mid.to_string())
                    .with_sdp_m_line_index(mid as u16)
                    .with_username_fragment(state.ufrag.clone()),
                );
            }
        }
        candidates
    }

    fn generate(&self, state: &ConnectionState, sdp_type: SdpType) -> Result<SessionDescription, PeerError> {
        if state.status == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        if self.shared.fail_descriptions.load(Ordering::Acquire) {
            return Err(PeerError::Generation("codec negotiation failed".into()));
        }
        if state.tracks.is_empty() {
            return Err(PeerError::Generation("no tracks attached".into()));
        }
        Ok(SessionDescription {
            sdp_type,
            sdp: self.build_sdp(state),
        })
    }
}

/// Remote tracks announced by `m=` sections, paired with their `a=msid` ids.
fn remote_tracks(sdp: &str) -> Vec<TrackInfo> {
    let mut tracks: Vec<TrackInfo> = Vec::new();
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            let kind = if rest.starts_with("video") {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            tracks.push(TrackInfo {
                id: format!("remote-{}", tracks.len()),
                kind,
                label: format!("remote {:?}", kind).to_lowercase(),
            });
        } else if let Some(msid) = line.strip_prefix("a=msid:")
            && let Some(track) = tracks.last_mut()
            && let Some(id) = msid.split_whitespace().nth(1)
        {
            track.id = id.to_string();
        }
    }
    tracks
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn add_track(&self, track: &TrackInfo) -> Result<(), PeerError> {
        let mut state = self.state.lock().await;
        if state.status == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock().await;
        self.generate(&state, SdpType::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock().await;
        match &state.remote {
            Some(remote) if remote.is_offer() => self.generate(&state, SdpType::Answer),
            Some(_) => Err(PeerError::InvalidDescription(
                "remote description is not an offer".into(),
            )),
            None => Err(PeerError::NoRemoteDescription),
        }
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock().await;
        if state.status == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        if state.local.is_some() {
            return Err(PeerError::InvalidDescription(
                "local description already set".into(),
            ));
        }
        state.local = Some(desc.clone());
        self.set_status(&mut state, PeerConnectionState::Connecting);
        for candidate in self.local_candidates(&state) {
            self.emit(PeerEvent::LocalCandidate(candidate));
        }
        self.check_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock().await;
        if state.status == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(PeerError::InvalidDescription("missing version line".into()));
        }
        if state.remote.is_some() {
            return Err(PeerError::InvalidDescription(
                "remote description already set".into(),
            ));
        }
        let expected = match &state.local {
            Some(local) if local.is_offer() => SdpType::Answer,
            Some(_) => {
                return Err(PeerError::InvalidDescription(
                    "answer already applied locally".into(),
                ));
            }
            None => SdpType::Offer,
        };
        if desc.sdp_type != expected {
            return Err(PeerError::InvalidDescription(format!(
                "expected {:?}, got {:?}",
                expected, desc.sdp_type
            )));
        }
        state.remote = Some(desc.clone());
        for track in remote_tracks(&desc.sdp) {
            self.emit(PeerEvent::RemoteTrack(track));
        }
        self.check_connected(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock().await;
        if state.status == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        if state.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        if !candidate.candidate.trim_start().starts_with("candidate:") {
            return Err(PeerError::InvalidCandidate(candidate.candidate.clone()));
        }
        state.remote_candidates += 1;
        self.shared.record_applied(self.index, candidate);
        self.check_connected(&mut state);
        Ok(())
    }

    async fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().await.status
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.status == PeerConnectionState::Closed {
            return;
        }
        self.set_status(&mut state, PeerConnectionState::Closed);
        self.shared.open.fetch_sub(1, Ordering::AcqRel);
        debug!("Loopback connection {} closed", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_track() -> TrackInfo {
        TrackInfo {
            id: "mic-1".into(),
            kind: TrackKind::Audio,
            label: "mic".into(),
        }
    }

    fn create(factory: &LoopbackPeerFactory) -> (Box<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = factory
            .create(&[IceServer::stun("stun:stun.example.org")], tx)
            .unwrap();
        (pc, rx)
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let factory = LoopbackPeerFactory::new();
        let (caller, mut caller_events) = create(&factory);
        let (callee, _callee_events) = create(&factory);

        caller.add_track(&audio_track()).await.unwrap();
        callee.add_track(&audio_track()).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        caller.set_local_description(&offer).await.unwrap();

        callee.set_remote_description(&offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(&answer).await.unwrap();
        caller.set_remote_description(&answer).await.unwrap();

        assert_eq!(caller.connection_state().await, PeerConnectionState::Connecting);
        caller
            .add_ice_candidate(&IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 1 typ host"))
            .await
            .unwrap();
        assert_eq!(caller.connection_state().await, PeerConnectionState::Connected);

        let mut saw_host = false;
        let mut saw_srflx = false;
        while let Ok(event) = caller_events.try_recv() {
            if let PeerEvent::LocalCandidate(c) = event {
                saw_host |= c.candidate.contains("typ host");
                saw_srflx |= c.candidate.contains("typ srflx");
            }
        }
        assert!(saw_host && saw_srflx);
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_rejected() {
        let factory = LoopbackPeerFactory::new();
        let (pc, _events) = create(&factory);
        let err = pc
            .add_ice_candidate(&IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert_eq!(err, PeerError::NoRemoteDescription);
    }

    #[tokio::test]
    async fn test_remote_tracks_reported_from_sdp() {
        let factory = LoopbackPeerFactory::new();
        let (pc, mut events) = create(&factory);
        let offer = SessionDescription::offer(
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:- far-mic\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
        );
        pc.set_remote_description(&offer).await.unwrap();

        let mut tracks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PeerEvent::RemoteTrack(track) = event {
                tracks.push(track);
            }
        }
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].id, "far-mic");
        assert_eq!(tracks[1].kind, TrackKind::Video);
    }

    #[tokio::test]
    async fn test_stalled_connectivity_stays_connecting() {
        let factory = LoopbackPeerFactory::new();
        factory.stall_connectivity(true);
        let (caller, _caller_events) = create(&factory);
        let (callee, _callee_events) = create(&factory);
        caller.add_track(&audio_track()).await.unwrap();
        callee.add_track(&audio_track()).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(&offer).await.unwrap();
        callee.set_remote_description(&offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(&answer).await.unwrap();
        caller.set_remote_description(&answer).await.unwrap();
        caller
            .add_ice_candidate(&IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 1 typ host"))
            .await
            .unwrap();
        assert_eq!(caller.connection_state().await, PeerConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = LoopbackPeerFactory::new();
        let (pc, _events) = create(&factory);
        assert_eq!(factory.open_connections(), 1);
        pc.close().await;
        pc.close().await;
        assert_eq!(factory.open_connections(), 0);
        assert_eq!(pc.create_offer().await.unwrap_err(), PeerError::Closed);
    }
}
