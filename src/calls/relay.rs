//! Trickle relay of network-reachability candidates.

use super::negotiator::SessionDescriptionNegotiator;
use super::signaling::SignalingChannel;
use callcore::{CallError, IceCandidate, PartyRole, SessionId};
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened to a candidate observed from the remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCandidateOutcome {
    Applied,
    /// Held until the remote description is set.
    Buffered,
    /// Same descriptor seen before; ignored.
    Duplicate,
    /// The peer connection refused it; ignored.
    Rejected,
}

/// Relays local candidates to the signaling channel and feeds remote ones
/// into the negotiator, buffering them until a remote description exists.
///
/// Local candidates are written by a single writer task, so the channel sees
/// them in the order they were produced.
pub struct CandidateRelay {
    session_id: SessionId,
    local_role: PartyRole,
    outbound: Option<mpsc::UnboundedSender<IceCandidate>>,
    writer: Option<JoinHandle<()>>,
    buffered: VecDeque<IceCandidate>,
    seen: HashSet<String>,
    flushed: bool,
}

impl CandidateRelay {
    /// Start relaying for `session_id`. Write failures are reported on `failures`
    /// and stop the writer.
    pub fn start(
        channel: Arc<dyn SignalingChannel>,
        session_id: SessionId,
        local_role: PartyRole,
        failures: mpsc::UnboundedSender<CallError>,
    ) -> Self {
        let (outbound, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
        let writer_session = session_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                match channel
                    .append_candidate(&writer_session, local_role, candidate)
                    .await
                {
                    Ok(seq) => debug!("Relayed local candidate #{} for {}", seq, writer_session),
                    Err(e) => {
                        warn!("Failed to relay candidate for {}: {}", writer_session, e);
                        let _ = failures.send(e.into());
                        break;
                    }
                }
            }
        });

        Self {
            session_id,
            local_role,
            outbound: Some(outbound),
            writer: Some(writer),
            buffered: VecDeque::new(),
            seen: HashSet::new(),
            flushed: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn local_role(&self) -> PartyRole {
        self.local_role
    }

    /// Queue a locally produced candidate for broadcast. Never waits on the channel.
    pub fn submit_local(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| CallError::InvalidState("candidate relay stopped".into()))?;
        outbound
            .send(candidate)
            .map_err(|_| CallError::SignalingUnavailable("candidate writer stopped".into()))
    }

    /// Apply `candidate` now if the remote description is set, otherwise buffer it.
    pub async fn on_remote(
        &mut self,
        candidate: IceCandidate,
        negotiator: &SessionDescriptionNegotiator,
    ) -> RemoteCandidateOutcome {
        if !self.seen.insert(candidate.dedupe_key()) {
            debug!("Ignoring duplicate remote candidate {}", candidate.candidate);
            return RemoteCandidateOutcome::Duplicate;
        }
        if !(self.flushed && negotiator.has_remote_description()) {
            self.buffered.push_back(candidate);
            return RemoteCandidateOutcome::Buffered;
        }
        Self::apply(&candidate, negotiator).await
    }

    /// Apply every buffered candidate in arrival order, then clear the buffer.
    ///
    /// Must be called once, right after the remote description is set.
    pub async fn flush_buffered(
        &mut self,
        negotiator: &SessionDescriptionNegotiator,
    ) -> Result<usize, CallError> {
        if self.flushed {
            return Err(CallError::InvalidState(
                "buffered candidates already flushed".into(),
            ));
        }
        if !negotiator.has_remote_description() {
            return Err(CallError::InvalidState(
                "cannot flush candidates before the remote description".into(),
            ));
        }
        self.flushed = true;

        let mut applied = 0;
        while let Some(candidate) = self.buffered.pop_front() {
            if Self::apply(&candidate, negotiator).await == RemoteCandidateOutcome::Applied {
                applied += 1;
            }
        }
        debug!(
            "Flushed {} buffered candidate(s) for {}",
            applied, self.session_id
        );
        Ok(applied)
    }

    async fn apply(
        candidate: &IceCandidate,
        negotiator: &SessionDescriptionNegotiator,
    ) -> RemoteCandidateOutcome {
        match negotiator.add_remote_candidate(candidate).await {
            Ok(()) => RemoteCandidateOutcome::Applied,
            Err(e) => {
                warn!("Remote candidate {} ignored: {}", candidate.candidate, e);
                RemoteCandidateOutcome::Rejected
            }
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Stop relaying. Candidates not yet written are discarded.
    pub fn shutdown(&mut self) {
        self.outbound = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

impl Drop for CandidateRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}
