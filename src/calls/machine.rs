//! Per-attempt call actor.
//!
//! One [`CallSessionStateMachine`] drives one call attempt from either side.
//! Local commands, remote session changes, peer connection events and
//! timeouts are all consumed by a single task, so two transitions of the
//! same session never interleave. Every exit path goes through
//! [`CallSessionStateMachine::finish`], which releases media, closes the
//! transport and unsubscribes exactly once.

use super::handle::{CallHandle, CallSnapshot};
use super::media::{LocalMediaHandle, MediaEndpoint};
use super::negotiator::SessionDescriptionNegotiator;
use super::peer::{PeerConnectionFactory, PeerConnectionState, PeerEvent};
use super::relay::CandidateRelay;
use super::signaling::{SignalingChannel, Subscription};
use crate::config::CallConfig;
use callcore::{
    CallError, CallErrorKind, CallEvent, CallStatus, CallTransition, MediaKind, NewCallSession,
    PartyRole, SessionChange, SessionDescription, SessionId, SessionUpdate, TrackInfo,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Collaborators shared by every call attempt of one party.
#[derive(Clone)]
pub struct CallContext {
    pub config: Arc<CallConfig>,
    pub channel: Arc<dyn SignalingChannel>,
    pub media: MediaEndpoint,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

impl CallContext {
    pub fn new(
        config: CallConfig,
        channel: Arc<dyn SignalingChannel>,
        media: MediaEndpoint,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            channel,
            media,
            peers,
        }
    }
}

pub(crate) enum CallCommand {
    Start {
        caller_id: String,
        receiver_id: String,
        media_kind: MediaKind,
        reply: oneshot::Sender<Result<SessionId, CallError>>,
    },
    Answer {
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<CallStatus, CallError>>,
    },
    Decline {
        reply: oneshot::Sender<Result<CallStatus, CallError>>,
    },
}

pub struct CallSessionStateMachine {
    ctx: CallContext,
    commands: mpsc::Receiver<CallCommand>,
    /// Terminal status requested by a handle while a command may be in flight.
    abort: Arc<watch::Sender<Option<CallStatus>>>,
    state_tx: watch::Sender<CallSnapshot>,
    events: mpsc::UnboundedSender<CallEvent>,

    session_id: Option<SessionId>,
    role: Option<PartyRole>,
    media_kind: Option<MediaKind>,
    status: Option<CallStatus>,
    end_time: Option<DateTime<Utc>>,
    last_error: Option<CallErrorKind>,
    /// Set once this side has written to the session record.
    wrote_record: bool,
    connected: bool,
    deadline: Option<Instant>,
    remote_tracks: Vec<TrackInfo>,

    local_media: Option<LocalMediaHandle>,
    negotiator: Option<SessionDescriptionNegotiator>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    relay: Option<CandidateRelay>,
    relay_failures_tx: mpsc::UnboundedSender<CallError>,
    relay_failures: mpsc::UnboundedReceiver<CallError>,
    subscription: Option<Subscription>,
}

async fn next_change(subscription: &mut Option<Subscription>) -> Option<SessionChange> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => pending().await,
    }
}

async fn next_peer_event(events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

/// Whether a pending request cancels the in-flight step of a party in `role`.
/// A decline only concerns a receiver that has not answered yet.
fn abort_applies(requested: Option<CallStatus>, role: Option<PartyRole>) -> bool {
    match requested {
        Some(CallStatus::Ended) => true,
        Some(CallStatus::Declined) => role == Some(PartyRole::Receiver),
        _ => false,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}

impl CallSessionStateMachine {
    /// Spawn an idle call actor. It does nothing until the returned handle
    /// starts or answers a call.
    pub fn spawn(ctx: CallContext, events: mpsc::UnboundedSender<CallEvent>) -> CallHandle {
        let (command_tx, commands) = mpsc::channel(ctx.config.command_buffer.max(1));
        let abort = Arc::new(watch::channel(None).0);
        let (state_tx, state_rx) = watch::channel(CallSnapshot::default());
        let (relay_failures_tx, relay_failures) = mpsc::unbounded_channel();

        let machine = Self {
            ctx,
            commands,
            abort: abort.clone(),
            state_tx,
            events,
            session_id: None,
            role: None,
            media_kind: None,
            status: None,
            end_time: None,
            last_error: None,
            wrote_record: false,
            connected: false,
            deadline: None,
            remote_tracks: Vec::new(),
            local_media: None,
            negotiator: None,
            peer_events: None,
            relay: None,
            relay_failures_tx,
            relay_failures,
            subscription: None,
        };
        tokio::spawn(machine.run());
        CallHandle::new(command_tx, abort, state_rx)
    }

    async fn run(mut self) {
        debug!("Call actor started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        if self.role.is_some() {
                            info!("All handles dropped, ending call");
                            self.finish(CallTransition::Ended, None, true).await;
                        }
                        break;
                    }
                },
                change = next_change(&mut self.subscription) => self.on_remote_change(change).await,
                event = next_peer_event(&mut self.peer_events) => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => self.peer_events = None,
                },
                Some(err) = self.relay_failures.recv() => self.fail(err).await,
                _ = sleep_until(self.deadline) => self.on_deadline().await,
            }
            if self.is_terminal() {
                break;
            }
        }
        debug!("Call actor for {:?} stopped", self.session_id);
    }

    fn is_terminal(&self) -> bool {
        self.status.is_some_and(|s| s.is_terminal())
    }

    async fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Start {
                caller_id,
                receiver_id,
                media_kind,
                reply,
            } => {
                let result = self.start(caller_id, receiver_id, media_kind).await;
                if reply.send(result).is_err() {
                    debug!("Start caller went away before the reply");
                }
            }
            CallCommand::Answer { session_id, reply } => {
                let result = self.answer(session_id).await;
                if reply.send(result).is_err() {
                    debug!("Answer caller went away before the reply");
                }
            }
            CallCommand::End { reply } => {
                let _ = reply.send(self.end().await);
            }
            CallCommand::Decline { reply } => {
                let _ = reply.send(self.decline().await);
            }
        }
    }

    async fn start(
        &mut self,
        caller_id: String,
        receiver_id: String,
        media_kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        if self.role.is_some() {
            return Err(CallError::InvalidState("call already in progress".into()));
        }
        self.role = Some(PartyRole::Caller);
        self.media_kind = Some(media_kind);
        self.publish();
        info!(
            "Starting {:?} call {} -> {}",
            media_kind, caller_id, receiver_id
        );

        match self.dial(caller_id, receiver_id, media_kind).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.abandon(e.clone()).await;
                Err(e)
            }
        }
    }

    async fn dial(
        &mut self,
        caller_id: String,
        receiver_id: String,
        media_kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        let media = self.acquire_media(media_kind).await?;
        self.local_media = Some(media);
        self.check_abort()?;

        self.open_negotiator()?;
        let offer = match (self.negotiator.as_mut(), self.local_media.as_ref()) {
            (Some(negotiator), Some(media)) => negotiator.create_offer(media).await?,
            _ => return Err(CallError::InvalidState("negotiator not ready".into())),
        };
        self.check_abort()?;

        let id = self
            .ctx
            .channel
            .create_session(NewCallSession {
                caller_id,
                receiver_id,
                media_kind,
                offer,
            })
            .await?;
        self.session_id = Some(id.clone());
        self.wrote_record = true;
        self.check_abort()?;

        self.relay = Some(CandidateRelay::start(
            self.ctx.channel.clone(),
            id.clone(),
            PartyRole::Caller,
            self.relay_failures_tx.clone(),
        ));
        self.subscription = Some(self.ctx.channel.subscribe(&id).await?);

        self.status = Some(CallStatus::Calling);
        self.deadline = Some(Instant::now() + self.ctx.config.answer_timeout());
        self.emit_status();
        info!("Call {} is ringing", id);
        Ok(id)
    }

    async fn answer(&mut self, session_id: SessionId) -> Result<(), CallError> {
        if self.role.is_some() {
            return Err(CallError::InvalidState("call already in progress".into()));
        }
        self.role = Some(PartyRole::Receiver);
        self.publish();
        info!("Answering call {}", session_id);

        match self.pick_up(session_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abandon(e.clone()).await;
                Err(e)
            }
        }
    }

    async fn pick_up(&mut self, session_id: SessionId) -> Result<(), CallError> {
        let session = self.ctx.channel.get_session(&session_id).await?;
        if !session.status.can_answer() {
            return Err(CallError::InvalidState(format!(
                "session {} is {}",
                session_id, session.status
            )));
        }
        let offer: SessionDescription = session
            .offer
            .ok_or_else(|| CallError::InvalidState(format!("session {} has no offer", session_id)))?;

        self.session_id = Some(session_id.clone());
        self.media_kind = Some(session.media_kind);
        self.status = Some(CallStatus::Calling);
        self.publish();

        let media = self.acquire_media(session.media_kind).await?;
        self.local_media = Some(media);
        self.check_abort()?;

        self.open_negotiator()?;
        let answer = match (self.negotiator.as_mut(), self.local_media.as_ref()) {
            (Some(negotiator), Some(media)) => {
                negotiator.accept_offer_and_create_answer(&offer, media).await?
            }
            _ => return Err(CallError::InvalidState("negotiator not ready".into())),
        };

        let mut relay = CandidateRelay::start(
            self.ctx.channel.clone(),
            session_id.clone(),
            PartyRole::Receiver,
            self.relay_failures_tx.clone(),
        );
        if let Some(negotiator) = self.negotiator.as_ref() {
            relay.flush_buffered(negotiator).await?;
        }
        self.relay = Some(relay);
        self.check_abort()?;

        self.ctx
            .channel
            .update_session(&session_id, SessionUpdate::answered(answer))
            .await?;
        self.wrote_record = true;
        self.subscription = Some(self.ctx.channel.subscribe(&session_id).await?);

        self.transition(CallTransition::AnswerObserved);
        self.deadline = Some(Instant::now() + self.ctx.config.connect_timeout());
        info!("Call {} answered", session_id);
        Ok(())
    }

    async fn end(&mut self) -> Result<CallStatus, CallError> {
        if let Some(status) = self.status
            && status.is_terminal()
        {
            return Ok(status);
        }
        self.finish(CallTransition::Ended, None, true).await;
        Ok(self.status.unwrap_or(CallStatus::Ended))
    }

    async fn decline(&mut self) -> Result<CallStatus, CallError> {
        let result = match (self.role, self.status) {
            (_, Some(CallStatus::Declined)) => Ok(CallStatus::Declined),
            (_, Some(status)) if status.is_terminal() => Err(CallError::InvalidState(format!(
                "call already {}",
                status
            ))),
            (Some(PartyRole::Receiver), Some(CallStatus::Calling)) => {
                self.finish(CallTransition::Declined, None, true).await;
                Ok(CallStatus::Declined)
            }
            _ => Err(CallError::InvalidState(
                "only a ringing receiver can decline".into(),
            )),
        };
        if result.is_err() {
            // A refused decline must not cancel a later answer.
            self.abort.send_if_modified(|requested| {
                if *requested == Some(CallStatus::Declined) {
                    *requested = None;
                    true
                } else {
                    false
                }
            });
        }
        result
    }

    async fn acquire_media(&mut self, kind: MediaKind) -> Result<LocalMediaHandle, CallError> {
        let media = self.ctx.media.clone();
        let mut abort = self.abort.subscribe();
        let role = self.role;
        tokio::select! {
            result = media.acquire(kind) => result,
            _ = abort.wait_for(move |requested| abort_applies(*requested, role)) => {
                debug!("Media acquisition abandoned");
                Err(CallError::Cancelled)
            }
        }
    }

    fn check_abort(&self) -> Result<(), CallError> {
        if abort_applies(*self.abort.borrow(), self.role) {
            return Err(CallError::Cancelled);
        }
        Ok(())
    }

    fn open_negotiator(&mut self) -> Result<(), CallError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = self
            .ctx
            .peers
            .create(&self.ctx.config.ice_servers, events_tx)
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))?;
        self.negotiator = Some(SessionDescriptionNegotiator::new(peer));
        self.peer_events = Some(events_rx);
        Ok(())
    }

    /// Tear down an attempt whose start or answer did not complete.
    async fn abandon(&mut self, error: CallError) {
        let requested = *self.abort.borrow();
        let (transition, error, persist) = match (error, requested) {
            (CallError::Cancelled, Some(CallStatus::Declined))
                if self.role == Some(PartyRole::Receiver) =>
            {
                (CallTransition::Declined, None, true)
            }
            (CallError::Cancelled, Some(CallStatus::Ended)) => (CallTransition::Ended, None, true),
            (error, _) => (CallTransition::Failed, Some(error), self.wrote_record),
        };
        self.finish(transition, error, persist).await;
    }

    async fn on_remote_change(&mut self, change: Option<SessionChange>) {
        let Some(change) = change else {
            self.fail(CallError::SignalingUnavailable("subscription closed".into()))
                .await;
            return;
        };
        match change {
            SessionChange::Answer(answer) => self.on_remote_answer(answer).await,
            SessionChange::Status { status, end_time } => {
                let transition = match status {
                    CallStatus::Ended => CallTransition::Ended,
                    CallStatus::Declined => CallTransition::Declined,
                    _ => return,
                };
                info!("Remote party moved {:?} to {}", self.session_id, status);
                self.end_time = end_time;
                self.finish(transition, None, false).await;
            }
            SessionChange::Candidate(record) => {
                if self.role.map(|role| role.peer()) != Some(record.origin) {
                    return;
                }
                if let (Some(relay), Some(negotiator)) =
                    (self.relay.as_mut(), self.negotiator.as_ref())
                {
                    let outcome = relay.on_remote(record.candidate, negotiator).await;
                    debug!("Remote candidate #{}: {:?}", record.seq, outcome);
                }
            }
        }
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        if self.role != Some(PartyRole::Caller) {
            return;
        }
        if self.status != Some(CallStatus::Calling) {
            debug!("Ignoring answer while {:?}", self.status);
            return;
        }
        let result = match (self.negotiator.as_mut(), self.relay.as_mut()) {
            (Some(negotiator), Some(relay)) => match negotiator.accept_answer(&answer).await {
                Ok(()) => relay.flush_buffered(negotiator).await.map(|_| ()),
                Err(e) => Err(e),
            },
            _ => Err(CallError::InvalidState("answer before offer".into())),
        };
        match result {
            Ok(()) => {
                self.transition(CallTransition::AnswerObserved);
                self.deadline = Some(Instant::now() + self.ctx.config.connect_timeout());
            }
            Err(CallError::AlreadyNegotiated) => debug!("Duplicate answer ignored"),
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => match &self.relay {
                Some(relay) => {
                    if let Err(e) = relay.submit_local(candidate) {
                        warn!("Local candidate not relayed: {}", e);
                    }
                }
                None => debug!("No relay yet, dropping local candidate"),
            },
            PeerEvent::StateChanged(PeerConnectionState::Connected) => {
                if self.connected {
                    return;
                }
                self.connected = true;
                self.deadline = None;
                if let Some(id) = self.session_id.clone() {
                    info!("Call {} connected", id);
                    self.emit(CallEvent::Connected { session_id: id });
                }
                self.publish();
            }
            PeerEvent::StateChanged(PeerConnectionState::Failed) => {
                self.fail(CallError::TransportFailed("connectivity checks failed".into()))
                    .await;
            }
            PeerEvent::StateChanged(state) => debug!("Peer connection {:?}", state),
            PeerEvent::RemoteTrack(track) => {
                debug!("Remote {:?} track {}", track.kind, track.id);
                self.remote_tracks.push(track.clone());
                if let Some(id) = self.session_id.clone() {
                    self.emit(CallEvent::RemoteTrack {
                        session_id: id,
                        track,
                    });
                }
                self.publish();
            }
        }
    }

    async fn on_deadline(&mut self) {
        self.deadline = None;
        let reason = match self.status {
            Some(CallStatus::Calling) => "no answer",
            _ => "transport did not connect",
        };
        self.fail(CallError::Timeout(reason.into())).await;
    }

    async fn fail(&mut self, error: CallError) {
        let persist = self.wrote_record;
        self.finish(CallTransition::Failed, Some(error), persist).await;
    }

    fn transition(&mut self, transition: CallTransition) {
        let Some(current) = self.status else {
            return;
        };
        match current.apply(transition) {
            Ok(next) => {
                self.status = Some(next);
                self.emit_status();
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Move to a terminal status and release everything this attempt holds.
    async fn finish(&mut self, transition: CallTransition, error: Option<CallError>, persist: bool) {
        if self.is_terminal() {
            return;
        }
        let status = match self.status {
            Some(current) => match current.apply(transition) {
                Ok(next) => next,
                Err(e) => {
                    warn!("{}", e);
                    CallStatus::Ended
                }
            },
            None if transition == CallTransition::Declined => CallStatus::Declined,
            None => CallStatus::Ended,
        };
        if status == CallStatus::Ended && self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }

        if persist && let Some(id) = &self.session_id {
            let update = match (status, self.end_time) {
                (CallStatus::Declined, _) => SessionUpdate::declined(),
                (_, Some(at)) => SessionUpdate::ended(at),
                (_, None) => SessionUpdate::ended(Utc::now()),
            };
            if let Err(e) = self.ctx.channel.update_session(id, update).await {
                warn!("Failed to persist {} for {}: {}", status, id, e);
            }
        }

        self.deadline = None;
        if let Some(mut relay) = self.relay.take() {
            relay.shutdown();
        }
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.close().await;
        }
        self.peer_events = None;
        if let Some(media) = self.local_media.take() {
            self.ctx.media.release(&media);
        }

        self.status = Some(status);
        self.last_error = error.as_ref().map(CallError::kind);
        match &error {
            Some(e) => warn!("Call {:?} {} after error: {}", self.session_id, status, e),
            None => info!("Call {:?} {}", self.session_id, status),
        }
        self.publish();
        self.emit(CallEvent::Terminated {
            session_id: self.session_id.clone(),
            status,
            error: self.last_error,
        });
    }

    fn emit_status(&mut self) {
        if let (Some(session_id), Some(status)) = (self.session_id.clone(), self.status) {
            self.emit(CallEvent::StatusChanged { session_id, status });
        }
        self.publish();
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            debug!("Call event receiver dropped");
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(CallSnapshot {
            session_id: self.session_id.clone(),
            role: self.role,
            media_kind: self.media_kind,
            status: self.status,
            end_time: self.end_time,
            connected: self.connected,
            media_held: self
                .local_media
                .as_ref()
                .is_some_and(|media| !media.is_released()),
            transport_open: self
                .negotiator
                .as_ref()
                .is_some_and(|negotiator| !negotiator.is_closed()),
            subscribed: self
                .subscription
                .as_ref()
                .is_some_and(Subscription::is_active),
            local_tracks: self
                .local_media
                .as_ref()
                .map(LocalMediaHandle::track_infos)
                .unwrap_or_default(),
            remote_tracks: self.remote_tracks.clone(),
            error: self.last_error,
        });
    }
}
