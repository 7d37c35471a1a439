use super::machine::CallCommand;
use callcore::{
    CallError, CallErrorKind, CallStatus, MediaKind, PartyRole, SessionId, TrackInfo,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Point-in-time view of one call attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub session_id: Option<SessionId>,
    pub role: Option<PartyRole>,
    pub media_kind: Option<MediaKind>,
    /// `None` until the attempt has a session to report on.
    pub status: Option<CallStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub connected: bool,
    pub media_held: bool,
    pub transport_open: bool,
    pub subscribed: bool,
    pub local_tracks: Vec<TrackInfo>,
    pub remote_tracks: Vec<TrackInfo>,
    /// Failure that forced the terminal status, if any.
    pub error: Option<CallErrorKind>,
}

impl CallSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|s| s.is_terminal())
    }

    /// True once nothing local is held: no capture device, transport or subscription.
    pub fn is_released(&self) -> bool {
        !self.media_held && !self.transport_open && !self.subscribed
    }
}

/// Cloneable handle to a running call actor.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<CallCommand>,
    abort: Arc<watch::Sender<Option<CallStatus>>>,
    state: watch::Receiver<CallSnapshot>,
}

fn actor_gone() -> CallError {
    CallError::InvalidState("call actor has stopped".into())
}

impl CallHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<CallCommand>,
        abort: Arc<watch::Sender<Option<CallStatus>>>,
        state: watch::Receiver<CallSnapshot>,
    ) -> Self {
        Self {
            commands,
            abort,
            state,
        }
    }

    async fn request<T>(
        &self,
        command: CallCommand,
        reply: oneshot::Receiver<Result<T, CallError>>,
    ) -> Result<T, CallError> {
        self.commands.send(command).await.map_err(|_| actor_gone())?;
        reply.await.map_err(|_| actor_gone())?
    }

    /// Place a call as `caller_id`. Resolves once the offer is persisted and
    /// the session is ringing.
    pub async fn start(
        &self,
        caller_id: impl Into<String>,
        receiver_id: impl Into<String>,
        media_kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            CallCommand::Start {
                caller_id: caller_id.into(),
                receiver_id: receiver_id.into(),
                media_kind,
                reply,
            },
            rx,
        )
        .await
    }

    /// Answer a ringing session as its receiver.
    pub async fn answer(&self, session_id: SessionId) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::Answer { session_id, reply }, rx)
            .await
    }

    /// Hang up. Safe from any status, including while a start or answer is
    /// still in flight; that step is abandoned.
    pub async fn end_call(&self) -> Result<CallStatus, CallError> {
        self.abort.send_if_modified(|requested| {
            if *requested != Some(CallStatus::Ended) {
                *requested = Some(CallStatus::Ended);
                true
            } else {
                false
            }
        });
        let (reply, rx) = oneshot::channel();
        match self.request(CallCommand::End { reply }, rx).await {
            Err(_) if self.snapshot().is_terminal() => {
                Ok(self.snapshot().status.unwrap_or(CallStatus::Ended))
            }
            result => result,
        }
    }

    /// Refuse a ringing call. Only valid for the receiver before it answered.
    ///
    /// An answer still in flight is abandoned; the actor decides whether the
    /// request applies to its role.
    pub async fn decline(&self) -> Result<CallStatus, CallError> {
        if !self.snapshot().is_terminal() {
            self.abort.send_if_modified(|requested| {
                if requested.is_none() {
                    *requested = Some(CallStatus::Declined);
                    true
                } else {
                    false
                }
            });
        }
        let (reply, rx) = oneshot::channel();
        match self.request(CallCommand::Decline { reply }, rx).await {
            Err(_) if self.snapshot().status == Some(CallStatus::Declined) => {
                Ok(CallStatus::Declined)
            }
            result => result,
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.state.borrow().session_id.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().is_terminal() || self.commands.is_closed()
    }

    /// Wait until the call reaches `status` or any terminal status; returns
    /// the status actually reached.
    pub async fn wait_for_status(&self, status: CallStatus) -> Option<CallStatus> {
        let snapshot = self
            .wait_until(|s| s.status == Some(status) || s.is_terminal())
            .await;
        snapshot.status
    }

    /// Wait until the transport reports connected. Returns `false` if the
    /// call ended first.
    pub async fn wait_connected(&self) -> bool {
        self.wait_until(|s| s.connected || s.is_terminal())
            .await
            .connected
    }

    async fn wait_until(&self, mut done: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| done(s)).await.map(|s| s.clone());
        match reached {
            Ok(snapshot) => snapshot,
            Err(_) => state.borrow().clone(),
        }
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.state.borrow();
        f.debug_struct("CallHandle")
            .field("session_id", &snapshot.session_id)
            .field("status", &snapshot.status)
            .finish()
    }
}
