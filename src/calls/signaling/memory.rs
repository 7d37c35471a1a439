use super::{Result, SignalingChannel, Subscription};
use async_trait::async_trait;
use callcore::{
    CallSession, IceCandidate, NewCallSession, PartyRole, SessionChange, SessionId,
    SessionUpdate, SignalingError,
};
use dashmap::DashMap;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};

struct SessionEntry {
    session: CallSession,
    subscribers: BTreeMap<u64, mpsc::UnboundedSender<SessionChange>>,
}

impl SessionEntry {
    fn notify(&mut self, change: SessionChange) {
        self.subscribers
            .retain(|_, tx| tx.send(change.clone()).is_ok());
    }
}

#[derive(Default)]
struct ChannelState {
    sessions: DashMap<SessionId, SessionEntry>,
    /// Serializes the duplicate check with the insert.
    create_lock: Mutex<()>,
    next_subscription: AtomicU64,
    unavailable: AtomicBool,
    fail_updates: AtomicBool,
    fail_appends: AtomicBool,
}

impl ChannelState {
    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(SignalingError::Unavailable("store offline".into()));
        }
        Ok(())
    }
}

/// Signaling channel backed by process memory.
///
/// Clones share the same store, so a caller and a receiver in one process can
/// each hold a clone. Candidate appends and field updates are applied and
/// broadcast under the session's entry lock, which gives every subscriber the
/// same per-session order.
#[derive(Clone, Default)]
pub struct InMemorySignalingChannel {
    state: Arc<ChannelState>,
}

impl InMemorySignalingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the whole store going offline.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::Release);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.state.fail_updates.store(fail, Ordering::Release);
    }

    pub fn fail_appends(&self, fail: bool) {
        self.state.fail_appends.store(fail, Ordering::Release);
    }

    pub fn snapshot(&self, id: &SessionId) -> Option<CallSession> {
        self.state.sessions.get(id).map(|e| e.session.clone())
    }

    pub fn subscriber_count(&self, id: &SessionId) -> usize {
        self.state
            .sessions
            .get(id)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }
}

#[async_trait]
impl SignalingChannel for InMemorySignalingChannel {
    async fn create_session(&self, new: NewCallSession) -> Result<SessionId> {
        self.state.check_available()?;
        let _guard = self.state.create_lock.lock().await;

        let duplicate = self.state.sessions.iter().any(|entry| {
            !entry.session.status.is_terminal()
                && entry.session.involves_pair(&new.caller_id, &new.receiver_id)
        });
        if duplicate {
            return Err(SignalingError::DuplicateActiveSession {
                caller_id: new.caller_id,
                receiver_id: new.receiver_id,
            });
        }

        let id = SessionId::generate();
        let session = CallSession::create(id.clone(), new);
        debug!(
            "Created session {} ({} -> {}, {:?})",
            id, session.caller_id, session.receiver_id, session.media_kind
        );
        self.state.sessions.insert(
            id.clone(),
            SessionEntry {
                session,
                subscribers: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn get_session(&self, id: &SessionId) -> Result<CallSession> {
        self.state.check_available()?;
        self.snapshot(id)
            .ok_or_else(|| SignalingError::NotFound(id.to_string()))
    }

    async fn update_session(&self, id: &SessionId, update: SessionUpdate) -> Result<()> {
        self.state.check_available()?;
        if self.state.fail_updates.load(Ordering::Acquire) {
            return Err(SignalingError::Unavailable("update failed".into()));
        }
        let mut entry = self
            .state
            .sessions
            .get_mut(id)
            .ok_or_else(|| SignalingError::NotFound(id.to_string()))?;

        entry.session.merge(&update)?;
        debug!("Session {} updated: status={}", id, entry.session.status);

        if let Some(answer) = update.answer {
            entry.notify(SessionChange::Answer(answer));
        }
        if update.status.is_some() {
            let change = SessionChange::Status {
                status: entry.session.status,
                end_time: entry.session.end_time,
            };
            entry.notify(change);
        }
        Ok(())
    }

    async fn append_candidate(
        &self,
        id: &SessionId,
        origin: PartyRole,
        candidate: IceCandidate,
    ) -> Result<u64> {
        self.state.check_available()?;
        if self.state.fail_appends.load(Ordering::Acquire) {
            return Err(SignalingError::Unavailable("candidate append failed".into()));
        }
        let mut entry = self
            .state
            .sessions
            .get_mut(id)
            .ok_or_else(|| SignalingError::NotFound(id.to_string()))?;

        let record = entry.session.append_candidate(origin, candidate)?;
        trace!("Session {} candidate #{} from {}", id, record.seq, origin);
        let seq = record.seq;
        entry.notify(SessionChange::Candidate(record));
        Ok(seq)
    }

    async fn subscribe(&self, id: &SessionId) -> Result<Subscription> {
        self.state.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription_id = self.state.next_subscription.fetch_add(1, Ordering::AcqRel);
        {
            let mut entry = self
                .state
                .sessions
                .get_mut(id)
                .ok_or_else(|| SignalingError::NotFound(id.to_string()))?;

            let session = &entry.session;
            let mut replay = Vec::new();
            if let Some(answer) = &session.answer {
                replay.push(SessionChange::Answer(answer.clone()));
            }
            replay.extend(
                session
                    .candidates
                    .iter()
                    .cloned()
                    .map(SessionChange::Candidate),
            );
            if session.status.is_terminal() {
                replay.push(SessionChange::Status {
                    status: session.status,
                    end_time: session.end_time,
                });
            }
            for change in replay {
                // Receiver is alive: we hold it.
                let _ = tx.send(change);
            }
            entry.subscribers.insert(subscription_id, tx);
        }
        debug!("Subscription {} opened on session {}", subscription_id, id);

        let state = Arc::downgrade(&self.state);
        let session_id = id.clone();
        Ok(Subscription::new(id.clone(), rx, move || {
            if let Some(state) = state.upgrade()
                && let Some(mut entry) = state.sessions.get_mut(&session_id)
            {
                entry.subscribers.remove(&subscription_id);
                debug!(
                    "Subscription {} closed on session {}",
                    subscription_id, session_id
                );
            }
        }))
    }

    async fn ringing_for(&self, receiver_id: &str) -> Result<Vec<CallSession>> {
        self.state.check_available()?;
        let mut ringing: Vec<CallSession> = self
            .state
            .sessions
            .iter()
            .filter(|e| e.session.receiver_id == receiver_id && e.session.status.can_answer())
            .map(|e| e.session.clone())
            .collect();
        ringing.sort_by_key(|s| s.start_time);
        Ok(ringing)
    }
}
