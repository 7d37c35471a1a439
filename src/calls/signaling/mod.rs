//! Store-and-forward signaling channel.
//!
//! Offers, answers and candidates travel between the two parties through an
//! externally owned document store rather than a dedicated signaling server.
//! [`SignalingChannel`] is the whole contract the call core needs from that
//! store; [`InMemorySignalingChannel`] implements it in-process.

mod memory;

pub use memory::InMemorySignalingChannel;

use async_trait::async_trait;
use callcore::{
    CallSession, IceCandidate, NewCallSession, PartyRole, SessionChange, SessionId,
    SessionUpdate, SignalingError,
};
use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, SignalingError>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Persist a new session in `calling` status.
    ///
    /// Fails with `DuplicateActiveSession` if the unordered party pair already
    /// has a non-terminal session.
    async fn create_session(&self, session: NewCallSession) -> Result<SessionId>;

    async fn get_session(&self, id: &SessionId) -> Result<CallSession>;

    /// Merge `answer`, `status` and `end_time`. Already-set descriptions are
    /// never overwritten, and terminal sessions accept no writes.
    async fn update_session(&self, id: &SessionId, update: SessionUpdate) -> Result<()>;

    /// Append a candidate atomically; returns its sequence number.
    async fn append_candidate(
        &self,
        id: &SessionId,
        origin: PartyRole,
        candidate: IceCandidate,
    ) -> Result<u64>;

    /// Push changes of `id` to the returned subscription.
    ///
    /// The current answer, every existing candidate and a terminal status are
    /// replayed first, then live changes follow.
    async fn subscribe(&self, id: &SessionId) -> Result<Subscription>;

    /// Sessions in `calling` status addressed to `receiver_id`, oldest first.
    async fn ringing_for(&self, receiver_id: &str) -> Result<Vec<CallSession>>;
}

/// Live feed of one session's changes.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    session_id: SessionId,
    changes: mpsc::UnboundedReceiver<SessionChange>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        session_id: SessionId,
        changes: mpsc::UnboundedReceiver<SessionChange>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            session_id,
            changes,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next change, or `None` once the channel side has gone away.
    pub async fn next(&mut self) -> Option<SessionChange> {
        self.changes.recv().await
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
            self.changes.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.session_id)
            .field("active", &self.is_active())
            .finish()
    }
}
