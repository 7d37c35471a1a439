//! Call manager for one party's call attempts.

use super::handle::CallHandle;
use super::machine::{CallContext, CallSessionStateMachine};
use callcore::{CallError, CallEvent, CallSession, MediaKind, SessionId, SessionUpdate};
use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::mpsc;

/// Registry of live call attempts, keyed by session id.
///
/// Each party (device) owns one manager. Every attempt runs in its own
/// [`CallSessionStateMachine`]; the manager only spawns them, keeps their
/// handles and fans their events into one stream.
pub struct CallManager {
    ctx: CallContext,
    calls: DashMap<SessionId, CallHandle>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
}

impl CallManager {
    pub fn new(ctx: CallContext) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            ctx,
            calls: DashMap::new(),
            events_tx,
        };
        (manager, events_rx)
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Place a call. The attempt is registered once the session is ringing.
    pub async fn start_call(
        &self,
        caller_id: &str,
        receiver_id: &str,
        media_kind: MediaKind,
    ) -> Result<CallHandle, CallError> {
        let handle = CallSessionStateMachine::spawn(self.ctx.clone(), self.events_tx.clone());
        let session_id = handle.start(caller_id, receiver_id, media_kind).await?;
        self.calls.insert(session_id, handle.clone());
        Ok(handle)
    }

    /// Answer a ringing session. Fails with `InvalidState` if this manager
    /// already runs a live attempt for it.
    pub async fn answer_call(&self, session_id: &SessionId) -> Result<CallHandle, CallError> {
        if let Some(existing) = self.calls.get(session_id)
            && !existing.is_finished()
        {
            return Err(CallError::InvalidState(format!(
                "session {} is already being handled",
                session_id
            )));
        }
        let handle = CallSessionStateMachine::spawn(self.ctx.clone(), self.events_tx.clone());
        handle.answer(session_id.clone()).await?;
        self.calls.insert(session_id.clone(), handle.clone());
        Ok(handle)
    }

    /// Refuse a ringing session without answering it.
    pub async fn decline_call(&self, session_id: &SessionId) -> Result<(), CallError> {
        if let Some(handle) = self.get(session_id)
            && !handle.is_finished()
        {
            handle.decline().await?;
            return Ok(());
        }

        let session = self.ctx.channel.get_session(session_id).await?;
        if !session.status.can_decline() {
            return Err(CallError::InvalidState(format!(
                "cannot decline session {} in status {}",
                session_id, session.status
            )));
        }
        self.ctx
            .channel
            .update_session(session_id, SessionUpdate::declined())
            .await?;
        info!("Declined call {} from {}", session_id, session.caller_id);
        Ok(())
    }

    /// Ringing sessions addressed to `receiver_id`, oldest first.
    pub async fn incoming_calls(&self, receiver_id: &str) -> Result<Vec<CallSession>, CallError> {
        Ok(self.ctx.channel.ringing_for(receiver_id).await?)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<CallHandle> {
        self.calls.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn active_calls(&self) -> Vec<CallHandle> {
        self.calls
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drop handles of finished attempts. Returns how many were removed.
    pub fn cleanup_ended(&self) -> usize {
        let before = self.calls.len();
        self.calls.retain(|_, handle| !handle.is_finished());
        let removed = before - self.calls.len();
        if removed > 0 {
            debug!("Removed {} finished call(s)", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::{MediaEndpoint, SimulatedDevices};
    use crate::calls::peer::LoopbackPeerFactory;
    use crate::calls::signaling::InMemorySignalingChannel;
    use crate::config::CallConfig;
    use callcore::CallStatus;
    use std::sync::Arc;

    fn manager(channel: &InMemorySignalingChannel) -> CallManager {
        let ctx = CallContext::new(
            CallConfig::default(),
            Arc::new(channel.clone()),
            MediaEndpoint::new(Arc::new(SimulatedDevices::new())),
            Arc::new(LoopbackPeerFactory::new()),
        );
        CallManager::new(ctx).0
    }

    #[tokio::test]
    async fn test_incoming_calls_and_decline_without_answering() {
        let _ = env_logger::builder().is_test(true).try_init();
        let channel = InMemorySignalingChannel::new();
        let alice = manager(&channel);
        let bob = manager(&channel);

        let call = alice.start_call("alice", "bob", MediaKind::Voice).await.unwrap();
        let id = call.session_id().unwrap();

        let ringing = bob.incoming_calls("bob").await.unwrap();
        assert_eq!(ringing.len(), 1);
        assert_eq!(ringing[0].id, id);

        bob.decline_call(&id).await.unwrap();
        assert_eq!(
            call.wait_for_status(CallStatus::Declined).await,
            Some(CallStatus::Declined)
        );
        assert!(bob.incoming_calls("bob").await.unwrap().is_empty());
        assert!(bob.decline_call(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_ended_drops_finished_handles() {
        let channel = InMemorySignalingChannel::new();
        let alice = manager(&channel);

        let call = alice.start_call("alice", "bob", MediaKind::Voice).await.unwrap();
        let id = call.session_id().unwrap();
        assert_eq!(alice.active_calls().len(), 1);
        assert_eq!(alice.cleanup_ended(), 0);

        call.end_call().await.unwrap();
        assert_eq!(alice.cleanup_ended(), 1);
        assert!(alice.get(&id).is_none());
    }
}
