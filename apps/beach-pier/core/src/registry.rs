use std::collections::HashMap;
use std::time::Instant;

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::{Detached, Engine};
use crate::protocol::{ServerMessage, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered but not looking for a partner
    Idle,
    Waiting { enqueued_at: Instant },
    Paired { partner: SessionId, initiator: bool },
}

/// Server-side record of one connected participant.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    last_liveness: Instant,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl Session {
    fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: SessionId::new(),
            state: SessionState::Idle,
            last_liveness: Instant::now(),
            outbound,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn partner(&self) -> Option<SessionId> {
        match self.state {
            SessionState::Paired { partner, .. } => Some(partner),
            _ => None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, SessionState::Waiting { .. })
    }

    pub fn last_liveness(&self) -> Instant {
        self.last_liveness
    }

    pub fn transport_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub(crate) fn outbound(&self) -> &mpsc::UnboundedSender<ServerMessage> {
        &self.outbound
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Fire-and-forget delivery. A closed channel is left for the liveness sweep.
    pub(crate) fn notify(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    sessions: HashMap<SessionId, Session>,
}

impl Registry {
    pub(crate) fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Where a removed session stood at the moment it was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    WasIdle,
    WasWaiting,
    WasPaired { partner: SessionId },
}

impl Engine {
    /// Registers a connection whose notifications go to `outbound`.
    ///
    /// The registry keeps the only sender it is handed; once the session is
    /// removed the receiving end sees the channel close.
    pub fn register(&self, outbound: mpsc::UnboundedSender<ServerMessage>) -> SessionId {
        let session = Session::new(outbound);
        let id = session.id;

        let mut state = self.lock();
        session.notify(ServerMessage::Registered { session_id: id });
        state.registry.insert(session);
        gauge!("beach_pier_sessions_active", state.registry.len() as f64);
        counter!("beach_pier_sessions_registered_total", 1);
        debug!(session_id = %id, "session registered");
        id
    }

    /// Registers a session backed by a fresh channel and hands back the receiving end.
    pub fn connect(&self) -> (SessionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(tx), rx)
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.lock().registry.get(id).cloned()
    }

    /// Deletes the session, breaking its link and queue entry in the same step.
    pub fn remove(&self, id: SessionId) -> Option<Removal> {
        let mut state = self.lock();
        state.registry.get(id)?;

        let removal = match state.detach(id) {
            Detached::Idle => Removal::WasIdle,
            Detached::LeftQueue => {
                state.broadcast_positions();
                Removal::WasWaiting
            }
            Detached::Unlinked(partner) => {
                counter!("beach_pier_links_dissolved_total", 1, "reason" => "disconnect");
                Removal::WasPaired { partner }
            }
        };
        state.discard(id);
        drop(state);

        info!(session_id = %id, removal = ?removal, "session removed");
        Some(removal)
    }

    /// Queues `message` for `id`. Returns false for unknown or closed sessions.
    pub fn notify(&self, id: SessionId, message: ServerMessage) -> bool {
        self.lock()
            .registry
            .get(id)
            .is_some_and(|session| session.notify(message))
    }

    /// Records a liveness signal for `id`.
    pub fn touch(&self, id: SessionId) {
        if let Some(session) = self.lock().registry.get_mut(id) {
            session.last_liveness = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingOutcome;

    #[test_timeout::timeout]
    fn register_announces_the_new_id() {
        let engine = Engine::new();
        let (id, mut rx) = engine.connect();

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::Registered { session_id: id }
        );
        let session = engine.get(id).unwrap();
        assert_eq!(session.state(), &SessionState::Idle);
        assert!(session.transport_open());
    }

    #[test_timeout::timeout]
    fn ids_are_unique_across_registrations() {
        let engine = Engine::new();
        let (a, _rx_a) = engine.connect();
        let (b, _rx_b) = engine.connect();
        assert_ne!(a, b);
    }

    #[test_timeout::timeout]
    fn unknown_ids_are_absent_not_errors() {
        let engine = Engine::new();
        let ghost = SessionId::new();
        assert!(engine.get(ghost).is_none());
        assert!(engine.remove(ghost).is_none());
        engine.touch(ghost);
    }

    #[test_timeout::timeout]
    fn removing_a_paired_session_frees_the_partner() {
        let engine = Engine::new();
        let (a, mut rx_a) = engine.connect();
        let (b, _rx_b) = engine.connect();
        engine.request_pairing(a);
        engine.request_pairing(b);
        while rx_a.try_recv().is_ok() {}

        assert_eq!(engine.remove(b), Some(Removal::WasPaired { partner: a }));
        assert_eq!(rx_a.try_recv().unwrap(), ServerMessage::PartnerGone);
        assert_eq!(engine.get(a).unwrap().state(), &SessionState::Idle);
        assert!(engine.get(b).is_none());
        engine.assert_invariants();

        assert!(engine.remove(b).is_none());
        assert!(rx_a.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn removing_a_waiter_updates_the_rest_of_the_queue() {
        let engine = Engine::new();
        let (a, _rx_a) = engine.connect();
        let (b, mut rx_b) = engine.connect();
        engine.request_pairing(a);
        assert!(matches!(
            engine.request_pairing(b),
            PairingOutcome::Paired { .. }
        ));

        let (c, _rx_c) = engine.connect();
        let (d, mut rx_d) = engine.connect();
        engine.seed_queue(&[c, d]);
        while rx_d.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        assert_eq!(engine.remove(c), Some(Removal::WasWaiting));
        assert_eq!(
            rx_d.try_recv().unwrap(),
            ServerMessage::QueueUpdate {
                position: 1,
                total: 1
            }
        );
        assert!(rx_b.try_recv().is_err());
        engine.assert_invariants();
    }

    #[test_timeout::timeout]
    fn removal_closes_the_outbound_channel() {
        let engine = Engine::new();
        let (id, mut rx) = engine.connect();
        assert!(rx.try_recv().is_ok());

        assert!(engine.notify(id, ServerMessage::Pong));
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong);

        engine.remove(id);
        assert!(!engine.notify(id, ServerMessage::Pong));
        assert_eq!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test_timeout::timeout]
    fn touch_moves_the_liveness_timestamp() {
        let engine = Engine::new();
        let (id, _rx) = engine.connect();
        let before = engine.get(id).unwrap().last_liveness();
        std::thread::sleep(std::time::Duration::from_millis(5));
        engine.touch(id);
        assert!(engine.get(id).unwrap().last_liveness() > before);
    }
}
