use std::time::Instant;

use metrics::{counter, gauge};
use tracing::{debug, info};

use crate::engine::{Engine, EngineState};
use crate::protocol::{ServerMessage, SessionId};
use crate::registry::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    Paired { partner: SessionId, initiator: bool },
    Waiting { position: usize, total: usize },
    AlreadyWaiting,
    AlreadyPaired,
    UnknownSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissolveOutcome {
    Unpaired { partner: SessionId },
    LeftQueue,
    Noop,
}

impl Engine {
    /// Matches `id` with the oldest valid waiter, or queues it.
    ///
    /// The requester becomes the initiator of a new link; the waiter it is
    /// matched with answers. Calling this while already waiting or paired
    /// changes nothing and repeats the current `waiting` or `paired` notice.
    pub fn request_pairing(&self, id: SessionId) -> PairingOutcome {
        let mut state = self.lock();
        match state.registry.get(id).map(|session| *session.state()) {
            None => return PairingOutcome::UnknownSession,
            Some(SessionState::Waiting { .. }) => {
                if let Some(position) = state.queue.position(id) {
                    let total = state.queue.len();
                    state.notify(id, ServerMessage::Waiting { position, total });
                }
                return PairingOutcome::AlreadyWaiting;
            }
            Some(SessionState::Paired { .. }) => {
                state.announce(id);
                return PairingOutcome::AlreadyPaired;
            }
            Some(SessionState::Idle) => {}
        }

        let mut shrunk = false;
        while let Some(candidate) = state.queue.pop_front() {
            shrunk = true;
            if state.claim(candidate, id) {
                state.link(id, candidate);
                state.broadcast_positions();
                counter!("beach_pier_pairings_total", 1);
                info!(initiator = %id, responder = %candidate, "sessions paired");
                return PairingOutcome::Paired {
                    partner: candidate,
                    initiator: true,
                };
            }
        }

        if shrunk {
            state.broadcast_positions();
        }
        match state.enqueue(id, Instant::now()) {
            Some(position) => {
                let total = state.queue.len();
                state.notify(id, ServerMessage::Waiting { position, total });
                debug!(session_id = %id, position, total, "session waiting for a partner");
                PairingOutcome::Waiting { position, total }
            }
            None => PairingOutcome::AlreadyWaiting,
        }
    }

    /// Drops the current partner or leaves the queue. Neither side is re-queued.
    pub fn dissolve_pair(&self, id: SessionId) -> DissolveOutcome {
        let mut state = self.lock();
        let Some(current) = state.registry.get(id).map(|session| *session.state()) else {
            return DissolveOutcome::Noop;
        };

        match current {
            SessionState::Paired { .. } => match state.unlink(id) {
                Some(partner) => {
                    counter!("beach_pier_links_dissolved_total", 1, "reason" => "request");
                    info!(session_id = %id, partner_id = %partner, "pair dissolved on request");
                    DissolveOutcome::Unpaired { partner }
                }
                None => DissolveOutcome::Noop,
            },
            SessionState::Waiting { .. } => {
                if state.leave_queue(id) {
                    state.broadcast_positions();
                }
                debug!(session_id = %id, "session left the queue");
                DissolveOutcome::LeftQueue
            }
            SessionState::Idle => DissolveOutcome::Noop,
        }
    }
}

impl EngineState {
    /// Re-validates a popped queue entry before it is matched with `requester`.
    ///
    /// Entries that no longer belong to a live waiting session are discarded.
    /// A waiter whose transport already closed is removed outright.
    fn claim(&mut self, candidate: SessionId, requester: SessionId) -> bool {
        if candidate == requester {
            return false;
        }
        let Some(session) = self.registry.get(candidate) else {
            debug!(session_id = %candidate, "discarding queue entry for departed session");
            return false;
        };
        if !session.is_waiting() {
            debug!(session_id = %candidate, "discarding stale queue entry");
            return false;
        }
        if !session.transport_open() {
            self.discard(candidate);
            counter!("beach_pier_stale_candidates_total", 1);
            debug!(session_id = %candidate, "discarding waiter with closed transport");
            return false;
        }
        true
    }

    /// Forms the link between `initiator` and `responder` and announces it to both.
    fn link(&mut self, initiator: SessionId, responder: SessionId) {
        if let Some(session) = self.registry.get_mut(initiator) {
            session.set_state(SessionState::Paired {
                partner: responder,
                initiator: true,
            });
        }
        if let Some(session) = self.registry.get_mut(responder) {
            session.set_state(SessionState::Paired {
                partner: initiator,
                initiator: false,
            });
        }
        self.announce(initiator);
        self.announce(responder);
    }

    /// Sends `paired` to `id` using the roles recorded on its link.
    pub(crate) fn announce(&self, id: SessionId) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if let SessionState::Paired { partner, initiator } = *session.state() {
            session.notify(ServerMessage::Paired {
                partner_id: partner,
                is_initiator: initiator,
            });
        }
    }

    /// Appends `id` to the queue and marks it waiting. Returns its position.
    pub(crate) fn enqueue(&mut self, id: SessionId, now: Instant) -> Option<usize> {
        let session = self.registry.get_mut(id)?;
        let position = self.queue.push_back(id)?;
        session.set_state(SessionState::Waiting { enqueued_at: now });
        gauge!("beach_pier_queue_length", self.queue.len() as f64);
        Some(position)
    }
}
