use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::protocol::{ServerMessage, SessionId};
use crate::queue::WaitingQueue;
use crate::registry::{Registry, Session, SessionState};

/// Owner of every piece of shared matchmaking state.
///
/// Registry, queue and partner links live behind one mutex so that each
/// read-then-write operation (match, dissolve, removal, sweep) is a single
/// critical section. Notifications are pushed onto unbounded channels while the
/// lock is held; those pushes never wait on the network.
#[derive(Clone, Default)]
pub struct Engine {
    inner: Arc<Mutex<EngineState>>,
}

#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) registry: Registry,
    pub(crate) queue: WaitingQueue,
    removed_total: u64,
}

/// What a session was doing when it was detached from the queue or its link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detached {
    Idle,
    LeftQueue,
    Unlinked(SessionId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub sessions: usize,
    pub idle: usize,
    pub waiting: usize,
    pub paired: usize,
    pub links: usize,
    pub queue_len: usize,
    /// How long the head of the queue has been waiting
    pub longest_wait_ms: u64,
    /// Sessions removed since startup, whatever the cause
    pub sessions_removed: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.lock()
    }

    pub fn stats(&self) -> EngineStats {
        let now = Instant::now();
        let state = self.lock();
        let mut stats = EngineStats {
            sessions: state.registry.len(),
            queue_len: state.queue.len(),
            sessions_removed: state.removed_total,
            ..EngineStats::default()
        };
        for session in state.registry.iter() {
            match session.state() {
                SessionState::Idle => stats.idle += 1,
                SessionState::Waiting { enqueued_at } => {
                    stats.waiting += 1;
                    let waited = now.saturating_duration_since(*enqueued_at).as_millis() as u64;
                    stats.longest_wait_ms = stats.longest_wait_ms.max(waited);
                }
                SessionState::Paired { .. } => stats.paired += 1,
            }
        }
        stats.links = stats.paired / 2;
        stats
    }
}

impl EngineState {
    pub(crate) fn notify(&self, id: SessionId, message: ServerMessage) {
        if let Some(session) = self.registry.get(id) {
            session.notify(message);
        }
    }

    /// Breaks the link `id` belongs to, if any. Both sides end up `Idle` and the
    /// partner is told its counterpart is gone.
    pub(crate) fn unlink(&mut self, id: SessionId) -> Option<SessionId> {
        let partner = self.registry.get(id)?.partner()?;
        if let Some(session) = self.registry.get_mut(id) {
            session.set_state(SessionState::Idle);
        }
        if let Some(other) = self.registry.get_mut(partner) {
            if other.partner() == Some(id) {
                other.set_state(SessionState::Idle);
                other.notify(ServerMessage::PartnerGone);
            }
        }
        Some(partner)
    }

    /// Drops `id` from the registry. Every removal path goes through here so the
    /// session gauge and removal count stay in step with the registry.
    ///
    /// The caller detaches the session first. Dropping the returned record
    /// releases its outbound channel, which ends the connection's writer.
    pub(crate) fn discard(&mut self, id: SessionId) -> Option<Session> {
        let session = self.registry.remove(id)?;
        self.removed_total += 1;
        gauge!("beach_pier_sessions_active", self.registry.len() as f64);
        counter!("beach_pier_sessions_removed_total", 1);
        Some(session)
    }

    /// Takes `id` out of the queue without rebroadcasting positions.
    pub(crate) fn leave_queue(&mut self, id: SessionId) -> bool {
        let removed = self.queue.remove(id);
        if let Some(session) = self.registry.get_mut(id) {
            if session.is_waiting() {
                session.set_state(SessionState::Idle);
            }
        }
        removed
    }

    pub(crate) fn detach(&mut self, id: SessionId) -> Detached {
        if let Some(partner) = self.unlink(id) {
            return Detached::Unlinked(partner);
        }
        if self.leave_queue(id) {
            return Detached::LeftQueue;
        }
        Detached::Idle
    }

    /// Tells every waiter its current 1-based position.
    pub(crate) fn broadcast_positions(&self) {
        let total = self.queue.len();
        for (index, id) in self.queue.iter().enumerate() {
            self.notify(
                id,
                ServerMessage::QueueUpdate {
                    position: index + 1,
                    total,
                },
            );
        }
        gauge!("beach_pier_queue_length", total as f64);
    }

    /// Checks the link biconditional and queue membership invariants.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        use std::collections::HashSet;

        let mut queued = HashSet::new();
        for id in self.queue.iter() {
            if !queued.insert(id) {
                return Err(format!("{id} queued twice"));
            }
            match self.registry.get(id) {
                Some(session) if session.is_waiting() => {}
                _ => return Err(format!("{id} queued but not waiting")),
            }
        }

        for session in self.registry.iter() {
            match session.state() {
                SessionState::Waiting { .. } if !queued.contains(&session.id()) => {
                    return Err(format!("{} waiting but not queued", session.id()));
                }
                SessionState::Paired {
                    partner,
                    initiator,
                } => {
                    let Some(other) = self.registry.get(*partner) else {
                        return Err(format!("{} paired with missing {partner}", session.id()));
                    };
                    match other.state() {
                        SessionState::Paired {
                            partner: back,
                            initiator: other_initiator,
                        } if *back == session.id() => {
                            if initiator == other_initiator {
                                return Err(format!("{} link has no single initiator", session.id()));
                            }
                        }
                        _ => return Err(format!("{} link is not mirrored", session.id())),
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl Engine {
    /// Puts `ids` straight into the queue, bypassing matching.
    pub(crate) fn seed_queue(&self, ids: &[SessionId]) {
        let mut state = self.lock();
        for id in ids {
            state.enqueue(*id, std::time::Instant::now());
        }
    }

    pub(crate) fn assert_invariants(&self) {
        if let Err(violation) = self.lock().check_invariants() {
            panic!("engine invariant violated: {violation}");
        }
    }
}
