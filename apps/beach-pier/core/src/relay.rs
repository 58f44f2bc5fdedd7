use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::protocol::{ServerMessage, SessionId, SignalKind};
use crate::registry::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Forwarded { to: SessionId },
    /// Sender has no partner; it was told `partner-gone`
    NoPartner,
    /// Sender addressed someone other than its current partner
    StaleTarget,
    /// Partner's transport refused the message
    Undeliverable,
    UnknownSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    Rejected,
    UnknownSession,
}

impl Engine {
    /// Passes `payload` to the sender's partner untouched.
    ///
    /// Only the partner lookup happens under the lock. Messages from one sender
    /// arrive in the order they were forwarded.
    pub fn forward(
        &self,
        from: SessionId,
        kind: SignalKind,
        payload: Value,
        to: Option<SessionId>,
    ) -> RelayOutcome {
        let (to, outbound) = {
            let state = self.lock();
            let Some(sender) = state.registry.get(from) else {
                return RelayOutcome::UnknownSession;
            };
            let partner = sender
                .partner()
                .and_then(|partner| state.registry.get(partner));
            let Some(partner) = partner else {
                sender.notify(ServerMessage::PartnerGone);
                counter!("beach_pier_relay_dropped_total", 1, "reason" => "no_partner");
                debug!(session_id = %from, kind = kind.as_str(), "dropping signal without partner");
                return RelayOutcome::NoPartner;
            };
            if to.is_some_and(|target| target != partner.id()) {
                counter!("beach_pier_relay_dropped_total", 1, "reason" => "stale_target");
                debug!(
                    session_id = %from,
                    kind = kind.as_str(),
                    "dropping signal addressed to a previous partner"
                );
                return RelayOutcome::StaleTarget;
            }
            (partner.id(), partner.outbound().clone())
        };

        if outbound.send(kind.deliver(payload, from)).is_err() {
            counter!("beach_pier_relay_dropped_total", 1, "reason" => "closed");
            return RelayOutcome::Undeliverable;
        }
        counter!("beach_pier_relay_forwarded_total", 1, "kind" => kind.as_str());
        RelayOutcome::Forwarded { to }
    }

    /// Re-announces an existing link so both sides can negotiate from scratch.
    ///
    /// The caller's idea of who its partner is gets checked against the live
    /// link. A mismatch, or a partner whose transport has already closed, earns
    /// the caller a `partner-gone` instead, and whatever link the caller still
    /// held is dissolved so the notice matches its state.
    pub fn request_restart(&self, id: SessionId, declared_partner: SessionId) -> RestartOutcome {
        let mut state = self.lock();
        let Some(requester) = state.registry.get(id) else {
            return RestartOutcome::UnknownSession;
        };

        let linked = match *requester.state() {
            SessionState::Paired { partner, .. } if partner == declared_partner => state
                .registry
                .get(partner)
                .map(|other| (other.partner() == Some(id), other.transport_open())),
            _ => None,
        };

        match linked {
            Some((true, true)) => {
                state.announce(id);
                state.announce(declared_partner);
                counter!("beach_pier_restarts_total", 1);
                info!(session_id = %id, partner_id = %declared_partner, "negotiation restarted");
                RestartOutcome::Restarted
            }
            Some((true, false)) => {
                state.unlink(declared_partner);
                state.discard(declared_partner);
                counter!("beach_pier_links_dissolved_total", 1, "reason" => "restart");
                info!(
                    session_id = %id,
                    partner_id = %declared_partner,
                    "restart found partner transport closed"
                );
                RestartOutcome::Rejected
            }
            _ => {
                if let Some(actual) = state.unlink(id) {
                    counter!("beach_pier_links_dissolved_total", 1, "reason" => "restart");
                    info!(
                        session_id = %id,
                        partner_id = %actual,
                        "restart named the wrong partner; link dissolved"
                    );
                }
                state.notify(id, ServerMessage::PartnerGone);
                counter!("beach_pier_restarts_rejected_total", 1);
                debug!(
                    session_id = %id,
                    declared_partner_id = %declared_partner,
                    "restart rejected"
                );
                RestartOutcome::Rejected
            }
        }
    }
}
