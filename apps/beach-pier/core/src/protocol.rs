use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identifier assigned to a connection when it registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kinds of negotiation payload the relay is willing to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    CandidateHint,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "negotiation-offer",
            SignalKind::Answer => "negotiation-answer",
            SignalKind::CandidateHint => "candidate-hint",
        }
    }

    /// Wraps a relayed payload for delivery to the partner.
    pub fn deliver(self, payload: Value, from: SessionId) -> ServerMessage {
        match self {
            SignalKind::Offer => ServerMessage::NegotiationOffer { payload, from },
            SignalKind::Answer => ServerMessage::NegotiationAnswer { payload, from },
            SignalKind::CandidateHint => ServerMessage::CandidateHint { payload, from },
        }
    }
}

/// Messages sent from a participant to the pier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Ask to be matched with the next waiting participant
    RequestPairing,
    NegotiationOffer {
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<SessionId>,
    },
    NegotiationAnswer {
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<SessionId>,
    },
    CandidateHint {
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<SessionId>,
    },
    /// Leave the queue or drop the current partner
    DissolvePair,
    /// Re-announce the current link so negotiation can start over
    Restart { declared_partner_id: SessionId },
    /// Heartbeat to keep the session fresh
    LivenessPing,
}

impl ClientMessage {
    const KINDS: [&'static str; 7] = [
        "request-pairing",
        "negotiation-offer",
        "negotiation-answer",
        "candidate-hint",
        "dissolve-pair",
        "restart",
        "liveness-ping",
    ];

    /// Parses a text frame, rejecting anything whose `type` is not part of the protocol.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingKind)?;
        if !Self::KINDS.iter().any(|known| *known == kind) {
            return Err(ProtocolError::UnknownKind(kind.to_string()));
        }
        serde_json::from_value(value).map_err(ProtocolError::InvalidBody)
    }
}

/// Messages sent from the pier to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Registered {
        session_id: SessionId,
    },
    /// Sent once when the participant enters the queue
    Waiting {
        position: usize,
        total: usize,
    },
    /// Sent whenever the queue shrinks ahead of or around the participant
    QueueUpdate {
        position: usize,
        total: usize,
    },
    Paired {
        partner_id: SessionId,
        is_initiator: bool,
    },
    NegotiationOffer {
        payload: Value,
        from: SessionId,
    },
    NegotiationAnswer {
        payload: Value,
        from: SessionId,
    },
    CandidateHint {
        payload: Value,
        from: SessionId,
    },
    PartnerGone,
    Pong,
    Error {
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(serde_json::Error),
    #[error("frame has no message type")]
    MissingKind,
    #[error("unrecognized message type: {0}")]
    UnknownKind(String),
    #[error("invalid message body: {0}")]
    InvalidBody(serde_json::Error),
}

impl ProtocolError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::MissingKind => "missing_kind",
            ProtocolError::UnknownKind(_) => "unknown_kind",
            ProtocolError::InvalidBody(_) => "invalid_body",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn decodes_relay_frames_with_optional_target() {
        let partner = SessionId::new();
        let text = json!({
            "type": "negotiation-offer",
            "payload": { "sdp": "v=0" },
            "to": partner,
        })
        .to_string();

        assert_eq!(
            ClientMessage::decode(&text).unwrap(),
            ClientMessage::NegotiationOffer {
                payload: json!({ "sdp": "v=0" }),
                to: Some(partner)
            }
        );

        let bare = ClientMessage::decode(r#"{"type":"candidate-hint","payload":"c1"}"#).unwrap();
        assert_eq!(
            bare,
            ClientMessage::CandidateHint {
                payload: json!("c1"),
                to: None
            }
        );
    }

    #[test_timeout::timeout]
    fn decodes_restart_with_camel_case_partner() {
        let partner = SessionId::new();
        let text = format!(r#"{{"type":"restart","declaredPartnerId":"{partner}"}}"#);
        assert_eq!(
            ClientMessage::decode(&text).unwrap(),
            ClientMessage::Restart {
                declared_partner_id: partner
            }
        );
    }

    #[test_timeout::timeout]
    fn rejects_unknown_and_malformed_frames() {
        let err = ClientMessage::decode(r#"{"type":"find-partner"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(ref kind) if kind == "find-partner"));
        assert_eq!(err.metric_label(), "unknown_kind");

        let err = ClientMessage::decode(r#"{"payload":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingKind));

        let err = ClientMessage::decode(r#"{"type":"restart"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidBody(_)));

        let err = ClientMessage::decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test_timeout::timeout]
    fn server_messages_use_kebab_tags_and_camel_fields() {
        let partner = SessionId::new();
        let paired = serde_json::to_value(ServerMessage::Paired {
            partner_id: partner,
            is_initiator: true,
        })
        .unwrap();
        assert_eq!(
            paired,
            json!({ "type": "paired", "partnerId": partner, "isInitiator": true })
        );

        let update = serde_json::to_value(ServerMessage::QueueUpdate {
            position: 1,
            total: 2,
        })
        .unwrap();
        assert_eq!(
            update,
            json!({ "type": "queue-update", "position": 1, "total": 2 })
        );

        let gone = serde_json::to_value(ServerMessage::PartnerGone).unwrap();
        assert_eq!(gone, json!({ "type": "partner-gone" }));
    }

    #[test_timeout::timeout]
    fn relayed_payloads_are_tagged_with_the_sender() {
        let from = SessionId::new();
        assert_eq!(
            SignalKind::Answer.deliver(json!("y"), from),
            ServerMessage::NegotiationAnswer {
                payload: json!("y"),
                from
            }
        );
    }
}
