use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use beach_pier_core::{ClientMessage, Engine, ServerMessage, SessionId, SignalKind};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;

/// WebSocket upgrade handler. Every upgraded socket is one participant.
pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let session_id = state.engine.register(tx);
    counter!("beach_pier_connections_total", 1);
    info!(session_id = %session_id, "participant connected");

    // Forward queued notifications to the socket. Exiting drops `rx`, which the
    // liveness sweep reads as a dead transport. The channel ends once the engine
    // drops the session (eviction included), and the socket is closed with it.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        debug!(session_id = %session_id, "socket refused message; writer stopping");
                        return;
                    }
                }
                Err(err) => warn!(session_id = %session_id, error = %err, "failed to encode message"),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!(session_id = %session_id, "session dropped by engine; socket closed");
    });

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = &mut writer => {
                info!(session_id = %session_id, "writer finished; ending connection");
                break;
            }
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(session_id = %session_id, error = %err, "error receiving frame");
                break;
            }
            None => break,
        };
        state.engine.touch(session_id);

        match frame {
            Message::Text(text) => handle_text(&state.engine, session_id, &text),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_text(&state.engine, session_id, text),
                Err(_) => {
                    counter!("beach_pier_protocol_errors_total", 1, "reason" => "binary_not_utf8");
                    state.engine.notify(
                        session_id,
                        ServerMessage::Error {
                            message: "binary frames must carry utf-8 json".to_string(),
                        },
                    );
                }
            },
            Message::Close(frame) => {
                info!(
                    session_id = %session_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "participant closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.engine.remove(session_id);
    writer.abort();
    info!(session_id = %session_id, "participant disconnected");
}

fn handle_text(engine: &Engine, session_id: SessionId, text: &str) {
    match ClientMessage::decode(text) {
        Ok(message) => dispatch(engine, session_id, message),
        Err(err) => {
            counter!("beach_pier_protocol_errors_total", 1, "reason" => err.metric_label());
            warn!(session_id = %session_id, error = %err, "rejecting client frame");
            engine.notify(
                session_id,
                ServerMessage::Error {
                    message: err.to_string(),
                },
            );
        }
    }
}

fn dispatch(engine: &Engine, session_id: SessionId, message: ClientMessage) {
    match message {
        ClientMessage::RequestPairing => {
            let outcome = engine.request_pairing(session_id);
            debug!(session_id = %session_id, ?outcome, "pairing requested");
        }
        ClientMessage::NegotiationOffer { payload, to } => {
            engine.forward(session_id, SignalKind::Offer, payload, to);
        }
        ClientMessage::NegotiationAnswer { payload, to } => {
            engine.forward(session_id, SignalKind::Answer, payload, to);
        }
        ClientMessage::CandidateHint { payload, to } => {
            engine.forward(session_id, SignalKind::CandidateHint, payload, to);
        }
        ClientMessage::DissolvePair => {
            let outcome = engine.dissolve_pair(session_id);
            debug!(session_id = %session_id, ?outcome, "dissolve requested");
        }
        ClientMessage::Restart {
            declared_partner_id,
        } => {
            let outcome = engine.request_restart(session_id, declared_partner_id);
            debug!(session_id = %session_id, ?outcome, "restart requested");
        }
        ClientMessage::LivenessPing => {
            engine.notify(session_id, ServerMessage::Pong);
        }
    }
}
