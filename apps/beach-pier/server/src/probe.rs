use anyhow::{anyhow, Context, Result};
use beach_pier_core::{ClientMessage, ServerMessage};
use clap::Args;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Websocket endpoint of the pier
    #[arg(short, long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// How long to keep listening before hanging up
    #[arg(short, long, default_value_t = 30)]
    duration_secs: u64,

    /// Payload to send as a negotiation offer once paired as initiator (parsed as JSON when possible)
    #[arg(long)]
    offer: Option<String>,
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    debug!("Connecting to {}", args.url);
    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&args.url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", args.url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the pier running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let request = serde_json::to_string(&ClientMessage::RequestPairing)?;
    write.send(Message::Text(request.into())).await?;

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Err(_) => break,
            Ok(None) => {
                println!("pier closed the connection");
                return Ok(());
            }
            Ok(Some(frame)) => frame.context("websocket error")?,
        };
        let Message::Text(text) = frame else {
            continue;
        };
        let message: ServerMessage =
            serde_json::from_str(text.as_str()).context("pier sent an unrecognized message")?;
        println!("{}", describe(&message));

        if let ServerMessage::Paired {
            partner_id,
            is_initiator: true,
        } = message
        {
            if let Some(offer) = &args.offer {
                let outbound = ClientMessage::NegotiationOffer {
                    payload: parse_payload(offer),
                    to: Some(partner_id),
                };
                write
                    .send(Message::Text(serde_json::to_string(&outbound)?.into()))
                    .await?;
                println!("-> sent offer to {partner_id}");
            }
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn describe(message: &ServerMessage) -> String {
    match message {
        ServerMessage::Registered { session_id } => format!("registered as {session_id}"),
        ServerMessage::Waiting { position, total } => {
            format!("waiting for a partner ({position}/{total})")
        }
        ServerMessage::QueueUpdate { position, total } => {
            format!("queue moved ({position}/{total})")
        }
        ServerMessage::Paired {
            partner_id,
            is_initiator,
        } => format!(
            "paired with {partner_id} ({})",
            if *is_initiator { "initiator" } else { "responder" }
        ),
        ServerMessage::NegotiationOffer { payload, from } => format!("<- offer from {from}: {payload}"),
        ServerMessage::NegotiationAnswer { payload, from } => {
            format!("<- answer from {from}: {payload}")
        }
        ServerMessage::CandidateHint { payload, from } => {
            format!("<- candidate hint from {from}: {payload}")
        }
        ServerMessage::PartnerGone => "partner gone".to_string(),
        ServerMessage::Pong => "pong".to_string(),
        ServerMessage::Error { message } => format!("error: {message}"),
    }
}
