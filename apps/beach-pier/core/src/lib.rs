//! Matchmaking and signaling relay engine behind the Beach Pier server.
//!
//! Participants register, ask to be paired, and once linked exchange opaque
//! negotiation payloads through the relay until one side leaves. All state
//! lives in an [`Engine`], which serializes every mutation.

mod engine;
mod liveness;
mod pairing;
mod protocol;
mod queue;
mod registry;
mod relay;

pub use engine::{Engine, EngineStats};
pub use liveness::{Heartbeat, LivenessConfig, LivenessProbe, SweepReport, TransportProbe};
pub use pairing::{DissolveOutcome, PairingOutcome};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, SessionId, SignalKind};
pub use registry::{Removal, Session, SessionState};
pub use relay::{RelayOutcome, RestartOutcome};
