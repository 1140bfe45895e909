//! # Audio Bridge
//!
//! Everything that happens to one call's media stream between the WebSocket and the
//! recognition sink.
//!
//! ## Module Organization:
//! - **protocol**: provider event envelopes in, control messages out
//! - **batcher**: accumulates decoded frames into transcoder-sized batches
//! - **session**: the per-call state machine tying parser, batcher, transcoder and sink together

pub mod batcher;
pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use session::{
    BridgeSession, BridgeSettings, CloseStatus, InboundFrame, SessionControl, SessionReport, SessionState,
    SocketCommand,
};
