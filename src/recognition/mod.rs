//! # Recognition Sink Boundary
//!
//! The bridge ends at a speech recognizer it does not implement. This module defines
//! the seam:
//!
//! - **RecognitionSink**: receives converted PCM for one session (`start`, `push_audio`, `stop`)
//! - **RecognitionEvent**: asynchronous results flowing back from the recognizer
//! - **TranscriptHandler**: application hook invoked for each result
//! - **RecognizerFactory**: creates one sink per session
//!
//! ## Event Flow:
//! Results arrive whenever the recognizer produces them, not in step with `push_audio`.
//! The sink is handed an unbounded sender at `start`; a listener task owned by the
//! session drains the receiving end and calls the handler. The listener is spawned
//! before the sink starts, so no early result is lost.

pub mod discarding;
pub mod handler;

pub use discarding::DiscardingRecognizerFactory;
pub use handler::LoggingTranscriptHandler;

use crate::error::BridgeError;
use crate::transcoder::OutputFormat;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One asynchronous result from a recognizer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// Interim hypothesis, may still change
    Partial(String),
    /// Settled text for an utterance
    Final(String),
    /// The recognizer gave up; carries its reason
    Cancelled(String),
}

pub type RecognitionEvents = mpsc::UnboundedSender<RecognitionEvent>;

/// Consumer of one session's converted audio.
#[async_trait]
pub trait RecognitionSink: Send {
    /// Begin recognition; results are sent on `events` until `stop`.
    async fn start(&mut self, events: RecognitionEvents) -> Result<(), BridgeError>;

    /// Accept one chunk of 16-bit little-endian PCM.
    async fn push_audio(&mut self, pcm: &[u8]) -> Result<(), BridgeError>;

    async fn stop(&mut self) -> Result<(), BridgeError>;
}

/// Creates a fresh sink for each session.
pub trait RecognizerFactory: Send + Sync {
    fn create(&self, session_id: &str, format: &OutputFormat) -> Box<dyn RecognitionSink>;

    fn describe(&self) -> String;
}

/// Application callbacks for recognition results.
pub trait TranscriptHandler: Send + Sync {
    fn on_partial(&self, session_id: &str, text: &str);

    fn on_final(&self, session_id: &str, text: &str);

    fn on_cancelled(&self, session_id: &str, reason: &str);
}

/// Spawn the task that feeds recognition events to `handler`.
///
/// The task ends once every clone of the returned sender is dropped, which happens
/// when the sink is stopped and dropped by its session.
pub fn spawn_listener(
    session_id: String,
    handler: Arc<dyn TranscriptHandler>,
) -> (RecognitionEvents, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                RecognitionEvent::Partial(text) => handler.on_partial(&session_id, &text),
                RecognitionEvent::Final(text) => handler.on_final(&session_id, &text),
                RecognitionEvent::Cancelled(reason) => handler.on_cancelled(&session_id, &reason),
            }
        }
        debug!(session_id = %session_id, "Recognition listener finished");
    });

    (tx, task)
}
