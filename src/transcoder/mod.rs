//! # Transcoding Pipe Manager
//!
//! Owns the external streaming transcoder that turns provider-native telephony audio
//! into linear PCM for the recognition sink. One process per call, never pooled: the
//! transcoder's internal state belongs to a single stream and a single input format.
//!
//! ## Key Components:
//! - **AudioConverter**: the per-session `convert` / `drain_and_stop` seam
//! - **ConverterFactory**: launches a converter for a negotiated input format
//! - **TranscodingPipe**: the process-backed converter (`pipe.rs`)
//! - **FfmpegTranscoder**: factory that configures ffmpeg for low-latency streaming

pub mod pipe;

pub use pipe::FfmpegTranscoder;

use crate::bridge::protocol::MediaFormat;
use crate::error::BridgeError;
use async_trait::async_trait;

/// Linear PCM format produced for the recognition sink (signed 16-bit little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl OutputFormat {
    /// Bytes of PCM per second of audio.
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * 2
    }
}

/// A running streaming converter owned by exactly one session.
///
/// ## Contract:
/// - `convert` writes one batch and makes exactly one bounded read attempt; the bytes
///   it returns need not correspond to the batch just written, and an empty result
///   means "no output yet"
/// - `drain_and_stop` signals end of input, collects the remaining output and releases
///   the underlying resources; calling it again returns an empty tail
#[async_trait]
pub trait AudioConverter: Send {
    async fn convert(&mut self, batch: &[u8]) -> Result<Vec<u8>, BridgeError>;

    async fn drain_and_stop(&mut self) -> Result<Vec<u8>, BridgeError>;
}

/// Launches converters, one per session.
pub trait ConverterFactory: Send + Sync {
    /// Start a converter reading `input` and emitting `output`.
    ///
    /// Fails with `BridgeError::PipeStart` when the converter cannot be launched.
    fn start(
        &self,
        session_id: &str,
        input: &MediaFormat,
        output: &OutputFormat,
    ) -> Result<Box<dyn AudioConverter>, BridgeError>;

    /// Name shown in health output and logs.
    fn describe(&self) -> String;
}
