//! # Discarding Recognizer
//!
//! The sink shipped with the bridge. It accepts PCM, measures it and throws it away,
//! which is enough to run the full pipeline end to end and watch levels in the log
//! before a real recognition service is wired in. It never produces transcripts.

use crate::error::BridgeError;
use crate::recognition::{RecognitionEvents, RecognitionSink, RecognizerFactory};
use crate::transcoder::OutputFormat;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use std::time::Duration;
use tracing::{debug, info};

/// Running measurements of the audio a session produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioLevels {
    pub bytes: u64,
    pub samples: u64,
    /// Largest absolute sample value, 0..=32768
    pub peak: u32,
}

pub struct DiscardingRecognizer {
    session_id: String,
    format: OutputFormat,
    levels: AudioLevels,
    /// Odd byte left over from the previous chunk
    carry: Option<u8>,
    events: Option<RecognitionEvents>,
}

impl DiscardingRecognizer {
    pub fn new(session_id: &str, format: OutputFormat) -> Self {
        Self {
            session_id: session_id.to_string(),
            format,
            levels: AudioLevels::default(),
            carry: None,
            events: None,
        }
    }

    #[cfg(test)]
    pub fn levels(&self) -> &AudioLevels {
        &self.levels
    }

    /// Audio time represented by the bytes received so far.
    pub fn duration(&self) -> Duration {
        let per_second = self.format.bytes_per_second().max(1);
        Duration::from_millis(self.levels.bytes * 1000 / per_second)
    }

    fn measure(&mut self, pcm: &[u8]) {
        let mut data = pcm;

        if let Some(low) = self.carry.take() {
            if let Some((&high, rest)) = data.split_first() {
                self.record_sample(LittleEndian::read_i16(&[low, high]));
                data = rest;
            } else {
                self.carry = Some(low);
            }
        }

        let mut samples = data.chunks_exact(2);
        for sample in &mut samples {
            self.record_sample(LittleEndian::read_i16(sample));
        }
        if let [odd] = samples.remainder() {
            self.carry = Some(*odd);
        }
    }

    fn record_sample(&mut self, sample: i16) {
        self.levels.samples += 1;
        self.levels.peak = self.levels.peak.max(sample.unsigned_abs() as u32);
    }
}

#[async_trait]
impl RecognitionSink for DiscardingRecognizer {
    async fn start(&mut self, events: RecognitionEvents) -> Result<(), BridgeError> {
        debug!(session_id = %self.session_id, "Discarding recognizer started");
        self.events = Some(events);
        Ok(())
    }

    async fn push_audio(&mut self, pcm: &[u8]) -> Result<(), BridgeError> {
        if self.events.is_none() {
            return Err(BridgeError::Recognition("audio pushed to a recognizer that is not running".to_string()));
        }
        self.levels.bytes += pcm.len() as u64;
        self.measure(pcm);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        // Releasing the sender lets the session's listener task finish.
        self.events = None;

        info!(
            session_id = %self.session_id,
            pcm_bytes = self.levels.bytes,
            duration_ms = self.duration().as_millis() as u64,
            peak = self.levels.peak,
            "Recognition stopped, audio discarded"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscardingRecognizerFactory;

impl RecognizerFactory for DiscardingRecognizerFactory {
    fn create(&self, session_id: &str, format: &OutputFormat) -> Box<dyn RecognitionSink> {
        Box::new(DiscardingRecognizer::new(session_id, *format))
    }

    fn describe(&self) -> String {
        "discard".to_string()
    }
}
