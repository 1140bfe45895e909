//! # Frame Batcher
//!
//! Accumulates decoded provider audio until a fixed threshold, then hands the whole
//! buffer to the session's converter as one batch. Telephony frames are tiny (160 bytes
//! per 20ms of mu-law), so writing each one to the transcoder separately would cost a
//! syscall round trip per frame for no gain in latency.
//!
//! ## Buffer Rules:
//! - Bytes are appended in arrival order and never reordered
//! - A flush takes the entire buffer, never part of it
//! - The buffer is empty again before the converter is even called, so a failed
//!   conversion never replays old audio

use crate::error::BridgeError;
use crate::transcoder::AudioConverter;
use tracing::debug;

pub struct FrameBatcher {
    buffer: Vec<u8>,
    threshold: usize,
    converter: Box<dyn AudioConverter>,
    batches_flushed: u64,
}

impl FrameBatcher {
    pub fn new(threshold: usize, converter: Box<dyn AudioConverter>) -> Self {
        Self {
            buffer: Vec::with_capacity(threshold * 2),
            threshold,
            converter,
            batches_flushed: 0,
        }
    }

    /// Append one frame; convert the buffer once it reaches the threshold.
    ///
    /// ## Returns:
    /// - **Ok(None)**: still below the threshold, nothing was written
    /// - **Ok(Some(pcm))**: a batch was written; `pcm` may be empty while the
    ///   transcoder is still buffering
    /// - **Err(BridgeError)**: the converter failed; the batch is lost
    pub async fn accept(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, BridgeError> {
        self.buffer.extend_from_slice(frame);

        if self.buffer.len() < self.threshold {
            return Ok(None);
        }

        self.flush().await.map(Some)
    }

    /// Convert whatever is buffered, even below the threshold.
    ///
    /// Only used at stream end. Returns `Ok(None)` when nothing is pending.
    pub async fn flush_remaining(&mut self) -> Result<Option<Vec<u8>>, BridgeError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        self.flush().await.map(Some)
    }

    /// Drop buffered bytes without converting them; returns how many were dropped.
    pub fn discard_remaining(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    /// Stop the converter and return its drained output.
    pub async fn drain_and_stop(&mut self) -> Result<Vec<u8>, BridgeError> {
        self.converter.drain_and_stop().await
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed
    }

    async fn flush(&mut self) -> Result<Vec<u8>, BridgeError> {
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.threshold * 2));
        self.batches_flushed += 1;

        let output = self.converter.convert(&batch).await?;
        debug!(
            batch_bytes = batch.len(),
            output_bytes = output.len(),
            batch = self.batches_flushed,
            "Converted batch"
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::{FailingConverter, RecordingConverter};

    #[tokio::test]
    async fn test_below_threshold_never_flushes() {
        let converter = RecordingConverter::echo();
        let batches = converter.batches();
        let mut batcher = FrameBatcher::new(512, Box::new(converter));

        for _ in 0..5 {
            assert!(batcher.accept(&[0xff; 100]).await.unwrap().is_none());
        }

        assert_eq!(batcher.pending_len(), 500);
        assert_eq!(batcher.batches_flushed(), 0);
        assert!(batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_crossing_threshold_flushes_whole_buffer() {
        let converter = RecordingConverter::echo();
        let batches = converter.batches();
        let mut batcher = FrameBatcher::new(512, Box::new(converter));

        // Ten 100-byte frames: one flush at the sixth, 400 bytes left over.
        let mut flushes = Vec::new();
        for i in 0..10 {
            if let Some(output) = batcher.accept(&[i as u8; 100]).await.unwrap() {
                flushes.push((i, output.len()));
            }
        }

        assert_eq!(flushes, vec![(5, 600)]);
        assert_eq!(batcher.pending_len(), 400);
        assert_eq!(batches.lock().unwrap()[0].len(), 600);
    }

    #[tokio::test]
    async fn test_no_bytes_lost_or_reordered() {
        let converter = RecordingConverter::echo();
        let batches = converter.batches();
        let mut batcher = FrameBatcher::new(64, Box::new(converter));

        let mut accepted = Vec::new();
        for i in 0..50u8 {
            let frame: Vec<u8> = (0..(i % 7 + 1)).map(|j| i.wrapping_mul(3).wrapping_add(j)).collect();
            accepted.extend_from_slice(&frame);
            batcher.accept(&frame).await.unwrap();
        }
        batcher.flush_remaining().await.unwrap();

        let converted: Vec<u8> = batches.lock().unwrap().concat();
        assert_eq!(converted, accepted);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_empty_output_is_not_an_error() {
        let mut batcher = FrameBatcher::new(10, Box::new(RecordingConverter::silent()));

        let output = batcher.accept(&[1; 10]).await.unwrap();
        assert_eq!(output, Some(Vec::new()));
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_convert_still_resets_buffer() {
        let converter = FailingConverter::new();
        let calls = converter.calls();
        let mut batcher = FrameBatcher::new(10, Box::new(converter));

        assert!(batcher.accept(&[1; 12]).await.is_err());
        assert_eq!(batcher.pending_len(), 0);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_and_discard_remaining() {
        let converter = RecordingConverter::echo();
        let batches = converter.batches();
        let mut batcher = FrameBatcher::new(512, Box::new(converter));

        assert!(batcher.flush_remaining().await.unwrap().is_none());

        batcher.accept(&[7; 300]).await.unwrap();
        assert_eq!(batcher.discard_remaining(), 300);
        assert!(batcher.flush_remaining().await.unwrap().is_none());

        batcher.accept(&[8; 300]).await.unwrap();
        assert_eq!(batcher.flush_remaining().await.unwrap().map(|pcm| pcm.len()), Some(300));
        assert_eq!(batches.lock().unwrap().len(), 1);
    }
}
