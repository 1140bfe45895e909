//! In-memory stand-ins for the transcoder, the recognizer and the transcript handler.

use crate::bridge::protocol::MediaFormat;
use crate::error::BridgeError;
use crate::recognition::{RecognitionEvent, RecognitionEvents, RecognitionSink, TranscriptHandler};
use crate::transcoder::{AudioConverter, ConverterFactory, OutputFormat};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

pub type Shared<T> = Arc<Mutex<T>>;

/// Records every batch; echoes it back or returns nothing.
pub struct RecordingConverter {
    echo: bool,
    tail: Vec<u8>,
    drained: bool,
    batches: Shared<Vec<Vec<u8>>>,
    drains: Shared<usize>,
}

impl RecordingConverter {
    pub fn echo() -> Self {
        Self::new(true)
    }

    pub fn silent() -> Self {
        Self::new(false)
    }

    fn new(echo: bool) -> Self {
        Self {
            echo,
            tail: Vec::new(),
            drained: false,
            batches: Shared::default(),
            drains: Shared::default(),
        }
    }

    /// Bytes returned by the first `drain_and_stop`.
    pub fn with_tail(mut self, tail: &[u8]) -> Self {
        self.tail = tail.to_vec();
        self
    }

    pub fn batches(&self) -> Shared<Vec<Vec<u8>>> {
        self.batches.clone()
    }

    pub fn drains(&self) -> Shared<usize> {
        self.drains.clone()
    }
}

#[async_trait]
impl AudioConverter for RecordingConverter {
    async fn convert(&mut self, batch: &[u8]) -> Result<Vec<u8>, BridgeError> {
        if self.drained {
            return Err(BridgeError::PipeClosed);
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(if self.echo { batch.to_vec() } else { Vec::new() })
    }

    async fn drain_and_stop(&mut self) -> Result<Vec<u8>, BridgeError> {
        *self.drains.lock().unwrap() += 1;
        if self.drained {
            return Ok(Vec::new());
        }
        self.drained = true;
        Ok(std::mem::take(&mut self.tail))
    }
}

/// Fails every write the way a dead transcoder does.
pub struct FailingConverter {
    calls: Shared<usize>,
}

impl FailingConverter {
    pub fn new() -> Self {
        Self {
            calls: Shared::default(),
        }
    }

    pub fn calls(&self) -> Shared<usize> {
        self.calls.clone()
    }
}

#[async_trait]
impl AudioConverter for FailingConverter {
    async fn convert(&mut self, _batch: &[u8]) -> Result<Vec<u8>, BridgeError> {
        *self.calls.lock().unwrap() += 1;
        Err(BridgeError::PipeWrite(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        )))
    }

    async fn drain_and_stop(&mut self) -> Result<Vec<u8>, BridgeError> {
        Ok(Vec::new())
    }
}

/// Hands out one prepared converter; any further start fails.
pub struct FakeFactory {
    converter: Mutex<Option<Box<dyn AudioConverter>>>,
    started: Shared<Vec<MediaFormat>>,
}

impl FakeFactory {
    pub fn with(converter: impl AudioConverter + 'static) -> Self {
        Self {
            converter: Mutex::new(Some(Box::new(converter))),
            started: Shared::default(),
        }
    }

    pub fn unstartable() -> Self {
        Self {
            converter: Mutex::new(None),
            started: Shared::default(),
        }
    }

    pub fn started(&self) -> Shared<Vec<MediaFormat>> {
        self.started.clone()
    }
}

impl ConverterFactory for FakeFactory {
    fn start(
        &self,
        _session_id: &str,
        input: &MediaFormat,
        _output: &OutputFormat,
    ) -> Result<Box<dyn AudioConverter>, BridgeError> {
        self.started.lock().unwrap().push(*input);
        self.converter.lock().unwrap().take().ok_or_else(|| BridgeError::PipeStart {
            program: "fake".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no converter"),
        })
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

/// Records pushed PCM; optionally emits results at start or fails pushes.
#[derive(Default)]
pub struct RecordingSink {
    emit_on_start: Vec<RecognitionEvent>,
    fail_push: bool,
    pushed: Shared<Vec<Vec<u8>>>,
    stopped: Shared<bool>,
    events: Option<RecognitionEvents>,
}

impl RecordingSink {
    pub fn emitting(events: Vec<RecognitionEvent>) -> Self {
        Self {
            emit_on_start: events,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_push: true,
            ..Default::default()
        }
    }

    pub fn pushed(&self) -> Shared<Vec<Vec<u8>>> {
        self.pushed.clone()
    }

    pub fn stopped(&self) -> Shared<bool> {
        self.stopped.clone()
    }
}

#[async_trait]
impl RecognitionSink for RecordingSink {
    async fn start(&mut self, events: RecognitionEvents) -> Result<(), BridgeError> {
        for event in self.emit_on_start.drain(..) {
            let _ = events.send(event);
        }
        self.events = Some(events);
        Ok(())
    }

    async fn push_audio(&mut self, pcm: &[u8]) -> Result<(), BridgeError> {
        if self.fail_push {
            return Err(BridgeError::Recognition("sink rejected audio".to_string()));
        }
        self.pushed.lock().unwrap().push(pcm.to_vec());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        self.events = None;
        *self.stopped.lock().unwrap() = true;
        Ok(())
    }
}

/// Records handler calls as `kind:session:text` strings.
#[derive(Default)]
pub struct RecordingHandler {
    events: Shared<Vec<String>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Shared<Vec<String>> {
        self.events.clone()
    }

    fn record(&self, kind: &str, session_id: &str, text: &str) {
        self.events.lock().unwrap().push(format!("{}:{}:{}", kind, session_id, text));
    }
}

impl TranscriptHandler for RecordingHandler {
    fn on_partial(&self, session_id: &str, text: &str) {
        self.record("partial", session_id, text);
    }

    fn on_final(&self, session_id: &str, text: &str) {
        self.record("final", session_id, text);
    }

    fn on_cancelled(&self, session_id: &str, reason: &str) {
        self.record("cancelled", session_id, reason);
    }
}
