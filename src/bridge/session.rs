//! # Bridge Session
//!
//! One session per accepted media WebSocket. The session consumes the socket's frames
//! in order, drives the call through its lifecycle and owns every per-call resource:
//! the transcoder (inside the batcher), the recognition sink and the listener task that
//! delivers recognition results.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: socket accepted, recognition started, nothing heard from the provider
//! 2. **Connected**: provider sent `connected`
//! 3. **Streaming**: `start` received, transcoder running, `media` frames are forwarded
//! 4. **Stopped**: the stream ended normally (`stop`, close frame, disconnect)
//! 5. **Failed**: the transcoder or the sink broke; the socket is closed with an error
//!
//! ## Transport Independence:
//! The session never touches the WebSocket directly. It reads `InboundFrame`s from any
//! stream and writes `SocketCommand`s to a channel, which lets the transport adapter in
//! `websocket.rs` stay thin and lets tests drive sessions from plain vectors.

use crate::bridge::batcher::FrameBatcher;
use crate::bridge::protocol::{
    parse_event, MediaEvent, MediaFormat, OutboundMessage, ProtocolError, StartEvent, StreamEvent,
};
use crate::config::{AppConfig, TrailingAudioPolicy};
use crate::error::BridgeError;
use crate::recognition::{spawn_listener, RecognitionSink, TranscriptHandler};
use crate::transcoder::{ConverterFactory, OutputFormat};

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long teardown waits for the recognition listener to deliver its last results.
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A frame as delivered by the transport.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Text(String),
    /// Binary frames carry nothing in this protocol; only the size is kept for logging
    Binary(usize),
    /// The peer closed the socket, with its reason if any
    Close(Option<String>),
    /// The transport failed; no further frames will arrive
    TransportError(String),
}

/// Instructions from the session back to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Text(String),
    Close(CloseStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseStatus {
    Normal,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connected,
    Streaming,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Streaming => "streaming",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

/// Identifiers and format captured from the `start` event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallMetadata {
    pub stream_sid: Option<String>,
    pub call_sid: Option<String>,
    pub account_sid: Option<String>,
    #[serde(skip)]
    pub format: Option<MediaFormat>,
    pub tracks: Vec<String>,
    pub custom_parameters: HashMap<String, String>,
}

/// Per-session tuning, resolved once from `AppConfig`.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub batch_threshold: usize,
    pub trailing_audio: TrailingAudioPolicy,
    /// Only `media` from this track is forwarded; `None` accepts every track
    pub track: Option<String>,
    pub default_input: MediaFormat,
    pub output: OutputFormat,
}

impl BridgeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_threshold: config.bridge.batch_threshold,
            trailing_audio: config.bridge.trailing_audio,
            track: config.bridge.track_filter().map(str::to_string),
            default_input: config.transcoder.default_input_format(),
            output: config.transcoder.output_format(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub frames_received: u64,
    pub media_frames: u64,
    pub frames_dropped: u64,
    pub audio_bytes_in: u64,
    pub pcm_bytes_out: u64,
    pub batches_flushed: u64,
    /// Provider-encoded bytes still pending when the stream ended and not converted.
    pub trailing_bytes_discarded: u64,
    /// PCM drained from the transcoder at stream end and not forwarded.
    pub trailing_pcm_discarded: u64,
}

/// Summary returned when a session ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub state: SessionState,
    pub metadata: CallMetadata,
    pub stats: SessionStats,
    pub duration_ms: u64,
    pub failure: Option<String>,
}

/// Sends provider control messages for a session, usable from outside its task.
#[derive(Clone)]
pub struct SessionControl {
    commands: mpsc::UnboundedSender<SocketCommand>,
    stream_sid: watch::Receiver<Option<String>>,
}

impl SessionControl {
    /// Ask the provider to echo `name` back once playback reaches this point.
    ///
    /// Returns `false` before the stream id is known or after the socket is gone.
    pub fn send_mark(&self, name: &str) -> bool {
        self.send(|stream_sid| OutboundMessage::mark(stream_sid, name))
    }

    /// Ask the provider to drop any outbound audio it has buffered.
    pub fn clear_playback(&self) -> bool {
        self.send(OutboundMessage::clear)
    }

    fn send(&self, build: impl FnOnce(String) -> OutboundMessage) -> bool {
        let Some(stream_sid) = self.stream_sid.borrow().clone() else {
            debug!("No stream id yet, control message not sent");
            return false;
        };
        self.commands.send(SocketCommand::Text(build(stream_sid).to_json())).is_ok()
    }

    /// A control bound to a fixed stream id, with the receiving end of its commands.
    #[cfg(test)]
    pub(crate) fn detached(stream_sid: Option<&str>) -> (Self, mpsc::UnboundedReceiver<SocketCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (_, stream_sid) = watch::channel(stream_sid.map(str::to_string));
        (Self { commands, stream_sid }, receiver)
    }
}

pub struct BridgeSession {
    session_id: String,
    settings: BridgeSettings,
    state: SessionState,
    metadata: CallMetadata,
    converters: Arc<dyn ConverterFactory>,
    batcher: Option<FrameBatcher>,
    sink: Option<Box<dyn RecognitionSink>>,
    sink_started: bool,
    handler: Arc<dyn TranscriptHandler>,
    listener: Option<JoinHandle<()>>,
    commands: mpsc::UnboundedSender<SocketCommand>,
    stream_sid: watch::Sender<Option<String>>,
    stats: SessionStats,
    failure: Option<String>,
    started_at: Instant,
}

impl BridgeSession {
    pub fn new(
        session_id: String,
        settings: BridgeSettings,
        converters: Arc<dyn ConverterFactory>,
        sink: Box<dyn RecognitionSink>,
        handler: Arc<dyn TranscriptHandler>,
        commands: mpsc::UnboundedSender<SocketCommand>,
    ) -> Self {
        let (stream_sid, _) = watch::channel(None);

        Self {
            session_id,
            settings,
            state: SessionState::Idle,
            metadata: CallMetadata::default(),
            converters,
            batcher: None,
            sink: Some(sink),
            sink_started: false,
            handler,
            listener: None,
            commands,
            stream_sid,
            stats: SessionStats::default(),
            failure: None,
            started_at: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle for sending `mark` / `clear` to the provider from outside the session task.
    pub fn control(&self) -> SessionControl {
        SessionControl {
            commands: self.commands.clone(),
            stream_sid: self.stream_sid.subscribe(),
        }
    }

    /// Process `frames` until the stream ends or the session reaches a terminal state.
    ///
    /// Teardown runs on every exit path, so the transcoder is always reaped and the
    /// recognition sink always stopped before the report is returned.
    pub async fn run<S>(mut self, mut frames: S) -> SessionReport
    where
        S: Stream<Item = InboundFrame> + Unpin,
    {
        info!(session_id = %self.session_id, "Media stream session started");

        match self.start_recognition().await {
            Ok(()) => {
                while let Some(frame) = frames.next().await {
                    if self.handle_frame(frame).await.is_break() {
                        break;
                    }
                }
            }
            Err(err) => self.fail(err),
        }

        if !self.state.is_terminal() {
            debug!(session_id = %self.session_id, state = self.state.as_str(), "Frame stream ended");
            self.state = SessionState::Stopped;
        }

        self.teardown().await;
        self.report()
    }

    async fn start_recognition(&mut self) -> Result<(), BridgeError> {
        let (events, listener) = spawn_listener(self.session_id.clone(), self.handler.clone());
        self.listener = Some(listener);

        if let Some(sink) = self.sink.as_mut() {
            sink.start(events).await?;
            self.sink_started = true;
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: InboundFrame) -> ControlFlow<()> {
        match frame {
            InboundFrame::Text(text) => {
                self.stats.frames_received += 1;
                match parse_event(&text) {
                    Ok(event) => self.handle_event(event).await,
                    Err(err) => {
                        self.log_protocol_error(&err);
                        ControlFlow::Continue(())
                    }
                }
            }
            InboundFrame::Binary(len) => {
                warn!(session_id = %self.session_id, bytes = len, "Ignoring binary frame");
                ControlFlow::Continue(())
            }
            InboundFrame::Close(reason) => {
                info!(session_id = %self.session_id, reason = ?reason, "Provider closed the socket");
                self.finish(SessionState::Stopped).await
            }
            InboundFrame::TransportError(err) => {
                warn!(session_id = %self.session_id, "Transport error, ending session: {}", err);
                self.state = SessionState::Stopped;
                ControlFlow::Break(())
            }
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) -> ControlFlow<()> {
        if !matches!(event, StreamEvent::Media(_)) {
            debug!(session_id = %self.session_id, event = event.name(), state = self.state.as_str(), "Control event");
        }

        match event {
            StreamEvent::Connected(connected) => {
                if self.state == SessionState::Idle {
                    self.state = SessionState::Connected;
                }
                info!(
                    session_id = %self.session_id,
                    protocol = ?connected.protocol,
                    version = ?connected.version,
                    "Provider connected"
                );
                ControlFlow::Continue(())
            }
            StreamEvent::Start(start) => match self.state {
                SessionState::Idle | SessionState::Connected => match self.begin_stream(start) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) => {
                        self.fail(err);
                        ControlFlow::Break(())
                    }
                },
                state => {
                    warn!(session_id = %self.session_id, state = state.as_str(), "Ignoring duplicate start");
                    ControlFlow::Continue(())
                }
            },
            StreamEvent::Media(media) => {
                if self.state != SessionState::Streaming {
                    self.stats.frames_dropped += 1;
                    debug!(session_id = %self.session_id, state = self.state.as_str(), "Dropping media outside of stream");
                    return ControlFlow::Continue(());
                }
                match self.forward_media(media).await {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) => {
                        self.fail(err);
                        ControlFlow::Break(())
                    }
                }
            }
            StreamEvent::Stop(_) => {
                info!(session_id = %self.session_id, "Provider stopped the stream");
                self.finish(SessionState::Stopped).await
            }
            StreamEvent::Mark(mark) => {
                let name = mark.mark.map(|mark| mark.name).unwrap_or_default();
                info!(session_id = %self.session_id, mark = %name, "Playback mark reached");
                ControlFlow::Continue(())
            }
            StreamEvent::Dtmf(dtmf) => {
                let digit = dtmf.dtmf.and_then(|dtmf| dtmf.digit).unwrap_or_default();
                info!(session_id = %self.session_id, digit = %digit, "DTMF received");
                ControlFlow::Continue(())
            }
        }
    }

    fn begin_stream(&mut self, start: StartEvent) -> Result<(), BridgeError> {
        let meta = start.start;
        let format = MediaFormat::resolve(meta.media_format.as_ref(), self.settings.default_input)
            .map_err(BridgeError::UnsupportedEncoding)?;

        self.metadata = CallMetadata {
            stream_sid: start.stream_sid.or(meta.stream_sid),
            call_sid: meta.call_sid,
            account_sid: meta.account_sid,
            format: Some(format),
            tracks: meta.tracks,
            custom_parameters: meta.custom_parameters,
        };
        self.stream_sid.send_replace(self.metadata.stream_sid.clone());

        info!(
            session_id = %self.session_id,
            stream_sid = ?self.metadata.stream_sid,
            call_sid = ?self.metadata.call_sid,
            format = %format,
            "Stream started"
        );

        let converter = self
            .converters
            .start(&self.session_id, &format, &self.settings.output)?;
        self.batcher = Some(FrameBatcher::new(self.settings.batch_threshold, converter));
        self.state = SessionState::Streaming;
        Ok(())
    }

    async fn forward_media(&mut self, media: MediaEvent) -> Result<(), BridgeError> {
        if let (Some(wanted), Some(track)) = (self.settings.track.as_deref(), media.media.track.as_deref()) {
            if wanted != track {
                self.stats.frames_dropped += 1;
                return Ok(());
            }
        }

        let frame = match media.media.decode() {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.frames_dropped += 1;
                self.log_protocol_error(&err);
                return Ok(());
            }
        };

        self.stats.media_frames += 1;
        self.stats.audio_bytes_in += frame.bytes.len() as u64;
        debug!(
            session_id = %self.session_id,
            chunk = ?frame.chunk,
            timestamp = ?frame.timestamp,
            bytes = frame.bytes.len(),
            "Media frame"
        );

        let batcher = self.batcher.as_mut().ok_or(BridgeError::PipeClosed)?;
        let output = batcher.accept(&frame.bytes).await?;
        if let Some(pcm) = output {
            self.push_pcm(&pcm).await?;
        }
        Ok(())
    }

    async fn push_pcm(&mut self, pcm: &[u8]) -> Result<(), BridgeError> {
        if pcm.is_empty() {
            return Ok(());
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.push_audio(pcm).await?;
            self.stats.pcm_bytes_out += pcm.len() as u64;
        }
        Ok(())
    }

    /// End the stream normally: settle trailing audio, then close the socket.
    async fn finish(&mut self, state: SessionState) -> ControlFlow<()> {
        if self.state == SessionState::Streaming {
            if let Err(err) = self.settle_trailing_audio().await {
                self.fail(err);
                return ControlFlow::Break(());
            }
        }

        self.state = state;
        let _ = self.commands.send(SocketCommand::Close(CloseStatus::Normal));
        ControlFlow::Break(())
    }

    async fn settle_trailing_audio(&mut self) -> Result<(), BridgeError> {
        let Some(batcher) = self.batcher.as_mut() else {
            return Ok(());
        };

        match self.settings.trailing_audio {
            TrailingAudioPolicy::Flush => {
                let pending = batcher.flush_remaining().await?;
                let tail = batcher.drain_and_stop().await?;
                debug!(session_id = %self.session_id, tail_bytes = tail.len(), "Flushed trailing audio");

                if let Some(pcm) = pending {
                    self.push_pcm(&pcm).await?;
                }
                self.push_pcm(&tail).await?;
            }
            TrailingAudioPolicy::Discard => {
                let dropped = batcher.discard_remaining();
                let tail = batcher.drain_and_stop().await?;
                self.stats.trailing_bytes_discarded += dropped as u64;
                self.stats.trailing_pcm_discarded += tail.len() as u64;
                debug!(
                    session_id = %self.session_id,
                    pending_bytes = dropped,
                    tail_bytes = tail.len(),
                    "Discarded trailing audio"
                );
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: BridgeError) {
        error!(session_id = %self.session_id, "Session failed: {}", err);

        let message = err.to_string();
        self.state = SessionState::Failed;
        let _ = self
            .commands
            .send(SocketCommand::Close(CloseStatus::Error(message.clone())));
        self.failure = Some(message);
    }

    fn log_protocol_error(&self, err: &ProtocolError) {
        match err {
            ProtocolError::UnknownEvent(name) => {
                debug!(session_id = %self.session_id, event = %name, "Ignoring unknown event");
            }
            err => warn!(session_id = %self.session_id, "Ignoring bad frame: {}", err),
        }
    }

    /// Release the transcoder and the sink.
    async fn teardown(&mut self) {
        if let Some(mut batcher) = self.batcher.take() {
            let leftover = batcher.discard_remaining();
            self.stats.trailing_bytes_discarded += leftover as u64;
            self.stats.batches_flushed = batcher.batches_flushed();

            match batcher.drain_and_stop().await {
                Ok(tail) if !tail.is_empty() => {
                    debug!(session_id = %self.session_id, tail_bytes = tail.len(), "Dropped transcoder output at teardown");
                }
                Ok(_) => {}
                Err(err) => warn!(session_id = %self.session_id, "Transcoder shutdown failed: {}", err),
            }
        }

        if let Some(mut sink) = self.sink.take() {
            if self.sink_started {
                if let Err(err) = sink.stop().await {
                    warn!(session_id = %self.session_id, "Recognition stop failed: {}", err);
                }
            }
        }

        if let Some(mut listener) = self.listener.take() {
            if tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, &mut listener).await.is_err() {
                warn!(session_id = %self.session_id, "Recognition listener still running, aborting it");
                listener.abort();
            }
        }
    }

    fn report(self) -> SessionReport {
        let report = SessionReport {
            session_id: self.session_id,
            state: self.state,
            metadata: self.metadata,
            stats: self.stats,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            failure: self.failure,
        };

        info!(
            session_id = %report.session_id,
            state = report.state.as_str(),
            frames = report.stats.frames_received,
            audio_bytes_in = report.stats.audio_bytes_in,
            pcm_bytes_out = report.stats.pcm_bytes_out,
            duration_ms = report.duration_ms,
            "Media stream session ended"
        );
        report
    }
}
