//! # Media Stream Protocol
//!
//! Decodes the telephony provider's JSON event envelopes and encodes the optional
//! control messages we can send back.
//!
//! ## Inbound Events (provider → bridge):
//! - **connected**: socket established, carries protocol name and version
//! - **start**: stream metadata (`streamSid`, call/account ids, media format)
//! - **media**: one base64 audio payload with track, chunk and timestamp
//! - **stop**: the provider ended the stream
//! - **mark** / **dtmf**: playback marker echo and keypad digits (diagnostic only)
//!
//! ## Outbound Messages (bridge → provider):
//! - **mark**: ask the provider to report when playback reaches a named point
//! - **clear**: ask the provider to flush its outbound audio buffer
//!
//! The parser is permissive: optional fields may be missing and unknown fields are
//! ignored, because the provider versions its protocol by adding fields.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Recoverable problems with a single inbound frame.
///
/// The session logs these and carries on with the next frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("envelope has no string `event` field")]
    MissingEvent,

    #[error("unknown event `{0}`")]
    UnknownEvent(String),

    #[error("invalid `{event}` event: {source}")]
    InvalidEvent {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("media payload is not valid base64: {0}")]
    InvalidPayload(#[source] base64::DecodeError),
}

/// One classified inbound event.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected(ConnectedEvent),
    Start(StartEvent),
    Media(MediaEvent),
    Stop(StopEvent),
    Mark(MarkEvent),
    Dtmf(DtmfEvent),
}

impl StreamEvent {
    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected(_) => "connected",
            StreamEvent::Start(_) => "start",
            StreamEvent::Media(_) => "media",
            StreamEvent::Stop(_) => "stop",
            StreamEvent::Mark(_) => "mark",
            StreamEvent::Dtmf(_) => "dtmf",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectedEvent {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartEvent {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<String>,
    #[serde(default)]
    pub start: StartMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default)]
    pub media_format: Option<WireMediaFormat>,
}

/// `start.mediaFormat` exactly as the provider sends it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMediaFormat {
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEvent {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<String>,
    pub media: MediaPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub payload: String,
}

/// Decoded audio of one `media` event.
///
/// `chunk` and `timestamp` are kept for diagnostics only; the protocol delivers frames
/// in order, so they are never used for reordering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    pub track: Option<String>,
    pub chunk: Option<String>,
    pub timestamp: Option<String>,
}

impl MediaPayload {
    /// Base64-decode the payload into provider-native audio bytes.
    pub fn decode(&self) -> Result<RawFrame, ProtocolError> {
        let bytes = STANDARD
            .decode(self.payload.trim())
            .map_err(ProtocolError::InvalidPayload)?;

        Ok(RawFrame {
            bytes,
            track: self.track.clone(),
            chunk: self.chunk.clone(),
            timestamp: self.timestamp.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopEvent {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub stop: Option<StopMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMetadata {
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkEvent {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub mark: Option<MarkName>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkName {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtmfEvent {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub dtmf: Option<DtmfDigit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DtmfDigit {
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub digit: Option<String>,
}

/// Classify one inbound text frame.
///
/// ## Dispatch:
/// The `event` tag is matched against the closed set of known events; anything else
/// falls through to `ProtocolError::UnknownEvent` so newer provider events are logged
/// and skipped instead of tearing down the call.
pub fn parse_event(text: &str) -> Result<StreamEvent, ProtocolError> {
    let envelope: Value = serde_json::from_str(text).map_err(ProtocolError::MalformedJson)?;

    let event = envelope
        .get("event")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingEvent)?
        .to_string();

    match event.as_str() {
        "connected" => decode_body("connected", envelope).map(StreamEvent::Connected),
        "start" => decode_body("start", envelope).map(StreamEvent::Start),
        "media" => decode_body("media", envelope).map(StreamEvent::Media),
        "stop" => decode_body("stop", envelope).map(StreamEvent::Stop),
        "mark" => decode_body("mark", envelope).map(StreamEvent::Mark),
        "dtmf" => decode_body("dtmf", envelope).map(StreamEvent::Dtmf),
        _ => Err(ProtocolError::UnknownEvent(event)),
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(
    event: &'static str,
    envelope: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(envelope).map_err(|source| ProtocolError::InvalidEvent { event, source })
}

/// Audio encodings the transcoder can be told to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// G.711 mu-law (the provider's default)
    Mulaw,
    /// G.711 A-law
    Alaw,
}

impl AudioEncoding {
    /// Raw demuxer name understood by ffmpeg's `-f` flag.
    pub fn ffmpeg_format(&self) -> &'static str {
        match self {
            AudioEncoding::Mulaw => "mulaw",
            AudioEncoding::Alaw => "alaw",
        }
    }
}

impl FromStr for AudioEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio/x-mulaw" | "mulaw" | "ulaw" | "pcmu" => Ok(AudioEncoding::Mulaw),
            "audio/x-alaw" | "alaw" | "pcma" => Ok(AudioEncoding::Alaw),
            other => Err(format!("unsupported encoding: {}", other)),
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_format())
    }
}

/// Validated media format of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl MediaFormat {
    /// Resolve the provider's announced format, filling gaps from `default`.
    ///
    /// ## Returns:
    /// - **Ok(MediaFormat)**: announced values where present, defaults elsewhere
    /// - **Err(String)**: the announced encoding is one we cannot transcode
    pub fn resolve(wire: Option<&WireMediaFormat>, default: MediaFormat) -> Result<Self, String> {
        let Some(wire) = wire else {
            return Ok(default);
        };

        let encoding = match wire.encoding.as_deref() {
            Some(name) => name.parse::<AudioEncoding>().map_err(|_| name.to_string())?,
            None => default.encoding,
        };

        Ok(Self {
            encoding,
            sample_rate: wire.sample_rate.filter(|rate| *rate > 0).unwrap_or(default.sample_rate),
            channels: wire.channels.filter(|ch| *ch > 0).unwrap_or(default.channels),
        })
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Hz {}ch", self.encoding, self.sample_rate, self.channels)
    }
}

/// Control messages sent back to the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkName,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

impl OutboundMessage {
    pub fn mark(stream_sid: impl Into<String>, name: impl Into<String>) -> Self {
        OutboundMessage::Mark {
            stream_sid: stream_sid.into(),
            mark: MarkName { name: name.into() },
        }
    }

    pub fn clear(stream_sid: impl Into<String>) -> Self {
        OutboundMessage::Clear {
            stream_sid: stream_sid.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Plain strings and a tag never fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}
