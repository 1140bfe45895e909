//! # Configuration Management
//!
//! Loads the bridge configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_BRIDGE__BATCH_THRESHOLD`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::bridge::protocol::{AudioEncoding, MediaFormat};
use crate::transcoder::OutputFormat;

/// Main application configuration.
///
/// ## Why separate config structs:
/// The HTTP server, the per-call bridge, the transcoder process and the recognition
/// boundary are tuned independently, so each gets its own table in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    pub transcoder: TranscoderConfig,
    pub recognition: RecognitionConfig,
    pub telephony: TelephonyConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// What happens to audio still buffered below the batch threshold when a stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingAudioPolicy {
    /// Convert the partial batch, drain the transcoder and forward the tail
    Flush,
    /// Drop the partial batch and the transcoder's drained tail
    Discard,
}

/// Per-call bridge tuning.
///
/// ## Fields:
/// - `batch_threshold`: bytes of provider-encoded audio collected before one transcoder write
/// - `trailing_audio`: policy for the sub-threshold remainder at stream end
/// - `max_concurrent_sessions`: media streams accepted at once; more are rejected with 503
/// - `frame_queue_depth`: inbound frames queued between the socket and the session task
/// - `idle_timeout_secs`: close the socket after this long without any inbound frame
/// - `heartbeat_interval_secs`: how often the socket pings the provider
/// - `track`: only feed `media` events from this track (`"any"` accepts all tracks)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub batch_threshold: usize,
    pub trailing_audio: TrailingAudioPolicy,
    pub max_concurrent_sessions: usize,
    pub frame_queue_depth: usize,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub track: String,
}

/// External transcoder process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Binary to launch (looked up on PATH)
    pub program: String,

    /// Size of the receive buffer used for the single read after each batch
    pub read_buffer_size: usize,

    /// Upper bound on that single read
    pub read_timeout_ms: u64,

    /// Upper bound on writing and flushing one batch into the process
    pub write_timeout_ms: u64,

    /// Upper bound on draining the process at stream end before it is killed
    pub drain_timeout_ms: u64,

    /// Input format assumed when the `start` event omits media format fields
    pub input: InputFormatConfig,

    /// Linear PCM format handed to the recognition sink
    pub output: OutputFormatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFormatConfig {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFormatConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Log interim hypotheses, not just final results
    pub log_partial_results: bool,
}

/// Call-setup document settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    /// Host advertised in the stream URL; the request's Host header when unset
    pub public_host: Option<String>,

    /// Path of the media WebSocket endpoint
    pub stream_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            bridge: BridgeConfig {
                batch_threshold: 512,    // ~64ms of 8kHz mu-law
                trailing_audio: TrailingAudioPolicy::Flush,
                max_concurrent_sessions: 50,
                frame_queue_depth: 64,
                idle_timeout_secs: 60,
                heartbeat_interval_secs: 15,
                track: "inbound".to_string(),
            },
            transcoder: TranscoderConfig {
                program: "ffmpeg".to_string(),
                read_buffer_size: 4096,
                read_timeout_ms: 40,
                write_timeout_ms: 1000,
                drain_timeout_ms: 2000,
                input: InputFormatConfig {
                    encoding: "mulaw".to_string(),
                    sample_rate: 8000,
                    channels: 1,
                },
                output: OutputFormatConfig {
                    sample_rate: 16000,
                    channels: 1,
                },
            },
            recognition: RecognitionConfig {
                log_partial_results: true,
            },
            telephony: TelephonyConfig {
                public_host: None,
                stream_path: "/stream".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_BRIDGE__TRAILING_AUDIO=discard`: Keep the lossy end-of-call behavior
    /// - `APP_TRANSCODER__PROGRAM=/usr/local/bin/ffmpeg`: Use a specific binary
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.bridge.batch_threshold == 0 {
            return Err(anyhow::anyhow!("Batch threshold must be greater than 0"));
        }

        if self.bridge.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.bridge.frame_queue_depth == 0 {
            return Err(anyhow::anyhow!("Frame queue depth must be greater than 0"));
        }

        if self.bridge.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.bridge.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.transcoder.program.trim().is_empty() {
            return Err(anyhow::anyhow!("Transcoder program cannot be empty"));
        }

        if self.transcoder.read_buffer_size == 0 {
            return Err(anyhow::anyhow!("Transcoder read buffer size must be greater than 0"));
        }

        if self.transcoder.read_timeout_ms == 0 || self.transcoder.write_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Transcoder read and write timeouts must be greater than 0"));
        }

        self.transcoder
            .input
            .encoding
            .parse::<AudioEncoding>()
            .map_err(|e| anyhow::anyhow!("Invalid transcoder input encoding: {}", e))?;

        if self.transcoder.input.sample_rate == 0 || self.transcoder.output.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.transcoder.input.channels == 0 || self.transcoder.output.channels == 0 {
            return Err(anyhow::anyhow!("Channel counts must be greater than 0"));
        }

        if !self.telephony.stream_path.starts_with('/') {
            return Err(anyhow::anyhow!("Stream path must start with '/'"));
        }

        Ok(())
    }
}

impl BridgeConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Track filter, or `None` when every track is accepted.
    pub fn track_filter(&self) -> Option<&str> {
        match self.track.as_str() {
            "" | "any" => None,
            track => Some(track),
        }
    }
}

impl TranscoderConfig {
    /// Media format used when the provider leaves fields out of `start.mediaFormat`.
    ///
    /// Falls back to 8kHz mono mu-law if the configured encoding does not parse;
    /// `AppConfig::validate` rejects that case at startup.
    pub fn default_input_format(&self) -> MediaFormat {
        MediaFormat {
            encoding: self.input.encoding.parse().unwrap_or(AudioEncoding::Mulaw),
            sample_rate: self.input.sample_rate,
            channels: self.input.channels,
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        OutputFormat {
            sample_rate: self.output.sample_rate,
            channels: self.output.channels,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bridge.batch_threshold, 512);
        assert_eq!(config.bridge.trailing_audio, TrailingAudioPolicy::Flush);
        assert_eq!(config.transcoder.program, "ffmpeg");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.batch_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transcoder.input.encoding = "opus".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.telephony.stream_path = "stream".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timings_are_rejected() {
        let mut config = AppConfig::default();
        config.bridge.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.idle_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transcoder.read_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transcoder.write_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_formats() {
        let config = AppConfig::default();
        let input = config.transcoder.default_input_format();
        assert_eq!(input.encoding, AudioEncoding::Mulaw);
        assert_eq!(input.sample_rate, 8000);
        assert_eq!(input.channels, 1);

        let output = config.transcoder.output_format();
        assert_eq!(output.sample_rate, 16000);
        assert_eq!(output.channels, 1);
    }

    #[test]
    fn test_track_filter() {
        let mut bridge = AppConfig::default().bridge;
        assert_eq!(bridge.track_filter(), Some("inbound"));

        bridge.track = "any".to_string();
        assert_eq!(bridge.track_filter(), None);
    }

    #[test]
    fn test_trailing_policy_from_toml_value() {
        let policy: TrailingAudioPolicy = serde_json::from_str("\"discard\"").unwrap();
        assert_eq!(policy, TrailingAudioPolicy::Discard);
    }
}
