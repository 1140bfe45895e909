//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket session through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the effective configuration, behind `Arc<RwLock<..>>`
//! - **metrics**: service-wide session and byte counters
//! - **components**: the transcoder launcher, recognizer factory and transcript handler
//!   every session is built from
//! - **sessions**: control handles of the live sessions, keyed by session id
//!
//! Sessions never share anything else; a session's own resources live in its task.
//!
//! ## Locking:
//! All locks are held only for a counter update or a clone. A poisoned lock still holds
//! consistent counters, so readers recover the guard instead of propagating the panic.

use crate::bridge::{SessionControl, SessionReport, SessionState};
use crate::config::AppConfig;
use crate::recognition::{
    DiscardingRecognizerFactory, LoggingTranscriptHandler, RecognizerFactory, TranscriptHandler,
};
use crate::transcoder::{ConverterFactory, FfmpegTranscoder};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub converters: Arc<dyn ConverterFactory>,
    pub recognizers: Arc<dyn RecognizerFactory>,
    pub transcripts: Arc<dyn TranscriptHandler>,
    pub sessions: Arc<RwLock<HashMap<String, SessionControl>>>,
    pub start_time: Instant,
}

/// Counters collected across all media stream sessions.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Sessions currently holding a socket and (possibly) a transcoder
    pub active_sessions: u32,
    pub total_sessions: u64,
    pub completed_sessions: u64,
    pub failed_sessions: u64,
    /// Upgrades refused because the session limit was reached
    pub rejected_sessions: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub audio_bytes_in: u64,
    pub pcm_bytes_out: u64,
}

impl AppState {
    /// Build state with the shipped components: ffmpeg, the discarding recognizer and
    /// the logging transcript handler.
    pub fn new(config: AppConfig) -> Self {
        let converters = Arc::new(FfmpegTranscoder::from_config(&config.transcoder));
        let transcripts = Arc::new(LoggingTranscriptHandler::new(config.recognition.log_partial_results));

        Self::with_components(config, converters, Arc::new(DiscardingRecognizerFactory), transcripts)
    }

    pub fn with_components(
        config: AppConfig,
        converters: Arc<dyn ConverterFactory>,
        recognizers: Arc<dyn RecognizerFactory>,
        transcripts: Arc<dyn TranscriptHandler>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            converters,
            recognizers,
            transcripts,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Reserve a slot for a new session.
    ///
    /// ## Returns:
    /// - **true**: the session counts as active until `end_session`
    /// - **false**: `max_sessions` are already active; the rejection is counted
    ///
    /// The check and the increment happen under one write lock, so concurrent upgrades
    /// can never overshoot the limit.
    pub fn try_begin_session(&self, max_sessions: usize) -> bool {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions as usize >= max_sessions {
            metrics.rejected_sessions += 1;
            return false;
        }

        metrics.active_sessions += 1;
        metrics.total_sessions += 1;
        true
    }

    /// Make a running session reachable for playback control.
    pub fn register_session(&self, session_id: &str, control: SessionControl) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), control);
    }

    pub fn session_control(&self, session_id: &str) -> Option<SessionControl> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Release a session's slot and fold its report into the counters.
    pub fn end_session(&self, report: &SessionReport) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&report.session_id);

        let mut metrics = self.metrics_mut();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);

        match report.state {
            SessionState::Failed => metrics.failed_sessions += 1,
            _ => metrics.completed_sessions += 1,
        }

        metrics.frames_received += report.stats.frames_received;
        metrics.frames_dropped += report.stats.frames_dropped;
        metrics.audio_bytes_in += report.stats.audio_bytes_in;
        metrics.pcm_bytes_out += report.stats.pcm_bytes_out;
    }

    /// Release a slot for a session that never ran (the upgrade itself failed).
    pub fn abandon_session(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
        metrics.failed_sessions += 1;
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}
