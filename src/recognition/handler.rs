use crate::recognition::TranscriptHandler;
use tracing::{info, warn};

/// Writes recognition results to the log.
#[derive(Debug, Clone)]
pub struct LoggingTranscriptHandler {
    log_partials: bool,
}

impl LoggingTranscriptHandler {
    pub fn new(log_partials: bool) -> Self {
        Self { log_partials }
    }
}

impl TranscriptHandler for LoggingTranscriptHandler {
    fn on_partial(&self, session_id: &str, text: &str) {
        if self.log_partials && !text.trim().is_empty() {
            info!(session_id = %session_id, "Partial: {}", text);
        }
    }

    fn on_final(&self, session_id: &str, text: &str) {
        if !text.trim().is_empty() {
            info!(session_id = %session_id, "Final: {}", text);
        }
    }

    fn on_cancelled(&self, session_id: &str, reason: &str) {
        warn!(session_id = %session_id, "Recognition cancelled: {}", reason);
    }
}
