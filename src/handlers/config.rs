use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "bridge": {
                "batch_threshold": config.bridge.batch_threshold,
                "trailing_audio": config.bridge.trailing_audio,
                "max_concurrent_sessions": config.bridge.max_concurrent_sessions,
                "frame_queue_depth": config.bridge.frame_queue_depth,
                "idle_timeout_secs": config.bridge.idle_timeout_secs,
                "heartbeat_interval_secs": config.bridge.heartbeat_interval_secs,
                "track": config.bridge.track
            },
            "transcoder": {
                "program": config.transcoder.program,
                "read_buffer_size": config.transcoder.read_buffer_size,
                "read_timeout_ms": config.transcoder.read_timeout_ms,
                "write_timeout_ms": config.transcoder.write_timeout_ms,
                "drain_timeout_ms": config.transcoder.drain_timeout_ms,
                "input": {
                    "encoding": config.transcoder.input.encoding,
                    "sample_rate": config.transcoder.input.sample_rate,
                    "channels": config.transcoder.input.channels
                },
                "output": {
                    "sample_rate": config.transcoder.output.sample_rate,
                    "channels": config.transcoder.output.channels
                }
            },
            "recognition": {
                "sink": state.recognizers.describe(),
                "log_partial_results": config.recognition.log_partial_results
            },
            "telephony": {
                "public_host": config.telephony.public_host,
                "stream_path": config.telephony.stream_path
            }
        }
    })))
}
