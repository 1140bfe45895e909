use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "completed": metrics.completed_sessions,
            "failed": metrics.failed_sessions,
            "rejected": metrics.rejected_sessions
        },
        "transcoder": {
            "program": state.converters.describe(),
            "input": config.transcoder.default_input_format().to_string(),
            "output_sample_rate": config.transcoder.output.sample_rate
        },
        "recognition": {
            "sink": state.recognizers.describe()
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "completed": metrics.completed_sessions,
            "failed": metrics.failed_sessions,
            "rejected": metrics.rejected_sessions,
            "failure_rate": if metrics.total_sessions > 0 {
                metrics.failed_sessions as f64 / metrics.total_sessions as f64
            } else {
                0.0
            }
        },
        "audio": {
            "frames_received": metrics.frames_received,
            "frames_dropped": metrics.frames_dropped,
            "audio_bytes_in": metrics.audio_bytes_in,
            "pcm_bytes_out": metrics.pcm_bytes_out,
            "pcm_seconds_out": metrics.pcm_bytes_out as f64
                / config.transcoder.output_format().bytes_per_second().max(1) as f64
        },
        "memory": get_memory_info(),
        "limits": {
            "max_concurrent_sessions": config.bridge.max_concurrent_sessions,
            "batch_threshold": config.bridge.batch_threshold
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max_sessions = config.bridge.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing bridge.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, App};

    #[test]
    fn test_system_status_levels() {
        let mut config = AppConfig::default();
        config.bridge.max_concurrent_sessions = 10;

        let metrics = AppMetrics {
            active_sessions: 8,
            ..Default::default()
        };
        assert_eq!(get_system_status(&config, &metrics)["status"], "moderate_load");

        let metrics = AppMetrics {
            active_sessions: 10,
            ..Default::default()
        };
        let status = get_system_status(&config, &metrics);
        assert_eq!(status["status"], "high_load");
        assert_eq!(status["load_warnings"].as_array().map(Vec::len), Some(1));

        let metrics = AppMetrics::default();
        assert_eq!(get_system_status(&config, &metrics)["status"], "normal");
    }

    #[actix_web::test]
    async fn test_health_endpoint() {
        let state = AppState::new(AppConfig::default());
        state.try_begin_session(10);

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            actix_test::call_and_read_body_json(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["transcoder"]["program"], "ffmpeg");

        let body: serde_json::Value =
            actix_test::call_and_read_body_json(&app, actix_test::TestRequest::get().uri("/metrics").to_request()).await;
        assert_eq!(body["sessions"]["total"], 1);
        assert_eq!(body["audio"]["pcm_bytes_out"], 0);
    }
}
