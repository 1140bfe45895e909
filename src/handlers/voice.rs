//! # Voice Callback
//!
//! The provider calls this webhook when a call comes in. The reply is a call-setup
//! document telling it to open a media stream back to our WebSocket endpoint.

use crate::state::AppState;
use actix_web::{http::header::ContentType, web, HttpRequest, HttpResponse};
use tracing::info;

pub async fn voice_callback(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();

    let connection = req.connection_info();
    let host = config
        .telephony
        .public_host
        .as_deref()
        .filter(|host| !host.trim().is_empty())
        .unwrap_or_else(|| connection.host());

    let stream_url = format!("wss://{}{}", host, config.telephony.stream_path);
    info!(stream_url = %stream_url, "Answering voice callback");

    HttpResponse::Ok()
        .content_type(ContentType::xml())
        .body(stream_document(&stream_url))
}

fn stream_document(stream_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{}" /></Connect></Response>"#,
        escape_xml(stream_url)
    )
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{body::to_bytes, http::header, test as actix_test, App};

    async fn call(config: AppConfig, host: &str) -> (String, String) {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config)))
                .route("/callback/calls/voice", web::post().to(voice_callback)),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/callback/calls/voice")
            .insert_header((header::HOST, host))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = to_bytes(resp.into_body()).await.unwrap();
        (content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[actix_web::test]
    async fn test_stream_url_uses_request_host() {
        let (content_type, body) = call(AppConfig::default(), "bridge.example.com").await;

        assert!(content_type.starts_with("text/xml"));
        assert_eq!(
            body,
            r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="wss://bridge.example.com/stream" /></Connect></Response>"#
        );
    }

    #[actix_web::test]
    async fn test_public_host_overrides_request_host() {
        let mut config = AppConfig::default();
        config.telephony.public_host = Some("calls.example.org".to_string());
        config.telephony.stream_path = "/media".to_string();

        let (_, body) = call(config, "10.0.0.5:8080").await;
        assert!(body.contains(r#"url="wss://calls.example.org/media""#));
    }

    #[test]
    fn test_url_is_escaped() {
        let document = stream_document("wss://host/stream?a=1&b=\"2\"");
        assert!(document.contains(r#"url="wss://host/stream?a=1&amp;b=&quot;2&quot;""#));
    }
}
