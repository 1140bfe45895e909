//! # Media Stream WebSocket
//!
//! The telephony provider connects here once per call and streams JSON media events.
//! Each connection becomes one `StreamSocket` actor plus one `BridgeSession` task.
//!
//! ## Division of Labour:
//! - **StreamSocket (actor)**: owns the socket. It answers pings, watches for idle
//!   peers, forwards every inbound frame to the session and executes the session's
//!   `SocketCommand`s (outbound text, close).
//! - **BridgeSession (tokio task)**: owns the call. It parses events, runs the
//!   transcoder and feeds the recognizer. See `bridge::session`.
//!
//! ## Backpressure:
//! Frames travel through a bounded queue. The actor forwards each frame with
//! `ctx.wait`, which suspends further socket reads until the session has room, so a
//! slow transcoder slows the socket down instead of growing memory.

use crate::bridge::{BridgeSession, BridgeSettings, CloseStatus, InboundFrame, SocketCommand};
use crate::config::BridgeConfig;
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Close frame descriptions must fit in a control frame.
const MAX_CLOSE_DESCRIPTION: usize = 120;

pub struct StreamSocket {
    session_id: String,
    frames: mpsc::Sender<InboundFrame>,
    commands: Option<mpsc::UnboundedReceiver<SocketCommand>>,
    last_activity: Instant,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
}

impl StreamSocket {
    pub fn new(
        session_id: String,
        frames: mpsc::Sender<InboundFrame>,
        commands: mpsc::UnboundedReceiver<SocketCommand>,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            session_id,
            frames,
            commands: Some(commands),
            last_activity: Instant::now(),
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Queue a frame for the session, pausing the socket until there is room.
    fn forward(&mut self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let frames = self.frames.clone();

        ctx.wait(
            async move { frames.send(frame).await.is_ok() }
                .into_actor(self)
                .map(|delivered, act, ctx| {
                    if !delivered {
                        debug!(session_id = %act.session_id, "Session has ended, closing socket");
                        ctx.stop();
                    }
                }),
        );
    }

    /// Hand the session a final frame without waiting, then stop.
    ///
    /// If the queue is full the frame is dropped; the session still sees the frame
    /// stream end once the actor is gone.
    fn forward_last(&mut self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let _ = self.frames.try_send(frame);
        ctx.stop();
    }
}

impl Actor for StreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Media WebSocket connected");

        if let Some(commands) = self.commands.take() {
            ctx.add_stream(UnboundedReceiverStream::new(commands));
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if act.last_activity.elapsed() > act.idle_timeout {
                warn!(session_id = %act.session_id, "No frames for {:?}, closing socket", act.idle_timeout);
                act.forward_last(InboundFrame::TransportError("idle timeout".to_string()), ctx);
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Media WebSocket closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for StreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_activity = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.forward(InboundFrame::Text(text.to_string()), ctx),
            Ok(ws::Message::Binary(data)) => self.forward(InboundFrame::Binary(data.len()), ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                let description = reason.and_then(|reason| reason.description);
                self.forward(InboundFrame::Close(description), ctx);
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                self.forward_last(InboundFrame::TransportError(err.to_string()), ctx);
            }
        }
    }
}

/// Commands from the session task.
impl StreamHandler<SocketCommand> for StreamSocket {
    fn handle(&mut self, command: SocketCommand, ctx: &mut Self::Context) {
        match command {
            SocketCommand::Text(text) => ctx.text(text),
            SocketCommand::Close(status) => {
                ctx.close(Some(close_reason(&status)));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // The session task is gone; nobody is left to read frames.
        ctx.stop();
    }
}

fn close_reason(status: &CloseStatus) -> ws::CloseReason {
    match status {
        CloseStatus::Normal => ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: None,
        },
        CloseStatus::Error(message) => {
            let mut end = message.len().min(MAX_CLOSE_DESCRIPTION);
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            ws::CloseReason {
                code: ws::CloseCode::Error,
                description: Some(message[..end].to_string()),
            }
        }
    }
}

/// Upgrade a provider connection into a media stream session.
///
/// ## Responses:
/// - **101 Switching Protocols**: session started
/// - **400**: not a WebSocket upgrade request
/// - **503**: `bridge.max_concurrent_sessions` streams are already active
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let config = state.get_config();
    let max_sessions = config.bridge.max_concurrent_sessions;

    if !state.try_begin_session(max_sessions) {
        warn!(
            peer = ?req.connection_info().peer_addr(),
            "Rejecting media stream, {} sessions already active",
            max_sessions
        );
        return Err(AppError::ServiceUnavailable(format!(
            "Maximum concurrent media streams ({}) reached",
            max_sessions
        ))
        .into());
    }

    let session_id = Uuid::new_v4().to_string();
    let (frames_tx, frames_rx) = mpsc::channel(config.bridge.frame_queue_depth);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let socket = StreamSocket::new(session_id.clone(), frames_tx, commands_rx, &config.bridge);
    let response = ws::start(socket, &req, stream).map_err(|err| {
        state.abandon_session();
        err
    })?;

    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "Accepted media stream"
    );

    let settings = BridgeSettings::from_config(&config);
    let sink = state.recognizers.create(&session_id, &settings.output);
    let session = BridgeSession::new(
        session_id.clone(),
        settings,
        state.converters.clone(),
        sink,
        state.transcripts.clone(),
        commands_tx,
    );
    state.register_session(&session_id, session.control());

    let span = info_span!("media_stream", session_id = %session_id);
    let state = state.into_inner();
    tokio::spawn(
        async move {
            let report = session.run(ReceiverStream::new(frames_rx)).await;
            state.end_session(&report);
        }
        .instrument(span),
    );

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test as actix_test, App};

    fn app_state(max_sessions: usize) -> AppState {
        let mut config = AppConfig::default();
        config.bridge.max_concurrent_sessions = max_sessions;
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_rejects_when_at_capacity() {
        let state = app_state(1);
        assert!(state.try_begin_session(1));

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/stream", web::get().to(media_stream)),
        )
        .await;

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/stream").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.rejected_sessions, 1);
        assert_eq!(metrics.active_sessions, 1);
    }

    #[actix_web::test]
    async fn test_plain_request_releases_slot() {
        let state = app_state(4);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/stream", web::get().to(media_stream)),
        )
        .await;

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/stream").to_request()).await;
        assert!(resp.status().is_client_error());
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_close_reasons() {
        let normal = close_reason(&CloseStatus::Normal);
        assert_eq!(normal.code, ws::CloseCode::Normal);
        assert!(normal.description.is_none());

        let long = "é".repeat(100);
        let error = close_reason(&CloseStatus::Error(long));
        assert_eq!(error.code, ws::CloseCode::Error);
        let description = error.description.unwrap();
        assert!(description.len() <= MAX_CLOSE_DESCRIPTION);
        assert!(description.chars().all(|c| c == 'é'));
    }
}
