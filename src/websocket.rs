//! # WebSocket Session Handler
//!
//! One actor per client connection. The actor owns the connection's
//! [`ConnectionState`] and turns every transport event (frames, timers, close)
//! into a [`Step`] that it then carries out: talking to the pipeline, sending
//! messages, publishing to discovery, or closing the socket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Client connects to `/ws` (or `/`)
//! 2. **Handshake**: The first frame must be a JSON text frame describing the session
//! 3. **Ready**: Server answers `{"uid": ..., "message": "SERVER_READY", "backend": ...}`
//! 4. **Streaming**: Binary frames carry float32 PCM audio; JSON text frames carry control messages
//! 5. **End**: `END_OF_AUDIO` (binary), a terminating `session_control`, or a close frame
//!
//! Anything other than a valid handshake as the first frame, or silence for
//! longer than the handshake timeout, closes the connection with a specific
//! close code and the reason code as close text.

use crate::admission::validate::SYNTHETIC_UID_PREFIX;
use crate::admission::{AdmissionError, CloseCause, ConnectionState, RoutedFrame, Step};
use crate::config::AdmissionConfig;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// WebSocket actor driving the admission protocol for one connection.
pub struct AdmissionWebSocket {
    /// Phase tracking; owned exclusively by this actor
    state: ConnectionState,

    app: AppState,

    /// Remote peer, for logs
    peer: String,

    handshake_timeout: Duration,
    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Pending handshake timer, cancelled on admission
    handshake_timer: Option<SpawnHandle>,

    /// Last frame or pong from the client
    last_heartbeat: Instant,

    // Cleanup bookkeeping for `stopped`.
    admitted: bool,
    pipeline_open: bool,
    /// Discovery publication, awaited before the record is withdrawn
    publish_task: Option<JoinHandle<()>>,
}

impl AdmissionWebSocket {
    /// Create a new WebSocket actor. Admission settings are read once, so a
    /// runtime config change only affects connections opened after it.
    pub fn new(app: AppState, admission: &AdmissionConfig, peer: String) -> Self {
        Self {
            state: ConnectionState::new(),
            app,
            peer,
            handshake_timeout: Duration::from_millis(admission.handshake_timeout_ms),
            heartbeat_interval: Duration::from_secs(admission.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(admission.client_timeout_secs),
            handshake_timer: None,
            last_heartbeat: Instant::now(),
            admitted: false,
            pipeline_open: false,
            publish_task: None,
        }
    }

    fn uid(&self) -> Option<String> {
        self.state.descriptor().map(|d| d.uid().to_string())
    }

    /// Carry out what the state machine decided.
    fn apply(&mut self, step: Step, ctx: &mut ws::WebsocketContext<Self>) {
        match step {
            Step::Admitted(descriptor) => {
                self.cancel_handshake_timer(ctx);
                self.admitted = true;
                self.app.record_admission(
                    &descriptor,
                    descriptor.uid().starts_with(SYNTHETIC_UID_PREFIX),
                );

                if let Err(err) = self.app.pipeline.open_session(&descriptor) {
                    error!(uid = %descriptor.uid(), error = %err, "Pipeline refused the session");
                    let step = self.state.on_pipeline_failure(err.to_string());
                    self.apply(step, ctx);
                    return;
                }
                self.pipeline_open = true;

                self.send_json(
                    ctx,
                    json!({
                        "uid": descriptor.uid(),
                        "message": "SERVER_READY",
                        "backend": self.app.pipeline.backend()
                    }),
                );

                if let Some(discovery) = &self.app.discovery {
                    let record = discovery.record_for(
                        descriptor.uid(),
                        descriptor.platform(),
                        descriptor.meeting_id(),
                    );
                    self.publish_task = Some(discovery.publish(record));
                }
            }
            Step::Dispatch(frame) => self.dispatch(frame, ctx),
            Step::Recovered(err) => {
                self.app.record_admission_error(&err);
            }
            Step::Ignored => {}
            Step::Close(cause) => self.close(cause, ctx),
        }
    }

    /// Hand an admitted frame to the pipeline, in arrival order.
    fn dispatch(&mut self, frame: RoutedFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(uid) = self.uid() else {
            return;
        };

        let result = match &frame {
            RoutedFrame::Audio(data) => self.app.pipeline.push_audio(&uid, data).map(|()| {
                self.app.record_audio_frame(data.len());
            }),
            RoutedFrame::Control(message) => {
                self.app.pipeline.control(&uid, message).map(|()| {
                    self.app.record_control_message();
                })
            }
            _ => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(err) if !err.is_fatal() => {
                debug!(uid = %uid, error = %err, "Dropping audio frame");
                self.app.record_dropped_frame();
            }
            Err(err) => {
                error!(uid = %uid, error = %err, "Pipeline failed, closing session");
                let step = self.state.on_pipeline_failure(err.to_string());
                self.apply(step, ctx);
            }
        }
    }

    fn close(&mut self, cause: CloseCause, ctx: &mut ws::WebsocketContext<Self>) {
        self.cancel_handshake_timer(ctx);

        match &cause {
            CloseCause::Rejected(err) => {
                self.app.record_admission_error(err);
                self.send_error(ctx, err);
            }
            CloseCause::PipelineFailure(detail) => {
                self.send_json(
                    ctx,
                    json!({
                        "type": "error",
                        "code": cause.reason_code(),
                        "message": detail,
                        "uid": self.uid()
                    }),
                );
            }
            CloseCause::HeartbeatTimeout | CloseCause::ClientEnded | CloseCause::TransportClosed => {}
        }

        if cause.is_error() {
            warn!(
                uid = ?self.uid(),
                peer = %self.peer,
                reason = cause.reason_code(),
                "Closing connection: {}",
                cause
            );
        } else {
            info!(uid = ?self.uid(), reason = cause.reason_code(), "Closing connection: {}", cause);
        }

        ctx.close(Some(ws::CloseReason {
            code: cause.close_code(),
            description: Some(cause.reason_code().to_string()),
        }));
        ctx.stop();
    }

    /// Send a fatal admission error to the client before closing.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &AdmissionError) {
        let mut message = json!({
            "type": "error",
            "code": err.reason_code(),
            "message": err.to_string()
        });
        if let Some(missing) = err.missing_fields() {
            message["missing"] = json!(missing);
        }
        if let Some(uid) = self.uid() {
            message["uid"] = json!(uid);
        }
        self.send_json(ctx, message);
    }

    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, value: serde_json::Value) {
        ctx.text(value.to_string());
    }

    fn cancel_handshake_timer(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(handle) = self.handshake_timer.take() {
            ctx.cancel_future(handle);
        }
    }

    fn start_handshake_timer(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let waited_ms = self.handshake_timeout.as_millis() as u64;
        let handle = ctx.run_later(self.handshake_timeout, move |act, ctx| {
            act.handshake_timer = None;
            let step = act.state.on_handshake_timeout(waited_ms);
            act.apply(step, ctx);
        });
        self.handshake_timer = Some(handle);
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let client_timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                let step = act.state.on_heartbeat_timeout();
                act.apply(step, ctx);
                return;
            }

            ctx.ping(b"");
            if act.state.is_active() {
                act.send_json(
                    ctx,
                    json!({
                        "type": "ping",
                        "timestamp": chrono::Utc::now().timestamp_millis()
                    }),
                );
            }
        });
    }
}

impl Actor for AdmissionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.on_open();
        self.app.record_connection_opened();
        info!(
            peer = %self.peer,
            handshake_timeout_ms = self.handshake_timeout.as_millis() as u64,
            "WebSocket connection opened, awaiting handshake"
        );

        self.start_handshake_timer(ctx);
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let uid = self.uid();

        if let Some(uid) = &uid {
            if self.pipeline_open {
                self.app.pipeline.close_session(uid);
            }
            if let Some(publish) = self.publish_task.take() {
                if let Some(discovery) = &self.app.discovery {
                    // Runs to completion on its own.
                    drop(discovery.withdraw(uid.clone(), Some(publish)));
                }
            }
        }
        if self.admitted {
            self.app.record_session_ended();
        }

        self.state.finish();

        info!(
            uid = ?uid,
            peer = %self.peer,
            reason = self.state.close_cause().map(|c| c.reason_code()).unwrap_or("unknown"),
            duration_ms = (chrono::Utc::now() - self.state.created_at()).num_milliseconds(),
            "WebSocket connection closed"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AdmissionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let step = match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                let registry = Arc::clone(&self.app.registry);
                self.state.on_text(&text, &registry)
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.state.on_binary(data)
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
                Step::Ignored
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
                Step::Ignored
            }
            Ok(ws::Message::Close(reason)) => {
                info!(
                    uid = ?self.uid(),
                    phase = self.state.phase().as_str(),
                    reason = ?reason,
                    "Client closed the connection"
                );
                self.state.on_transport_closed()
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(peer = %self.peer, "Received unexpected continuation frame");
                Step::Ignored
            }
            Ok(ws::Message::Nop) => Step::Ignored,
            Err(err) => {
                error!(peer = %self.peer, "WebSocket protocol error: {}", err);
                self.state.on_transport_closed()
            }
        };

        self.apply(step, ctx);
    }
}

/// WebSocket endpoint, mounted at `/ws` and `/`.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string();
    debug!(peer = %peer, "New WebSocket connection request");

    let admission = app_state.get_config().admission;
    let actor = AdmissionWebSocket::new(app_state.get_ref().clone(), &admission, peer);
    ws::start(actor, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::discovery::tests::RecordingRegistrar;
    use crate::discovery::Discovery;
    use crate::pipeline::TracingPipeline;
    use crate::state::tests::test_state;
    use crate::state::AppMetrics;
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::RwLock;
    use tokio_tungstenite::tungstenite::Message;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn spawn_server(config: AppConfig) -> (String, AppState) {
        let state = test_state(config);
        (serve(state.clone()), state)
    }

    /// Server whose sessions are published to `registrar`.
    async fn spawn_server_with_discovery(registrar: Arc<RecordingRegistrar>) -> (String, AppState) {
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let discovery = Discovery::new(registrar, "10.0.0.5:9090".to_string(), metrics.clone());
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(TracingPipeline::new()),
            Some(discovery),
            metrics,
        );
        (serve(state.clone()), state)
    }

    fn serve(state: AppState) -> String {
        let data = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws", web::get().to(audio_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("ws://{}/ws", addr)
    }

    async fn connect(url: &str) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    /// Read until the close frame; returns the close code, reason and every
    /// JSON text message seen on the way.
    async fn read_until_close(client: &mut Client) -> (u16, String, Vec<serde_json::Value>) {
        let mut texts = Vec::new();
        while let Some(msg) = client.next().await {
            match msg.unwrap() {
                Message::Text(text) => texts.push(serde_json::from_str(&text).unwrap()),
                Message::Close(Some(frame)) => {
                    return (u16::from(frame.code), frame.reason.to_string(), texts)
                }
                Message::Close(None) => panic!("close frame without a code"),
                _ => {}
            }
        }
        panic!("connection ended without a close frame");
    }

    /// First JSON text message, skipping pings.
    async fn read_json(client: &mut Client) -> serde_json::Value {
        loop {
            if let Message::Text(text) = client.next().await.unwrap().unwrap() {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        for _ in 0..50 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn wait_until_released(state: &AppState) {
        wait_for("session release", || state.registry.active_count() == 0).await;
    }

    const HANDSHAKE: &str = r#"{"uid":"s1","platform":"zoom","meetingUrl":"https://x","nativeMeetingId":7,"token":"t"}"#;

    #[actix_web::test]
    async fn test_binary_before_handshake_is_premature_streaming() {
        let (url, state) = spawn_server(AppConfig::default()).await;
        let mut client = connect(&url).await;

        client.send(Message::Binary(vec![0, 0, 0, 0])).await.unwrap();
        let (code, reason, texts) = read_until_close(&mut client).await;

        assert_eq!(code, 1002);
        assert_eq!(reason, "premature_streaming");
        assert_eq!(texts[0]["type"], "error");
        assert_eq!(texts[0]["code"], "premature_streaming");
        assert_eq!(
            state.get_metrics_snapshot().rejections.get("premature_streaming"),
            Some(&1)
        );
    }

    #[actix_web::test]
    async fn test_valid_handshake_gets_server_ready() {
        let (url, state) = spawn_server(AppConfig::default()).await;
        let mut client = connect(&url).await;

        client.send(Message::Text(HANDSHAKE.to_string())).await.unwrap();
        let ready = read_json(&mut client).await;
        assert_eq!(ready["uid"], "s1");
        assert_eq!(ready["message"], "SERVER_READY");
        assert_eq!(ready["backend"], "tracing");
        assert!(state.registry.contains("s1"));

        client.send(Message::Binary(b"END_OF_AUDIO".to_vec())).await.unwrap();
        let (code, reason, _) = read_until_close(&mut client).await;
        assert_eq!(code, 1000);
        assert_eq!(reason, "client_ended");

        wait_until_released(&state).await;
        assert_eq!(state.get_metrics_snapshot().handshakes_accepted, 1);
    }

    #[actix_web::test]
    async fn test_silent_client_times_out() {
        let mut config = AppConfig::default();
        config.admission.handshake_timeout_ms = 100;
        let (url, _state) = spawn_server(config).await;
        let mut client = connect(&url).await;

        let (code, reason, texts) = read_until_close(&mut client).await;
        assert_eq!(code, 1008);
        assert_eq!(reason, "handshake_timeout");
        assert_eq!(texts[0]["code"], "handshake_timeout");
    }

    #[actix_web::test]
    async fn test_incomplete_handshake_lists_missing_fields() {
        let (url, state) = spawn_server(AppConfig::default()).await;
        let mut client = connect(&url).await;

        client
            .send(Message::Text(r#"{"uid":"s1","token":"t"}"#.to_string()))
            .await
            .unwrap();
        let (code, reason, texts) = read_until_close(&mut client).await;

        assert_eq!(code, 1008);
        assert_eq!(reason, "missing_required_fields");
        assert_eq!(
            texts[0]["missing"],
            json!(["platform", "meeting_url", "meeting_id"])
        );
        assert!(!state.registry.contains("s1"));
    }

    #[actix_web::test]
    async fn test_non_object_handshake_is_malformed() {
        let (url, _state) = spawn_server(AppConfig::default()).await;
        let mut client = connect(&url).await;

        client.send(Message::Text("[1, 2, 3]".to_string())).await.unwrap();
        let (code, reason, _) = read_until_close(&mut client).await;
        assert_eq!(code, 1007);
        assert_eq!(reason, "malformed_payload");
    }

    #[actix_web::test]
    async fn test_session_limit_is_enforced() {
        let mut config = AppConfig::default();
        config.admission.max_concurrent_sessions = 1;
        let (url, _state) = spawn_server(config).await;

        let mut first = connect(&url).await;
        first.send(Message::Text(HANDSHAKE.to_string())).await.unwrap();
        read_json(&mut first).await;

        let mut second = connect(&url).await;
        second.send(Message::Text(HANDSHAKE.to_string())).await.unwrap();
        let (code, reason, _) = read_until_close(&mut second).await;
        assert_eq!(code, 1013);
        assert_eq!(reason, "capacity_exceeded");
    }

    #[actix_web::test]
    async fn test_admitted_session_is_published_then_withdrawn() {
        let registrar = Arc::new(RecordingRegistrar::default());
        let (url, _state) = spawn_server_with_discovery(registrar.clone()).await;
        let mut client = connect(&url).await;

        client.send(Message::Text(HANDSHAKE.to_string())).await.unwrap();
        assert_eq!(read_json(&mut client).await["message"], "SERVER_READY");
        wait_for("registration", || registrar.registered.lock().len() == 1).await;
        {
            let registered = registrar.registered.lock();
            assert_eq!(registered[0].uid, "s1");
            assert_eq!(registered[0].address, "10.0.0.5:9090");
            assert_eq!(registered[0].platform, "zoom");
            assert_eq!(registered[0].meeting_id, "7");
        }

        client.send(Message::Binary(b"END_OF_AUDIO".to_vec())).await.unwrap();
        let (code, _, _) = read_until_close(&mut client).await;
        assert_eq!(code, 1000);

        wait_for("withdrawal", || !registrar.withdrawn.lock().is_empty()).await;
        assert_eq!(*registrar.withdrawn.lock(), vec!["s1".to_string()]);
        assert_eq!(
            *registrar.events.lock(),
            vec!["register s1".to_string(), "deregister s1".to_string()]
        );
    }

    #[actix_web::test]
    async fn test_registrar_failure_does_not_block_admission() {
        let registrar = Arc::new(RecordingRegistrar {
            fail: true,
            ..Default::default()
        });
        let (url, state) = spawn_server_with_discovery(registrar).await;
        let mut client = connect(&url).await;

        client.send(Message::Text(HANDSHAKE.to_string())).await.unwrap();
        let ready = read_json(&mut client).await;
        assert_eq!(ready["message"], "SERVER_READY");
        assert_eq!(ready["uid"], "s1");

        wait_for("registrar failure", || {
            state.get_metrics_snapshot().registrar_failures == 1
        })
        .await;
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.total_rejections(), 0);
        assert_eq!(metrics.handshakes_accepted, 1);
        assert!(state.registry.contains("s1"));
    }

    #[actix_web::test]
    async fn test_rejected_handshake_is_never_published() {
        let registrar = Arc::new(RecordingRegistrar::default());
        let (url, _state) = spawn_server_with_discovery(registrar.clone()).await;
        let mut client = connect(&url).await;

        client
            .send(Message::Text(r#"{"uid":"s1","token":"t"}"#.to_string()))
            .await
            .unwrap();
        let (code, _, _) = read_until_close(&mut client).await;
        assert_eq!(code, 1008);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registrar.events.lock().is_empty());
    }
}
