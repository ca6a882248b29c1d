//! # Device WebSocket Handler
//!
//! One actor per connected device. The actor owns the socket; everything the
//! pipeline wants to send goes through a `WsChannel`, which forwards it to the
//! actor as an actix message.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the device connects to `ws_path` with its identity in a
//!    `Device-Id`, `mac_address` or `uuid` header (or a `device_id` query)
//! 2. **Hello**: the device announces its audio parameters; the server echoes
//!    a `hello` carrying the session id
//! 3. **Listening**: `listen` messages toggle speech detection; binary frames
//!    carry Opus audio from the microphone
//! 4. **Replies**: the server sends `stt`/`tts` JSON messages and binary Opus
//!    frames paced at the frame duration
//!
//! ## Key Rust Concepts:
//! - **Actor model**: the socket is only touched from the actor's own context;
//!   other tasks talk to it through its `Addr`
//! - **AtomicBool**: the channel's open flag is read from pipeline tasks and
//!   flipped by the actor without a lock

use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::channel::OutboundChannel;
use crate::protocol::parse_client_message;
use crate::session::{DeviceBinding, Session};
use crate::state::{AppState, PipelineMetrics};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Headers a device may carry its identity in, in order of preference.
const DEVICE_ID_HEADERS: [&str; 3] = ["Device-Id", "mac_address", "uuid"];

/// Message for sending text to the device.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// Message for sending one binary Opus frame to the device.
#[derive(Message)]
#[rtype(result = "()")]
struct SendBinary(Vec<u8>);

/// Message asking the actor to close the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseConnection;

/// `OutboundChannel` backed by the actor's address.
pub struct WsChannel {
    addr: Addr<VoiceWebSocket>,
    open: AtomicBool,
}

impl WsChannel {
    fn new(addr: Addr<VoiceWebSocket>) -> Self {
        Self {
            addr,
            open: AtomicBool::new(true),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl OutboundChannel for WsChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.addr.connected()
    }

    fn send_text(&self, text: String) -> VoiceResult<()> {
        if !self.is_open() {
            return Err(VoiceError::ChannelClosed);
        }
        self.addr.do_send(SendText(text));
        Ok(())
    }

    fn send_binary(&self, frame: Vec<u8>) -> VoiceResult<()> {
        if !self.is_open() {
            return Err(VoiceError::ChannelClosed);
        }
        self.addr.do_send(SendBinary(frame));
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.addr.do_send(CloseConnection);
        }
    }
}

/// WebSocket actor for one device connection.
pub struct VoiceWebSocket {
    session_id: String,
    binding: DeviceBinding,
    state: AppState,
    session: Option<Arc<Session>>,
    channel: Option<Arc<WsChannel>>,
    /// Last time anything arrived from the device
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl VoiceWebSocket {
    pub fn new(state: AppState, binding: DeviceBinding) -> Self {
        let session = state.get_config().session;
        Self {
            session_id: Uuid::new_v4().to_string(),
            binding,
            state,
            session: None,
            channel: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(session.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(session.client_timeout_secs),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_text(&mut self, text: &str) {
        let Some(session) = self.session.clone() else {
            return;
        };
        PipelineMetrics::incr(&self.state.metrics.text_messages);
        session.touch();
        session.record_message();

        match parse_client_message(text) {
            Ok(message) => {
                debug!(session_id = %self.session_id, ?message, "Client message");
                self.state.dialogue.handle_message(&session, message);
            }
            Err(err) => {
                PipelineMetrics::incr(&self.state.metrics.protocol_errors);
                warn!(session_id = %self.session_id, "Ignoring invalid client message: {}", err);
            }
        }
    }

    fn handle_binary(&mut self, data: &[u8]) {
        let Some(session) = self.session.clone() else {
            return;
        };
        PipelineMetrics::incr(&self.state.metrics.audio_frames);
        session.touch();
        self.state.dialogue.handle_audio_frame(&session, data);
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Register the session as soon as the socket is up.
    fn started(&mut self, ctx: &mut Self::Context) {
        let channel = Arc::new(WsChannel::new(ctx.address()));

        let session = match self.state.registry.register(&self.session_id, channel.clone()) {
            Ok(session) => session,
            Err(err) => {
                PipelineMetrics::incr(&self.state.metrics.connections_rejected);
                warn!(device_id = %self.binding.device_id, "Rejecting connection: {}", err);
                channel.mark_closed();
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Again,
                    description: Some(err.to_string()),
                }));
                ctx.stop();
                return;
            }
        };

        if let Err(err) = self
            .state
            .registry
            .bind_device(&self.session_id, self.binding.clone())
        {
            error!(session_id = %self.session_id, "Failed to bind device: {}", err);
        }

        PipelineMetrics::incr(&self.state.metrics.connections_accepted);
        info!(
            session_id = %self.session_id,
            device_id = %self.binding.device_id,
            conversation_id = %self.binding.conversation_id,
            "WebSocket connection started"
        );

        self.session = Some(session);
        self.channel = Some(channel);
        self.start_heartbeat(ctx);
    }

    /// Release everything the session owns.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(channel) = self.channel.take() {
            channel.mark_closed();
        }
        if self.session.take().is_some() {
            self.state.registry.close(&self.session_id);
        }
        info!(session_id = %self.session_id, "WebSocket connection stopped");
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
                return;
            }
        };
        self.last_heartbeat = Instant::now();

        match msg {
            ws::Message::Text(text) => self.handle_text(&text),
            ws::Message::Binary(data) => self.handle_binary(&data),
            ws::Message::Ping(data) => ctx.pong(&data),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                info!(session_id = %self.session_id, ?reason, "WebSocket closed by device");
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            ws::Message::Nop => {}
        }
    }
}

impl Handler<SendText> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<SendBinary> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendBinary, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<CloseConnection> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseConnection, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Closing connection on request");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// Find the device identity in the upgrade request.
///
/// Headers win over the query string; blank values are ignored.
fn extract_device_id(req: &HttpRequest) -> Option<String> {
    let from_header = DEVICE_ID_HEADERS.iter().find_map(|name| {
        req.headers()
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    });

    from_header.or_else(|| {
        web::Query::<HashMap<String, String>>::from_query(req.query_string())
            .ok()
            .and_then(|query| query.get("device_id").cloned())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    })
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// The device identity is resolved and bound to its conversation before the
/// upgrade, so a directory failure is an ordinary HTTP error. The
/// `VoiceWebSocket` actor handles everything after the upgrade.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let device_id = extract_device_id(&req).unwrap_or_else(|| {
        let generated = Uuid::new_v4().to_string();
        debug!(device_id = %generated, "No device id supplied, generated one");
        generated
    });
    info!(
        device_id = %device_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let record = app_state
        .devices
        .bind(&device_id)
        .await
        .map_err(crate::error::AppError::from)?;
    let binding = DeviceBinding {
        device_id: record.device_id,
        conversation_id: record.conversation_id,
    };

    let websocket = VoiceWebSocket::new(app_state.get_ref().clone(), binding);
    ws::start(websocket, &req, stream)
}
