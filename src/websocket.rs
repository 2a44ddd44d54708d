//! # WebSocket Detection Streaming Handler
//!
//! Handles real-time audio streaming via WebSocket for speech/noise detection.
//! Clients connect to `/ws` (or `/ws/audio`) and stream audio frames; every processed
//! frame is answered with a `noise_detection` message.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the upgrade registers a session; the ID comes from
//!    `?connection_id=` or is generated. The server answers with `connected`.
//! 2. **Audio Streaming**: binary messages carry raw PCM; JSON `audio_frame` messages
//!    carry the same bytes base64-encoded.
//! 3. **Results**: one `noise_detection` per frame, plus `display_state` whenever the
//!    displayed state commits.
//! 4. **Close**: the session is removed when the actor stops. If the session is
//!    evicted first, the client gets `unknown_session` and the socket is closed.
//!
//! ## Ordering:
//! Frames are queued to a single worker task per connection, so results come back in
//! the order the frames arrived. The queue is bounded by `frame_queue_capacity`;
//! frames arriving while it is full are dropped with an `overloaded` error.

use crate::audio::session::{FrameOutcome, FramePayload, SessionHandle};
use crate::detection::DisplayState;
use crate::error::{SessionError, SessionResult};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Messages accepted from the client as JSON text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Base64-wrapped PCM frame
    AudioFrame {
        data: AudioFrameData,
        /// Client-side counter; logged only
        #[serde(rename = "sequenceHint", default)]
        sequence_hint: Option<u64>,
    },

    /// Application-level heartbeat
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
pub struct AudioFrameData {
    /// Little-endian 16-bit PCM, standard base64
    pub audio: String,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Messages sent to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        message: String,
        timestamp: i64,
    },

    /// Result for one processed frame
    #[serde(rename_all = "camelCase")]
    NoiseDetection {
        is_noisy: bool,
        confidence: f32,
        vad_probability: f32,
        frame_number: u64,
        display_state: DisplayState,
        timestamp: i64,
    },

    /// The displayed state committed to a new value
    #[serde(rename = "display_state", rename_all = "camelCase")]
    DisplayStateChanged {
        state: DisplayState,
        frame_number: u64,
        timestamp: i64,
    },

    Pong {
        timestamp: u64,
    },

    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn noise_detection(outcome: &FrameOutcome) -> Self {
        ServerMessage::NoiseDetection {
            is_noisy: outcome.is_noisy,
            confidence: outcome.confidence,
            vad_probability: outcome.vad_probability,
            frame_number: outcome.frame_index,
            display_state: outcome.display_state,
            timestamp: outcome.processed_at.timestamp_millis(),
        }
    }

    /// `display_state` message, only when this frame committed a change.
    pub fn display_state_change(outcome: &FrameOutcome) -> Option<Self> {
        outcome.state_change.map(|change| ServerMessage::DisplayStateChanged {
            state: change.to,
            frame_number: outcome.frame_index,
            timestamp: outcome.processed_at.timestamp_millis(),
        })
    }

    pub fn error(err: &SessionError) -> Self {
        Self::error_with_code(err.code(), &err.to_string())
    }

    pub fn error_with_code(code: &str, message: &str) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// Work item for the per-connection frame worker.
#[derive(Debug)]
enum FrameInput {
    Pcm(Vec<u8>),
    Base64(String),
}

impl FrameInput {
    fn payload(&self) -> FramePayload<'_> {
        match self {
            FrameInput::Pcm(bytes) => FramePayload::Pcm(bytes),
            FrameInput::Base64(audio) => FramePayload::Base64(audio),
        }
    }
}

/// Queue a frame without waiting.
///
/// A full queue drops the frame with `Overloaded`; a closed one means the worker is
/// gone along with the session.
fn queue_frame(
    frames: &mpsc::Sender<FrameInput>,
    handle: &SessionHandle,
    input: FrameInput,
) -> SessionResult<()> {
    frames.try_send(input).map_err(|err| match err {
        TrySendError::Full(_) => SessionError::Overloaded(frames.max_capacity()),
        TrySendError::Closed(_) => SessionError::UnknownSession(handle.connection_id.clone()),
    })
}

/// Result of one frame, delivered back to the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct FrameProcessed(SessionResult<FrameOutcome>);

/// WebSocket actor for one detection connection.
///
/// ## Actor Model:
/// The actor owns the socket; frame processing happens in a separate task that sends
/// each result back as a `FrameProcessed` message.
pub struct DetectionWebSocket {
    connection_id: String,
    state: AppState,

    /// Set once `on_connect` succeeded; only this session may be removed in `stopped`
    session: Option<SessionHandle>,

    /// Queue into the frame worker; dropping it ends the worker
    frames: Option<mpsc::Sender<FrameInput>>,

    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl DetectionWebSocket {
    pub fn new(connection_id: String, state: AppState) -> Self {
        let heartbeat_interval = state.config.session.heartbeat_interval();
        let client_timeout = state.config.session.client_timeout();
        Self {
            connection_id,
            state,
            session: None,
            frames: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(
                connection_id = %self.connection_id,
                error = %err,
                "Failed to serialize message"
            ),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(connection_id = %self.connection_id, code, "WebSocket error: {}", message);
        self.send(ctx, &ServerMessage::error_with_code(code, message));
    }

    fn enqueue(&mut self, input: FrameInput, ctx: &mut ws::WebsocketContext<Self>) {
        let (Some(frames), Some(handle)) = (&self.frames, &self.session) else {
            debug!(connection_id = %self.connection_id, "Frame received before registration");
            return;
        };

        if let Err(err) = queue_frame(frames, handle, input) {
            self.state.record_frame_error(&err);
            self.reject(err, ctx);
        }
    }

    /// Report a failed frame; a vanished session also ends the connection.
    fn reject(&mut self, err: SessionError, ctx: &mut ws::WebsocketContext<Self>) {
        self.send_error(ctx, err.code(), &err.to_string());
        if matches!(err, SessionError::UnknownSession(_)) {
            self.close_session_gone(ctx);
        }
    }

    fn close_session_gone(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        info!(connection_id = %self.connection_id, "Session is gone, closing connection");
        self.frames = None;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Away,
            description: Some("session expired".to_string()),
        }));
        ctx.stop();
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::AudioFrame { data, sequence_hint }) => {
                debug!(
                    connection_id = %self.connection_id,
                    sequence_hint,
                    client_timestamp = data.timestamp,
                    "Received audio_frame"
                );
                self.enqueue(FrameInput::Base64(data.audio), ctx);
            }
            Ok(ClientMessage::Ping { timestamp }) => {
                let timestamp =
                    timestamp.unwrap_or_else(|| Utc::now().timestamp_millis().max(0) as u64);
                self.send(ctx, &ServerMessage::Pong { timestamp });
            }
            Err(err) => {
                self.send_error(ctx, "invalid_message", &format!("Invalid message: {}", err));
            }
        }
    }

    /// Close the connection if the client went silent or its session was evicted,
    /// otherwise ping it.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(
                    connection_id = %act.connection_id,
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
                return;
            }

            let evicted = act
                .session
                .as_ref()
                .is_some_and(|handle| !act.state.sessions.is_live(handle));
            if evicted {
                let err = SessionError::UnknownSession(act.connection_id.clone());
                act.reject(err, ctx);
                return;
            }

            ctx.ping(b"");
        });
    }
}

/// Drain one connection's frames in order.
///
/// Exits when the actor drops its sender.
async fn run_frame_worker(
    handle: SessionHandle,
    state: AppState,
    mut frames: mpsc::Receiver<FrameInput>,
    addr: Addr<DetectionWebSocket>,
) {
    while let Some(input) = frames.recv().await {
        let result = state.sessions.submit(&handle, input.payload()).await;

        match &result {
            Ok(_) => state.record_frame_processed(),
            Err(err) => state.record_frame_error(err),
        }

        // Silently dropped if the connection is already gone
        addr.do_send(FrameProcessed(result));
    }

    debug!(connection_id = %handle.connection_id, "Frame worker finished");
}

impl Actor for DetectionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        let handle = match self.state.sessions.on_connect(&self.connection_id) {
            Ok(handle) => handle,
            Err(err) => {
                self.state.record_connection_refused();
                self.send(ctx, &ServerMessage::error(&err));
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some(err.to_string()),
                }));
                ctx.stop();
                return;
            }
        };

        self.state.record_connection_opened();
        info!(
            connection_id = %self.connection_id,
            epoch = handle.epoch,
            "WebSocket connection started"
        );

        let (sender, receiver) = mpsc::channel(self.state.config.session.frame_queue_capacity);
        self.frames = Some(sender);
        tokio::spawn(run_frame_worker(
            handle.clone(),
            self.state.clone(),
            receiver,
            ctx.address(),
        ));
        self.session = Some(handle);

        self.send(
            ctx,
            &ServerMessage::Connected {
                connection_id: self.connection_id.clone(),
                message: "Connected to noise detection service".to_string(),
                timestamp: Utc::now().timestamp_millis(),
            },
        );

        self.start_heartbeat(ctx);
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.frames = None;

        if let Some(handle) = self.session.take() {
            self.state.sessions.release(&handle);
        }
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DetectionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                error!(
                    connection_id = %self.connection_id,
                    error = %err,
                    "WebSocket protocol error"
                );
                ctx.stop();
                return;
            }
        };

        // Any traffic proves the client is alive
        self.last_heartbeat = Instant::now();

        match msg {
            ws::Message::Text(text) => self.handle_text(&text, ctx),
            ws::Message::Binary(data) => self.enqueue(FrameInput::Pcm(data.to_vec()), ctx),
            ws::Message::Ping(data) => ctx.pong(&data),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                info!(connection_id = %self.connection_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                warn!(
                    connection_id = %self.connection_id,
                    "Received unexpected continuation frame"
                );
            }
            ws::Message::Nop => {}
        }
    }
}

/// Deliver a frame result to the client.
impl Handler<FrameProcessed> for DetectionWebSocket {
    type Result = ();

    fn handle(&mut self, msg: FrameProcessed, ctx: &mut Self::Context) {
        match msg.0 {
            Ok(outcome) => {
                self.send(ctx, &ServerMessage::noise_detection(&outcome));
                if let Some(change) = ServerMessage::display_state_change(&outcome) {
                    self.send(ctx, &change);
                }
            }
            Err(err) => self.reject(err, ctx),
        }
    }
}

/// Query string accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub connection_id: Option<String>,
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Resolves the connection ID and hands the socket to a `DetectionWebSocket` actor.
pub async fn detection_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let query = web::Query::<ConnectQuery>::from_query(req.query_string())
        .map(|q| q.into_inner())
        .unwrap_or_default();

    let connection_id = query
        .connection_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        connection_id = %connection_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let websocket = DetectionWebSocket::new(connection_id, app_state.get_ref().clone());
    ws::start(websocket, &req, stream)
}
