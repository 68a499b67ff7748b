//! # Client Push Channel
//!
//! Each client keeps one WebSocket open at `/ws/{client_id}`. The server uses it
//! to stream pipeline output back while a recording is processed; the client
//! uses it for WebRTC-style signalling.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the channel is attached to `client_id` (replacing any older one)
//! 2. **Signalling**: JSON messages from the client are answered in place
//! 3. **Output**: text frames carry text fragments, binary frames carry
//!    little-endian 16-bit PCM
//! 4. **Heartbeat**: ping every 30s, closed after 60s without hearing from the client
//! 5. **Disconnect**: the channel is detached; a session still recording is abandoned
//!
//! ## Message Format:
//! - **Client → Server**: `{"type":"offer","sdp":..}`, `{"type":"ice-candidate","candidate":..}`,
//!   `{"type":"ping"}`
//! - **Server → Client**: `{"type":"answer","sdp":..}`, `{"type":"ice-candidate","candidate":..}`,
//!   `{"type":"pong"}`, plus pipeline output

use crate::audio::SessionManager;
use crate::error::{AppError, AppResult};
use crate::handlers::validate_client_id;
use crate::state::AppState;
use crate::transport::{encode_pcm_frame, Transport};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Signalling messages exchanged with the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer { sdp: serde_json::Value },
    Answer { sdp: serde_json::Value },
    IceCandidate { candidate: serde_json::Value },
    /// Audio sent over the signalling channel; uploads go through `/audio/chunk`
    Audio,
    Ping,
    Pong,
}

impl SignalMessage {
    /// The server's reply, if this message warrants one.
    pub fn reply(self) -> Option<SignalMessage> {
        match self {
            SignalMessage::Offer { sdp } => Some(SignalMessage::Answer { sdp }),
            SignalMessage::IceCandidate { candidate } => Some(SignalMessage::IceCandidate { candidate }),
            SignalMessage::Ping => Some(SignalMessage::Pong),
            SignalMessage::Answer { .. } | SignalMessage::Audio | SignalMessage::Pong => None,
        }
    }
}

/// Push a text fragment to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct PushText(String);

/// Push an encoded PCM frame to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct PushFrame(Vec<u8>);

/// Close the socket from the server side.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

/// [`Transport`] backed by a [`ClientSocket`] actor's mailbox.
pub struct WsTransport {
    addr: Addr<ClientSocket>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, text: &str) -> AppResult<()> {
        self.addr
            .send(PushText(text.to_string()))
            .await
            .map_err(|e| AppError::Transport(format!("text not delivered: {}", e)))
    }

    async fn send_frame(&self, samples: &[i16]) -> AppResult<()> {
        self.addr
            .send(PushFrame(encode_pcm_frame(samples)))
            .await
            .map_err(|e| AppError::Transport(format!("audio frame not delivered: {}", e)))
    }

    fn is_alive(&self) -> bool {
        self.addr.connected()
    }

    async fn close(&self) {
        // Already-stopped actors are fine
        let _ = self.addr.send(CloseSocket).await;
    }
}

/// WebSocket actor for one client's push channel.
///
/// ## Ownership:
/// The actor holds the only strong reference to its [`WsTransport`]; the session
/// registry gets a weak one. When the actor stops, the transport goes with it.
pub struct ClientSocket {
    client_id: String,
    manager: SessionManager,
    transport: Option<Arc<WsTransport>>,
    ticket: Option<Uuid>,
    last_heartbeat: Instant,
}

impl ClientSocket {
    pub fn new(client_id: String, manager: SessionManager) -> Self {
        Self {
            client_id,
            manager,
            transport: None,
            ticket: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_signal(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<SignalMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(client_id = %self.client_id, error = %err, "Ignoring malformed message");
                return;
            }
        };

        debug!(client_id = %self.client_id, ?message, "Signalling message");
        if let Some(reply) = message.reply() {
            match serde_json::to_string(&reply) {
                Ok(json) => ctx.text(json),
                Err(err) => error!(error = %err, "Failed to encode signalling reply"),
            }
        }
    }
}

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let transport = Arc::new(WsTransport {
            addr: ctx.address(),
        });
        let shared: Arc<dyn Transport> = transport.clone();
        self.ticket = Some(self.manager.attach_transport(&self.client_id, Arc::downgrade(&shared)));
        self.transport = Some(transport);

        info!(client_id = %self.client_id, "Push channel connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(client_id = %act.client_id, "Heartbeat timeout, closing push channel");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "Push channel disconnected");
        self.transport = None;

        if let Some(ticket) = self.ticket.take() {
            let manager = self.manager.clone();
            let client_id = self.client_id.clone();
            tokio::spawn(async move {
                manager.disconnect(&client_id, ticket).await;
            });
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_signal(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                debug!(client_id = %self.client_id, bytes = data.len(), "Ignoring binary message");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, ?reason, "Client closed push channel");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.client_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<PushText> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: PushText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<PushFrame> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: PushFrame, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<CloseSocket> for ClientSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a [`ClientSocket`] actor
/// bound to the `client_id` path segment.
pub async fn client_socket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let client_id = validate_client_id(&path)?.to_string();
    info!(
        client_id = %client_id,
        peer = ?req.connection_info().peer_addr(),
        "New push channel request"
    );

    ws::start(ClientSocket::new(client_id, app_state.manager.clone()), &req, stream)
}
