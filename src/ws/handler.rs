//! WebSocket session handling
//!
//! One task pair per socket: a writer draining the connection's outbound
//! queue, and the reader loop below dispatching client messages. Identity
//! is bound by the first `register` message, not at upgrade time.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::arbiter::{ClaimError, ForfeitError};
use crate::game::{start_match, StartError};
use crate::input::{self, InputError};
use crate::registry::{Connection, RegisterError};
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, RoomId, ServerMsg};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    debug!("New WebSocket connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outbound queue. Everything the server pushes to this client, from the
    // tick loop included, funnels through here in FIFO order.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMsg>();

    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let superseded = matches!(msg, ServerMsg::SessionSuperseded { .. });
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(error = %e, "WebSocket send failed");
                break;
            }
            // Deliver the eviction notice, then close from our side
            if superseded {
                let _ = ws_sink.send(Message::Close(None)).await;
                break;
            }
        }
    });

    let rate_limiter = PlayerRateLimiter::new();
    let mut session = Session {
        state,
        tx,
        conn: None,
        rate_limiter,
    };

    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !session.rate_limiter.check_message() {
                    warn!("Rate limited client message");
                    continue;
                }
                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => session.dispatch(msg).await,
                    Err(e) => {
                        warn!(error = %e, "Failed to parse client message");
                        session.send_error("bad_message", "Could not parse message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!("Received binary message, ignoring");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                if let Some(conn) = &session.conn {
                    conn.touch();
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Client initiated close");
                break;
            }
            Err(e) => {
                debug!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    session.cleanup();
    writer_handle.abort();
}

struct Session {
    state: AppState,
    tx: mpsc::UnboundedSender<ServerMsg>,
    conn: Option<Arc<Connection>>,
    rate_limiter: PlayerRateLimiter,
}

impl Session {
    async fn dispatch(&mut self, msg: ClientMsg) {
        if let Some(conn) = &self.conn {
            conn.touch();
        }

        match msg {
            ClientMsg::Register {
                display_name,
                wallet_address,
            } => self.handle_register(&display_name, &wallet_address),
            ClientMsg::StartMatch { room_id } => self.handle_start(room_id),
            ClientMsg::Input { room_id, dir } => {
                let Some(conn) = &self.conn else {
                    return self.send_error("not_registered", "Register before sending input");
                };
                // Inputs above the per-socket cadence are dropped without
                // a reply; the sender is not told which ones applied
                if !self.rate_limiter.check_input() {
                    return;
                }
                if let Err(e) = input::submit(
                    &self.state.rooms,
                    &self.state.matches,
                    &conn.wallet_address,
                    room_id,
                    dir,
                ) {
                    self.send_error(input_error_code(&e), &e.to_string());
                }
            }
            ClientMsg::Forfeit { room_id } => self.handle_forfeit(room_id).await,
            ClientMsg::ClaimVictory { room_id } => self.handle_claim(room_id).await,
            ClientMsg::Chat { message } => self.handle_chat(message),
            ClientMsg::Ping { t } => {
                let _ = self.tx.send(ServerMsg::Pong { t });
            }
        }
    }

    fn handle_register(&mut self, display_name: &str, wallet_address: &str) {
        if self.conn.is_some() {
            return self.send_error("already_registered", "This socket already has an identity");
        }
        match self
            .state
            .registry
            .register(display_name, wallet_address, self.tx.clone())
        {
            Ok(conn) => {
                let _ = self.tx.send(ServerMsg::Registered {
                    wallet_address: conn.wallet_address.clone(),
                    display_name: conn.display_name.clone(),
                });
                self.conn = Some(conn);
            }
            // The socket stays open; the client may retry with a fixed payload
            Err(e @ RegisterError::InvalidAddress) => {
                self.send_error("invalid_address", &e.to_string())
            }
            Err(e @ RegisterError::EmptyName) => self.send_error("invalid_name", &e.to_string()),
        }
    }

    fn handle_start(&mut self, room_id: RoomId) {
        let Some(conn) = &self.conn else {
            return self.send_error("not_registered", "Register before starting a match");
        };
        match start_match(
            &self.state.engine_ctx(),
            room_id,
            Some(&conn.wallet_address),
        ) {
            Ok(()) => {}
            Err(e) => {
                let code = match e {
                    StartError::RoomNotFound => "unknown_room",
                    StartError::NotAuthorized => "not_authorized",
                    StartError::NotReady => "not_ready",
                    StartError::AlreadyRunning => "already_running",
                };
                self.send_error(code, &e.to_string());
            }
        }
    }

    async fn handle_forfeit(&mut self, room_id: RoomId) {
        let Some(conn) = self.conn.clone() else {
            return self.send_error("not_registered", "Register before forfeiting");
        };
        if let Err(e) = self
            .state
            .arbiter
            .voluntary_forfeit(room_id, &conn.wallet_address)
            .await
        {
            let code = match e {
                ForfeitError::UnknownRoom => "unknown_room",
                ForfeitError::NotParticipant => "not_participant",
                ForfeitError::SettlementFailed => "settlement_failed",
            };
            self.send_error(code, &e.to_string());
        }
    }

    async fn handle_claim(&mut self, room_id: RoomId) {
        let Some(conn) = self.conn.clone() else {
            return self.send_error("not_registered", "Register before claiming");
        };
        if let Err(e) = self.state.arbiter.claim(room_id, &conn.wallet_address).await {
            let code = match e {
                ClaimError::NoClaim => "no_claim",
                ClaimError::NotClaimant => "not_claimant",
                ClaimError::CooldownActive { .. } => "cooldown_active",
                ClaimError::SettlementFailed => "settlement_failed",
            };
            self.send_error(code, &e.to_string());
        }
    }

    /// Chat goes to the sender's room when they are in one, otherwise to
    /// the whole lobby
    fn handle_chat(&mut self, message: String) {
        let Some(conn) = &self.conn else {
            return self.send_error("not_registered", "Register before chatting");
        };
        let message = message.trim();
        if message.is_empty() || message.len() > 500 {
            return;
        }

        let chat = ServerMsg::Chat {
            from: conn.wallet_address.clone(),
            display_name: conn.display_name.clone(),
            message: message.to_string(),
            timestamp: unix_millis(),
        };

        // Scope to the room whose match is running when the sender is in
        // several, falling back to their earliest open room
        let open = self.state.rooms.rooms_of(&conn.wallet_address);
        let scoped = open
            .iter()
            .find(|id| self.state.matches.get(**id).is_some())
            .or_else(|| open.first());
        match scoped.and_then(|id| self.state.rooms.get(*id)) {
            Some(room) => {
                self.state.registry.send_to(&room.player_a, chat.clone());
                self.state.registry.send_to(&room.player_b, chat);
            }
            None => self.state.registry.broadcast(&chat),
        }
    }

    fn send_error(&self, code: &str, message: &str) {
        let _ = self.tx.send(ServerMsg::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    /// Disconnect path: release the identity binding, then let the arbiter
    /// decide whether a forfeit cooldown starts
    fn cleanup(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Some(address) = self.state.registry.unregister(conn.id) {
            info!(wallet = %address, "Player disconnected");
            self.state.arbiter.on_disconnect(&address);
        } else {
            // Already evicted by a successor session; nothing to arbitrate
            debug!(conn_id = %conn.id, "Superseded session closed");
        }
    }
}

fn input_error_code(e: &InputError) -> &'static str {
    match e {
        InputError::UnknownRoom => "unknown_room",
        InputError::NotParticipant => "not_participant",
        InputError::NoActiveMatch => "no_active_match",
    }
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
