//! Ledger event webhook with signature verification
//!
//! Rooms come into existence here: the staking ledger confirms funding and
//! joins on its side and pushes events to this endpoint. The handler is the
//! only writer of room creation, and it must tolerate redelivery.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::game::{start_match, StartError};
use crate::rooms::{CreateOutcome, JoinOutcome, RoomError};
use crate::ws::protocol::{RoomId, ServerMsg, WalletAddress};

type HmacSha256 = Hmac<Sha256>;

/// Handle ledger contract events
pub async fn ledger_events_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, WebhookError> {
    let signature = headers
        .get("X-Ledger-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::MissingSignature)?;

    let payload = std::str::from_utf8(&body).map_err(|_| WebhookError::InvalidPayload)?;

    verify_ledger_signature(payload, signature, &state.config.ledger_webhook_secret)?;

    let event: LedgerEvent = serde_json::from_str(payload).map_err(|e| {
        error!(error = %e, "Failed to parse ledger event");
        WebhookError::InvalidPayload
    })?;

    match event {
        LedgerEvent::RoomFunded {
            room_id,
            player_a,
            player_b,
            stake_wei,
        } => handle_room_funded(&state, room_id, player_a, player_b, stake_wei),
        LedgerEvent::PlayerJoined { room_id, player } => {
            handle_player_joined(&state, room_id, &player)?;
        }
    }

    Ok(StatusCode::OK)
}

/// Verify the `t=<unix>,v1=<hex>` HMAC-SHA256 signature over the raw body
fn verify_ledger_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let mut kv = part.splitn(2, '=');
        if let (Some(key), Some(value)) = (kv.next(), kv.next()) {
            match key {
                "t" => timestamp = Some(value),
                "v1" => signatures.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(WebhookError::InvalidSignature);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if !signatures.iter().any(|sig| *sig == expected) {
        return Err(WebhookError::InvalidSignature);
    }

    // Replay window check; log-only, event ids are idempotent downstream
    if let Ok(ts) = timestamp.parse::<i64>() {
        let now = chrono::Utc::now().timestamp();
        if (now - ts).abs() > 300 {
            warn!("Ledger webhook timestamp outside freshness window");
        }
    }

    Ok(())
}

fn handle_room_funded(
    state: &AppState,
    room_id: RoomId,
    player_a: WalletAddress,
    player_b: WalletAddress,
    stake_wei: String,
) {
    match state
        .rooms
        .create(room_id, player_a.clone(), player_b.clone(), stake_wei.clone())
    {
        CreateOutcome::Created => {
            state.registry.send_to(
                &player_a,
                ServerMsg::RoomAvailable {
                    room_id,
                    opponent: player_b.clone(),
                    stake_wei: stake_wei.clone(),
                },
            );
            state.registry.send_to(
                &player_b,
                ServerMsg::RoomAvailable {
                    room_id,
                    opponent: player_a,
                    stake_wei,
                },
            );
        }
        CreateOutcome::Duplicate => {
            info!(room_id = %room_id, "Room funding event redelivered");
        }
    }
}

fn handle_player_joined(
    state: &AppState,
    room_id: RoomId,
    player: &WalletAddress,
) -> Result<(), WebhookError> {
    match state.rooms.mark_joined(room_id, player) {
        Ok(JoinOutcome::BothJoined) => {
            let Some(room) = state.rooms.get(room_id) else {
                return Ok(());
            };
            state.registry.send_to(
                &room.player_a,
                ServerMsg::OpponentJoined {
                    room_id,
                    opponent: room.player_b.clone(),
                },
            );
            state.registry.send_to(
                &room.player_b,
                ServerMsg::OpponentJoined {
                    room_id,
                    opponent: room.player_a.clone(),
                },
            );

            match start_match(&state.engine_ctx(), room_id, None) {
                Ok(()) | Err(StartError::AlreadyRunning) => {}
                Err(e) => {
                    warn!(room_id = %room_id, error = %e, "Could not start match from join event")
                }
            }
        }
        Ok(JoinOutcome::Waiting) => {
            info!(room_id = %room_id, player = %player, "Participant joined, waiting for opponent");
        }
        Ok(JoinOutcome::NoChange) => {}
        // The funding event may simply not have arrived yet; a non-2xx
        // answer makes the ledger redeliver the join once it has
        Err(RoomError::NotFound(_)) => {
            warn!(room_id = %room_id, player = %player, "Join event for a room not funded yet");
            return Err(WebhookError::UnknownRoom(room_id));
        }
        // Not retryable; acknowledge so the ledger stops redelivering
        Err(e) => warn!(room_id = %room_id, error = %e, "Ignoring join event"),
    }
    Ok(())
}

/// Ledger contract events, mirrored from the staking chain
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LedgerEvent {
    RoomFunded {
        room_id: RoomId,
        player_a: WalletAddress,
        player_b: WalletAddress,
        stake_wei: String,
    },
    PlayerJoined {
        room_id: RoomId,
        player: WalletAddress,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Missing X-Ledger-Signature header")]
    MissingSignature,

    #[error("Invalid request payload")]
    InvalidPayload,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Room {0} is not known yet, retry delivery")]
    UnknownRoom(RoomId),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            WebhookError::MissingSignature => StatusCode::BAD_REQUEST,
            WebhookError::InvalidPayload => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::UnknownRoom(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, self.to_string()).into_response()
    }
}
