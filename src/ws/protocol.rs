//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ledger-issued room identifier. Opaque to the server; never fabricated
/// speculatively without a confirmed "room funded" event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A checksummed-or-not Ethereum-style wallet address, normalized to
/// lowercase. The durable primary key for a player identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    /// Strict format check: `0x` followed by exactly 40 hex characters
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let normalized = raw.trim().to_ascii_lowercase();
        let hex_part = normalized
            .strip_prefix("0x")
            .ok_or_else(|| AddressError(raw.to_string()))?;

        if hex_part.len() == 40 && hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(normalized))
        } else {
            Err(AddressError(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid wallet address: {0}")]
pub struct AddressError(String);

/// Which paddle a participant controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    A,
    B,
}

/// Closed set of allowed paddle commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddleDir {
    Up,
    Down,
    Stop,
}

/// How a match reached its terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Win threshold reached through play
    Score,
    /// Voluntary surrender
    Forfeit,
    /// Disconnect cooldown elapsed and the remaining player claimed
    Claim,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// First message on every connection: bind an identity to this socket.
    /// The wallet address is validated strictly; registering an identity
    /// already bound elsewhere evicts the prior connection.
    Register {
        display_name: String,
        wallet_address: String,
    },

    /// Explicit match start, authorized only for the room creator (player A)
    StartMatch { room_id: RoomId },

    /// Paddle velocity input for the sender's side
    Input { room_id: RoomId, dir: PaddleDir },

    /// Voluntary surrender; settles immediately, no cooldown
    Forfeit { room_id: RoomId },

    /// Claim victory after the opponent's disconnect cooldown elapsed
    ClaimVictory { room_id: RoomId },

    /// Chat relay; scoped to the sender's room when they are in one
    Chat { message: String },

    /// Ping for latency measurement / keepalive
    Ping { t: u64 },
}

/// Messages pushed from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Registration accepted
    Registered {
        wallet_address: WalletAddress,
        display_name: String,
    },

    /// A newer session claimed this identity; the socket closes after this
    SessionSuperseded { message: String },

    /// The ledger funded a room naming this player as a participant
    RoomAvailable {
        room_id: RoomId,
        opponent: WalletAddress,
        stake_wei: String,
    },

    /// The other participant's on-chain join was confirmed
    OpponentJoined {
        room_id: RoomId,
        opponent: WalletAddress,
    },

    /// Match is starting; tells the recipient which paddle is theirs
    MatchStart {
        room_id: RoomId,
        side: Side,
        opponent: WalletAddress,
        countdown_seconds: u32,
    },

    /// Whole-second countdown progress (start countdown and point pauses)
    CountdownTick {
        room_id: RoomId,
        seconds_remaining: u32,
    },

    /// Full authoritative state, pushed every tick while a match runs
    Snapshot {
        room_id: RoomId,
        /// Monotonic per-match tick number; clients drop stale snapshots
        tick: u64,
        server_time: u64,
        state: MatchSnapshot,
    },

    /// Terminal outcome of a simulated match
    MatchEnd {
        room_id: RoomId,
        winner: WalletAddress,
        score_a: u32,
        score_b: u32,
        reason: EndReason,
    },

    /// Opponent's connection dropped mid-match; claim opens after cooldown
    ForfeitPending {
        room_id: RoomId,
        disconnected: WalletAddress,
        cooldown_seconds: u64,
    },

    /// The cooldown elapsed without the opponent returning
    ForfeitClaimable { room_id: RoomId },

    /// A forfeit or claim settled the room outside the tick loop
    ForfeitSettled {
        room_id: RoomId,
        winner: WalletAddress,
        reason: EndReason,
    },

    /// Running win/loss totals for this connection, pushed after every
    /// recorded match outcome
    MatchTally { wins: u32, losses: u32 },

    /// Relayed chat message
    Chat {
        from: WalletAddress,
        display_name: String,
        message: String,
        timestamp: u64,
    },

    /// Error surfaced to the offending client only
    Error { code: String, message: String },

    /// Pong response
    Pong { t: u64 },
}

/// Per-tick state snapshot of one match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub ball: BallSnapshot,
    pub paddle_a: PaddleSnapshot,
    pub paddle_b: PaddleSnapshot,
    pub score_a: u32,
    pub score_b: u32,
    pub phase: PhaseSnapshot,
    /// Seconds left before play resumes; motion is frozen while > 0
    pub countdown_remaining: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallSnapshot {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaddleSnapshot {
    pub y: f32,
    pub velocity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSnapshot {
    Countdown,
    Live,
    PointPause,
    Ended,
}
