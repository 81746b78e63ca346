//! Room store - per-match metadata keyed by ledger-issued room id
//!
//! Rooms are created from "room funded" ledger events (idempotently, since
//! the event source may redeliver) and never self-expire: they are closed
//! explicitly on terminal outcomes so an unsettled stake is never orphaned.
//! The settlement record lives here too, implementing the exactly-once
//! "declare winner" emission guard shared by the match engine and the
//! forfeit arbiter.

use dashmap::DashMap;
use tracing::{debug, info};

use crate::util::time::unix_millis;
use crate::ws::protocol::{EndReason, RoomId, Side, WalletAddress};

/// Room lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Created,
    BothJoined,
    Active,
    Settling,
    Closed,
}

/// Pending settlement bookkeeping for a room
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub winner: WalletAddress,
    pub reason: EndReason,
    /// An emission attempt is currently on the wire
    pub in_flight: bool,
    /// The declare-winner instruction was emitted successfully
    pub emitted: bool,
}

/// One staked match container
#[derive(Debug, Clone)]
pub struct Room {
    pub room_id: RoomId,
    pub player_a: WalletAddress,
    pub player_b: WalletAddress,
    /// Opaque decimal wei amount as reported by the ledger
    pub stake_wei: String,
    pub joined_a: bool,
    pub joined_b: bool,
    pub status: RoomStatus,
    pub created_at: u64,
    pub settlement: Option<SettlementRecord>,
}

impl Room {
    pub fn side_of(&self, player: &WalletAddress) -> Option<Side> {
        if *player == self.player_a {
            Some(Side::A)
        } else if *player == self.player_b {
            Some(Side::B)
        } else {
            None
        }
    }

    pub fn opponent_of(&self, player: &WalletAddress) -> Option<WalletAddress> {
        match self.side_of(player)? {
            Side::A => Some(self.player_b.clone()),
            Side::B => Some(self.player_a.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Redelivered event for a known room id; state unchanged
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// One participant joined, waiting for the other
    Waiting,
    /// Both flags just became true; caller hands off to the match engine
    BothJoined,
    /// Flag was already set, or the room is past the joining stage
    NoChange,
}

/// Result of requesting the exactly-once settlement emission slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginEmission {
    /// Caller owns the emission attempt; must call `finish_emission`
    Proceed,
    /// Another attempt is on the wire right now
    Busy,
    /// Instruction already emitted, or a different winner was recorded first
    Done,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room {0} not found")]
    NotFound(RoomId),
    #[error("player {player} is not a participant of room {room_id}")]
    NotParticipant {
        room_id: RoomId,
        player: WalletAddress,
    },
}

/// Concurrent room store, shared across all rooms
pub struct RoomStore {
    rooms: DashMap<RoomId, Room>,
    /// Participant -> open rooms index, used on disconnect and for chat
    /// scoping. The ledger may fund several rooms naming the same player.
    by_participant: DashMap<WalletAddress, Vec<RoomId>>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            by_participant: DashMap::new(),
        }
    }

    /// Idempotent on room id: duplicate creation is a no-op, not an error,
    /// because the funding event source may redeliver.
    pub fn create(
        &self,
        room_id: RoomId,
        player_a: WalletAddress,
        player_b: WalletAddress,
        stake_wei: String,
    ) -> CreateOutcome {
        if self.rooms.contains_key(&room_id) {
            debug!(room_id = %room_id, "Duplicate room creation ignored");
            return CreateOutcome::Duplicate;
        }

        self.by_participant
            .entry(player_a.clone())
            .or_default()
            .push(room_id);
        self.by_participant
            .entry(player_b.clone())
            .or_default()
            .push(room_id);
        self.rooms.insert(
            room_id,
            Room {
                room_id,
                player_a,
                player_b,
                stake_wei,
                joined_a: false,
                joined_b: false,
                status: RoomStatus::Created,
                created_at: unix_millis(),
                settlement: None,
            },
        );

        info!(room_id = %room_id, "Room created from ledger event");
        CreateOutcome::Created
    }

    /// Flip the joined flag for a confirmed on-chain join. The player's
    /// socket may or may not be registered yet; that is the caller's concern.
    pub fn mark_joined(
        &self,
        room_id: RoomId,
        player: &WalletAddress,
    ) -> Result<JoinOutcome, RoomError> {
        let mut room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(RoomError::NotFound(room_id))?;

        let side = room.side_of(player).ok_or_else(|| RoomError::NotParticipant {
            room_id,
            player: player.clone(),
        })?;

        if room.status != RoomStatus::Created {
            return Ok(JoinOutcome::NoChange);
        }

        let flag = match side {
            Side::A => &mut room.joined_a,
            Side::B => &mut room.joined_b,
        };
        if *flag {
            return Ok(JoinOutcome::NoChange);
        }
        *flag = true;

        if room.joined_a && room.joined_b {
            room.status = RoomStatus::BothJoined;
            info!(room_id = %room_id, "Both participants joined");
            Ok(JoinOutcome::BothJoined)
        } else {
            Ok(JoinOutcome::Waiting)
        }
    }

    /// Transition to Active when the match engine takes ownership
    pub fn activate(&self, room_id: RoomId) -> bool {
        match self.rooms.get_mut(&room_id) {
            Some(mut room) if room.status == RoomStatus::BothJoined => {
                room.status = RoomStatus::Active;
                true
            }
            _ => false,
        }
    }

    /// Read-only snapshot
    pub fn get(&self, room_id: RoomId) -> Option<Room> {
        self.rooms.get(&room_id).map(|r| r.clone())
    }

    /// The open rooms this participant belongs to, in funding order
    pub fn rooms_of(&self, player: &WalletAddress) -> Vec<RoomId> {
        self.by_participant
            .get(player)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Claim the settlement emission slot for this room. Exactly one caller
    /// ever gets `Proceed` per successful emission, even when a natural win
    /// and a forfeit claim race: the first transition wins and later ones
    /// are no-ops.
    pub fn begin_emission(&self, room_id: RoomId, winner: &WalletAddress) -> BeginEmission {
        let mut room = match self.rooms.get_mut(&room_id) {
            Some(room) => room,
            None => return BeginEmission::NotFound,
        };

        match &mut room.settlement {
            None => {
                room.settlement = Some(SettlementRecord {
                    winner: winner.clone(),
                    reason: EndReason::Score,
                    in_flight: true,
                    emitted: false,
                });
                room.status = RoomStatus::Settling;
                BeginEmission::Proceed
            }
            Some(record) => {
                if record.emitted || record.winner != *winner {
                    BeginEmission::Done
                } else if record.in_flight {
                    BeginEmission::Busy
                } else {
                    // Retry after a failed attempt for the same winner
                    record.in_flight = true;
                    BeginEmission::Proceed
                }
            }
        }
    }

    /// Record the emission attempt's outcome. Success closes and releases
    /// the room; failure keeps it in `Settling` as the only record of the
    /// pending settlement, available for a retried claim.
    pub fn finish_emission(&self, room_id: RoomId, ok: bool) {
        let removed = {
            let mut room = match self.rooms.get_mut(&room_id) {
                Some(room) => room,
                None => return,
            };
            let record = match &mut room.settlement {
                Some(record) => record,
                None => return,
            };
            record.in_flight = false;
            if ok {
                record.emitted = true;
                room.status = RoomStatus::Closed;
                Some((room.player_a.clone(), room.player_b.clone()))
            } else {
                None
            }
        };

        if let Some((a, b)) = removed {
            self.unindex(&a, room_id);
            self.unindex(&b, room_id);
            self.rooms.remove(&room_id);
            info!(room_id = %room_id, "Room settled and released");
        }
    }

    /// Drop one room from a participant's index, keeping their other
    /// open rooms intact
    fn unindex(&self, player: &WalletAddress, room_id: RoomId) {
        if let Some(mut open) = self.by_participant.get_mut(player) {
            open.retain(|id| *id != room_id);
        }
        self.by_participant.remove_if(player, |_, open| open.is_empty());
    }

    /// Annotate the pending settlement with how it was decided
    pub fn set_settlement_reason(&self, room_id: RoomId, reason: EndReason) {
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            if let Some(record) = &mut room.settlement {
                record.reason = reason;
            }
        }
    }

    /// Pending (not yet emitted) settlement winner, used by claim retries
    pub fn pending_winner(&self, room_id: RoomId) -> Option<WalletAddress> {
        let room = self.rooms.get(&room_id)?;
        match &room.settlement {
            Some(record) if !record.emitted => Some(record.winner.clone()),
            _ => None,
        }
    }

    pub fn open_rooms(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: &str) -> WalletAddress {
        WalletAddress::parse(&format!("0x{:0>40}", last)).unwrap()
    }

    fn seeded_store() -> (RoomStore, WalletAddress, WalletAddress) {
        let store = RoomStore::new();
        let a = addr("a");
        let b = addr("b");
        store.create(RoomId(42), a.clone(), b.clone(), "10000000000000000".into());
        (store, a, b)
    }

    #[test]
    fn duplicate_creation_leaves_state_unchanged() {
        let (store, a, b) = seeded_store();
        store.mark_joined(RoomId(42), &a).unwrap();

        let outcome = store.create(RoomId(42), a.clone(), b, "999".into());
        assert_eq!(outcome, CreateOutcome::Duplicate);

        let room = store.get(RoomId(42)).unwrap();
        assert!(room.joined_a);
        assert_eq!(room.stake_wei, "10000000000000000");
    }

    #[test]
    fn both_joined_reported_exactly_once() {
        let (store, a, b) = seeded_store();

        assert_eq!(store.mark_joined(RoomId(42), &a).unwrap(), JoinOutcome::Waiting);
        assert_eq!(store.mark_joined(RoomId(42), &a).unwrap(), JoinOutcome::NoChange);
        assert_eq!(
            store.mark_joined(RoomId(42), &b).unwrap(),
            JoinOutcome::BothJoined
        );
        // Redelivered join event after the handoff
        assert_eq!(store.mark_joined(RoomId(42), &b).unwrap(), JoinOutcome::NoChange);
        assert_eq!(store.get(RoomId(42)).unwrap().status, RoomStatus::BothJoined);
    }

    #[test]
    fn join_rejects_bystanders_and_unknown_rooms() {
        let (store, _a, _b) = seeded_store();
        assert!(matches!(
            store.mark_joined(RoomId(42), &addr("c")),
            Err(RoomError::NotParticipant { .. })
        ));
        assert!(matches!(
            store.mark_joined(RoomId(7), &addr("a")),
            Err(RoomError::NotFound(_))
        ));
    }

    #[test]
    fn emission_slot_granted_once() {
        let (store, a, _b) = seeded_store();

        assert_eq!(store.begin_emission(RoomId(42), &a), BeginEmission::Proceed);
        // A racing path is refused while the first attempt is in flight
        assert_eq!(store.begin_emission(RoomId(42), &a), BeginEmission::Busy);

        store.finish_emission(RoomId(42), true);
        // Room is released after successful emission
        assert!(store.get(RoomId(42)).is_none());
        assert_eq!(store.begin_emission(RoomId(42), &a), BeginEmission::NotFound);
        assert!(store.rooms_of(&a).is_empty());
    }

    #[test]
    fn player_can_be_indexed_in_multiple_open_rooms() {
        let (store, a, b) = seeded_store();
        let c = addr("c");
        store.create(RoomId(43), a.clone(), c, "5".into());

        assert_eq!(store.rooms_of(&a), vec![RoomId(42), RoomId(43)]);

        // Settling one room must not orphan the player's other room
        store.begin_emission(RoomId(42), &a);
        store.finish_emission(RoomId(42), true);
        assert_eq!(store.rooms_of(&a), vec![RoomId(43)]);
        assert!(store.rooms_of(&b).is_empty());
    }

    #[test]
    fn failed_emission_keeps_room_and_allows_retry() {
        let (store, a, _b) = seeded_store();

        assert_eq!(store.begin_emission(RoomId(42), &a), BeginEmission::Proceed);
        store.finish_emission(RoomId(42), false);

        // The only record of the pending settlement survives
        let room = store.get(RoomId(42)).unwrap();
        assert_eq!(room.status, RoomStatus::Settling);
        assert_eq!(store.pending_winner(RoomId(42)).unwrap(), a);

        assert_eq!(store.begin_emission(RoomId(42), &a), BeginEmission::Proceed);
        store.finish_emission(RoomId(42), true);
        assert!(store.get(RoomId(42)).is_none());
    }

    #[test]
    fn conflicting_winner_is_a_no_op() {
        let (store, a, b) = seeded_store();

        assert_eq!(store.begin_emission(RoomId(42), &a), BeginEmission::Proceed);
        // Racing forfeit claim naming the other player: first transition wins
        assert_eq!(store.begin_emission(RoomId(42), &b), BeginEmission::Done);
    }
}
