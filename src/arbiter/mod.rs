//! Disconnect and forfeit arbitration
//!
//! A disconnect mid-match never settles by itself. It opens a claim that
//! ripens after a cooldown, and only an explicit victory claim from the
//! remaining player (or a voluntary forfeit from the quitter) reaches the
//! settlement path. Reconnection does not cancel a pending claim; the
//! remaining player keeps the option either way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::game::{MatchCmd, MatchRegistry};
use crate::ledger::{settle, SettlementSink};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomStore;
use crate::ws::protocol::{EndReason, RoomId, ServerMsg, WalletAddress};

/// How long the disconnected player has to return before the opponent's
/// claim ripens
pub const FORFEIT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// Cooldown running; claims are premature
    OpponentLost,
    /// Cooldown elapsed; the remaining player may claim
    Claimable,
    /// Winner declared; further claims are acknowledgements
    Settled,
}

/// One pending forfeit claim per room
struct ForfeitClaim {
    disconnected: WalletAddress,
    remaining: WalletAddress,
    deadline: Instant,
    /// Ties the deadline task to this claim instance
    seq: u64,
    state: ClaimState,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("no forfeit claim is open for this room")]
    NoClaim,
    #[error("only the remaining player may claim this room")]
    NotClaimant,
    #[error("opponent has {remaining_secs}s left to reconnect")]
    CooldownActive { remaining_secs: u64 },
    #[error("winner declaration failed; try again")]
    SettlementFailed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ForfeitError {
    #[error("room not found")]
    UnknownRoom,
    #[error("sender is not a participant of this room")]
    NotParticipant,
    #[error("winner declaration failed; the opponent can claim instead")]
    SettlementFailed,
}

pub struct ForfeitArbiter {
    claims: DashMap<RoomId, ForfeitClaim>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomStore>,
    matches: Arc<MatchRegistry>,
    sink: Arc<dyn SettlementSink>,
    claim_seq: AtomicU64,
}

impl ForfeitArbiter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomStore>,
        matches: Arc<MatchRegistry>,
        sink: Arc<dyn SettlementSink>,
    ) -> Self {
        Self {
            claims: DashMap::new(),
            registry,
            rooms,
            matches,
            sink,
            claim_seq: AtomicU64::new(0),
        }
    }

    /// A registered player's socket went away. Every room where they were
    /// in a running match gets paused with a cooldown claim opened for the
    /// opponent.
    pub fn on_disconnect(self: &Arc<Self>, player: &WalletAddress) {
        for room_id in self.rooms.rooms_of(player) {
            self.raise_claim(room_id, player);
        }
    }

    fn raise_claim(self: &Arc<Self>, room_id: RoomId, player: &WalletAddress) {
        let Some(handle) = self.matches.get(room_id) else {
            // No match running yet; the room just waits
            return;
        };
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let Some(remaining) = room.opponent_of(player) else {
            return;
        };

        // Both players gone leaves the first claim standing
        if self.claims.contains_key(&room_id) {
            return;
        }

        let seq = self.claim_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + FORFEIT_COOLDOWN;
        self.claims.insert(
            room_id,
            ForfeitClaim {
                disconnected: player.clone(),
                remaining: remaining.clone(),
                deadline,
                seq,
                state: ClaimState::OpponentLost,
            },
        );

        // Freeze the match without settling; the outcome is decided here
        handle.submit(MatchCmd::Abandon);

        warn!(
            room_id = %room_id,
            disconnected = %player,
            cooldown_secs = FORFEIT_COOLDOWN.as_secs(),
            "Player lost mid-match, forfeit cooldown started"
        );
        self.registry.send_to(
            &remaining,
            ServerMsg::ForfeitPending {
                room_id,
                disconnected: player.clone(),
                cooldown_seconds: FORFEIT_COOLDOWN.as_secs(),
            },
        );

        let arbiter = self.clone();
        tokio::spawn(async move {
            sleep_until(deadline).await;
            arbiter.ripen(room_id, seq);
        });
    }

    /// Cooldown elapsed: flip the claim to Claimable if it is still the
    /// same claim and has not been settled meanwhile
    fn ripen(&self, room_id: RoomId, seq: u64) {
        let Some(mut claim) = self.claims.get_mut(&room_id) else {
            return;
        };
        if claim.seq != seq || claim.state != ClaimState::OpponentLost {
            return;
        }
        claim.state = ClaimState::Claimable;
        let remaining = claim.remaining.clone();
        drop(claim);

        info!(room_id = %room_id, "Forfeit cooldown elapsed, claim open");
        self.registry
            .send_to(&remaining, ServerMsg::ForfeitClaimable { room_id });
    }

    /// Explicit victory claim from the remaining player. Idempotent once
    /// settled; also the retry path after a failed settlement emission.
    pub async fn claim(&self, room_id: RoomId, claimant: &WalletAddress) -> Result<(), ClaimError> {
        // A previously attempted declaration (from any path) that failed to
        // emit can be retried by its recorded winner.
        if self.rooms.pending_winner(room_id).as_ref() == Some(claimant) {
            self.emit(room_id, claimant, EndReason::Claim).await?;
            if let Some(mut claim) = self.claims.get_mut(&room_id) {
                claim.state = ClaimState::Settled;
            }
            self.registry.send_to(
                claimant,
                ServerMsg::ForfeitSettled {
                    room_id,
                    winner: claimant.clone(),
                    reason: EndReason::Claim,
                },
            );
            return Ok(());
        }

        let (deadline, state, disconnected) = {
            let claim = self.claims.get(&room_id).ok_or(ClaimError::NoClaim)?;
            if claim.remaining != *claimant {
                return Err(ClaimError::NotClaimant);
            }
            (claim.deadline, claim.state, claim.disconnected.clone())
        };

        match state {
            ClaimState::Settled => {
                // Re-acknowledge; the declaration already went out
                self.registry.send_to(
                    claimant,
                    ServerMsg::ForfeitSettled {
                        room_id,
                        winner: claimant.clone(),
                        reason: EndReason::Claim,
                    },
                );
                return Ok(());
            }
            ClaimState::OpponentLost => {
                // The recorded deadline decides, not the expiry task: a
                // late or lost timer must not block a ripe claim
                let now = Instant::now();
                if now < deadline {
                    let remaining_secs =
                        deadline.saturating_duration_since(now).as_secs().max(1);
                    return Err(ClaimError::CooldownActive { remaining_secs });
                }
                if let Some(mut claim) = self.claims.get_mut(&room_id) {
                    claim.state = ClaimState::Claimable;
                }
            }
            ClaimState::Claimable => {}
        }

        self.emit(room_id, claimant, EndReason::Claim).await?;

        if let Some(mut claim) = self.claims.get_mut(&room_id) {
            claim.state = ClaimState::Settled;
        }
        self.registry.record_result(claimant, &disconnected);
        self.notify_settled(room_id, claimant, &disconnected, EndReason::Claim);
        Ok(())
    }

    /// A connected player concedes. No cooldown applies; the quitter is
    /// present and the decision is deliberate.
    pub async fn voluntary_forfeit(
        &self,
        room_id: RoomId,
        quitter: &WalletAddress,
    ) -> Result<(), ForfeitError> {
        let room = self.rooms.get(room_id).ok_or(ForfeitError::UnknownRoom)?;
        let winner = room
            .opponent_of(quitter)
            .ok_or(ForfeitError::NotParticipant)?;

        info!(room_id = %room_id, quitter = %quitter, "Voluntary forfeit");

        if let Some(mut claim) = self.claims.get_mut(&room_id) {
            claim.state = ClaimState::Settled;
        }

        if let Some(handle) = self.matches.get(room_id) {
            // The match task settles and notifies on its next tick
            handle.submit(MatchCmd::ForceEnd {
                winner,
                reason: EndReason::Forfeit,
            });
            return Ok(());
        }

        // Match already torn down (e.g. abandoned after a disconnect, then
        // the quitter reconnected to concede); settle directly.
        match settle(&self.rooms, &*self.sink, room_id, &winner, EndReason::Forfeit).await {
            Ok(_) => {
                self.registry.record_result(&winner, quitter);
                self.notify_settled(room_id, &winner, quitter, EndReason::Forfeit);
                Ok(())
            }
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Forfeit settlement failed");
                Err(ForfeitError::SettlementFailed)
            }
        }
    }

    async fn emit(
        &self,
        room_id: RoomId,
        winner: &WalletAddress,
        reason: EndReason,
    ) -> Result<(), ClaimError> {
        match settle(&self.rooms, &*self.sink, room_id, winner, reason).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Claim settlement failed, claim stays open");
                Err(ClaimError::SettlementFailed)
            }
        }
    }

    fn notify_settled(
        &self,
        room_id: RoomId,
        winner: &WalletAddress,
        loser: &WalletAddress,
        reason: EndReason,
    ) {
        let msg = ServerMsg::ForfeitSettled {
            room_id,
            winner: winner.clone(),
            reason,
        };
        self.registry.send_to(winner, msg.clone());
        self.registry.send_to(loser, msg);
    }

    #[cfg(test)]
    fn claim_state(&self, room_id: RoomId) -> Option<ClaimState> {
        self.claims.get(&room_id).map(|c| c.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::RecordingSink;
    use crate::rooms::RoomStatus;
    use tokio::sync::mpsc;

    fn addr(last: &str) -> WalletAddress {
        WalletAddress::parse(&format!("0x{:0>40}", last)).unwrap()
    }

    struct Fixture {
        arbiter: Arc<ForfeitArbiter>,
        sink: Arc<RecordingSink>,
        rooms: Arc<RoomStore>,
        matches: Arc<MatchRegistry>,
        a: WalletAddress,
        b: WalletAddress,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        let rooms = Arc::new(RoomStore::new());
        let matches = Arc::new(MatchRegistry::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let arbiter = Arc::new(ForfeitArbiter::new(
            registry,
            rooms.clone(),
            matches.clone(),
            sink.clone(),
        ));
        let (a, b) = (addr("a"), addr("b"));
        rooms.create(RoomId(7), a.clone(), b.clone(), "1000".into());
        rooms.mark_joined(RoomId(7), &a).unwrap();
        rooms.mark_joined(RoomId(7), &b).unwrap();
        Fixture {
            arbiter,
            sink,
            rooms,
            matches,
            a,
            b,
        }
    }

    /// Register a fake running match, returning its command receiver
    fn fake_match(fx: &Fixture) -> mpsc::Receiver<MatchCmd> {
        let (tx, rx) = mpsc::channel(8);
        fx.matches.register(RoomId(7), tx).unwrap();
        fx.rooms.activate(RoomId(7));
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn claim_respects_the_cooldown() {
        let fx = fixture();
        let mut cmds = fake_match(&fx);

        fx.arbiter.on_disconnect(&fx.b);
        assert!(matches!(cmds.try_recv().unwrap(), MatchCmd::Abandon));
        assert_eq!(fx.arbiter.claim_state(RoomId(7)), Some(ClaimState::OpponentLost));

        tokio::time::sleep(Duration::from_secs(59)).await;
        match fx.arbiter.claim(RoomId(7), &fx.a).await {
            Err(ClaimError::CooldownActive { remaining_secs }) => {
                assert!(remaining_secs >= 1);
            }
            other => panic!("expected cooldown rejection, got {:?}", other),
        }
        assert!(fx.sink.declarations().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.arbiter.claim_state(RoomId(7)), Some(ClaimState::Claimable));

        fx.arbiter.claim(RoomId(7), &fx.a).await.unwrap();
        assert_eq!(fx.sink.declarations(), vec![(RoomId(7), fx.a.clone())]);
        assert!(fx.rooms.get(RoomId(7)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ripe_claim_succeeds_even_if_the_expiry_task_is_lost() {
        let fx = fixture();
        let _cmds = fake_match(&fx);

        fx.arbiter.on_disconnect(&fx.b);
        tokio::time::sleep(Duration::from_secs(61)).await;

        // The expiry task never flipping the state must not block a claim
        // whose recorded deadline has passed
        fx.arbiter.claims.get_mut(&RoomId(7)).unwrap().state = ClaimState::OpponentLost;

        fx.arbiter.claim(RoomId(7), &fx.a).await.unwrap();
        assert_eq!(fx.sink.declarations(), vec![(RoomId(7), fx.a.clone())]);
        assert_eq!(fx.arbiter.claim_state(RoomId(7)), Some(ClaimState::Settled));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_claim_is_idempotent() {
        let fx = fixture();
        let _cmds = fake_match(&fx);

        fx.arbiter.on_disconnect(&fx.b);
        tokio::time::sleep(Duration::from_secs(61)).await;

        fx.arbiter.claim(RoomId(7), &fx.a).await.unwrap();
        fx.arbiter.claim(RoomId(7), &fx.a).await.unwrap();
        fx.arbiter.claim(RoomId(7), &fx.a).await.unwrap();

        assert_eq!(fx.sink.declarations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_remaining_player_may_claim() {
        let fx = fixture();
        let _cmds = fake_match(&fx);

        fx.arbiter.on_disconnect(&fx.b);
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(
            fx.arbiter.claim(RoomId(7), &fx.b).await,
            Err(ClaimError::NotClaimant)
        );
        assert_eq!(
            fx.arbiter.claim(RoomId(7), &addr("c")).await,
            Err(ClaimError::NotClaimant)
        );
        assert!(fx.sink.declarations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_emission_keeps_the_claim_open_for_retry() {
        let fx = fixture();
        let _cmds = fake_match(&fx);

        fx.arbiter.on_disconnect(&fx.b);
        tokio::time::sleep(Duration::from_secs(61)).await;

        fx.sink.set_failing(true);
        assert_eq!(
            fx.arbiter.claim(RoomId(7), &fx.a).await,
            Err(ClaimError::SettlementFailed)
        );
        // Room is held, not released, while the declaration is unconfirmed
        assert_eq!(fx.rooms.get(RoomId(7)).unwrap().status, RoomStatus::Settling);

        fx.sink.set_failing(false);
        fx.arbiter.claim(RoomId(7), &fx.a).await.unwrap();
        assert_eq!(fx.sink.declarations(), vec![(RoomId(7), fx.a.clone())]);
        assert!(fx.rooms.get(RoomId(7)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn voluntary_forfeit_bypasses_the_cooldown() {
        let fx = fixture();
        let mut cmds = fake_match(&fx);

        // Quitter is still connected; the match is told to end immediately
        fx.arbiter.voluntary_forfeit(RoomId(7), &fx.b).await.unwrap();
        match cmds.try_recv().unwrap() {
            MatchCmd::ForceEnd { winner, reason } => {
                assert_eq!(winner, fx.a);
                assert_eq!(reason, EndReason::Forfeit);
            }
            other => panic!("expected force end, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forfeit_without_a_running_match_settles_directly() {
        let fx = fixture();

        fx.arbiter.voluntary_forfeit(RoomId(7), &fx.b).await.unwrap();
        assert_eq!(fx.sink.declarations(), vec![(RoomId(7), fx.a.clone())]);

        // Outsiders cannot concede a room they are not in
        fx.rooms
            .create(RoomId(8), fx.a.clone(), fx.b.clone(), "1".into());
        assert_eq!(
            fx.arbiter.voluntary_forfeit(RoomId(8), &addr("c")).await,
            Err(ForfeitError::NotParticipant)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_outside_a_match_opens_no_claim() {
        let fx = fixture();
        // Room exists but no match is running
        fx.arbiter.on_disconnect(&fx.b);
        assert!(fx.arbiter.claim_state(RoomId(7)).is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(
            fx.arbiter.claim(RoomId(7), &fx.a).await,
            Err(ClaimError::NoClaim)
        );
    }
}
