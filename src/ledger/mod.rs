//! Settlement ledger boundary
//!
//! The core's responsibility ends at emitting a "declare winner" instruction
//! to the external ledger bridge. Emission is exactly-once per room (guarded
//! by the room store's settlement record) and the room is only released once
//! there is evidence the instruction went out.

pub mod client;
pub mod webhook;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::rooms::{BeginEmission, RoomStore};
use crate::ws::protocol::{EndReason, RoomId, WalletAddress};

/// Outbound side of the ledger collaborator. Object-safe so tests can
/// inject a recording sink instead of a real HTTP client.
#[async_trait]
pub trait SettlementSink: Send + Sync {
    /// Emit the declare-winner instruction. The core never retries this
    /// automatically; a failed emission is surfaced to the claimant.
    async fn declare_winner(
        &self,
        room_id: RoomId,
        winner: &WalletAddress,
    ) -> Result<(), LedgerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ledger API error (status {status}): {body}")]
    Api { status: u16, body: String },
}

/// Outcome of a settlement attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// This call emitted the instruction
    Emitted,
    /// The instruction was already emitted, or a different winner was
    /// recorded first; idempotent no-op
    AlreadySettled,
    /// Another emission attempt is on the wire
    InFlight,
    UnknownRoom,
}

/// The single settlement path shared by the match engine (natural win,
/// forced end) and the arbiter (claims, forfeits without a running match).
pub async fn settle(
    rooms: &RoomStore,
    sink: &dyn SettlementSink,
    room_id: RoomId,
    winner: &WalletAddress,
    reason: EndReason,
) -> Result<SettleOutcome, LedgerError> {
    match rooms.begin_emission(room_id, winner) {
        BeginEmission::Proceed => {
            rooms.set_settlement_reason(room_id, reason);
            match sink.declare_winner(room_id, winner).await {
                Ok(()) => {
                    rooms.finish_emission(room_id, true);
                    info!(room_id = %room_id, winner = %winner, ?reason, "Winner declared to ledger");
                    Ok(SettleOutcome::Emitted)
                }
                Err(e) => {
                    rooms.finish_emission(room_id, false);
                    warn!(room_id = %room_id, error = %e, "Settlement emission failed, room held");
                    Err(e)
                }
            }
        }
        BeginEmission::Busy => Ok(SettleOutcome::InFlight),
        BeginEmission::Done => Ok(SettleOutcome::AlreadySettled),
        BeginEmission::NotFound => Ok(SettleOutcome::UnknownRoom),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    fn addr(last: &str) -> WalletAddress {
        WalletAddress::parse(&format!("0x{:0>40}", last)).unwrap()
    }

    fn seeded() -> (RoomStore, WalletAddress, WalletAddress) {
        let rooms = RoomStore::new();
        let a = addr("a");
        let b = addr("b");
        rooms.create(RoomId(1), a.clone(), b.clone(), "1000".into());
        (rooms, a, b)
    }

    #[tokio::test]
    async fn settle_emits_exactly_once() {
        let (rooms, a, _b) = seeded();
        let sink = RecordingSink::default();

        let first = settle(&rooms, &sink, RoomId(1), &a, EndReason::Score)
            .await
            .unwrap();
        assert_eq!(first, SettleOutcome::Emitted);

        // Racing second path: room already released, no second instruction
        let second = settle(&rooms, &sink, RoomId(1), &a, EndReason::Claim)
            .await
            .unwrap();
        assert_eq!(second, SettleOutcome::UnknownRoom);
        assert_eq!(sink.declarations().len(), 1);
    }

    #[tokio::test]
    async fn racing_winners_collapse_to_first_decision() {
        let (rooms, a, b) = seeded();
        let sink = RecordingSink::default();

        settle(&rooms, &sink, RoomId(1), &a, EndReason::Score)
            .await
            .unwrap();
        // Late forfeit claim naming the other player is a no-op
        let late = settle(&rooms, &sink, RoomId(1), &b, EndReason::Claim).await.unwrap();
        assert!(matches!(
            late,
            SettleOutcome::AlreadySettled | SettleOutcome::UnknownRoom
        ));
        assert_eq!(sink.declarations(), vec![(RoomId(1), a)]);
    }

    #[tokio::test]
    async fn failed_emission_holds_room_for_retry() {
        let (rooms, a, _b) = seeded();
        let sink = RecordingSink::default();
        sink.set_failing(true);

        let err = settle(&rooms, &sink, RoomId(1), &a, EndReason::Claim).await;
        assert!(err.is_err());
        assert!(rooms.get(RoomId(1)).is_some());

        sink.set_failing(false);
        let retry = settle(&rooms, &sink, RoomId(1), &a, EndReason::Claim)
            .await
            .unwrap();
        assert_eq!(retry, SettleOutcome::Emitted);
        assert_eq!(sink.declarations().len(), 1);
        assert!(rooms.get(RoomId(1)).is_none());
    }
}
