//! Input router - attributes paddle commands and forwards them to matches
//!
//! Inputs are advisory, not transactional: an input that cannot be applied
//! (throttled, queue full, match gone) is dropped without a reply, because
//! the next snapshot corrects the client anyway.

use std::sync::Arc;

use tracing::trace;

use crate::game::{MatchCmd, MatchRegistry};
use crate::rooms::RoomStore;
use crate::ws::protocol::{PaddleDir, RoomId, WalletAddress};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InputError {
    #[error("room not found")]
    UnknownRoom,
    #[error("sender is not a participant of this room")]
    NotParticipant,
    #[error("no active match for this room")]
    NoActiveMatch,
}

/// Route a paddle command from an authenticated sender to its match.
///
/// Attribution is by wallet address, never by claimed side: the match
/// applies the command to whichever paddle the sender owns, so a client
/// cannot steer the opponent.
pub fn submit(
    rooms: &RoomStore,
    matches: &Arc<MatchRegistry>,
    sender: &WalletAddress,
    room_id: RoomId,
    dir: PaddleDir,
) -> Result<(), InputError> {
    let room = rooms.get(room_id).ok_or(InputError::UnknownRoom)?;
    if room.side_of(sender).is_none() {
        return Err(InputError::NotParticipant);
    }

    let handle = matches.get(room_id).ok_or(InputError::NoActiveMatch)?;

    // Queue full means the match is overloaded for this tick; drop silently
    if !handle.submit(MatchCmd::Input {
        player: sender.clone(),
        dir,
    }) {
        trace!(room_id = %room_id, wallet = %sender, "Input dropped, queue full");
    }
    Ok(())
}
