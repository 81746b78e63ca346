//! Game simulation modules

pub mod r#match;
pub mod physics;

pub use r#match::{start_match, EngineCtx, MatchRegistry, StartError};

use crate::ws::protocol::{EndReason, PaddleDir, WalletAddress};

/// Commands funneled into a match's single-writer tick loop. All external
/// mutation goes through this queue; nothing touches simulation state from
/// network-handling tasks directly.
#[derive(Debug, Clone)]
pub enum MatchCmd {
    /// Paddle velocity change, attributed by the input router
    Input { player: WalletAddress, dir: PaddleDir },
    /// Arbiter-driven short circuit: end now with this winner, settle
    ForceEnd { winner: WalletAddress, reason: EndReason },
    /// Stop the loop without settling (disconnect cooldown in progress)
    Abandon,
}
