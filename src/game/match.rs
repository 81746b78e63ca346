//! Match state and authoritative tick loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

use crate::ledger::{settle, SettleOutcome, SettlementSink};
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomStatus, RoomStore};
use crate::util::time::{tick_delta, unix_millis, TICK_DURATION_MICROS};
use crate::ws::protocol::{
    EndReason, MatchSnapshot, PhaseSnapshot, RoomId, ServerMsg, Side, WalletAddress,
};

use super::physics::{self, Ball, Paddle};
use super::MatchCmd;

/// Countdown before the opening serve
pub const START_COUNTDOWN_SECS: f32 = 5.0;
/// Pause after every point before the next serve
pub const POINT_PAUSE_SECS: f32 = 3.0;
/// First player to reach this score wins
pub const WIN_SCORE: u32 = 10;

/// Command queue depth per match; a full queue drops inputs rather than
/// queueing unboundedly
const CMD_QUEUE_DEPTH: usize = 256;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Opening countdown, ball frozen
    Countdown,
    /// Ball in play
    Live,
    /// Post-point countdown, ball frozen at center
    PointPause,
    /// Terminal; winner recorded
    Ended,
}

impl MatchPhase {
    fn snapshot(self) -> PhaseSnapshot {
        match self {
            MatchPhase::Countdown => PhaseSnapshot::Countdown,
            MatchPhase::Live => PhaseSnapshot::Live,
            MatchPhase::PointPause => PhaseSnapshot::PointPause,
            MatchPhase::Ended => PhaseSnapshot::Ended,
        }
    }
}

/// Authoritative simulation state, owned exclusively by the match task
pub struct MatchState {
    pub room_id: RoomId,
    pub player_a: WalletAddress,
    pub player_b: WalletAddress,
    pub ball: Ball,
    pub paddle_a: Paddle,
    pub paddle_b: Paddle,
    pub score_a: u32,
    pub score_b: u32,
    pub phase: MatchPhase,
    /// Seconds until play (re)starts; no motion or scoring while > 0
    pub countdown_remaining: f32,
    pub tick: u64,
    rng: ChaCha8Rng,
    winner: Option<(WalletAddress, EndReason)>,
}

impl MatchState {
    fn new(room_id: RoomId, player_a: WalletAddress, player_b: WalletAddress, seed: u64) -> Self {
        Self {
            room_id,
            player_a,
            player_b,
            ball: Ball::centered(),
            paddle_a: Paddle::new(Side::A),
            paddle_b: Paddle::new(Side::B),
            score_a: 0,
            score_b: 0,
            phase: MatchPhase::Countdown,
            countdown_remaining: START_COUNTDOWN_SECS,
            tick: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            winner: None,
        }
    }

    fn serve(&mut self) {
        self.ball.dx = if self.rng.gen_bool(0.5) {
            physics::SERVE_SPEED
        } else {
            -physics::SERVE_SPEED
        };
        self.ball.dy = if self.rng.gen_bool(0.5) {
            physics::SERVE_SPEED
        } else {
            -physics::SERVE_SPEED
        };
    }

    fn snapshot(&self) -> MatchSnapshot {
        MatchSnapshot {
            ball: self.ball.snapshot(),
            paddle_a: self.paddle_a.snapshot(),
            paddle_b: self.paddle_b.snapshot(),
            score_a: self.score_a,
            score_b: self.score_b,
            phase: self.phase.snapshot(),
            countdown_remaining: self.countdown_remaining,
        }
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    /// Distinguishes this match instance from any successor for the same
    /// room, so stale teardown is a detectable no-op
    pub generation: u64,
    pub cmd_tx: mpsc::Sender<MatchCmd>,
}

impl MatchHandle {
    /// Queue a command without blocking; a full queue drops it
    pub fn submit(&self, cmd: MatchCmd) -> bool {
        self.cmd_tx.try_send(cmd).is_ok()
    }
}

/// Registry of all running matches
pub struct MatchRegistry {
    matches: DashMap<RoomId, MatchHandle>,
    generations: AtomicU64,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
            generations: AtomicU64::new(0),
        }
    }

    pub fn get(&self, room_id: RoomId) -> Option<MatchHandle> {
        self.matches.get(&room_id).map(|m| m.value().clone())
    }

    /// Reserve the room's match slot. Returns `None` when a match is
    /// already running (the double-start guard).
    pub fn register(&self, room_id: RoomId, cmd_tx: mpsc::Sender<MatchCmd>) -> Option<MatchHandle> {
        match self.matches.entry(room_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let handle = MatchHandle {
                    generation: self.generations.fetch_add(1, Ordering::Relaxed),
                    cmd_tx,
                };
                slot.insert(handle.clone());
                Some(handle)
            }
        }
    }

    /// Remove the entry only if it still belongs to this match instance
    pub fn remove_if_generation(&self, room_id: RoomId, generation: u64) {
        self.matches
            .remove_if(&room_id, |_, handle| handle.generation == generation);
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared services the tick loop needs at its boundaries
#[derive(Clone)]
pub struct EngineCtx {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomStore>,
    pub matches: Arc<MatchRegistry>,
    pub sink: Arc<dyn SettlementSink>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StartError {
    #[error("room not found")]
    RoomNotFound,
    #[error("only the room creator may start the match")]
    NotAuthorized,
    #[error("both participants must join before starting")]
    NotReady,
    #[error("match already running")]
    AlreadyRunning,
}

/// Instantiate and spawn the match for a room whose participants have both
/// joined. `requested_by` is the explicit client start path (creator only);
/// `None` is the pre-authorized handoff from the room store.
pub fn start_match(
    ctx: &EngineCtx,
    room_id: RoomId,
    requested_by: Option<&WalletAddress>,
) -> Result<(), StartError> {
    let room = ctx.rooms.get(room_id).ok_or(StartError::RoomNotFound)?;

    if let Some(caller) = requested_by {
        if *caller != room.player_a {
            return Err(StartError::NotAuthorized);
        }
    }

    match room.status {
        RoomStatus::BothJoined => {}
        RoomStatus::Active | RoomStatus::Settling => return Err(StartError::AlreadyRunning),
        RoomStatus::Created | RoomStatus::Closed => return Err(StartError::NotReady),
    }

    let (game, cmd_tx) = GameMatch::new(
        room_id,
        room.player_a.clone(),
        room.player_b.clone(),
        rand::random(),
    );
    let handle = ctx
        .matches
        .register(room_id, cmd_tx)
        .ok_or(StartError::AlreadyRunning)?;

    ctx.rooms.activate(room_id);

    let countdown = START_COUNTDOWN_SECS as u32;
    ctx.registry.send_to(
        &room.player_a,
        ServerMsg::MatchStart {
            room_id,
            side: Side::A,
            opponent: room.player_b.clone(),
            countdown_seconds: countdown,
        },
    );
    ctx.registry.send_to(
        &room.player_b,
        ServerMsg::MatchStart {
            room_id,
            side: Side::B,
            opponent: room.player_a.clone(),
            countdown_seconds: countdown,
        },
    );

    info!(room_id = %room_id, "Match starting");

    let ctx = ctx.clone();
    let generation = handle.generation;
    tokio::spawn(async move {
        game.run(ctx, generation).await;
    });

    Ok(())
}

/// The authoritative simulation for one room
pub struct GameMatch {
    state: MatchState,
    cmd_rx: mpsc::Receiver<MatchCmd>,
    abandoned: bool,
}

impl GameMatch {
    pub fn new(
        room_id: RoomId,
        player_a: WalletAddress,
        player_b: WalletAddress,
        seed: u64,
    ) -> (Self, mpsc::Sender<MatchCmd>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_DEPTH);
        let game = Self {
            state: MatchState::new(room_id, player_a, player_b, seed),
            cmd_rx,
            abandoned: false,
        };
        (game, cmd_tx)
    }

    /// Run the fixed-rate tick loop until the match ends or is abandoned
    pub async fn run(mut self, ctx: EngineCtx, generation: u64) {
        let room_id = self.state.room_id;
        info!(room_id = %room_id, "Match task started");

        let mut tick_interval = interval(Duration::from_micros(TICK_DURATION_MICROS));
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_countdown_secs = u32::MAX;

        loop {
            tick_interval.tick().await;

            // Apply all queued commands for this tick, then integrate.
            // Anything arriving after this drain waits for the next tick.
            self.process_cmds();
            if self.abandoned {
                // A forfeit landing in the same drain already decided the
                // outcome; honor it instead of dropping the declaration
                if self.state.winner.is_some() {
                    self.finish(&ctx).await;
                } else {
                    info!(room_id = %room_id, "Match abandoned");
                }
                break;
            }

            self.step_tick();

            // Whole-second countdown notifications alongside the snapshots
            let secs = self.state.countdown_remaining.ceil() as u32;
            if secs != last_countdown_secs {
                last_countdown_secs = secs;
                self.broadcast(
                    &ctx,
                    ServerMsg::CountdownTick {
                        room_id,
                        seconds_remaining: secs,
                    },
                );
            }

            self.broadcast(
                &ctx,
                ServerMsg::Snapshot {
                    room_id,
                    tick: self.state.tick,
                    server_time: unix_millis(),
                    state: self.state.snapshot(),
                },
            );

            if self.state.phase == MatchPhase::Ended {
                self.finish(&ctx).await;
                break;
            }
        }

        // Stale handles for a successor match must not be torn down here
        ctx.matches.remove_if_generation(room_id, generation);
        info!(room_id = %room_id, "Match task stopped");
    }

    /// Drain the command queue (single-writer discipline)
    fn process_cmds(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                MatchCmd::Input { player, dir } => {
                    if self.state.phase == MatchPhase::Ended {
                        continue;
                    }
                    let velocity = dir.velocity();
                    if player == self.state.player_a {
                        self.state.paddle_a.velocity = velocity;
                    } else if player == self.state.player_b {
                        self.state.paddle_b.velocity = velocity;
                    }
                }
                MatchCmd::ForceEnd { winner, reason } => {
                    if self.state.phase != MatchPhase::Ended {
                        self.state.phase = MatchPhase::Ended;
                        self.state.winner = Some((winner, reason));
                    }
                }
                MatchCmd::Abandon => {
                    self.abandoned = true;
                }
            }
        }
    }

    /// One synchronous simulation step
    fn step_tick(&mut self) {
        self.state.tick += 1;

        match self.state.phase {
            MatchPhase::Countdown | MatchPhase::PointPause => {
                self.state.countdown_remaining -= tick_delta();
                if self.state.countdown_remaining <= 0.0 {
                    self.state.countdown_remaining = 0.0;
                    self.state.serve();
                    self.state.phase = MatchPhase::Live;
                }
            }
            MatchPhase::Live => {
                physics::integrate_paddle(&mut self.state.paddle_a);
                physics::integrate_paddle(&mut self.state.paddle_b);
                physics::integrate_ball(
                    &mut self.state.ball,
                    &self.state.paddle_a,
                    &self.state.paddle_b,
                );

                if let Some(side) = physics::goal_scored(&self.state.ball) {
                    self.score_point(side);
                }
            }
            MatchPhase::Ended => {}
        }
    }

    fn score_point(&mut self, side: Side) {
        match side {
            Side::A => self.state.score_a += 1,
            Side::B => self.state.score_b += 1,
        }
        self.state.ball.reset();

        let (score, winner) = match side {
            Side::A => (self.state.score_a, &self.state.player_a),
            Side::B => (self.state.score_b, &self.state.player_b),
        };

        if score >= WIN_SCORE {
            self.state.phase = MatchPhase::Ended;
            self.state.winner = Some((winner.clone(), EndReason::Score));
        } else {
            self.state.phase = MatchPhase::PointPause;
            self.state.countdown_remaining = POINT_PAUSE_SECS;
        }
    }

    /// Terminal transition: settle, notify, tally
    async fn finish(&mut self, ctx: &EngineCtx) {
        let Some((winner, reason)) = self.state.winner.clone() else {
            return;
        };
        let room_id = self.state.room_id;
        let loser = if winner == self.state.player_a {
            self.state.player_b.clone()
        } else {
            self.state.player_a.clone()
        };

        match settle(&ctx.rooms, &*ctx.sink, room_id, &winner, reason).await {
            Ok(SettleOutcome::Emitted) | Ok(SettleOutcome::AlreadySettled) => {}
            Ok(outcome) => {
                warn!(room_id = %room_id, ?outcome, "Unexpected settlement outcome at match end");
            }
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Settlement failed at match end");
                // Funds are at stake: tell the winner to claim again rather
                // than swallowing the failure
                ctx.registry.send_to(
                    &winner,
                    ServerMsg::Error {
                        code: "settlement_failed".to_string(),
                        message: "Winner declaration failed; claim victory to retry".to_string(),
                    },
                );
            }
        }

        self.broadcast(
            ctx,
            ServerMsg::MatchEnd {
                room_id,
                winner: winner.clone(),
                score_a: self.state.score_a,
                score_b: self.state.score_b,
                reason,
            },
        );
        ctx.registry.record_result(&winner, &loser);

        info!(
            room_id = %room_id,
            winner = %winner,
            score_a = self.state.score_a,
            score_b = self.state.score_b,
            ?reason,
            "Match ended"
        );
    }

    fn broadcast(&self, ctx: &EngineCtx, msg: ServerMsg) {
        ctx.registry.send_to(&self.state.player_a, msg.clone());
        ctx.registry.send_to(&self.state.player_b, msg);
    }

    #[cfg(test)]
    pub fn state(&self) -> &MatchState {
        &self.state
    }
}
