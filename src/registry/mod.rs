//! Connection registry - single active session per identity
//!
//! Maps a stable player identity (wallet address, and display name as a
//! secondary key) to exactly one live connection. Registering an identity
//! that is already bound displaces the prior connection, which is notified
//! and forcibly closed, so two sockets can never both believe they own the
//! same identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::time::unix_millis;
use crate::ws::protocol::{ServerMsg, WalletAddress};

/// Win/loss tally kept for a connection's lifetime
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchTally {
    pub wins: u32,
    pub losses: u32,
}

/// One live WebSocket connection bound to an identity
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub wallet_address: WalletAddress,
    pub display_name: String,
    /// Outbound message queue; the session's writer task drains this.
    /// Per-recipient FIFO, which is the only ordering guarantee we make.
    pub tx: mpsc::UnboundedSender<ServerMsg>,
    pub connected_at: u64,
    last_activity: AtomicU64,
    stats: Mutex<MatchTally>,
}

impl Connection {
    pub fn touch(&self) {
        self.last_activity.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn tally(&self) -> MatchTally {
        *self.stats.lock()
    }

    /// Push a message to this connection, ignoring a closed channel
    pub fn send(&self, msg: ServerMsg) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Registry of live connections, shared across all rooms
pub struct ConnectionRegistry {
    by_id: DashMap<Uuid, Arc<Connection>>,
    by_address: DashMap<WalletAddress, Uuid>,
    by_name: DashMap<String, Uuid>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("invalid wallet address")]
    InvalidAddress,
    #[error("display name must not be empty")]
    EmptyName,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_address: DashMap::new(),
            by_name: DashMap::new(),
        }
    }

    /// Bind an identity to a connection, evicting prior holders of either
    /// key. Returns the installed connection on success.
    pub fn register(
        &self,
        display_name: &str,
        wallet_address: &str,
        tx: mpsc::UnboundedSender<ServerMsg>,
    ) -> Result<Arc<Connection>, RegisterError> {
        let address =
            WalletAddress::parse(wallet_address).map_err(|_| RegisterError::InvalidAddress)?;
        let name = display_name.trim().to_lowercase();
        if name.is_empty() {
            return Err(RegisterError::EmptyName);
        }

        let conn = Arc::new(Connection {
            id: Uuid::new_v4(),
            wallet_address: address.clone(),
            display_name: name.clone(),
            tx,
            connected_at: unix_millis(),
            last_activity: AtomicU64::new(unix_millis()),
            stats: Mutex::new(MatchTally::default()),
        });

        self.by_id.insert(conn.id, conn.clone());

        // Install the key bindings first, then evict whoever they
        // displaced. The insert is the atomic arbiter: of two racing
        // registrations for one identity, exactly one ends up displaced,
        // so both sockets can never stay live for the same key.
        let prior_address = self.by_address.insert(address.clone(), conn.id);
        let prior_name = self.by_name.insert(name.clone(), conn.id);
        for stale in [prior_address, prior_name].into_iter().flatten() {
            if stale != conn.id {
                self.evict(stale);
            }
        }

        info!(
            conn_id = %conn.id,
            wallet = %address,
            display_name = %name,
            active = self.by_id.len(),
            "Connection registered"
        );

        Ok(conn)
    }

    /// Tear down a displaced connection: the superseded socket is told why
    /// and its writer task closes it after delivering the notice.
    fn evict(&self, connection_id: Uuid) {
        if let Some((_, old)) = self.by_id.remove(&connection_id) {
            warn!(
                conn_id = %connection_id,
                wallet = %old.wallet_address,
                "Evicting superseded session"
            );
            old.send(ServerMsg::SessionSuperseded {
                message: "A new session was opened with this identity".to_string(),
            });
            self.remove_bindings(&old);
        }
    }

    /// Drop the secondary-key bindings, but only while they still point at
    /// this connection (a successor may already have overwritten them).
    fn remove_bindings(&self, conn: &Connection) {
        self.by_address
            .remove_if(&conn.wallet_address, |_, id| *id == conn.id);
        self.by_name
            .remove_if(&conn.display_name, |_, id| *id == conn.id);
    }

    /// Remove a connection on disconnect. Returns the wallet address the
    /// connection held so the caller can signal the forfeit arbiter; returns
    /// `None` if the connection was already evicted.
    pub fn unregister(&self, connection_id: Uuid) -> Option<WalletAddress> {
        let (_, conn) = self.by_id.remove(&connection_id)?;
        self.remove_bindings(&conn);
        debug!(
            conn_id = %connection_id,
            wallet = %conn.wallet_address,
            session_ms = unix_millis().saturating_sub(conn.connected_at),
            remaining = self.by_id.len(),
            "Connection unregistered"
        );
        Some(conn.wallet_address.clone())
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.by_id.get(&connection_id).map(|c| c.value().clone())
    }

    pub fn lookup_address(&self, address: &WalletAddress) -> Option<Arc<Connection>> {
        let id = *self.by_address.get(address)?;
        self.get(id)
    }

    pub fn lookup_name(&self, name: &str) -> Option<Arc<Connection>> {
        let id = *self.by_name.get(&name.to_lowercase())?;
        self.get(id)
    }

    /// Push a message to the identity's live connection, if any
    pub fn send_to(&self, address: &WalletAddress, msg: ServerMsg) -> bool {
        match self.lookup_address(address) {
            Some(conn) => conn.send(msg),
            None => false,
        }
    }

    /// Relay a message to every live connection (lobby chat)
    pub fn broadcast(&self, msg: &ServerMsg) {
        for entry in self.by_id.iter() {
            entry.value().send(msg.clone());
        }
    }

    /// Record a terminal match outcome in the per-identity tallies and push
    /// the updated running totals to each player
    pub fn record_result(&self, winner: &WalletAddress, loser: &WalletAddress) {
        if let Some(conn) = self.lookup_address(winner) {
            conn.stats.lock().wins += 1;
            let tally = conn.tally();
            conn.send(ServerMsg::MatchTally {
                wins: tally.wins,
                losses: tally.losses,
            });
        }
        if let Some(conn) = self.lookup_address(loser) {
            conn.stats.lock().losses += 1;
            let tally = conn.tally();
            conn.send(ServerMsg::MatchTally {
                wins: tally.wins,
                losses: tally.losses,
            });
        }
    }

    pub fn connected_players(&self) -> usize {
        self.by_id.len()
    }

    /// Connections with no client traffic in the last `idle_ms`
    pub fn idle_connections(&self, idle_ms: u64) -> usize {
        let cutoff = unix_millis().saturating_sub(idle_ms);
        self.by_id
            .iter()
            .filter(|entry| entry.value().last_activity() < cutoff)
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn channel() -> (
        mpsc::UnboundedSender<ServerMsg>,
        mpsc::UnboundedReceiver<ServerMsg>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn rejects_malformed_addresses() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let err = registry.register("alice", "0x123", tx).unwrap_err();
        assert!(matches!(err, RegisterError::InvalidAddress));
        assert_eq!(registry.connected_players(), 0);
    }

    #[test]
    fn registering_same_address_evicts_prior_connection() {
        let registry = ConnectionRegistry::new();

        let (tx1, mut rx1) = channel();
        let first = registry.register("alice", ADDR_A, tx1).unwrap();

        let (tx2, _rx2) = channel();
        let second = registry.register("alice2", ADDR_A, tx2).unwrap();

        // Prior session was told before the new binding became visible
        match rx1.try_recv().unwrap() {
            ServerMsg::SessionSuperseded { .. } => {}
            other => panic!("expected supersession notice, got {:?}", other),
        }

        assert!(registry.get(first.id).is_none());
        let live = registry
            .lookup_address(&WalletAddress::parse(ADDR_A).unwrap())
            .unwrap();
        assert_eq!(live.id, second.id);
        assert_eq!(registry.connected_players(), 1);
    }

    #[test]
    fn display_name_collision_also_evicts() {
        let registry = ConnectionRegistry::new();

        let (tx1, mut rx1) = channel();
        registry.register("Alice", ADDR_A, tx1).unwrap();

        let (tx2, _rx2) = channel();
        registry
            .register(
                "alice",
                "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                tx2,
            )
            .unwrap();

        assert!(matches!(
            rx1.try_recv().unwrap(),
            ServerMsg::SessionSuperseded { .. }
        ));
        // Only the new session remains; the old address key is gone
        assert_eq!(registry.connected_players(), 1);
        assert!(registry
            .lookup_address(&WalletAddress::parse(ADDR_A).unwrap())
            .is_none());
    }

    #[test]
    fn unregister_reports_identity_once() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let conn = registry.register("bob", ADDR_A, tx).unwrap();

        let addr = registry.unregister(conn.id).unwrap();
        assert_eq!(addr.as_str(), ADDR_A);
        // Second unregister (e.g. after eviction) is a no-op
        assert!(registry.unregister(conn.id).is_none());
    }

    #[test]
    fn racing_registrations_for_one_wallet_leave_a_single_session() {
        use std::sync::Barrier;

        const ADDR: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

        for round in 0..500 {
            let registry = Arc::new(ConnectionRegistry::new());
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        let (tx, rx) = mpsc::unbounded_channel();
                        barrier.wait();
                        let conn = registry
                            .register(&format!("racer{}", i), ADDR, tx)
                            .unwrap();
                        (conn, rx)
                    })
                })
                .collect();

            let mut results: Vec<_> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(
                registry.connected_players(),
                1,
                "round {}: exactly one session may survive per wallet",
                round
            );

            // The survivor is bound under the address key, and the loser
            // was told it lost
            let live = registry
                .lookup_address(&WalletAddress::parse(ADDR).unwrap())
                .unwrap();
            assert!(results.iter().any(|(c, _)| c.id == live.id));
            let superseded: usize = results
                .iter_mut()
                .map(|(_, rx)| {
                    matches!(rx.try_recv(), Ok(ServerMsg::SessionSuperseded { .. })) as usize
                })
                .sum();
            assert_eq!(superseded, 1, "round {}: one eviction notice", round);
        }
    }

    #[test]
    fn match_results_push_updated_tallies() {
        let registry = ConnectionRegistry::new();
        const ADDR_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

        let (tx_w, mut rx_w) = channel();
        let winner = registry.register("winner", ADDR_A, tx_w).unwrap();
        let (tx_l, mut rx_l) = channel();
        let loser = registry.register("loser", ADDR_B, tx_l).unwrap();

        registry.record_result(&winner.wallet_address, &loser.wallet_address);
        registry.record_result(&winner.wallet_address, &loser.wallet_address);

        assert_eq!(winner.tally().wins, 2);
        assert_eq!(loser.tally().losses, 2);

        let mut last = None;
        while let Ok(msg) = rx_w.try_recv() {
            last = Some(msg);
        }
        match last {
            Some(ServerMsg::MatchTally { wins, losses }) => {
                assert_eq!((wins, losses), (2, 0));
            }
            other => panic!("expected tally push, got {:?}", other),
        }

        let mut last = None;
        while let Ok(msg) = rx_l.try_recv() {
            last = Some(msg);
        }
        match last {
            Some(ServerMsg::MatchTally { wins, losses }) => {
                assert_eq!((wins, losses), (0, 2));
            }
            other => panic!("expected tally push, got {:?}", other),
        }
    }

    #[test]
    fn activity_tracking_counts_idle_connections() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let conn = registry.register("dave", ADDR_A, tx).unwrap();

        // Freshly registered connections are not idle
        assert_eq!(registry.idle_connections(60_000), 0);
        conn.touch();
        assert!(conn.last_activity() >= conn.connected_at);
    }

    #[test]
    fn lookup_by_either_key() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let conn = registry.register("Carol", ADDR_A, tx).unwrap();

        assert_eq!(registry.lookup_name("carol").unwrap().id, conn.id);
        assert_eq!(
            registry
                .lookup_address(&WalletAddress::parse(ADDR_A).unwrap())
                .unwrap()
                .id,
            conn.id
        );
    }
}
