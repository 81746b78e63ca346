//! Application state shared across routes

use std::sync::Arc;

use crate::arbiter::ForfeitArbiter;
use crate::config::Config;
use crate::game::{EngineCtx, MatchRegistry};
use crate::ledger::SettlementSink;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomStore>,
    pub matches: Arc<MatchRegistry>,
    pub arbiter: Arc<ForfeitArbiter>,
    pub sink: Arc<dyn SettlementSink>,
}

impl AppState {
    /// The sink is injected so tests run against a recording double while
    /// main wires the HTTP ledger client
    pub fn new(config: Config, sink: Arc<dyn SettlementSink>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomStore::new());
        let matches = Arc::new(MatchRegistry::new());
        let arbiter = Arc::new(ForfeitArbiter::new(
            registry.clone(),
            rooms.clone(),
            matches.clone(),
            sink.clone(),
        ));

        Self {
            config,
            registry,
            rooms,
            matches,
            arbiter,
            sink,
        }
    }

    /// The subset of services the match engine touches
    pub fn engine_ctx(&self) -> EngineCtx {
        EngineCtx {
            registry: self.registry.clone(),
            rooms: self.rooms.clone(),
            matches: self.matches.clone(),
            sink: self.sink.clone(),
        }
    }
}
