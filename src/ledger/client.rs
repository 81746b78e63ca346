//! HTTP client for the settlement ledger bridge

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::Config;
use crate::ws::protocol::{RoomId, WalletAddress};

use super::{LedgerError, SettlementSink};

/// Production settlement sink: posts declare-winner instructions to the
/// bridge service that relays them on-chain.
#[derive(Clone)]
pub struct HttpLedger {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpLedger {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            base_url: config.ledger_api_url.trim_end_matches('/').to_string(),
            api_key: config.ledger_api_key.clone(),
        }
    }
}

#[derive(Serialize)]
struct DeclareWinnerBody<'a> {
    winner: &'a WalletAddress,
}

#[async_trait]
impl SettlementSink for HttpLedger {
    async fn declare_winner(
        &self,
        room_id: RoomId,
        winner: &WalletAddress,
    ) -> Result<(), LedgerError> {
        let url = format!("{}/rooms/{}/winner", self.base_url, room_id);

        let response = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&DeclareWinnerBody { winner })
            .send()
            .await
            .map_err(LedgerError::Request)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Api { status, body });
        }

        Ok(())
    }
}
