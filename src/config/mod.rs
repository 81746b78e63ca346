//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Base URL of the settlement ledger bridge
    pub ledger_api_url: String,
    /// API key for outbound ledger calls
    pub ledger_api_key: String,
    /// Shared secret for verifying inbound ledger webhook signatures
    pub ledger_webhook_secret: String,

    /// Allowed client origin for CORS (comma-separated for multiple)
    pub client_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            ledger_api_url: env::var("LEDGER_API_URL")
                .map_err(|_| ConfigError::Missing("LEDGER_API_URL"))?,
            ledger_api_key: env::var("LEDGER_API_KEY")
                .map_err(|_| ConfigError::Missing("LEDGER_API_KEY"))?,
            ledger_webhook_secret: env::var("LEDGER_WEBHOOK_SECRET")
                .map_err(|_| ConfigError::Missing("LEDGER_WEBHOOK_SECRET"))?,

            client_origin: env::var("CLIENT_ORIGIN")
                .map_err(|_| ConfigError::Missing("CLIENT_ORIGIN"))?,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
