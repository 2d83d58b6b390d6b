//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL
    pub database_url: String,
    /// Maximum inbound WebSocket frame size in bytes
    pub max_message_size: usize,
    /// WebSocket ping interval in seconds
    pub ws_ping_interval: u64,
    /// Seconds to wait for a setup message before dropping the connection
    pub setup_timeout_seconds: u64,
    /// Maximum total WebSocket connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum WebSocket connections per IP address (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
    /// Bearer token for /admin/* endpoints (None = endpoints hidden)
    pub admin_token: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ServerConfig {
            host: env::var("HUDDLE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("HUDDLE_PORT")
                .unwrap_or_else(|_| "8090".to_string())
                .parse()
                .context("Invalid HUDDLE_PORT")?,
            database_url: env::var("HUDDLE_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/huddle.db".to_string()),
            max_message_size: env::var("HUDDLE_MAX_MESSAGE_SIZE")
                .unwrap_or_else(|_| "65536".to_string()) // 64KB
                .parse()
                .context("Invalid HUDDLE_MAX_MESSAGE_SIZE")?,
            ws_ping_interval: env::var("HUDDLE_WS_PING_INTERVAL")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid HUDDLE_WS_PING_INTERVAL")?,
            setup_timeout_seconds: env::var("HUDDLE_SETUP_TIMEOUT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid HUDDLE_SETUP_TIMEOUT")?,
            max_connections: env::var("HUDDLE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("Invalid HUDDLE_MAX_CONNECTIONS")?,
            max_connections_per_ip: env::var("HUDDLE_MAX_CONNECTIONS_PER_IP")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid HUDDLE_MAX_CONNECTIONS_PER_IP")?,
            cors_origins: env::var("HUDDLE_CORS_ORIGINS").ok(),
            admin_token: env::var("HUDDLE_ADMIN_TOKEN").ok(),
        };

        Ok(config)
    }
}
