use std::env;
use std::time::Duration;

use crate::store::DEFAULT_TABLE;

pub const DEFAULT_KEY_HEADER: &str = "APIKEY";
pub const DEFAULT_HEADER_PREFIX: &str = "X-API-";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: String,
    pub quota_table: String,
    pub key_header: String,
    pub header_prefix: String,
    pub db_max_connections: u32,
    pub keeper_timeout_ms: Option<u64>,
    pub server_host: String,
    pub server_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name))
    }

    /// Build a config from any variable source; only `DATABASE_URL` is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, env::VarError>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let optional = |name: &str| lookup(name).ok().filter(|v| !v.trim().is_empty());

        Ok(Config {
            database_url: lookup("DATABASE_URL")?,
            quota_table: optional("QUOTA_TABLE").unwrap_or_else(|| DEFAULT_TABLE.into()),
            key_header: optional("KEY_HEADER").unwrap_or_else(|| DEFAULT_KEY_HEADER.into()),
            header_prefix: optional("HEADER_PREFIX")
                .unwrap_or_else(|| DEFAULT_HEADER_PREFIX.into()),
            db_max_connections: optional("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            keeper_timeout_ms: optional("KEEPER_TIMEOUT_MS").and_then(|v| v.parse().ok()),
            server_host: optional("SERVER_HOST").unwrap_or_else(|| "::".into()),
            server_port: optional("SERVER_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
        })
    }

    pub fn keeper_timeout(&self) -> Option<Duration> {
        self.keeper_timeout_ms.map(Duration::from_millis)
    }
}
