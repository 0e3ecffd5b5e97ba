//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The connection URL is wrapped in secrecy::SecretString to keep
//! credentials out of logs.

pub mod secrets;

use crate::error::{Error, Result};
use crate::queue::DEFAULT_POLL_MS;
use secrecy::SecretString;

/// Collection used when `QUEUE_COLLECTION` is unset.
pub const DEFAULT_COLLECTION: &str = "messages";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub collection: String,
    pub poll_ms: u64,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let poll_ms = match std::env::var("QUEUE_POLL_MS") {
            Ok(raw) => raw.parse().map_err(|e| {
                Error::Config(format!("QUEUE_POLL_MS must be a whole number of ms: {e}"))
            })?,
            Err(_) => DEFAULT_POLL_MS,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            collection: std::env::var("QUEUE_COLLECTION")
                .unwrap_or_else(|_| DEFAULT_COLLECTION.to_string()),
            poll_ms,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
