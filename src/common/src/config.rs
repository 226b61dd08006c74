//! Configuration loading from environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL of the hosted screening database
    pub database_url: String,

    /// Interval between polling ticks in seconds
    pub poll_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - DATABASE_URL: PostgreSQL connection string
    ///
    /// Optional variables (with defaults):
    /// - POLL_INTERVAL_SECS: Polling interval (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let poll_interval_secs = env::var("POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(10);

        Ok(Self {
            database_url,
            poll_interval_secs,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Workflow webhook endpoints and their bearer tokens.
///
/// Tokens are optional at startup: a missing token is reported per request
/// as a configuration error so the rest of the dashboard keeps working.
#[derive(Clone)]
pub struct WebhookConfig {
    pub research_url: String,
    pub research_token: Option<String>,
    pub screening_url: String,
    pub screening_token: Option<String>,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("research_url", &self.research_url)
            .field("research_token", &self.research_token.as_ref().map(|_| "<set>"))
            .field("screening_url", &self.screening_url)
            .field("screening_token", &self.screening_token.as_ref().map(|_| "<set>"))
            .finish()
    }
}

impl WebhookConfig {
    /// Load webhook configuration, reading .env first.
    ///
    /// Required variables:
    /// - RESEARCH_WEBHOOK_URL
    /// - SCREENING_WEBHOOK_URL
    ///
    /// Optional variables:
    /// - RESEARCH_WEBHOOK_TOKEN
    /// - SCREENING_WEBHOOK_TOKEN
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    pub fn from_env_only() -> Result<Self, ConfigError> {
        Ok(Self {
            research_url: required_url("RESEARCH_WEBHOOK_URL")?,
            research_token: optional_secret("RESEARCH_WEBHOOK_TOKEN"),
            screening_url: required_url("SCREENING_WEBHOOK_URL")?,
            screening_token: optional_secret("SCREENING_WEBHOOK_TOKEN"),
        })
    }
}

fn required_url(var: &str) -> Result<String, ConfigError> {
    let value = env::var(var).map_err(|_| ConfigError::MissingVar(var.to_string()))?;
    Url::parse(&value).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", var, e)))?;
    Ok(value)
}

fn optional_secret(var: &str) -> Option<String> {
    env::var(var).ok().filter(|s| !s.trim().is_empty())
}
