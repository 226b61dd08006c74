//! Client for the dashboard API.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use common::{PollTarget, ScreeningRequest, WatchlistStock};

/// Longer than the server's own workflow budget so its envelope always arrives.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(150);

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.body["success"].as_bool().unwrap_or(false)
    }

    /// `error` plus `details` when the server sent both.
    pub fn error_message(&self) -> String {
        let error = self.body["error"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status));
        match self.body["details"].as_str() {
            Some(details) => format!("{} {}", error, details),
            None => error,
        }
    }
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read(response: reqwest::Response) -> Result<ApiResponse> {
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).with_context(|| format!("Unreadable API response (HTTP {})", status))?
        };
        Ok(ApiResponse { status, body })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;
        Self::read(response).await
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;
        Self::read(response).await
    }

    pub async fn research(&self, symbol: &str) -> Result<ApiResponse> {
        self.post("/api/stock-research", &json!({ "symbol": symbol })).await
    }

    pub async fn submit_screening(&self, request: &ScreeningRequest) -> Result<ApiResponse> {
        self.post("/api/stock-screening", &serde_json::to_value(request)?).await
    }

    pub async fn watchlist(&self, user_email: &str) -> Result<Vec<WatchlistStock>> {
        let response = self.get("/api/watchlist", &[("userEmail", user_email)]).await?;
        if !response.is_success() {
            bail!("Failed to fetch watchlist: {}", response.error_message());
        }
        Ok(serde_json::from_value(response.body["data"].clone())?)
    }

    pub async fn watchlist_action(&self, body: Value) -> Result<ApiResponse> {
        self.post("/api/watchlist", &body).await
    }

    pub async fn is_watched(&self, user_email: &str, symbol: &str) -> Result<bool> {
        let response = self
            .get("/api/watchlist/check", &[("userEmail", user_email), ("symbol", symbol)])
            .await?;
        if !response.is_success() {
            bail!("Failed to check watchlist status: {}", response.error_message());
        }
        Ok(response.body["isWatched"].as_bool().unwrap_or(false))
    }
}

/// Decide what to poll from the submission response.
///
/// A session handle is pinned; a 202 polling hand-off or an acknowledgement
/// without a handle falls back to discovery of sessions created since
/// `submitted_at`.
pub fn poll_target_for(response: &ApiResponse, submitted_at: DateTime<Utc>) -> Result<PollTarget> {
    let body = &response.body;
    let discover = PollTarget::Discover { since: submitted_at };
    match response.status {
        200 if body["success"].as_bool() == Some(true) => Ok(body["sessionId"]
            .as_str()
            .map(|id| PollTarget::Session(id.to_string()))
            .unwrap_or(discover)),
        202 if body["requiresPolling"].as_bool() == Some(true) => Ok(discover),
        200 => Err(anyhow!(
            "Screening was not accepted: {}",
            body["message"].as_str().unwrap_or("no reason given")
        )),
        _ => Err(anyhow!("Screening request failed: {}", response.error_message())),
    }
}

/// Uppercase a ticker and check it is 1-5 letters or dots.
pub fn validate_symbol(symbol: &str) -> Result<String, String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() || symbol.len() > 5 {
        return Err(format!("Symbol must be 1-5 characters, got '{}'", symbol));
    }
    if !symbol.chars().all(|c| c.is_ascii_alphabetic() || c == '.') {
        return Err(format!("Symbol may only contain letters and dots, got '{}'", symbol));
    }
    Ok(symbol)
}
