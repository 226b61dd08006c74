//! Workflow webhook client.
//!
//! Forwards research and screening requests to the external workflow engine
//! with a bearer token and a per-request timeout. Responses come back as raw
//! JSON; shaping them into the dashboard's contract is done by the callers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::screening::ScreeningRequest;

/// Timeout for single-symbol research calls.
pub const RESEARCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the legacy status check call.
pub const STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(120);

/// Upstream bodies are truncated to this many bytes in errors.
const MAX_ERROR_BODY: usize = 2000;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Authentication token not configured")]
    MissingToken,

    #[error("Workflow request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Workflow returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Workflow returned a malformed response: {0}")]
    MalformedBody(String),

    #[error("HTTP request failed: {0}")]
    Request(String),
}

impl WebhookError {
    /// Upstream HTTP status, if the workflow answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            WebhookError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for 5xx answers whose body says the execution was cancelled.
    pub fn is_cancelled_execution(&self) -> bool {
        match self {
            WebhookError::Status { status, body } => {
                *status >= 500 && body.to_lowercase().contains("cancelled")
            }
            _ => false,
        }
    }
}

/// Calls into the external workflow engine.
/// Mockable for testing via mockall.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Research a single, already-normalised symbol.
    async fn research(&self, symbol: &str) -> Result<Value, WebhookError>;

    /// Start a screening job, waiting at most `timeout` for the acknowledgement.
    async fn submit_screening(&self, request: &ScreeningRequest, timeout: Duration) -> Result<Value, WebhookError>;

    /// Ask the screening workflow for results of a previously started job.
    async fn check_screening(&self, max_stocks: u32) -> Result<Value, WebhookError>;
}

/// reqwest-backed workflow client.
pub struct WebhookClient {
    client: Client,
    config: WebhookConfig,
}

impl WebhookClient {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn post_json(
        &self,
        url: &str,
        token: Option<&str>,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, WebhookError> {
        let token = token.ok_or(WebhookError::MissingToken)?;

        debug!("POST {} (timeout {:?})", url, timeout);

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_request_error(e, timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_request_error(e, timeout))?;

        if !status.is_success() {
            warn!("Workflow {} returned {}", url, status);
            return Err(WebhookError::Status {
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        parse_body(&text)
    }
}

#[async_trait]
impl WorkflowClient for WebhookClient {
    async fn research(&self, symbol: &str) -> Result<Value, WebhookError> {
        info!("Forwarding research request for {}", symbol);
        self.post_json(
            &self.config.research_url,
            self.config.research_token.as_deref(),
            &json!({ "symbol": symbol }),
            RESEARCH_TIMEOUT,
        )
        .await
    }

    async fn submit_screening(&self, request: &ScreeningRequest, timeout: Duration) -> Result<Value, WebhookError> {
        info!(
            "Forwarding screening request: {} stocks, type={}, user={}",
            request.batch_size, request.screening_type, request.user_email
        );
        let body = serde_json::to_value(request).map_err(|e| WebhookError::Request(e.to_string()))?;
        self.post_json(
            &self.config.screening_url,
            self.config.screening_token.as_deref(),
            &body,
            timeout,
        )
        .await
    }

    async fn check_screening(&self, max_stocks: u32) -> Result<Value, WebhookError> {
        self.post_json(
            &self.config.screening_url,
            self.config.screening_token.as_deref(),
            &json!({ "maxStocks": max_stocks }),
            STATUS_CHECK_TIMEOUT,
        )
        .await
    }
}

fn classify_request_error(err: reqwest::Error, timeout: Duration) -> WebhookError {
    if err.is_timeout() {
        WebhookError::Timeout(timeout)
    } else {
        WebhookError::Request(err.to_string())
    }
}

/// Parse an upstream body, treating an empty body as JSON null.
pub fn parse_body(text: &str) -> Result<Value, WebhookError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| {
        debug!("Unparseable workflow body: {}", truncate(text));
        WebhookError::MalformedBody(e.to_string())
    })
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
