//! Shaping workflow answers into the dashboard's JSON contract.
//!
//! Every function here returns a [`ProxyReply`]: the proxy endpoints never
//! surface a bare error, only a status code plus a `{success, ...}` envelope.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::screening::{estimated_time, is_large_batch};
use crate::webhook::WebhookError;

const SMALLER_BATCH_HINT: &str =
    "Try a smaller batch size (10-20 stocks), or wait a few minutes and try again - the workflow may still be processing in the background.";

/// HTTP status plus JSON body, cheap to clone between deduplicated callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyReply {
    pub status: u16,
    pub body: Value,
}

impl ProxyReply {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    /// `{success: false, error}` with the given status.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, json!({ "success": false, "error": message.into() }))
    }

    fn error_with_details(status: u16, message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(
            status,
            json!({ "success": false, "error": message.into(), "details": details.into() }),
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ============================================================================
// Single-symbol research
// ============================================================================

/// Envelope for a research answer.
///
/// A body that already carries a boolean `success` is the workflow's own
/// envelope and goes out verbatim; anything else is wrapped as `data`.
pub fn research_reply(result: Result<Value, WebhookError>) -> ProxyReply {
    match result {
        Ok(body) => {
            if body.get("success").map(Value::is_boolean).unwrap_or(false) {
                ProxyReply::ok(body)
            } else {
                ProxyReply::ok(json!({ "success": true, "data": body }))
            }
        }
        Err(WebhookError::MissingToken) => {
            error!("RESEARCH_WEBHOOK_TOKEN is not set");
            ProxyReply::error(500, "Authentication token not configured")
        }
        Err(WebhookError::Status { status, body }) => {
            warn!("Research workflow returned {}", status);
            ProxyReply::error_with_details(500, format!("Research workflow returned HTTP {}", status), body)
        }
        Err(WebhookError::MalformedBody(reason)) => {
            ProxyReply::error_with_details(500, "Research workflow returned a malformed response", reason)
        }
        Err(WebhookError::Timeout(_)) => ProxyReply::error(500, "Research workflow timed out"),
        Err(WebhookError::Request(reason)) => {
            error!("Research proxy error: {}", reason);
            ProxyReply::error(500, "Failed to fetch stock data")
        }
    }
}

// ============================================================================
// Screening submission
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum AckError {
    #[error("workflow acknowledgement is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("sessionId must be a string, got {0}")]
    InvalidSessionId(String),
}

/// Validated acknowledgement of a screening submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningAck {
    pub success: bool,
    pub session_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
}

impl ScreeningAck {
    /// Validate the workflow's acknowledgement once, at the boundary.
    ///
    /// `sessionId` must be a plain string, null or absent. Any other shape is
    /// a contract violation and is rejected rather than unwrapped.
    pub fn from_upstream(value: Value) -> Result<Self, AckError> {
        let Value::Object(obj) = value else {
            return Err(AckError::NotAnObject(json_kind(&value).to_string()));
        };

        let session_id = match obj.get("sessionId") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(other) => return Err(AckError::InvalidSessionId(json_kind(other).to_string())),
        };

        let results = obj.get("results").filter(|v| !v.is_null()).cloned();
        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                if results.is_some() && session_id.is_none() {
                    "completed".to_string()
                } else {
                    "processing".to_string()
                }
            });

        Ok(Self {
            success: obj.get("success").and_then(Value::as_bool).unwrap_or(true),
            session_id,
            status,
            message: obj.get("message").and_then(Value::as_str).map(str::to_string),
            results,
            summary: obj.get("summary").filter(|v| !v.is_null()).cloned(),
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reply for a workflow answer to a screening submission.
pub fn reply_for_ack(batch_size: u32, upstream: Value) -> ProxyReply {
    match ScreeningAck::from_upstream(upstream) {
        Ok(ack) => {
            info!(
                "Screening accepted: session={:?} status={}",
                ack.session_id, ack.status
            );
            match serde_json::to_value(&ack) {
                Ok(body) => ProxyReply::ok(body),
                Err(e) => ProxyReply::error(500, format!("Failed to encode acknowledgement: {}", e)),
            }
        }
        Err(violation) => {
            error!(
                "Screening workflow contract violation ({} stocks): {}",
                batch_size, violation
            );
            ProxyReply::error_with_details(
                502,
                "Screening workflow returned an unexpected acknowledgement",
                violation.to_string(),
            )
        }
    }
}

/// The 202 "go poll the database" envelope for large batches.
pub fn requires_polling_reply(batch_size: u32, message: &str) -> ProxyReply {
    ProxyReply::new(
        202,
        json!({
            "success": false,
            "requiresPolling": true,
            "message": message,
            "estimatedTime": estimated_time(batch_size),
        }),
    )
}

/// Reply for a failed screening submission.
///
/// Batches of 100+ degrade timeouts, gateway timeouts, cancelled executions
/// and unreadable bodies into [`requires_polling_reply`]; smaller batches get
/// a hard error with guidance to reduce the batch size.
pub fn reply_for_failure(batch_size: u32, err: &WebhookError) -> ProxyReply {
    let large = is_large_batch(batch_size);

    match err {
        WebhookError::MissingToken => {
            error!("SCREENING_WEBHOOK_TOKEN is not set");
            ProxyReply::error(500, "Authentication token not configured")
        }
        WebhookError::Timeout(_) if large => {
            info!("Screening {} stocks timed out upstream, switching to polling", batch_size);
            requires_polling_reply(
                batch_size,
                &format!(
                    "Screening {} stocks is running in the background. Results will appear as they are saved.",
                    batch_size
                ),
            )
        }
        WebhookError::Timeout(_) => ProxyReply::error_with_details(
            408,
            "Screening request timed out.",
            SMALLER_BATCH_HINT,
        ),
        WebhookError::Status { status: 524, .. } if large => requires_polling_reply(
            batch_size,
            "The workflow is taking longer than the gateway allows. Screening continues in the background.",
        ),
        WebhookError::Status { status: 524, body } => {
            warn!("Screening gateway timeout: {}", body);
            ProxyReply::error_with_details(
                524,
                "The screening workflow took too long to respond (524).",
                SMALLER_BATCH_HINT,
            )
        }
        e if large && e.is_cancelled_execution() => {
            warn!("Workflow reported a cancelled execution for {} stocks, assuming it still runs", batch_size);
            requires_polling_reply(
                batch_size,
                "The workflow reported a cancelled execution, which usually means it is still processing. Checking the database for results.",
            )
        }
        WebhookError::Status { status, body } => {
            warn!("Screening workflow error {}: {}", status, body);
            ProxyReply::new(
                500,
                json!({
                    "success": false,
                    "error": format!("Screening workflow error ({}).", status),
                    "details": SMALLER_BATCH_HINT,
                    "upstream": body,
                }),
            )
        }
        WebhookError::MalformedBody(_) if large => requires_polling_reply(
            batch_size,
            "The workflow answered with an unreadable response; assuming it is still processing.",
        ),
        WebhookError::MalformedBody(reason) => ProxyReply::error_with_details(
            500,
            "The screening workflow returned an unreadable response.",
            reason.clone(),
        ),
        WebhookError::Request(reason) => {
            error!("Screening proxy error: {}", reason);
            ProxyReply::error(500, "Failed to screen stocks")
        }
    }
}

// ============================================================================
// Legacy status polling
// ============================================================================

/// Body of `POST /api/stock-screening/status`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub max_stocks: u32,
    pub job_id: String,
}

/// Where a legacy job stands relative to its time estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusPhase {
    /// Still inside the estimate; progress in percent.
    Processing { progress: f64 },
    /// Estimate elapsed; time to ask the workflow.
    Due,
}

/// Start time encoded in a `job-<unix millis>` identifier.
pub fn job_started_at(job_id: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = job_id.split('-').nth(1)?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Expected processing time in seconds for the legacy path.
pub fn estimated_processing_secs(max_stocks: u32) -> f64 {
    if max_stocks >= 500 {
        540.0
    } else {
        max_stocks as f64 * 4.5 + 20.0
    }
}

pub fn status_phase(request: &StatusRequest, now: DateTime<Utc>) -> Option<StatusPhase> {
    let started = job_started_at(&request.job_id)?;
    let elapsed_ms = (now - started).num_milliseconds().max(0) as f64;
    let estimate_ms = estimated_processing_secs(request.max_stocks) * 1000.0;

    if elapsed_ms < estimate_ms {
        Some(StatusPhase::Processing {
            progress: (elapsed_ms / estimate_ms * 100.0).min(100.0),
        })
    } else {
        Some(StatusPhase::Due)
    }
}

fn processing_reply(status: u16, message: &str, progress: Option<f64>) -> ProxyReply {
    let mut body = json!({
        "success": false,
        "status": "processing",
        "message": message,
        "timestamp": now_rfc3339(),
    });
    if let Some(progress) = progress {
        body["progress"] = json!(progress);
    }
    ProxyReply::new(status, body)
}

pub fn status_pending_reply(max_stocks: u32, progress: f64) -> ProxyReply {
    processing_reply(
        202,
        &format!("Screening {} stocks is still in progress...", max_stocks),
        Some(progress),
    )
}

pub fn status_error_reply(status: u16, message: impl Into<String>) -> ProxyReply {
    ProxyReply::new(
        status,
        json!({
            "success": false,
            "status": "error",
            "error": message.into(),
            "timestamp": now_rfc3339(),
        }),
    )
}

/// Reply for the one-off workflow check once a legacy job's estimate elapsed.
pub fn status_check_reply(result: Result<Value, WebhookError>) -> ProxyReply {
    match result {
        Ok(data) => ProxyReply::ok(completed_envelope(&data)),
        Err(WebhookError::MissingToken) => status_error_reply(500, "Authentication token not configured"),
        Err(WebhookError::Status { status: 404, body }) if body.contains("not registered") => {
            info!("Screening webhook not registered (test mode), reporting still processing");
            processing_reply(
                202,
                "Screening is still in progress... (workflow test mode limitation)",
                None,
            )
        }
        Err(WebhookError::Status { status: 524, .. }) => {
            processing_reply(200, "Screening is still in progress...", None)
        }
        Err(err) => {
            info!("Workflow status check failed, continuing to poll: {}", err);
            processing_reply(
                202,
                "Screening is still in progress... (encountered error but continuing)",
                None,
            )
        }
    }
}

/// Stock as returned by the workflow's synchronous screening answer.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkflowStock {
    symbol: String,
    name: String,
    sector: String,
    score: f64,
    rating: String,
    price: f64,
    change_percent: f64,
    market_cap: f64,
    pe_ratio: Option<f64>,
    #[serde(rename = "week52High")]
    week_52_high: Option<f64>,
    #[serde(rename = "distanceFrom52High")]
    distance_from_52_high: Option<String>,
    score_breakdown: crate::models::ScoreBreakdown,
}

fn completed_envelope(data: &Value) -> Value {
    let summary = &data["summary"];
    let number = |v: &Value| v.as_f64().unwrap_or(0.0);

    let results: Vec<Value> = data["results"]
        .as_array()
        .map(|stocks| {
            stocks
                .iter()
                .filter_map(|s| serde_json::from_value::<WorkflowStock>(s.clone()).ok())
                .enumerate()
                .map(|(index, stock)| {
                    json!({
                        "rank": index + 1,
                        "symbol": stock.symbol,
                        "name": stock.name,
                        "sector": stock.sector,
                        "score": stock.score,
                        "rating": stock.rating,
                        "price": stock.price,
                        "changePercent": stock.change_percent,
                        "marketCap": stock.market_cap,
                        "peRatio": stock.pe_ratio,
                        "week52High": stock.week_52_high,
                        "distanceFrom52High": stock.distance_from_52_high,
                        "scoreBreakdown": stock.score_breakdown,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "success": true,
        "status": "completed",
        "timestamp": now_rfc3339(),
        "summary": {
            "totalScreened": number(&summary["totalScreened"]),
            "averageScore": number(&summary["averageScore"]),
            "strongBuys": number(&summary["ratings"]["strongBuy"]),
            "buys": number(&summary["ratings"]["buy"]),
            "topSector": summary["topSector"].as_str().unwrap_or("N/A"),
        },
        "results": results,
    })
}
