//! Screening request shape and the batch-size policies that drive request
//! timeouts, user-facing time estimates and polling ceilings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Batches at or above this size are expected to outlive one HTTP round trip.
pub const LARGE_BATCH_THRESHOLD: u32 = 100;

/// Batch size assumed when the caller does not know it.
pub const DEFAULT_BATCH_SIZE: u32 = 500;

/// Polling ticks per minute at the default 10 second interval.
pub const POLLS_PER_MINUTE: u32 = 6;

fn default_screening_type() -> String {
    "momentum".to_string()
}

fn default_filter() -> String {
    "All".to_string()
}

/// Screening job parameters forwarded to the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningRequest {
    pub batch_size: u32,
    #[serde(rename = "type", default = "default_screening_type")]
    pub screening_type: String,
    #[serde(default = "default_filter")]
    pub sector: String,
    #[serde(default = "default_filter")]
    pub market_cap: String,
    pub user_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<u32>,
    /// Any other fields the caller sent; forwarded untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScreeningRequest {
    pub fn new(batch_size: u32, user_email: &str) -> Self {
        Self {
            batch_size,
            screening_type: default_screening_type(),
            sector: default_filter(),
            market_cap: default_filter(),
            user_email: user_email.to_string(),
            start_index: None,
            extra: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batchSize must be greater than zero".to_string());
        }
        let email = self.user_email.trim();
        if email.is_empty() {
            return Err("User email is required".to_string());
        }
        if !email.contains('@') {
            return Err(format!("Invalid user email: {}", email));
        }
        Ok(())
    }

    pub fn is_large(&self) -> bool {
        is_large_batch(self.batch_size)
    }
}

pub fn is_large_batch(batch_size: u32) -> bool {
    batch_size >= LARGE_BATCH_THRESHOLD
}

/// How long the proxy waits for the workflow's acknowledgement.
///
/// Large batches get the short budget: the proxy gives up early and tells
/// the caller to poll instead.
pub fn request_timeout(batch_size: u32) -> Duration {
    if is_large_batch(batch_size) {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(120)
    }
}

/// User-facing completion estimate.
pub fn estimated_time(batch_size: u32) -> &'static str {
    match batch_size {
        n if n >= 5000 => "25-30 minutes",
        n if n >= 2000 => "15-20 minutes",
        n if n >= 1000 => "10-15 minutes",
        n if n >= 500 => "5-10 minutes",
        _ => "2-5 minutes",
    }
}

/// Polling ceiling in ticks for a batch.
pub fn max_poll_attempts(batch_size: u32) -> u32 {
    match batch_size {
        n if n >= 5000 => 360,
        n if n >= 2000 => 300,
        n if n >= 1000 => 240,
        _ => 180,
    }
}

/// Wall-clock budget in minutes for a polling ceiling.
pub fn timeout_minutes(max_attempts: u32) -> u32 {
    max_attempts.div_ceil(POLLS_PER_MINUTE)
}
