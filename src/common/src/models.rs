//! Shared data models for screening sessions, results, watchlists and
//! single-symbol research.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Lifecycle status of a screening session, as written by the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Processing,
    Running,
    Completed,
    Failed,
    Replaced,
    #[serde(other)]
    Unknown,
}

impl SessionStatus {
    /// Parse status from the database column.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pending" => SessionStatus::Pending,
            "processing" => SessionStatus::Processing,
            "running" => SessionStatus::Running,
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "replaced" => SessionStatus::Replaced,
            _ => SessionStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Processing => "processing",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Replaced => "replaced",
            SessionStatus::Unknown => "unknown",
        }
    }

    /// No further transitions are expected from the workflow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Replaced
        )
    }

    /// The workflow is still working on this session.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Pending | SessionStatus::Processing | SessionStatus::Running
        )
    }

    /// The session's result rows are final and can be shown as-is.
    pub fn has_final_results(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Replaced)
    }

    /// Human-readable progress line for a session in this state.
    pub fn progress_message(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "Initializing screening process...",
            SessionStatus::Processing | SessionStatus::Running => {
                "Processing stocks and calculating scores..."
            }
            SessionStatus::Completed => "Screening completed successfully!",
            SessionStatus::Failed => "Screening failed. Please try again.",
            SessionStatus::Replaced => "Screening was replaced by a newer session.",
            SessionStatus::Unknown => "Processing...",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One screening run owned by a user (identified by email).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningSession {
    pub id: String,
    pub user_email: String,
    pub status: SessionStatus,
    pub total_stocks_screened: Option<i32>,
    pub total_buy_rated: Option<i32>,
    pub buy_percentage: Option<f64>,
    pub average_score: Option<f64>,
    pub average_buy_score: Option<f64>,
    pub processing_time_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub screening_type: Option<String>,
    pub filters: Option<Value>,
    /// Raw diagnostic blob written by the workflow (JSON, possibly double-encoded).
    #[serde(skip)]
    pub session_data: Option<String>,
}

impl ScreeningSession {
    /// Structured failure details, only meaningful when status is `failed`.
    pub fn failure(&self) -> SessionFailure {
        SessionFailure::from_session_data(self.session_data.as_deref())
    }
}

/// Category of a remote screening failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The workflow itself errored out.
    Workflow,
    /// A market-data provider the workflow depends on failed.
    UpstreamData,
    /// The workflow gave up waiting on something.
    Timeout,
    /// The workflow execution was cancelled.
    Cancelled,
    Unknown,
}

impl FailureKind {
    fn from_code(code: &str) -> Self {
        let code = code.to_lowercase();
        if code.contains("timeout") || code.contains("timed_out") {
            FailureKind::Timeout
        } else if code.contains("cancel") {
            FailureKind::Cancelled
        } else if code.contains("upstream") || code.contains("api") || code.contains("data") {
            FailureKind::UpstreamData
        } else if code.contains("workflow") {
            FailureKind::Workflow
        } else {
            FailureKind::Unknown
        }
    }
}

/// Failure details extracted from a failed session's diagnostic blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub message: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl SessionFailure {
    pub fn unknown() -> Self {
        Self {
            kind: FailureKind::Unknown,
            message: None,
            failed_at: None,
        }
    }

    /// Parse the workflow's diagnostic blob.
    ///
    /// Recognised keys: `error_message` (preferred) or `error` for the text,
    /// `failed_at` (RFC 3339) and `error_kind` / `error_code` for the category.
    /// Anything unparseable yields an `Unknown` failure with no message.
    pub fn from_session_data(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::unknown();
        };

        let mut value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => return Self::unknown(),
        };
        // Some workflow versions store the object as a JSON string.
        if let Value::String(inner) = &value {
            value = match serde_json::from_str(inner) {
                Ok(v) => v,
                Err(_) => return Self::unknown(),
            };
        }

        let Some(obj) = value.as_object() else {
            return Self::unknown();
        };

        let message = obj
            .get("error_message")
            .and_then(text_of)
            .or_else(|| obj.get("error").and_then(text_of));

        let failed_at = obj
            .get("failed_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let kind = obj
            .get("error_kind")
            .or_else(|| obj.get("error_code"))
            .and_then(Value::as_str)
            .map(FailureKind::from_code)
            .unwrap_or(if message.is_some() {
                FailureKind::Workflow
            } else {
                FailureKind::Unknown
            });

        Self {
            kind,
            message,
            failed_at,
        }
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(map) => map.get("message").and_then(text_of),
        Value::Null | Value::String(_) => None,
        other => Some(other.to_string()),
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "Screening failed: {}", message)?,
            None => write!(f, "Screening failed. Please try again.")?,
        }
        if let Some(failed_at) = self.failed_at {
            write!(f, " (Failed at: {})", failed_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }
        Ok(())
    }
}

/// Seven-level screening rating, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rating {
    #[serde(rename = "STRONG BUY")]
    StrongBuy,
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "WEAK BUY")]
    WeakBuy,
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "WEAK SELL")]
    WeakSell,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "STRONG SELL")]
    StrongSell,
}

impl Rating {
    pub const ALL: [Rating; 7] = [
        Rating::StrongBuy,
        Rating::Buy,
        Rating::WeakBuy,
        Rating::Hold,
        Rating::WeakSell,
        Rating::Sell,
        Rating::StrongSell,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_uppercase().replace(['_', '-'], " ");
        Rating::ALL.into_iter().find(|r| r.as_str() == normalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::StrongBuy => "STRONG BUY",
            Rating::Buy => "BUY",
            Rating::WeakBuy => "WEAK BUY",
            Rating::Hold => "HOLD",
            Rating::WeakSell => "WEAK SELL",
            Rating::Sell => "SELL",
            Rating::StrongSell => "STRONG SELL",
        }
    }

    /// Signed strength: +3 for STRONG BUY down to -3 for STRONG SELL.
    pub fn strength(&self) -> i8 {
        match self {
            Rating::StrongBuy => 3,
            Rating::Buy => 2,
            Rating::WeakBuy => 1,
            Rating::Hold => 0,
            Rating::WeakSell => -1,
            Rating::Sell => -2,
            Rating::StrongSell => -3,
        }
    }

    pub fn is_buy(&self) -> bool {
        self.strength() > 0
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score split into its sub-factors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreBreakdown {
    pub momentum: f64,
    pub quality: f64,
    pub technical: f64,
}

/// One scored stock within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningResult {
    /// Display rank (1-based)
    pub rank: u32,
    pub symbol: String,
    pub name: String,
    pub sector: String,
    pub score: f64,
    pub rating: Rating,
    pub price: f64,
    pub change_percent: f64,
    /// Rank assigned by the workflow within the session
    pub rank_position: Option<i32>,
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub week_52_high: Option<f64>,
    pub week_52_low: Option<f64>,
    pub distance_from_52_high: Option<String>,
    pub signal_strength: Option<String>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub volume: Option<f64>,
    pub avg_volume: Option<f64>,
    pub relative_volume: Option<f64>,
    pub forward_pe: Option<f64>,
    pub beta: Option<f64>,
    pub eps_growth: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub roe: Option<f64>,
    pub operating_margin: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub ytd_return: Option<f64>,
    pub mtd_return: Option<f64>,
    pub price_relative_4w: Option<f64>,
    pub price_relative_13w: Option<f64>,
    #[serde(default)]
    pub score_breakdown: ScoreBreakdown,
    pub technicals: Option<Value>,
    pub signals: Option<Value>,
    pub insights: Option<Value>,
    pub recommendations: Option<Value>,
}

impl ScreeningResult {
    /// Minimal result with every enrichment field empty.
    pub fn basic(symbol: &str, name: &str, sector: &str, score: f64, rating: Rating) -> Self {
        Self {
            rank: 0,
            symbol: symbol.to_string(),
            name: name.to_string(),
            sector: sector.to_string(),
            score,
            rating,
            price: 0.0,
            change_percent: 0.0,
            rank_position: None,
            market_cap: None,
            pe_ratio: None,
            week_52_high: None,
            week_52_low: None,
            distance_from_52_high: None,
            signal_strength: None,
            day_high: None,
            day_low: None,
            volume: None,
            avg_volume: None,
            relative_volume: None,
            forward_pe: None,
            beta: None,
            eps_growth: None,
            revenue_growth: None,
            roe: None,
            operating_margin: None,
            debt_to_equity: None,
            ytd_return: None,
            mtd_return: None,
            price_relative_4w: None,
            price_relative_13w: None,
            score_breakdown: ScoreBreakdown::default(),
            technicals: None,
            signals: None,
            insights: None,
            recommendations: None,
        }
    }
}

/// A saved ticker joined with its most recent screening metrics.
///
/// Field names follow the stored procedure's output columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WatchlistStock {
    pub symbol: String,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub added_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub latest_score: Option<f64>,
    pub latest_rating: Option<String>,
    pub latest_price: Option<f64>,
    pub latest_change_percent: Option<f64>,
    pub latest_screening_date: Option<DateTime<Utc>>,
    pub rank_position: Option<i32>,
}

/// A metric the research workflow reports either as a number or as "N/A".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }
}

impl Default for MetricValue {
    fn default() -> Self {
        MetricValue::Text("N/A".to_string())
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{:.2}", n),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Technicals {
    pub day_range: String,
    pub open_price: f64,
    pub previous_close: f64,
    #[serde(rename = "week52High")]
    pub week_52_high: MetricValue,
    #[serde(rename = "week52Low")]
    pub week_52_low: MetricValue,
    pub beta: MetricValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsItem {
    pub title: String,
    pub date: String,
    pub url: String,
    pub summary: String,
}

/// Which upstream data sources answered the research request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceFlags {
    pub quote: bool,
    pub profile: bool,
    pub metrics: bool,
    pub news: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugInfo {
    pub input_count: u32,
    pub quote_fields: Vec<String>,
    pub profile_fields: Vec<String>,
    pub metrics_fields: Vec<String>,
    pub news_count: u32,
    pub has_all_data: SourceFlags,
}

/// Single-symbol research result. Request-scoped, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StockData {
    pub symbol: String,
    pub name: String,

    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub open_price: f64,
    pub previous_close: f64,
    pub volume: f64,

    pub sector: String,
    pub country: String,
    pub exchange: String,
    pub market_cap: String,
    pub website: String,
    pub logo: String,
    pub description: String,

    pub pe_ratio: MetricValue,
    pub beta: MetricValue,

    pub technicals: Technicals,
    pub news: Vec<NewsItem>,

    pub last_update: String,
    pub data_source: String,
    pub debug: DebugInfo,
}
