//! Database repository functions for screening sessions, results and the
//! watchlist stored procedures.
//!
//! Tables and procedures are owned by the screening workflow; this crate only
//! reads sessions and results, and writes the watchlist through procedures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, warn};

use crate::db::{is_access_denied, is_invalid_text};
use crate::models::{Rating, ScoreBreakdown, ScreeningResult, ScreeningSession, SessionStatus, WatchlistStock};
use crate::Database;

const SESSION_COLUMNS: &str = r#"
    id::text AS id,
    user_email,
    status,
    total_stocks_screened,
    total_buy_rated,
    buy_percentage::float8 AS buy_percentage,
    average_score::float8 AS average_score,
    average_buy_score::float8 AS average_buy_score,
    processing_time_seconds::float8 AS processing_time_seconds,
    created_at,
    completed_at,
    screening_type,
    filters::jsonb AS filters,
    session_data::text AS session_data
"#;

/// Row shape of `user_screening_sessions`.
#[derive(Debug, Clone, FromRow)]
struct SessionRow {
    id: String,
    user_email: String,
    status: String,
    total_stocks_screened: Option<i32>,
    total_buy_rated: Option<i32>,
    buy_percentage: Option<f64>,
    average_score: Option<f64>,
    average_buy_score: Option<f64>,
    processing_time_seconds: Option<f64>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    screening_type: Option<String>,
    filters: Option<Value>,
    session_data: Option<String>,
}

impl From<SessionRow> for ScreeningSession {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            user_email: row.user_email,
            status: SessionStatus::parse(&row.status),
            total_stocks_screened: row.total_stocks_screened,
            total_buy_rated: row.total_buy_rated,
            buy_percentage: row.buy_percentage,
            average_score: row.average_score,
            average_buy_score: row.average_buy_score,
            processing_time_seconds: row.processing_time_seconds,
            created_at: row.created_at,
            completed_at: row.completed_at,
            screening_type: row.screening_type,
            filters: row.filters,
            session_data: row.session_data,
        }
    }
}

/// Row shape of `screening_results` joined with `stock_universe`.
#[derive(Debug, Clone, FromRow)]
struct ResultRow {
    symbol: String,
    name: Option<String>,
    sector: Option<String>,
    score: f64,
    rating: String,
    price: Option<f64>,
    change_percent: Option<f64>,
    rank_position: Option<i32>,
    market_cap: Option<f64>,
    pe_ratio: Option<f64>,
    week_52_high: Option<f64>,
    week_52_low: Option<f64>,
    distance_from_52_high: Option<String>,
    signal_strength: Option<String>,
    day_high: Option<f64>,
    day_low: Option<f64>,
    volume: Option<f64>,
    avg_volume: Option<f64>,
    relative_volume: Option<f64>,
    forward_pe: Option<f64>,
    beta: Option<f64>,
    eps_growth: Option<f64>,
    revenue_growth: Option<f64>,
    roe: Option<f64>,
    operating_margin: Option<f64>,
    debt_to_equity: Option<f64>,
    ytd_return: Option<f64>,
    mtd_return: Option<f64>,
    price_relative_4w: Option<f64>,
    price_relative_13w: Option<f64>,
    score_breakdown: Option<Value>,
    technicals: Option<Value>,
    signals: Option<Value>,
    insights: Option<Value>,
    recommendations: Option<Value>,
}

impl From<ResultRow> for ScreeningResult {
    fn from(row: ResultRow) -> Self {
        let rating = Rating::parse(&row.rating).unwrap_or_else(|| {
            debug!("Unknown rating '{}' for {}, treating as HOLD", row.rating, row.symbol);
            Rating::Hold
        });
        let score_breakdown = row
            .score_breakdown
            .and_then(|v| serde_json::from_value::<ScoreBreakdown>(v).ok())
            .unwrap_or_default();

        Self {
            rank: row.rank_position.map(|r| r.max(0) as u32).unwrap_or(0),
            name: row.name.unwrap_or_else(|| row.symbol.clone()),
            sector: row.sector.unwrap_or_else(|| "Unknown".to_string()),
            symbol: row.symbol,
            score: row.score,
            rating,
            price: row.price.unwrap_or(0.0),
            change_percent: row.change_percent.unwrap_or(0.0),
            rank_position: row.rank_position,
            market_cap: row.market_cap,
            pe_ratio: row.pe_ratio,
            week_52_high: row.week_52_high,
            week_52_low: row.week_52_low,
            distance_from_52_high: row.distance_from_52_high,
            signal_strength: row.signal_strength,
            day_high: row.day_high,
            day_low: row.day_low,
            volume: row.volume,
            avg_volume: row.avg_volume,
            relative_volume: row.relative_volume,
            forward_pe: row.forward_pe,
            beta: row.beta,
            eps_growth: row.eps_growth,
            revenue_growth: row.revenue_growth,
            roe: row.roe,
            operating_margin: row.operating_margin,
            debt_to_equity: row.debt_to_equity,
            ytd_return: row.ytd_return,
            mtd_return: row.mtd_return,
            price_relative_4w: row.price_relative_4w,
            price_relative_13w: row.price_relative_13w,
            score_breakdown,
            technicals: row.technicals,
            signals: row.signals,
            insights: row.insights,
            recommendations: row.recommendations,
        }
    }
}

/// Read access to screening sessions and their results.
/// Mockable for testing via mockall.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScreeningStore: Send + Sync {
    /// Most recently created session for a user.
    async fn latest_session_for_user(&self, user_email: &str) -> Result<Option<ScreeningSession>, sqlx::Error>;

    /// Session by its identifier.
    async fn session_by_id(&self, session_id: &str) -> Result<Option<ScreeningSession>, sqlx::Error>;

    /// Sessions created since `since`, newest first.
    async fn recent_sessions(
        &self,
        user_email: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScreeningSession>, sqlx::Error>;

    /// Most recent session whose results are final (completed or replaced).
    async fn latest_completed_session(&self, user_email: &str) -> Result<Option<ScreeningSession>, sqlx::Error>;

    /// Results of a session, best rank first.
    async fn session_results(&self, session_id: &str, limit: i64) -> Result<Vec<ScreeningResult>, sqlx::Error>;
}

/// Watchlist persistence, exclusively through stored procedures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WatchlistStore: Send + Sync {
    async fn add_to_watchlist(&self, user_email: &str, symbol: &str, notes: Option<String>) -> Result<(), sqlx::Error>;

    async fn remove_from_watchlist(&self, user_email: &str, symbol: &str) -> Result<(), sqlx::Error>;

    async fn watchlist_with_latest_data(&self, user_email: &str) -> Result<Vec<WatchlistStock>, sqlx::Error>;

    async fn is_stock_watched(&self, user_email: &str, symbol: &str) -> Result<bool, sqlx::Error>;
}

/// Log a failed read, calling out row-level security denials.
fn log_read_error(what: &str, err: &sqlx::Error) {
    if is_access_denied(err) {
        error!(
            "Database access denied while reading {} - check row-level security policies: {}",
            what, err
        );
    } else {
        warn!("Failed to read {}: {}", what, err);
    }
}

/// Get the most recently created session for a user.
pub async fn get_latest_session_for_user(
    pool: &PgPool,
    user_email: &str,
) -> Result<Option<ScreeningSession>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM user_screening_sessions WHERE user_email = $1 ORDER BY created_at DESC LIMIT 1",
        SESSION_COLUMNS
    );
    let row = sqlx::query_as::<_, SessionRow>(&sql)
        .bind(user_email)
        .fetch_optional(pool)
        .await
        .inspect_err(|e| log_read_error("latest session", e))?;

    Ok(row.map(Into::into))
}

/// Sessions and results are keyed by uuid; compare in that type so the
/// primary and foreign key indexes are used.
const SESSION_BY_ID_FILTER: &str = "id = $1::uuid";
const RESULTS_BY_SESSION_FILTER: &str = "r.session_id = $1::uuid";

const ADD_TO_WATCHLIST_SQL: &str = "SELECT add_to_watchlist(p_user_email => $1, p_symbol => $2, p_notes => $3)";
const REMOVE_FROM_WATCHLIST_SQL: &str = "SELECT remove_from_watchlist(p_user_email => $1, p_symbol => $2)";
const IS_STOCK_WATCHED_SQL: &str = "SELECT is_stock_watched(p_user_email => $1, p_symbol => $2)";
const WATCHLIST_SOURCE: &str = "get_watchlist_with_latest_data(p_user_email => $1)";

/// Get a session by id.
pub async fn get_session_by_id(pool: &PgPool, session_id: &str) -> Result<Option<ScreeningSession>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM user_screening_sessions WHERE {}",
        SESSION_COLUMNS, SESSION_BY_ID_FILTER
    );
    let row = sqlx::query_as::<_, SessionRow>(&sql)
        .bind(session_id)
        .fetch_optional(pool)
        .await;

    match row {
        Ok(row) => Ok(row.map(Into::into)),
        // An id that is not a uuid cannot name a session.
        Err(e) if is_invalid_text(&e) => Ok(None),
        Err(e) => {
            log_read_error("session", &e);
            Err(e)
        }
    }
}

/// Get a user's sessions created after `since`, newest first.
pub async fn get_recent_sessions(
    pool: &PgPool,
    user_email: &str,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ScreeningSession>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {}
        FROM user_screening_sessions
        WHERE user_email = $1 AND created_at >= $2
        ORDER BY created_at DESC
        LIMIT $3
        "#,
        SESSION_COLUMNS
    );
    let rows = sqlx::query_as::<_, SessionRow>(&sql)
        .bind(user_email)
        .bind(since)
        .bind(limit)
        .fetch_all(pool)
        .await
        .inspect_err(|e| log_read_error("recent sessions", e))?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Get the latest session for a user whose results are final.
pub async fn get_latest_completed_session(
    pool: &PgPool,
    user_email: &str,
) -> Result<Option<ScreeningSession>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {}
        FROM user_screening_sessions
        WHERE user_email = $1 AND status IN ('completed', 'replaced')
        ORDER BY created_at DESC
        LIMIT 1
        "#,
        SESSION_COLUMNS
    );
    let row = sqlx::query_as::<_, SessionRow>(&sql)
        .bind(user_email)
        .fetch_optional(pool)
        .await
        .inspect_err(|e| log_read_error("latest completed session", e))?;

    Ok(row.map(Into::into))
}

/// Get the results of a session joined with the stock universe, best rank first.
pub async fn get_session_results(
    pool: &PgPool,
    session_id: &str,
    limit: i64,
) -> Result<Vec<ScreeningResult>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT
            r.symbol,
            u.name,
            u.sector,
            r.score::float8 AS score,
            r.rating,
            r.price::float8 AS price,
            r.change_percent::float8 AS change_percent,
            r.rank_position,
            r.market_cap::float8 AS market_cap,
            r.pe_ratio::float8 AS pe_ratio,
            r.week_52_high::float8 AS week_52_high,
            r.week_52_low::float8 AS week_52_low,
            r.distance_from_52_high::text AS distance_from_52_high,
            r.signal_strength::text AS signal_strength,
            r.day_high::float8 AS day_high,
            r.day_low::float8 AS day_low,
            r.volume::float8 AS volume,
            r.avg_volume::float8 AS avg_volume,
            r.relative_volume::float8 AS relative_volume,
            r.forward_pe::float8 AS forward_pe,
            r.beta::float8 AS beta,
            r.eps_growth::float8 AS eps_growth,
            r.revenue_growth::float8 AS revenue_growth,
            r.roe::float8 AS roe,
            r.operating_margin::float8 AS operating_margin,
            r.debt_to_equity::float8 AS debt_to_equity,
            r.ytd_return::float8 AS ytd_return,
            r.mtd_return::float8 AS mtd_return,
            r.price_relative_4w::float8 AS price_relative_4w,
            r.price_relative_13w::float8 AS price_relative_13w,
            r.score_breakdown::jsonb AS score_breakdown,
            r.technicals::jsonb AS technicals,
            r.signals::jsonb AS signals,
            r.insights::jsonb AS insights,
            r.recommendations::jsonb AS recommendations
        FROM screening_results r
        INNER JOIN stock_universe u ON u.symbol = r.symbol
        WHERE {}
        ORDER BY r.rank_position ASC NULLS LAST, r.score DESC
        LIMIT $2
        "#,
        RESULTS_BY_SESSION_FILTER
    );
    let rows = sqlx::query_as::<_, ResultRow>(&sql)
        .bind(session_id)
        .bind(limit)
        .fetch_all(pool)
        .await;

    match rows {
        Ok(rows) => Ok(rows.into_iter().map(Into::into).collect()),
        Err(e) if is_invalid_text(&e) => Ok(Vec::new()),
        Err(e) => {
            log_read_error("screening results", &e);
            Err(e)
        }
    }
}

/// Call `add_to_watchlist`; the procedure is add-if-absent.
pub async fn add_to_watchlist(
    pool: &PgPool,
    user_email: &str,
    symbol: &str,
    notes: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(ADD_TO_WATCHLIST_SQL)
        .bind(user_email)
        .bind(symbol)
        .bind(notes)
        .execute(pool)
        .await?;
    Ok(())
}

/// Call `remove_from_watchlist`; the procedure is remove-if-present.
pub async fn remove_from_watchlist(pool: &PgPool, user_email: &str, symbol: &str) -> Result<(), sqlx::Error> {
    sqlx::query(REMOVE_FROM_WATCHLIST_SQL)
        .bind(user_email)
        .bind(symbol)
        .execute(pool)
        .await?;
    Ok(())
}

/// Call `get_watchlist_with_latest_data`.
pub async fn get_watchlist_with_latest_data(
    pool: &PgPool,
    user_email: &str,
) -> Result<Vec<WatchlistStock>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT
            symbol::text AS symbol,
            company_name::text AS company_name,
            sector::text AS sector,
            added_at::timestamptz AS added_at,
            notes::text AS notes,
            latest_score::float8 AS latest_score,
            latest_rating::text AS latest_rating,
            latest_price::float8 AS latest_price,
            latest_change_percent::float8 AS latest_change_percent,
            latest_screening_date::timestamptz AS latest_screening_date,
            rank_position::int4 AS rank_position
        FROM {}
        "#,
        WATCHLIST_SOURCE
    );
    let stocks = sqlx::query_as::<_, WatchlistStock>(&sql)
        .bind(user_email)
        .fetch_all(pool)
        .await
        .inspect_err(|e| log_read_error("watchlist", e))?;

    Ok(stocks)
}

/// Call `is_stock_watched`.
pub async fn is_stock_watched(pool: &PgPool, user_email: &str, symbol: &str) -> Result<bool, sqlx::Error> {
    let watched = sqlx::query_scalar::<_, Option<bool>>(IS_STOCK_WATCHED_SQL)
        .bind(user_email)
        .bind(symbol)
        .fetch_one(pool)
        .await?;
    Ok(watched.unwrap_or(false))
}

#[async_trait]
impl ScreeningStore for Database {
    async fn latest_session_for_user(&self, user_email: &str) -> Result<Option<ScreeningSession>, sqlx::Error> {
        get_latest_session_for_user(self.pool(), user_email).await
    }

    async fn session_by_id(&self, session_id: &str) -> Result<Option<ScreeningSession>, sqlx::Error> {
        get_session_by_id(self.pool(), session_id).await
    }

    async fn recent_sessions(
        &self,
        user_email: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScreeningSession>, sqlx::Error> {
        get_recent_sessions(self.pool(), user_email, since, limit).await
    }

    async fn latest_completed_session(&self, user_email: &str) -> Result<Option<ScreeningSession>, sqlx::Error> {
        get_latest_completed_session(self.pool(), user_email).await
    }

    async fn session_results(&self, session_id: &str, limit: i64) -> Result<Vec<ScreeningResult>, sqlx::Error> {
        get_session_results(self.pool(), session_id, limit).await
    }
}

#[async_trait]
impl WatchlistStore for Database {
    async fn add_to_watchlist(&self, user_email: &str, symbol: &str, notes: Option<String>) -> Result<(), sqlx::Error> {
        add_to_watchlist(self.pool(), user_email, symbol, notes.as_deref()).await
    }

    async fn remove_from_watchlist(&self, user_email: &str, symbol: &str) -> Result<(), sqlx::Error> {
        remove_from_watchlist(self.pool(), user_email, symbol).await
    }

    async fn watchlist_with_latest_data(&self, user_email: &str) -> Result<Vec<WatchlistStock>, sqlx::Error> {
        get_watchlist_with_latest_data(self.pool(), user_email).await
    }

    async fn is_stock_watched(&self, user_email: &str, symbol: &str) -> Result<bool, sqlx::Error> {
        is_stock_watched(self.pool(), user_email, symbol).await
    }
}
