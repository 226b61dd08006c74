//! HTTP handlers.
//!
//! Every handler answers with a JSON envelope and an explicit status code;
//! extractor rejections are turned into `400 {success: false, error}` too.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use common::proxy::{
    reply_for_ack, reply_for_failure, research_reply, status_check_reply, status_error_reply, status_pending_reply,
    status_phase, StatusPhase, StatusRequest,
};
use common::screening::request_timeout;
use common::view::{rank_results, ScreeningSummary};
use common::{ProxyReply, RequestKey, ScreeningRequest, WatchlistError};

use crate::state::AppState;

type AppStateRef = State<Arc<AppState>>;

const DEFAULT_RESULTS_LIMIT: i64 = 50;
const MAX_RESULTS_LIMIT: i64 = 1000;

fn respond(reply: ProxyReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    respond(ProxyReply::error(status.as_u16(), message))
}

fn not_found(message: &str) -> Response {
    respond(ProxyReply::new(
        404,
        json!({ "success": false, "error": message, "timestamp": Utc::now().to_rfc3339() }),
    ))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// ============================================================================
// Health
// ============================================================================

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

// ============================================================================
// Research
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ResearchBody {
    symbol: Option<String>,
}

/// POST /api/stock-research
pub async fn stock_research(State(state): AppStateRef, body: Result<Json<ResearchBody>, JsonRejection>) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let Some(symbol) = non_empty(body.symbol).map(|s| s.to_uppercase()) else {
        return error_response(StatusCode::BAD_REQUEST, "Symbol is required");
    };

    let workflow = Arc::clone(&state.workflow);
    let key = RequestKey::research(&symbol);
    let reply = state
        .research_inflight
        .run(key, async move { research_reply(workflow.research(&symbol).await) })
        .await;

    respond(reply)
}

// ============================================================================
// Screening
// ============================================================================

/// POST /api/stock-screening
pub async fn stock_screening(
    State(state): AppStateRef,
    body: Result<Json<ScreeningRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if let Err(message) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    info!(
        "Screening request: {} stocks, type={}, sector={}, marketCap={}",
        request.batch_size, request.screening_type, request.sector, request.market_cap
    );

    let workflow = Arc::clone(&state.workflow);
    let key = RequestKey::screening(&request);
    let reply = state
        .screening_inflight
        .run(key, async move {
            let batch_size = request.batch_size;
            match workflow.submit_screening(&request, request_timeout(batch_size)).await {
                Ok(body) => reply_for_ack(batch_size, body),
                Err(err) => reply_for_failure(batch_size, &err),
            }
        })
        .await;

    respond(reply)
}

/// POST /api/stock-screening/status (legacy job polling)
pub async fn screening_status(
    State(state): AppStateRef,
    body: Result<Json<StatusRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return respond(status_error_reply(400, rejection.body_text())),
    };

    match status_phase(&request, Utc::now()) {
        None => respond(status_error_reply(400, format!("Invalid jobId: {}", request.job_id))),
        Some(StatusPhase::Processing { progress }) => respond(status_pending_reply(request.max_stocks, progress)),
        Some(StatusPhase::Due) => {
            info!("Checking workflow for job {} ({} stocks)", request.job_id, request.max_stocks);
            respond(status_check_reply(state.workflow.check_screening(request.max_stocks).await))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedParams {
    session_id: Option<String>,
    user_email: Option<String>,
    limit: Option<i64>,
}

/// GET /api/stock-screening/enhanced
pub async fn enhanced_results(
    State(state): AppStateRef,
    params: Result<Query<EnhancedParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let Some(user_email) = non_empty(params.user_email) else {
        return error_response(StatusCode::BAD_REQUEST, "User email is required");
    };
    let limit = params.limit.unwrap_or(DEFAULT_RESULTS_LIMIT).clamp(1, MAX_RESULTS_LIMIT);

    let session_id = match non_empty(params.session_id) {
        Some(id) => id,
        None => match state.store.latest_session_for_user(&user_email).await {
            Ok(Some(session)) => session.id,
            Ok(None) => return not_found("No screening results found"),
            Err(e) => {
                error!("Enhanced results session lookup failed: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch screening session");
            }
        },
    };

    let results = match state.store.session_results(&session_id, limit).await {
        Ok(results) => results,
        Err(e) => {
            error!("Enhanced results query failed for {}: {}", session_id, e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch enhanced screening results",
            );
        }
    };
    if results.is_empty() {
        return not_found("No screening results found");
    }

    let results = rank_results(results);
    let summary = ScreeningSummary::from_results(&results);
    info!("Enhanced screening results: {} stocks for session {}", results.len(), session_id);

    Json(json!({
        "success": true,
        "timestamp": Utc::now().to_rfc3339(),
        "sessionId": session_id,
        "summary": summary,
        "results": results,
    }))
    .into_response()
}

// ============================================================================
// Watchlist
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchlistParams {
    user_email: Option<String>,
    symbol: Option<String>,
}

fn watchlist_failure(err: WatchlistError) -> Response {
    if err.is_validation() {
        error_response(StatusCode::BAD_REQUEST, err.to_string())
    } else {
        warn!("Watchlist operation failed: {}", err);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

/// GET /api/watchlist
pub async fn get_watchlist(
    State(state): AppStateRef,
    params: Result<Query<WatchlistParams>, QueryRejection>,
) -> Response {
    let Ok(Query(params)) = params else {
        return error_response(StatusCode::BAD_REQUEST, "User email is required");
    };
    let Some(user_email) = non_empty(params.user_email) else {
        return error_response(StatusCode::BAD_REQUEST, "User email is required");
    };

    match state.watchlist.list(&user_email).await {
        Ok(stocks) => Json(json!({ "success": true, "data": stocks })).into_response(),
        Err(err) => watchlist_failure(err),
    }
}

/// GET /api/watchlist/check
pub async fn check_watchlist(
    State(state): AppStateRef,
    params: Result<Query<WatchlistParams>, QueryRejection>,
) -> Response {
    let Ok(Query(params)) = params else {
        return error_response(StatusCode::BAD_REQUEST, "User email is required");
    };
    let Some(user_email) = non_empty(params.user_email) else {
        return error_response(StatusCode::BAD_REQUEST, "User email is required");
    };
    let Some(symbol) = non_empty(params.symbol) else {
        return error_response(StatusCode::BAD_REQUEST, "Symbol is required");
    };

    match state.watchlist.is_watched(&user_email, &symbol).await {
        Ok(watched) => Json(json!({ "success": true, "isWatched": watched })).into_response(),
        Err(err) => watchlist_failure(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchlistAction {
    action: Option<String>,
    symbol: Option<String>,
    symbols: Option<Value>,
    user_email: Option<String>,
    notes: Option<String>,
}

/// POST /api/watchlist
pub async fn post_watchlist(
    State(state): AppStateRef,
    body: Result<Json<WatchlistAction>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let Some(user_email) = non_empty(body.user_email) else {
        return error_response(StatusCode::BAD_REQUEST, "User email is required");
    };
    let symbol = non_empty(body.symbol);

    let outcome = match body.action.as_deref() {
        Some("add") => {
            let Some(symbol) = symbol else {
                return error_response(StatusCode::BAD_REQUEST, "Symbol is required for add action");
            };
            state
                .watchlist
                .add(&user_email, &symbol, body.notes)
                .await
                .map(|_| json!({ "success": true }))
        }
        Some("remove") => {
            let Some(symbol) = symbol else {
                return error_response(StatusCode::BAD_REQUEST, "Symbol is required for remove action");
            };
            state
                .watchlist
                .remove(&user_email, &symbol)
                .await
                .map(|_| json!({ "success": true }))
        }
        Some("bulk-add") => {
            let Some(symbols) = body.symbols.as_ref().and_then(Value::as_array) else {
                return error_response(StatusCode::BAD_REQUEST, "Symbols array is required for bulk-add action");
            };
            let symbols: Vec<String> = symbols
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            state
                .watchlist
                .bulk_add(&user_email, &symbols)
                .await
                .map(|added| json!({ "success": true, "added": added }))
        }
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                r#"Invalid action. Must be "add", "remove", or "bulk-add""#,
            )
        }
    };

    match outcome {
        Ok(body) => Json(body).into_response(),
        Err(err) => watchlist_failure(err),
    }
}
