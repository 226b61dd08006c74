//! Router assembly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    // Open CORS; the browser dashboard may be served from another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        // ================================================================
        // Workflow proxies
        // ================================================================
        .route("/api/stock-research", post(handlers::stock_research))
        .route("/api/stock-screening", post(handlers::stock_screening))
        .route("/api/stock-screening/status", post(handlers::screening_status))
        // ================================================================
        // Database reads
        // ================================================================
        .route("/api/stock-screening/enhanced", get(handlers::enhanced_results))
        .route(
            "/api/watchlist",
            get(handlers::get_watchlist).post(handlers::post_watchlist),
        )
        .route("/api/watchlist/check", get(handlers::check_watchlist))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use common::models::Rating;
    use common::screening::ScreeningRequest;
    use common::{
        ScreeningResult, ScreeningSession, ScreeningStore, SessionStatus, WatchlistService, WatchlistStock,
        WatchlistStore, WebhookError, WorkflowClient,
    };

    type Responder = Box<dyn Fn(u32) -> Result<Value, WebhookError> + Send + Sync>;

    /// Workflow stand-in that counts calls and answers after a short delay.
    struct FakeWorkflow {
        research_calls: AtomicUsize,
        screening_calls: AtomicUsize,
        research: Box<dyn Fn(&str) -> Result<Value, WebhookError> + Send + Sync>,
        screening: Responder,
        status: Responder,
    }

    impl FakeWorkflow {
        fn new() -> Self {
            Self {
                research_calls: AtomicUsize::new(0),
                screening_calls: AtomicUsize::new(0),
                research: Box::new(|symbol: &str| Ok(json!({ "symbol": symbol, "price": 190.5 }))),
                screening: Box::new(|_| Ok(json!({ "success": true, "sessionId": "S1", "status": "processing" }))),
                status: Box::new(|_| Err(WebhookError::Status { status: 524, body: String::new() })),
            }
        }
    }

    #[async_trait]
    impl WorkflowClient for FakeWorkflow {
        async fn research(&self, symbol: &str) -> Result<Value, WebhookError> {
            self.research_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            (self.research)(symbol)
        }

        async fn submit_screening(&self, request: &ScreeningRequest, _timeout: Duration) -> Result<Value, WebhookError> {
            self.screening_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            (self.screening)(request.batch_size)
        }

        async fn check_screening(&self, max_stocks: u32) -> Result<Value, WebhookError> {
            (self.status)(max_stocks)
        }
    }

    #[derive(Default)]
    struct FakeStore {
        sessions: Vec<ScreeningSession>,
        results: HashMap<String, Vec<ScreeningResult>>,
        watchlist: Mutex<BTreeMap<(String, String), Option<String>>>,
    }

    #[async_trait]
    impl ScreeningStore for FakeStore {
        async fn latest_session_for_user(&self, user_email: &str) -> Result<Option<ScreeningSession>, sqlx::Error> {
            Ok(self
                .sessions
                .iter()
                .filter(|s| s.user_email == user_email)
                .max_by_key(|s| s.created_at)
                .cloned())
        }

        async fn session_by_id(&self, session_id: &str) -> Result<Option<ScreeningSession>, sqlx::Error> {
            Ok(self.sessions.iter().find(|s| s.id == session_id).cloned())
        }

        async fn recent_sessions(
            &self,
            user_email: &str,
            since: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<ScreeningSession>, sqlx::Error> {
            Ok(self
                .sessions
                .iter()
                .filter(|s| s.user_email == user_email && s.created_at >= since)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn latest_completed_session(&self, user_email: &str) -> Result<Option<ScreeningSession>, sqlx::Error> {
            Ok(self
                .sessions
                .iter()
                .filter(|s| s.user_email == user_email && s.status.has_final_results())
                .max_by_key(|s| s.created_at)
                .cloned())
        }

        async fn session_results(&self, session_id: &str, limit: i64) -> Result<Vec<ScreeningResult>, sqlx::Error> {
            Ok(self
                .results
                .get(session_id)
                .map(|r| r.iter().take(limit as usize).cloned().collect())
                .unwrap_or_default())
        }
    }

    #[async_trait]
    impl WatchlistStore for FakeStore {
        async fn add_to_watchlist(&self, user_email: &str, symbol: &str, notes: Option<String>) -> Result<(), sqlx::Error> {
            if symbol == "FAIL" {
                return Err(sqlx::Error::PoolTimedOut);
            }
            self.watchlist
                .lock()
                .unwrap()
                .entry((user_email.to_string(), symbol.to_string()))
                .or_insert(notes);
            Ok(())
        }

        async fn remove_from_watchlist(&self, user_email: &str, symbol: &str) -> Result<(), sqlx::Error> {
            self.watchlist
                .lock()
                .unwrap()
                .remove(&(user_email.to_string(), symbol.to_string()));
            Ok(())
        }

        async fn watchlist_with_latest_data(&self, user_email: &str) -> Result<Vec<WatchlistStock>, sqlx::Error> {
            Ok(self
                .watchlist
                .lock()
                .unwrap()
                .iter()
                .filter(|((email, _), _)| email == user_email)
                .map(|((_, symbol), notes)| WatchlistStock {
                    symbol: symbol.clone(),
                    company_name: None,
                    sector: None,
                    added_at: Utc::now(),
                    notes: notes.clone(),
                    latest_score: Some(71.0),
                    latest_rating: Some("BUY".to_string()),
                    latest_price: None,
                    latest_change_percent: None,
                    latest_screening_date: None,
                    rank_position: None,
                })
                .collect())
        }

        async fn is_stock_watched(&self, user_email: &str, symbol: &str) -> Result<bool, sqlx::Error> {
            Ok(self
                .watchlist
                .lock()
                .unwrap()
                .contains_key(&(user_email.to_string(), symbol.to_string())))
        }
    }

    fn session(id: &str, status: SessionStatus, minutes_ago: i64) -> ScreeningSession {
        ScreeningSession {
            id: id.to_string(),
            user_email: "a@b.com".to_string(),
            status,
            total_stocks_screened: Some(3),
            total_buy_rated: None,
            buy_percentage: None,
            average_score: None,
            average_buy_score: None,
            processing_time_seconds: None,
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
            completed_at: None,
            screening_type: Some("momentum".to_string()),
            filters: None,
            session_data: None,
        }
    }

    fn seeded_store() -> FakeStore {
        let mut results = HashMap::new();
        results.insert(
            "S-old".to_string(),
            vec![
                ScreeningResult::basic("JPM", "JPMorgan Chase", "Financials", 55.0, Rating::WeakBuy),
                ScreeningResult::basic("NVDA", "NVIDIA", "Technology", 91.2, Rating::StrongBuy),
                ScreeningResult::basic("MSFT", "Microsoft", "Technology", 72.4, Rating::Buy),
            ],
        );
        FakeStore {
            sessions: vec![session("S-old", SessionStatus::Completed, 60)],
            results,
            watchlist: Mutex::new(BTreeMap::new()),
        }
    }

    struct Harness {
        app: Router,
        workflow: Arc<FakeWorkflow>,
    }

    fn harness(workflow: FakeWorkflow, store: FakeStore) -> Harness {
        let workflow = Arc::new(workflow);
        let store = Arc::new(store);
        let state = AppState::new(
            workflow.clone(),
            store.clone(),
            WatchlistService::new(store),
        );
        Harness {
            app: router(Arc::new(state)),
            workflow,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let (status, body) = send(&h.app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_research_wraps_upstream_data() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let (status, body) = send(&h.app, post("/api/stock-research", json!({ "symbol": "aapl" }))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["symbol"], "AAPL");
    }

    #[tokio::test]
    async fn test_research_missing_symbol_is_400() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let (status, body) = send(&h.app, post("/api/stock-research", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_research_missing_token_is_500() {
        let mut workflow = FakeWorkflow::new();
        workflow.research = Box::new(|_: &str| Err(WebhookError::MissingToken));
        let h = harness(workflow, FakeStore::default());

        let (status, body) = send(&h.app, post("/api/stock-research", json!({ "symbol": "AAPL" }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Authentication token not configured");
    }

    #[tokio::test]
    async fn test_concurrent_research_for_same_symbol_calls_upstream_once() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());

        let (a, b) = tokio::join!(
            send(&h.app, post("/api/stock-research", json!({ "symbol": "AAPL" }))),
            send(&h.app, post("/api/stock-research", json!({ "symbol": "aapl" }))),
        );

        assert_eq!(h.workflow.research_calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_concurrent_research_for_different_symbols_not_collapsed() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());

        let (a, b) = tokio::join!(
            send(&h.app, post("/api/stock-research", json!({ "symbol": "AAPL" }))),
            send(&h.app, post("/api/stock-research", json!({ "symbol": "MSFT" }))),
        );

        assert_eq!(h.workflow.research_calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.1["data"]["symbol"], "AAPL");
        assert_eq!(b.1["data"]["symbol"], "MSFT");
    }

    #[tokio::test]
    async fn test_screening_ack() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let (status, body) = send(
            &h.app,
            post("/api/stock-screening", json!({ "batchSize": 20, "userEmail": "a@b.com" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "sessionId": "S1", "status": "processing" }));
    }

    #[tokio::test]
    async fn test_duplicate_screening_submissions_collapse() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let request = json!({ "batchSize": 20, "userEmail": "a@b.com" });

        let (a, b) = tokio::join!(
            send(&h.app, post("/api/stock-screening", request.clone())),
            send(&h.app, post("/api/stock-screening", request)),
        );

        assert_eq!(h.workflow.screening_calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_large_batch_timeout_switches_to_polling() {
        let mut workflow = FakeWorkflow::new();
        workflow.screening = Box::new(|_| Err(WebhookError::Timeout(Duration::from_secs(30))));
        let h = harness(workflow, FakeStore::default());

        let (status, body) = send(
            &h.app,
            post("/api/stock-screening", json!({ "batchSize": 500, "userEmail": "a@b.com" })),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["requiresPolling"], true);
        assert_eq!(body["estimatedTime"], "5-10 minutes");
    }

    #[tokio::test]
    async fn test_small_batch_timeout_is_408() {
        let mut workflow = FakeWorkflow::new();
        workflow.screening = Box::new(|_| Err(WebhookError::Timeout(Duration::from_secs(120))));
        let h = harness(workflow, FakeStore::default());

        let (status, body) = send(
            &h.app,
            post("/api/stock-screening", json!({ "batchSize": 20, "userEmail": "a@b.com" })),
        )
        .await;

        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_screening_contract_violation_is_502() {
        let mut workflow = FakeWorkflow::new();
        workflow.screening = Box::new(|_| Ok(json!({ "sessionId": { "id": "S1" } })));
        let h = harness(workflow, FakeStore::default());

        let (status, _) = send(
            &h.app,
            post("/api/stock-screening", json!({ "batchSize": 20, "userEmail": "a@b.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_screening_invalid_body_is_400() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let (status, body) = send(&h.app, post("/api/stock-screening", json!({ "userEmail": "a@b.com" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &h.app,
            post("/api/stock-screening", json!({ "batchSize": 20, "userEmail": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_before_estimate_is_processing() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let job_id = format!("job-{}", Utc::now().timestamp_millis());

        let (status, body) = send(
            &h.app,
            post("/api/stock-screening/status", json!({ "maxStocks": 500, "jobId": job_id })),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "processing");
        assert!(body["progress"].as_f64().unwrap() < 5.0);
    }

    #[tokio::test]
    async fn test_status_after_estimate_asks_workflow() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let started = Utc::now() - chrono::Duration::minutes(30);
        let job_id = format!("job-{}", started.timestamp_millis());

        let (status, body) = send(
            &h.app,
            post("/api/stock-screening/status", json!({ "maxStocks": 20, "jobId": job_id })),
        )
        .await;

        // Fake workflow answers 524: still processing, reported as 200.
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "processing");
    }

    #[tokio::test]
    async fn test_status_invalid_job_id() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let (status, body) = send(
            &h.app,
            post("/api/stock-screening/status", json!({ "maxStocks": 20, "jobId": "nonsense" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_enhanced_requires_email() {
        let h = harness(FakeWorkflow::new(), seeded_store());
        let (status, body) = send(&h.app, get("/api/stock-screening/enhanced?sessionId=S-old")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "User email is required");
    }

    #[tokio::test]
    async fn test_enhanced_ranks_by_score_and_summarises() {
        let h = harness(FakeWorkflow::new(), seeded_store());
        let (status, body) = send(
            &h.app,
            get("/api/stock-screening/enhanced?sessionId=S-old&userEmail=a%40b.com"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["totalScreened"], 3);
        assert_eq!(body["summary"]["averageScore"], 72.9);
        assert_eq!(body["summary"]["strongBuys"], 1);
        assert_eq!(body["summary"]["topSector"], "Technology");
        assert_eq!(body["results"][0]["symbol"], "NVDA");
        assert_eq!(body["results"][0]["rank"], 1);
        assert_eq!(body["results"][2]["symbol"], "JPM");
        assert_eq!(body["results"][2]["rank"], 3);
    }

    #[tokio::test]
    async fn test_enhanced_without_session_uses_latest() {
        let h = harness(FakeWorkflow::new(), seeded_store());
        let (status, body) = send(&h.app, get("/api/stock-screening/enhanced?userEmail=a%40b.com&limit=2")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionId"], "S-old");
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enhanced_no_results_is_404() {
        let h = harness(FakeWorkflow::new(), seeded_store());
        let (status, body) = send(
            &h.app,
            get("/api/stock-screening/enhanced?sessionId=S-missing&userEmail=a%40b.com"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No screening results found");
    }

    #[tokio::test]
    async fn test_watchlist_add_list_remove() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());

        let (status, _) = send(
            &h.app,
            post("/api/watchlist", json!({ "action": "add", "symbol": "aapl", "userEmail": "a@b.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&h.app, get("/api/watchlist?userEmail=a%40b.com")).await;
        assert_eq!(body["data"][0]["symbol"], "AAPL");

        let (_, body) = send(&h.app, get("/api/watchlist/check?userEmail=a%40b.com&symbol=AAPL")).await;
        assert_eq!(body["isWatched"], true);

        send(
            &h.app,
            post("/api/watchlist", json!({ "action": "remove", "symbol": "AAPL", "userEmail": "a@b.com" })),
        )
        .await;
        let (_, body) = send(&h.app, get("/api/watchlist?userEmail=a%40b.com")).await;
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn test_watchlist_validation_messages() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let cases = [
            (json!({ "action": "add", "symbol": "AAPL" }), "User email is required"),
            (json!({ "action": "add", "userEmail": "a@b.com" }), "Symbol is required for add action"),
            (
                json!({ "action": "bulk-add", "symbols": "AAPL", "userEmail": "a@b.com" }),
                "Symbols array is required for bulk-add action",
            ),
            (
                json!({ "action": "rename", "userEmail": "a@b.com" }),
                r#"Invalid action. Must be "add", "remove", or "bulk-add""#,
            ),
        ];

        for (request, message) in cases {
            let (status, body) = send(&h.app, post("/api/watchlist", request)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], message);
        }

        let (status, _) = send(&h.app, get("/api/watchlist")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_watchlist_bulk_add_failure_is_500() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let (status, body) = send(
            &h.app,
            post(
                "/api/watchlist",
                json!({ "action": "bulk-add", "symbols": ["AAPL", "FAIL"], "userEmail": "a@b.com" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to add 1 stocks to watchlist");
    }

    #[tokio::test]
    async fn test_watchlist_bulk_add() {
        let h = harness(FakeWorkflow::new(), FakeStore::default());
        let (status, body) = send(
            &h.app,
            post(
                "/api/watchlist",
                json!({ "action": "bulk-add", "symbols": ["AAPL", "MSFT"], "userEmail": "a@b.com" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"], 2);
    }
}
