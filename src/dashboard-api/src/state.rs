//! Shared state for the API handlers.

use std::sync::Arc;

use common::{InFlight, ProxyReply, RequestKey, ScreeningStore, WatchlistService, WorkflowClient};

/// Orchestration object owning the upstream clients and the in-flight maps.
pub struct AppState {
    pub workflow: Arc<dyn WorkflowClient>,
    pub store: Arc<dyn ScreeningStore>,
    pub watchlist: WatchlistService,
    /// Research requests keyed by symbol.
    pub research_inflight: InFlight<RequestKey, ProxyReply>,
    /// Screening submissions keyed by batch signature.
    pub screening_inflight: InFlight<RequestKey, ProxyReply>,
}

impl AppState {
    pub fn new(workflow: Arc<dyn WorkflowClient>, store: Arc<dyn ScreeningStore>, watchlist: WatchlistService) -> Self {
        Self {
            workflow,
            store,
            watchlist,
            research_inflight: InFlight::new(),
            screening_inflight: InFlight::new(),
        }
    }
}
