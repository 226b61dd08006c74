//! Common library for the stock dashboard services.
//!
//! Provides shared functionality:
//! - Configuration loading from .env
//! - Database connection pooling and repository queries
//! - Workflow webhook client and proxy reply shaping
//! - In-flight request deduplication
//! - Screening session polling
//! - Result views, CSV export and the watchlist service

pub mod config;
pub mod db;
pub mod export;
pub mod inflight;
pub mod models;
pub mod poller;
pub mod proxy;
pub mod repository;
pub mod screening;
pub mod view;
pub mod watchlist;
pub mod webhook;

pub use config::{Config, WebhookConfig};
pub use db::Database;
pub use inflight::{InFlight, RequestKey};
pub use models::{Rating, ScreeningResult, ScreeningSession, SessionStatus, StockData, WatchlistStock};
pub use poller::{PollConfig, PollHandle, PollPhase, PollSnapshot, PollTarget, ScreeningPoller};
pub use proxy::ProxyReply;
pub use repository::{ScreeningStore, WatchlistStore};
pub use screening::ScreeningRequest;
pub use watchlist::{WatchedSymbols, WatchlistError, WatchlistService};
pub use webhook::{WebhookClient, WebhookError, WorkflowClient};
