//! Screening session polling.
//!
//! A [`ScreeningPoller`] spawns one owned task per tracked session. The task
//! re-reads the session and its results at a fixed interval until the session
//! fails, results appear, the attempt ceiling is hit, or the wall-clock budget
//! runs out. Every tick also refreshes the user's latest completed session so
//! callers always have something to show while a new job runs.
//!
//! Polling is read-only: cancelling a handle never touches the remote job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::models::{ScreeningResult, ScreeningSession, SessionFailure, SessionStatus};
use crate::repository::ScreeningStore;
use crate::screening::{max_poll_attempts, timeout_minutes};

/// Consecutive lookup misses or errors tolerated before giving up.
const LOOKUP_TOLERANCE: u32 = 3;

/// Sessions read per discovery lookup.
const DISCOVERY_LIMIT: i64 = 5;

/// Default number of result rows read per session.
pub const DEFAULT_RESULTS_LIMIT: i64 = 100;

/// What the polling task follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    /// The session handle returned at submission time.
    Session(String),
    /// Recovery path when no handle was received: a session the user created
    /// at or after `since`, active ones first. Pinned once found. Sessions
    /// older than `since` belong to earlier runs and are never picked.
    Discover { since: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub wall_clock: Duration,
    pub results_limit: i64,
}

impl PollConfig {
    /// Ceilings scaled to the batch: attempts by tier, wall clock at
    /// `ceil(attempts / 6)` minutes.
    pub fn for_batch(batch_size: u32, interval: Duration) -> Self {
        let max_attempts = max_poll_attempts(batch_size);
        Self {
            interval,
            max_attempts,
            wall_clock: Duration::from_secs(u64::from(timeout_minutes(max_attempts)) * 60),
            results_limit: DEFAULT_RESULTS_LIMIT,
        }
    }
}

/// How a successful poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Results exist and the session status says they are final.
    Confirmed,
    /// Results exist but the session has not been marked complete; the
    /// workflow may still be writing rows.
    Provisional,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PollError {
    #[error("Screening session {0} was not found")]
    SessionNotFound(String),

    #[error("No screening session found. The workflow may have failed to create a session.")]
    NoSession,

    #[error("Unable to fetch screening session ({0}). The workflow may have failed to start properly.")]
    SessionUnavailable(String),

    #[error("{0}")]
    RemoteFailure(SessionFailure),

    #[error("Screening timed out after {minutes} minutes. Please try again.")]
    AttemptsExhausted { attempts: u32, minutes: u32 },

    #[error("Screening timed out after {minutes} minutes. Please try again.")]
    WallClock { minutes: u32 },
}

pub type PollOutcome = Result<Completion, PollError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Polling,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl PollPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollPhase::Polling)
    }
}

/// Everything a consumer needs to render the current state.
#[derive(Debug, Clone)]
pub struct PollSnapshot {
    pub phase: PollPhase,
    pub target: PollTarget,
    pub session: Option<ScreeningSession>,
    pub results: Vec<ScreeningResult>,
    pub latest_session: Option<ScreeningSession>,
    pub latest_results: Vec<ScreeningResult>,
    pub poll_count: u32,
    pub last_poll_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub outcome: Option<PollOutcome>,
}

impl PollSnapshot {
    fn started(target: PollTarget) -> Self {
        Self {
            phase: PollPhase::Polling,
            target,
            session: None,
            results: Vec::new(),
            latest_session: None,
            latest_results: Vec::new(),
            poll_count: 0,
            last_poll_time: None,
            error: None,
            outcome: None,
        }
    }

    /// True only when the session itself confirmed completion.
    pub fn is_fully_complete(&self) -> bool {
        matches!(self.outcome, Some(Ok(Completion::Confirmed)))
    }

    /// Results of the tracked session, or the latest completed ones while
    /// the tracked session has none yet.
    pub fn display_results(&self) -> &[ScreeningResult] {
        if self.results.is_empty() {
            &self.latest_results
        } else {
            &self.results
        }
    }
}

/// Latest completed session and its results.
#[derive(Debug, Clone, Default)]
pub struct LatestResults {
    pub session: Option<ScreeningSession>,
    pub results: Vec<ScreeningResult>,
}

/// One-shot fetch of the user's latest completed session and its results.
pub async fn load_latest(
    store: &dyn ScreeningStore,
    user_email: &str,
    limit: i64,
) -> Result<LatestResults, sqlx::Error> {
    let Some(session) = store.latest_completed_session(user_email).await? else {
        return Ok(LatestResults::default());
    };
    let results = store.session_results(&session.id, limit).await?;
    Ok(LatestResults {
        session: Some(session),
        results,
    })
}

/// Spawns polling tasks for one user.
#[derive(Clone)]
pub struct ScreeningPoller {
    store: Arc<dyn ScreeningStore>,
    user_email: String,
    config: PollConfig,
}

impl ScreeningPoller {
    pub fn new(store: Arc<dyn ScreeningStore>, user_email: impl Into<String>, config: PollConfig) -> Self {
        Self {
            store,
            user_email: user_email.into(),
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start polling `target` on a new task owned by the returned handle.
    pub fn spawn(&self, target: PollTarget) -> PollHandle {
        let (tx, rx) = watch::channel(PollSnapshot::started(target.clone()));

        info!(
            "Polling {:?} for {} every {:?} (max {} attempts)",
            target, self.user_email, self.config.interval, self.config.max_attempts
        );

        let task = PollTask {
            store: Arc::clone(&self.store),
            user_email: self.user_email.clone(),
            config: self.config.clone(),
            tx,
            target,
            lookup_failures: 0,
        };

        PollHandle {
            poller: self.clone(),
            rx,
            task: tokio::spawn(task.run()),
            cancelled: false,
        }
    }
}

/// Owner of a running polling task. Dropping it stops the task.
pub struct PollHandle {
    poller: ScreeningPoller,
    rx: watch::Receiver<PollSnapshot>,
    task: JoinHandle<()>,
    cancelled: bool,
}

impl PollHandle {
    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.rx.clone()
    }

    pub fn snapshot(&self) -> PollSnapshot {
        let snapshot = self.rx.borrow().clone();
        self.mark_cancelled(snapshot)
    }

    /// Stop polling. Local only; the remote job keeps running.
    pub fn cancel(&mut self) {
        if !self.task.is_finished() {
            debug!("Cancelling polling task");
            self.task.abort();
            self.cancelled = true;
        }
    }

    /// Cancel the current task and start a fresh one for `target`.
    pub fn restart(&mut self, target: PollTarget) {
        self.cancel();
        let next = self.poller.spawn(target);
        *self = next;
    }

    /// Wait until polling reaches a terminal phase.
    pub async fn wait(&self) -> PollSnapshot {
        let mut rx = self.rx.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if current.phase.is_terminal() {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                // Task gone without a terminal snapshot: it was aborted.
                let mut last = rx.borrow().clone();
                if !last.phase.is_terminal() {
                    last.phase = PollPhase::Cancelled;
                }
                return last;
            }
        }
    }

    fn mark_cancelled(&self, mut snapshot: PollSnapshot) -> PollSnapshot {
        if self.cancelled && !snapshot.phase.is_terminal() {
            snapshot.phase = PollPhase::Cancelled;
        }
        snapshot
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct PollTask {
    store: Arc<dyn ScreeningStore>,
    user_email: String,
    config: PollConfig,
    tx: watch::Sender<PollSnapshot>,
    target: PollTarget,
    lookup_failures: u32,
}

impl PollTask {
    async fn run(mut self) {
        let wall_clock = self.config.wall_clock;
        let outcome = match tokio::time::timeout(wall_clock, self.poll_until_done()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let minutes = u32::try_from(wall_clock.as_secs().div_ceil(60).max(1)).unwrap_or(u32::MAX);
                Err(PollError::WallClock { minutes })
            }
        };
        self.finish(outcome);
    }

    async fn poll_until_done(&mut self) -> PollOutcome {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts = 0u32;
        loop {
            ticker.tick().await;
            attempts += 1;
            self.tx.send_modify(|s| {
                s.poll_count = attempts;
                s.last_poll_time = Some(Utc::now());
            });

            self.refresh_latest().await;

            if let Some(outcome) = self.check_session().await {
                return outcome;
            }

            if attempts >= self.config.max_attempts {
                return Err(PollError::AttemptsExhausted {
                    attempts,
                    minutes: timeout_minutes(self.config.max_attempts),
                });
            }
        }
    }

    async fn refresh_latest(&self) {
        match load_latest(self.store.as_ref(), &self.user_email, self.config.results_limit).await {
            Ok(latest) => self.tx.send_modify(|s| {
                s.latest_session = latest.session;
                s.latest_results = latest.results;
            }),
            Err(e) => warn!("Failed to refresh latest results: {}", e),
        }
    }

    /// One tick against the tracked session. `None` keeps polling.
    async fn check_session(&mut self) -> Option<PollOutcome> {
        let session = match self.resolve_session().await {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };

        debug!("Session {} status: {}", session.id, session.status);
        self.tx.send_modify(|s| s.session = Some(session.clone()));

        if session.status == SessionStatus::Failed {
            return Some(Err(PollError::RemoteFailure(session.failure())));
        }

        match self.store.session_results(&session.id, self.config.results_limit).await {
            Ok(results) if !results.is_empty() => {
                let completion = if session.status.has_final_results() {
                    Completion::Confirmed
                } else {
                    Completion::Provisional
                };
                info!(
                    "Session {} has {} results ({:?}, status {})",
                    session.id,
                    results.len(),
                    completion,
                    session.status
                );
                self.tx.send_modify(|s| s.results = results);
                Some(Ok(completion))
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to read results for session {}: {}", session.id, e);
                None
            }
        }
    }

    async fn resolve_session(&mut self) -> Result<Option<ScreeningSession>, PollError> {
        let lookup = match &self.target {
            PollTarget::Session(id) => self.store.session_by_id(id).await,
            PollTarget::Discover { since } => self.discover(*since).await,
        };

        match lookup {
            Ok(Some(session)) => {
                self.lookup_failures = 0;
                if matches!(self.target, PollTarget::Discover { .. }) {
                    info!("Discovered session {} ({})", session.id, session.status);
                    let pinned = PollTarget::Session(session.id.clone());
                    self.tx.send_modify(|s| s.target = pinned.clone());
                    self.target = pinned;
                }
                Ok(Some(session))
            }
            Ok(None) => {
                self.lookup_failures += 1;
                debug!("No session yet (miss {})", self.lookup_failures);
                if self.lookup_failures > LOOKUP_TOLERANCE {
                    return Err(match &self.target {
                        PollTarget::Session(id) => PollError::SessionNotFound(id.clone()),
                        PollTarget::Discover { .. } => PollError::NoSession,
                    });
                }
                Ok(None)
            }
            Err(e) => {
                self.lookup_failures += 1;
                warn!("Session lookup failed (attempt {}): {}", self.lookup_failures, e);
                if self.lookup_failures > LOOKUP_TOLERANCE {
                    return Err(PollError::SessionUnavailable(e.to_string()));
                }
                Ok(None)
            }
        }
    }

    async fn discover(&self, since: DateTime<Utc>) -> Result<Option<ScreeningSession>, sqlx::Error> {
        let candidates: Vec<ScreeningSession> = self
            .store
            .recent_sessions(&self.user_email, since, DISCOVERY_LIMIT)
            .await?
            .into_iter()
            .filter(|s| s.created_at >= since)
            .collect();

        let pick = candidates
            .iter()
            .position(|s| s.status.is_active())
            .unwrap_or(0);
        Ok(candidates.into_iter().nth(pick))
    }

    fn finish(&self, outcome: PollOutcome) {
        let phase = match &outcome {
            Ok(_) => PollPhase::Completed,
            Err(PollError::AttemptsExhausted { .. }) | Err(PollError::WallClock { .. }) => PollPhase::TimedOut,
            Err(_) => PollPhase::Failed,
        };
        let error = outcome.as_ref().err().map(ToString::to_string);

        match &error {
            Some(message) => warn!("Polling stopped: {}", message),
            None => info!("Polling finished: {:?}", outcome),
        }

        self.tx.send_modify(|s| {
            s.phase = phase;
            s.error = error;
            s.outcome = Some(outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, Rating};
    use crate::repository::MockScreeningStore;

    fn session(id: &str, status: SessionStatus) -> ScreeningSession {
        ScreeningSession {
            id: id.to_string(),
            user_email: "a@b.com".to_string(),
            status,
            total_stocks_screened: None,
            total_buy_rated: None,
            buy_percentage: None,
            average_score: None,
            average_buy_score: None,
            processing_time_seconds: None,
            created_at: Utc::now(),
            completed_at: None,
            screening_type: Some("momentum".to_string()),
            filters: None,
            session_data: None,
        }
    }

    fn ranked_results(count: i32) -> Vec<ScreeningResult> {
        (1..=count)
            .map(|i| {
                let mut r = ScreeningResult::basic(
                    &format!("SYM{}", i),
                    &format!("Company {}", i),
                    "Technology",
                    100.0 - f64::from(i),
                    Rating::Buy,
                );
                r.rank_position = Some(i);
                r.rank = i as u32;
                r
            })
            .collect()
    }

    fn fast_config(max_attempts: u32) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(10),
            max_attempts,
            wall_clock: Duration::from_secs(5),
            results_limit: DEFAULT_RESULTS_LIMIT,
        }
    }

    fn store_without_history() -> MockScreeningStore {
        let mut store = MockScreeningStore::new();
        store.expect_latest_completed_session().returning(|_| Ok(None));
        store
    }

    fn poller(store: MockScreeningStore, config: PollConfig) -> ScreeningPoller {
        ScreeningPoller::new(Arc::new(store), "a@b.com", config)
    }

    fn submitted_a_minute_ago() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(1)
    }

    fn created_yesterday(id: &str, status: SessionStatus) -> ScreeningSession {
        let mut old = session(id, status);
        old.created_at = Utc::now() - chrono::Duration::days(1);
        old.completed_at = Some(old.created_at + chrono::Duration::minutes(8));
        old
    }

    fn discovery_task(store: MockScreeningStore, since: DateTime<Utc>) -> PollTask {
        let target = PollTarget::Discover { since };
        let (tx, _) = watch::channel(PollSnapshot::started(target.clone()));
        PollTask {
            store: Arc::new(store),
            user_email: "a@b.com".to_string(),
            config: fast_config(10),
            tx,
            target,
            lookup_failures: 0,
        }
    }

    #[test]
    fn test_config_for_batch() {
        let config = PollConfig::for_batch(20, Duration::from_secs(10));
        assert_eq!(config.max_attempts, 180);
        assert_eq!(config.wall_clock, Duration::from_secs(30 * 60));

        let config = PollConfig::for_batch(5000, Duration::from_secs(10));
        assert_eq!(config.max_attempts, 360);
        assert_eq!(config.wall_clock, Duration::from_secs(60 * 60));
    }

    #[tokio::test]
    async fn test_stops_on_results_with_confirmed_completion() {
        let mut store = store_without_history();
        store
            .expect_session_by_id()
            .returning(|id| Ok(Some(session(id, SessionStatus::Completed))));
        store.expect_session_results().returning(|_, _| Ok(ranked_results(20)));

        let handle = poller(store, fast_config(10)).spawn(PollTarget::Session("S1".to_string()));
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::Completed);
        assert!(snapshot.is_fully_complete());
        assert_eq!(snapshot.poll_count, 1);
        assert_eq!(snapshot.results.len(), 20);
        let ranks: Vec<_> = snapshot.results.iter().filter_map(|r| r.rank_position).collect();
        assert_eq!(ranks, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_early_exit_on_partial_results_is_provisional() {
        let mut store = store_without_history();
        store
            .expect_session_by_id()
            .returning(|id| Ok(Some(session(id, SessionStatus::Processing))));
        let mut reads = 0;
        store.expect_session_results().returning(move |_, _| {
            reads += 1;
            if reads < 3 {
                Ok(Vec::new())
            } else {
                Ok(ranked_results(5))
            }
        });

        let handle = poller(store, fast_config(10)).spawn(PollTarget::Session("S1".to_string()));
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::Completed);
        assert_eq!(snapshot.poll_count, 3);
        assert_eq!(snapshot.outcome, Some(Ok(Completion::Provisional)));
        assert!(!snapshot.is_fully_complete());
    }

    #[tokio::test]
    async fn test_failed_session_reports_structured_failure() {
        let mut store = store_without_history();
        store.expect_session_by_id().returning(|id| {
            let mut failed = session(id, SessionStatus::Failed);
            failed.session_data = Some(r#"{"error_message":"Finnhub rate limit","error_kind":"upstream_api"}"#.to_string());
            Ok(Some(failed))
        });
        store.expect_session_results().never();

        let handle = poller(store, fast_config(10)).spawn(PollTarget::Session("S1".to_string()));
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("Screening failed: Finnhub rate limit"));
        match snapshot.outcome {
            Some(Err(PollError::RemoteFailure(failure))) => assert_eq!(failure.kind, FailureKind::UpstreamData),
            other => panic!("Expected remote failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let mut store = store_without_history();
        store
            .expect_session_by_id()
            .returning(|id| Ok(Some(session(id, SessionStatus::Running))));
        store.expect_session_results().returning(|_, _| Ok(Vec::new()));

        let handle = poller(store, fast_config(3)).spawn(PollTarget::Session("S1".to_string()));
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::TimedOut);
        assert_eq!(snapshot.poll_count, 3);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("Screening timed out after 1 minutes. Please try again.")
        );
    }

    #[tokio::test]
    async fn test_wall_clock_fires_before_attempt_ceiling() {
        let mut store = store_without_history();
        store
            .expect_session_by_id()
            .returning(|id| Ok(Some(session(id, SessionStatus::Processing))));
        store.expect_session_results().returning(|_, _| Ok(Vec::new()));

        let config = PollConfig {
            interval: Duration::from_millis(20),
            max_attempts: 10_000,
            wall_clock: Duration::from_millis(100),
            results_limit: DEFAULT_RESULTS_LIMIT,
        };
        let handle = poller(store, config).spawn(PollTarget::Session("S1".to_string()));
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::TimedOut);
        assert_eq!(snapshot.outcome, Some(Err(PollError::WallClock { minutes: 1 })));
        assert!(snapshot.poll_count < 10_000);
    }

    #[tokio::test]
    async fn test_pinned_session_never_retargets() {
        let mut store = store_without_history();
        store
            .expect_session_by_id()
            .withf(|id| id == "S1")
            .returning(|id| Ok(Some(session(id, SessionStatus::Processing))));
        store.expect_latest_session_for_user().never();
        store.expect_recent_sessions().never();
        let mut reads = 0;
        store
            .expect_session_results()
            .withf(|id, _| id == "S1")
            .returning(move |_, _| {
                reads += 1;
                if reads < 2 {
                    Ok(Vec::new())
                } else {
                    Ok(ranked_results(3))
                }
            });

        let handle = poller(store, fast_config(10)).spawn(PollTarget::Session("S1".to_string()));
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.session.map(|s| s.id), Some("S1".to_string()));
        assert_eq!(snapshot.results.len(), 3);
    }

    #[tokio::test]
    async fn test_discovery_prefers_active_session_then_pins_it() {
        let since = submitted_a_minute_ago();
        let mut store = store_without_history();
        store.expect_recent_sessions().times(1).returning(|_, _, _| {
            Ok(vec![
                session("S-done", SessionStatus::Completed),
                session("S2", SessionStatus::Running),
            ])
        });
        store.expect_latest_session_for_user().never();
        store
            .expect_session_by_id()
            .withf(|id| id == "S2")
            .returning(|id| Ok(Some(session(id, SessionStatus::Completed))));
        let mut reads = 0;
        store.expect_session_results().returning(move |_, _| {
            reads += 1;
            if reads < 2 {
                Ok(Vec::new())
            } else {
                Ok(ranked_results(2))
            }
        });

        let handle = poller(store, fast_config(10)).spawn(PollTarget::Discover { since });
        let snapshot = handle.wait().await;

        assert!(snapshot.is_fully_complete());
        assert_eq!(snapshot.session.map(|s| s.id), Some("S2".to_string()));
        assert_eq!(snapshot.target, PollTarget::Session("S2".to_string()));
    }

    #[tokio::test]
    async fn test_discovery_ignores_runs_before_submission() {
        let since = submitted_a_minute_ago();
        let mut store = MockScreeningStore::new();
        store
            .expect_latest_completed_session()
            .returning(|_| Ok(Some(created_yesterday("S-OLD", SessionStatus::Completed))));
        // The repository applies `since`, but a stale row must not slip through either way.
        store
            .expect_recent_sessions()
            .withf(move |_, from, _| *from == since)
            .returning(|_, _, _| Ok(vec![created_yesterday("S-OLD", SessionStatus::Completed)]));
        store.expect_latest_session_for_user().never();
        store.expect_session_by_id().never();
        store
            .expect_session_results()
            .withf(|id, _| id == "S-OLD")
            .returning(|_, _| Ok(ranked_results(1)));

        let handle = poller(store, fast_config(10)).spawn(PollTarget::Discover { since });
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::Failed);
        assert_eq!(snapshot.outcome, Some(Err(PollError::NoSession)));
        assert!(!snapshot.is_fully_complete());
        assert!(snapshot.session.is_none());
        assert!(snapshot.results.is_empty());
        // Previous run stays on screen as the latest completed results only.
        assert_eq!(snapshot.display_results().len(), 1);
        assert_eq!(snapshot.latest_session.map(|s| s.id), Some("S-OLD".to_string()));
    }

    #[tokio::test]
    async fn test_handoff_shows_previous_results_while_new_session_processes() {
        let since = submitted_a_minute_ago();
        let mut store = MockScreeningStore::new();
        store
            .expect_latest_completed_session()
            .returning(|_| Ok(Some(created_yesterday("S-OLD", SessionStatus::Completed))));
        let mut lookups = 0;
        store.expect_recent_sessions().returning(move |_, _, _| {
            lookups += 1;
            if lookups < 2 {
                Ok(Vec::new())
            } else {
                Ok(vec![session("S-NEW", SessionStatus::Processing)])
            }
        });
        store.expect_latest_session_for_user().never();
        store
            .expect_session_by_id()
            .withf(|id| id == "S-NEW")
            .returning(|id| Ok(Some(session(id, SessionStatus::Processing))));
        store.expect_session_results().returning(|id, _| {
            if id == "S-OLD" {
                Ok(ranked_results(4))
            } else {
                Ok(Vec::new())
            }
        });

        let handle = poller(store, fast_config(4)).spawn(PollTarget::Discover { since });
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::TimedOut);
        assert_eq!(snapshot.session.as_ref().map(|s| s.id.as_str()), Some("S-NEW"));
        assert_eq!(
            snapshot.session.as_ref().map(|s| s.status.progress_message()),
            Some("Processing stocks and calculating scores...")
        );
        assert!(snapshot.results.is_empty());
        assert_eq!(snapshot.latest_results.len(), 4);
        assert!(!snapshot.is_fully_complete());
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent_without_writes() {
        let since = submitted_a_minute_ago();
        let mut store = MockScreeningStore::new();
        store.expect_recent_sessions().times(2).returning(|_, _, _| {
            Ok(vec![
                session("S-B", SessionStatus::Completed),
                session("S-A", SessionStatus::Pending),
                session("S-C", SessionStatus::Running),
            ])
        });
        let task = discovery_task(store, since);

        let first = task.discover(since).await.unwrap().map(|s| s.id);
        let second = task.discover(since).await.unwrap().map(|s| s.id);

        assert_eq!(first, Some("S-A".to_string()));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_lookup_errors_tolerated_then_reported() {
        let mut store = store_without_history();
        store
            .expect_session_by_id()
            .times(4)
            .returning(|_| Err(sqlx::Error::PoolTimedOut));

        let handle = poller(store, fast_config(10)).spawn(PollTarget::Session("S1".to_string()));
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::Failed);
        assert_eq!(snapshot.poll_count, 4);
        assert!(matches!(snapshot.outcome, Some(Err(PollError::SessionUnavailable(_)))));
    }

    #[tokio::test]
    async fn test_discovery_without_any_session() {
        let mut store = store_without_history();
        store.expect_recent_sessions().returning(|_, _, _| Ok(Vec::new()));
        store.expect_latest_session_for_user().never();

        let handle = poller(store, fast_config(10)).spawn(PollTarget::Discover {
            since: submitted_a_minute_ago(),
        });
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.outcome, Some(Err(PollError::NoSession)));
        assert_eq!(snapshot.poll_count, 4);
    }

    #[tokio::test]
    async fn test_latest_results_refreshed_while_polling() {
        let mut store = MockScreeningStore::new();
        store
            .expect_latest_completed_session()
            .returning(|_| Ok(Some(session("S-prev", SessionStatus::Completed))));
        store
            .expect_session_by_id()
            .returning(|id| Ok(Some(session(id, SessionStatus::Processing))));
        store.expect_session_results().returning(|id, _| {
            if id == "S-prev" {
                Ok(ranked_results(7))
            } else {
                Ok(Vec::new())
            }
        });

        let handle = poller(store, fast_config(2)).spawn(PollTarget::Session("S1".to_string()));
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.phase, PollPhase::TimedOut);
        assert!(snapshot.results.is_empty());
        assert_eq!(snapshot.latest_results.len(), 7);
        assert_eq!(snapshot.display_results().len(), 7);
        assert_eq!(snapshot.latest_session.map(|s| s.id), Some("S-prev".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let mut store = store_without_history();
        store
            .expect_session_by_id()
            .returning(|id| Ok(Some(session(id, SessionStatus::Processing))));
        store.expect_session_results().returning(|_, _| Ok(Vec::new()));

        let config = PollConfig {
            interval: Duration::from_secs(60),
            ..fast_config(10)
        };
        let mut handle = poller(store, config).spawn(PollTarget::Session("S1".to_string()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        assert_eq!(handle.snapshot().phase, PollPhase::Cancelled);
        assert_eq!(handle.wait().await.phase, PollPhase::Cancelled);
    }

    #[tokio::test]
    async fn test_restart_switches_target() {
        let mut store = store_without_history();
        store.expect_session_by_id().returning(|id| {
            let status = if id == "S2" {
                SessionStatus::Completed
            } else {
                SessionStatus::Processing
            };
            Ok(Some(session(id, status)))
        });
        store.expect_session_results().returning(|id, _| {
            if id == "S2" {
                Ok(ranked_results(4))
            } else {
                Ok(Vec::new())
            }
        });

        let config = PollConfig {
            interval: Duration::from_millis(30),
            ..fast_config(100)
        };
        let mut handle = poller(store, config).spawn(PollTarget::Session("S1".to_string()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.restart(PollTarget::Session("S2".to_string()));

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.target, PollTarget::Session("S2".to_string()));
        assert!(snapshot.is_fully_complete());
        assert_eq!(snapshot.results.len(), 4);
    }

    #[tokio::test]
    async fn test_load_latest() {
        let mut store = MockScreeningStore::new();
        store
            .expect_latest_completed_session()
            .returning(|_| Ok(Some(session("S9", SessionStatus::Replaced))));
        store
            .expect_session_results()
            .withf(|id, limit| id == "S9" && *limit == 50)
            .returning(|_, _| Ok(ranked_results(2)));

        let latest = load_latest(&store, "a@b.com", 50).await.unwrap();
        assert_eq!(latest.session.map(|s| s.id), Some("S9".to_string()));
        assert_eq!(latest.results.len(), 2);

        let empty = load_latest(&store_without_history(), "a@b.com", 50).await.unwrap();
        assert!(empty.session.is_none());
        assert!(empty.results.is_empty());
    }
}
