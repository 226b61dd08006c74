//! Stock Dashboard CLI
//!
//! Terminal front end for the dashboard: research a symbol, run a screening
//! and follow it to completion, browse the latest results, and manage the
//! watchlist.

mod api;
mod display;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use futures_util::future::join_all;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::export::{export_file_name, watchlist_file_name, write_csv, write_watchlist_csv};
use common::poller::load_latest;
use common::screening::{estimated_time, timeout_minutes, DEFAULT_BATCH_SIZE};
use common::view::{
    filter_and_sort, sort_watchlist, watchlist_suggestions, ResultFilter, ScreeningSummary, SortKey, SortOrder,
    WatchlistSortKey,
};
use common::{
    Config, Database, PollConfig, PollPhase, PollSnapshot, Rating, ScreeningPoller, ScreeningRequest,
    ScreeningResult, ScreeningStore, StockData, WatchedSymbols,
};

use crate::api::{poll_target_for, validate_symbol, ApiClient};

/// Stock dashboard CLI
#[derive(Parser, Debug)]
#[command(name = "stockdash")]
#[command(about = "Research stocks, run screenings and manage your watchlist")]
struct Cli {
    /// Dashboard API base URL
    #[arg(long, default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research a single symbol
    Research {
        /// Ticker, 1-5 letters
        symbol: String,
    },
    /// Submit a screening and follow it until results arrive
    Screen(ScreenArgs),
    /// Show the latest completed screening
    Latest {
        #[arg(long)]
        email: String,

        #[command(flatten)]
        view: ViewArgs,
    },
    /// Manage the watchlist
    Watchlist {
        #[arg(long)]
        email: String,

        #[command(subcommand)]
        action: WatchlistCommand,
    },
}

#[derive(Args, Debug)]
struct ScreenArgs {
    #[arg(long)]
    email: String,

    /// Number of stocks to screen
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch: u32,

    #[arg(long = "type", default_value = "momentum")]
    screening_type: String,

    #[arg(long, default_value = "All")]
    sector: String,

    #[arg(long, default_value = "All")]
    market_cap: String,

    /// Offset into the symbol universe
    #[arg(long)]
    start_index: Option<u32>,

    /// Watch every high-scoring result once the run completes
    #[arg(long)]
    add_suggestions: bool,

    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Args, Debug)]
struct ViewArgs {
    /// score, rating, change-percent or symbol
    #[arg(long, default_value = "score")]
    sort: SortKey,

    /// asc or desc
    #[arg(long, default_value = "desc")]
    order: SortOrder,

    /// Only show this rating, e.g. "Strong Buy"
    #[arg(long, value_parser = parse_rating)]
    rating: Option<Rating>,

    /// Only show this sector
    #[arg(long = "sector-filter")]
    sector_filter: Option<String>,

    /// Maximum results to fetch
    #[arg(long, default_value_t = 100)]
    limit: i64,

    /// Write the displayed results to a CSV file ("-" for the default name)
    #[arg(long)]
    csv: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum WatchlistCommand {
    /// List watched stocks with their latest scores
    List(WatchlistListArgs),
    /// Watch a symbol
    Add {
        symbol: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Stop watching one or more symbols
    Remove {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    /// Watch several symbols at once
    BulkAdd {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    /// Check whether a symbol is watched
    Check { symbol: String },
}

#[derive(Args, Debug)]
struct WatchlistListArgs {
    /// symbol, score, price, change-percent or added-at
    #[arg(long, default_value = "added-at")]
    sort: WatchlistSortKey,

    /// asc or desc
    #[arg(long, default_value = "desc")]
    order: SortOrder,

    /// Write the list to a CSV file ("-" for the default name)
    #[arg(long)]
    csv: Option<PathBuf>,
}

fn parse_rating(s: &str) -> Result<Rating, String> {
    Rating::parse(s).ok_or_else(|| format!("Unknown rating: {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with RUST_LOG env filter
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let api = ApiClient::new(&cli.api_url)?;

    match cli.command {
        Command::Research { symbol } => research(&api, &symbol).await,
        Command::Screen(args) => screen(&api, args).await,
        Command::Latest { email, view } => latest(&email, &view).await,
        Command::Watchlist { email, action } => watchlist(&api, &email, action).await,
    }
}

// ============================================================================
// Research
// ============================================================================

async fn research(api: &ApiClient, symbol: &str) -> Result<()> {
    let symbol = validate_symbol(symbol).map_err(anyhow::Error::msg)?;
    println!("Researching {}...", symbol);

    let response = api.research(&symbol).await?;
    if !response.is_success() {
        bail!("Research failed: {}", response.error_message());
    }

    let stock: StockData =
        serde_json::from_value(response.body["data"].clone()).context("Unexpected research payload")?;
    display::print_stock(&stock);
    Ok(())
}

// ============================================================================
// Screening
// ============================================================================

async fn connect_store() -> Result<Arc<dyn ScreeningStore>> {
    let config = Config::from_env()?;
    let db = Database::connect(&config).await?;
    Ok(Arc::new(db))
}

fn show_results(results: &[ScreeningResult], view: &ViewArgs, session_id: Option<&str>) -> Result<()> {
    let filter = ResultFilter {
        rating: view.rating,
        sector: view.sector_filter.clone(),
    };
    let shown = filter_and_sort(results, &filter, view.sort, view.order);

    display::print_summary(&ScreeningSummary::from_results(results));
    display::print_results(&shown);

    if let Some(path) = &view.csv {
        let path = if path.as_os_str() == "-" {
            PathBuf::from(export_file_name(session_id))
        } else {
            path.clone()
        };
        write_csv(&path, &shown)?;
        println!("\n  Exported {} results to {}", shown.len(), path.display());
    }
    Ok(())
}

async fn screen(api: &ApiClient, args: ScreenArgs) -> Result<()> {
    let mut request = ScreeningRequest::new(args.batch, &args.email);
    request.screening_type = args.screening_type;
    request.sector = args.sector;
    request.market_cap = args.market_cap;
    request.start_index = args.start_index;
    request.validate().map_err(anyhow::Error::msg)?;

    let config = Config::from_env()?;
    let store: Arc<dyn ScreeningStore> = Arc::new(Database::connect(&config).await?);

    // Previous results stay visible while the new run is in progress.
    match load_latest(store.as_ref(), &args.email, args.view.limit).await {
        Ok(previous) if !previous.results.is_empty() => {
            let when = previous
                .session
                .as_ref()
                .map(|s| s.created_at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!("Latest completed screening ({}): {} results", when, previous.results.len());
        }
        Ok(_) => {}
        Err(e) => warn!("Could not load previous results: {}", e),
    }

    banner_for(&request);
    let submitted_at = Utc::now();
    let response = api.submit_screening(&request).await?;
    let target = poll_target_for(&response, submitted_at)?;
    if let Some(message) = response.body["message"].as_str() {
        println!("  {}", message);
    }
    info!("Polling target: {:?}", target);

    let mut poll_config = PollConfig::for_batch(request.batch_size, config.poll_interval());
    poll_config.results_limit = args.view.limit;
    println!(
        "  Checking every {}s for up to {} minutes\n",
        poll_config.interval.as_secs(),
        timeout_minutes(poll_config.max_attempts)
    );

    let poller = ScreeningPoller::new(store, &args.email, poll_config);
    let mut handle = poller.spawn(target);
    let mut updates = handle.subscribe();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.phase.is_terminal() {
                    break;
                }
                display::print_progress(&snapshot);
            }
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                println!("\n  Stopped watching. The screening keeps running; use `stockdash latest` later.");
                return Ok(());
            }
        }
    }

    let snapshot = handle.wait().await;
    report(&snapshot, &args.view)?;
    if matches!(snapshot.phase, PollPhase::Completed) {
        offer_suggestions(api, &args.email, &snapshot.results, args.add_suggestions).await?;
    }
    Ok(())
}

/// List high scorers that are not watched yet, and optionally watch them.
async fn offer_suggestions(api: &ApiClient, email: &str, results: &[ScreeningResult], add: bool) -> Result<()> {
    let watched = match api.watchlist(email).await {
        Ok(stocks) => WatchedSymbols::from_stocks(&stocks),
        Err(e) => {
            warn!("Could not load watchlist for suggestions: {}", e);
            WatchedSymbols::new()
        }
    };
    let picks = watchlist_suggestions(results, |symbol| watched.contains(symbol));
    if picks.is_empty() {
        return Ok(());
    }
    display::print_suggestions(&picks);

    if !add {
        println!("\n  Rerun with --add-suggestions or use `stockdash watchlist bulk-add` to watch them.");
        return Ok(());
    }
    let symbols: Vec<&str> = picks.iter().map(|r| r.symbol.as_str()).collect();
    let response = api
        .watchlist_action(json!({ "action": "bulk-add", "symbols": symbols, "userEmail": email }))
        .await?;
    if !response.is_success() {
        bail!("{}", response.error_message());
    }
    println!("Added {} stocks to watchlist", response.body["added"].as_u64().unwrap_or(0));
    Ok(())
}

fn banner_for(request: &ScreeningRequest) {
    display::banner("STOCK SCREENING");
    println!("  Stocks:      {}", request.batch_size);
    println!("  Type:        {}", request.screening_type);
    println!("  Sector:      {}", request.sector);
    println!("  Market cap:  {}", request.market_cap);
    println!("  Estimated:   {}", estimated_time(request.batch_size));
}

fn report(snapshot: &PollSnapshot, view: &ViewArgs) -> Result<()> {
    match snapshot.phase {
        PollPhase::Completed => {
            let session_id = snapshot.session.as_ref().map(|s| s.id.as_str());
            display::banner(&format!("RESULTS ({})", session_id.unwrap_or("latest")));
            if !snapshot.is_fully_complete() {
                let status = snapshot
                    .session
                    .as_ref()
                    .map(|s| s.status.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("  Results are provisional: session is still {}", status);
            }
            show_results(&snapshot.results, view, session_id)
        }
        PollPhase::Cancelled => {
            println!("  Polling cancelled.");
            Ok(())
        }
        PollPhase::Failed | PollPhase::TimedOut | PollPhase::Polling => {
            let message = snapshot
                .error
                .clone()
                .unwrap_or_else(|| "Screening did not finish".to_string());
            if !snapshot.latest_results.is_empty() {
                display::banner("LATEST COMPLETED RESULTS");
                let session_id = snapshot.latest_session.as_ref().map(|s| s.id.as_str());
                show_results(&snapshot.latest_results, view, session_id)?;
            }
            bail!(message)
        }
    }
}

async fn latest(email: &str, view: &ViewArgs) -> Result<()> {
    let store = connect_store().await?;
    let latest = load_latest(store.as_ref(), email, view.limit).await?;

    let Some(session) = latest.session else {
        println!("No completed screenings for {}", email);
        return Ok(());
    };

    display::banner(&format!(
        "LATEST SCREENING {} ({})",
        session.id,
        session.created_at.format("%Y-%m-%d %H:%M")
    ));
    if let Some(secs) = session.processing_time_seconds {
        println!("  Processing time: {:.0}s", secs);
    }
    show_results(&latest.results, view, Some(&session.id))
}

// ============================================================================
// Watchlist
// ============================================================================

async fn watchlist(api: &ApiClient, email: &str, action: WatchlistCommand) -> Result<()> {
    match action {
        WatchlistCommand::List(args) => {
            let stocks = sort_watchlist(&api.watchlist(email).await?, args.sort, args.order);
            display::banner(&format!("WATCHLIST ({} stocks)", stocks.len()));
            display::print_watchlist(&stocks);

            if let Some(path) = &args.csv {
                let path = if path.as_os_str() == "-" {
                    PathBuf::from(watchlist_file_name(Utc::now().date_naive()))
                } else {
                    path.clone()
                };
                write_watchlist_csv(&path, &stocks)?;
                println!("\n  Exported {} stocks to {}", stocks.len(), path.display());
            }
        }
        WatchlistCommand::Add { symbol, notes } => {
            let symbol = validate_symbol(&symbol).map_err(anyhow::Error::msg)?;
            let mut watched = WatchedSymbols::from_stocks(&api.watchlist(email).await?);
            if watched.contains(&symbol) {
                println!("{} is already on the watchlist", symbol);
                return Ok(());
            }

            let change = watched.apply_add(&symbol);
            let response = api
                .watchlist_action(json!({ "action": "add", "symbol": symbol, "userEmail": email, "notes": notes }))
                .await?;
            if !response.is_success() {
                watched.revert(change);
                bail!("Failed to add {}: {}", symbol, response.error_message());
            }
            println!("Added {} ({} watched)", symbol, watched.len());
        }
        WatchlistCommand::Remove { symbols } => {
            let symbols = symbols
                .iter()
                .map(|s| validate_symbol(s))
                .collect::<Result<BTreeSet<_>, _>>()
                .map_err(anyhow::Error::msg)?;
            let mut watched = WatchedSymbols::from_stocks(&api.watchlist(email).await?);
            let (targets, missing): (Vec<String>, Vec<String>) =
                symbols.into_iter().partition(|s| watched.contains(s));
            for symbol in &missing {
                println!("{} is not on the watchlist", symbol);
            }
            if targets.is_empty() {
                return Ok(());
            }

            // One call per symbol, all in flight together.
            let changes: Vec<_> = targets.iter().map(|s| watched.apply_remove(s)).collect();
            let calls = targets.iter().map(|symbol| {
                api.watchlist_action(json!({ "action": "remove", "symbol": symbol, "userEmail": email }))
            });
            let responses = join_all(calls).await;
            let outcomes = responses.iter().zip(&targets).map(|(response, symbol)| match response {
                Ok(r) if r.is_success() => true,
                Ok(r) => {
                    warn!("Failed to remove {}: {}", symbol, r.error_message());
                    false
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", symbol, e);
                    false
                }
            });
            let failed = watched.settle(changes.into_iter().zip(outcomes));
            if failed > 0 {
                bail!("Failed to remove {} stocks. Please try again.", failed);
            }
            println!("Removed {} ({} watched)", targets.join(", "), watched.len());
        }
        WatchlistCommand::BulkAdd { symbols } => {
            let symbols = symbols
                .iter()
                .map(|s| validate_symbol(s))
                .collect::<Result<Vec<_>, _>>()
                .map_err(anyhow::Error::msg)?;
            let response = api
                .watchlist_action(json!({ "action": "bulk-add", "symbols": symbols, "userEmail": email }))
                .await?;
            if !response.is_success() {
                bail!("{}", response.error_message());
            }
            println!("Added {} stocks to the watchlist", response.body["added"].as_u64().unwrap_or(0));
        }
        WatchlistCommand::Check { symbol } => {
            let symbol = validate_symbol(&symbol).map_err(anyhow::Error::msg)?;
            if api.is_watched(email, &symbol).await? {
                println!("{} is on the watchlist", symbol);
            } else {
                println!("{} is not on the watchlist", symbol);
            }
        }
    }
    Ok(())
}
