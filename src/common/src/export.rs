//! CSV export of screening results and watchlists.

use std::path::Path;

use chrono::NaiveDate;
use csv::Writer;
use thiserror::Error;
use tracing::info;

use crate::models::{ScreeningResult, WatchlistStock};

const HEADERS: [&str; 8] = ["Rank", "Symbol", "Company", "Score", "Rating", "Price", "Change %", "Sector"];
const WATCHLIST_HEADERS: [&str; 8] = [
    "Symbol",
    "Company",
    "Sector",
    "Score",
    "Rating",
    "Price",
    "Change %",
    "Added Date",
];
const MISSING: &str = "N/A";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

fn write_results<W: std::io::Write>(wtr: &mut Writer<W>, results: &[ScreeningResult]) -> Result<(), ExportError> {
    wtr.write_record(HEADERS)?;
    for result in results {
        let rank = result.rank_position.map(|r| r.to_string()).unwrap_or_else(|| result.rank.to_string());
        wtr.write_record([
            rank,
            result.symbol.clone(),
            result.name.clone(),
            result.score.to_string(),
            result.rating.to_string(),
            result.price.to_string(),
            result.change_percent.to_string(),
            result.sector.clone(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Header plus one line per result; fields with commas or quotes are quoted.
pub fn results_to_csv(results: &[ScreeningResult]) -> Result<String, ExportError> {
    let mut wtr = Writer::from_writer(vec![]);
    write_results(&mut wtr, results)?;
    let data = wtr.into_inner().map_err(|e| ExportError::Io(e.into_error()))?;
    Ok(String::from_utf8(data)?)
}

pub fn write_csv(path: impl AsRef<Path>, results: &[ScreeningResult]) -> Result<(), ExportError> {
    let path = path.as_ref();
    let mut wtr = Writer::from_path(path)?;
    write_results(&mut wtr, results)?;
    info!("Exported {} results to {}", results.len(), path.display());
    Ok(())
}

fn or_missing<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| MISSING.to_string())
}

fn write_watchlist<W: std::io::Write>(wtr: &mut Writer<W>, stocks: &[WatchlistStock]) -> Result<(), ExportError> {
    wtr.write_record(WATCHLIST_HEADERS)?;
    for stock in stocks {
        wtr.write_record([
            stock.symbol.clone(),
            stock.company_name.clone().unwrap_or_default(),
            stock.sector.clone().unwrap_or_default(),
            or_missing(stock.latest_score),
            or_missing(stock.latest_rating.as_deref()),
            or_missing(stock.latest_price),
            or_missing(stock.latest_change_percent),
            stock.added_at.format("%Y-%m-%d").to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Watchlist rows in display order; metrics never screened read "N/A".
pub fn watchlist_to_csv(stocks: &[WatchlistStock]) -> Result<String, ExportError> {
    let mut wtr = Writer::from_writer(vec![]);
    write_watchlist(&mut wtr, stocks)?;
    let data = wtr.into_inner().map_err(|e| ExportError::Io(e.into_error()))?;
    Ok(String::from_utf8(data)?)
}

pub fn write_watchlist_csv(path: impl AsRef<Path>, stocks: &[WatchlistStock]) -> Result<(), ExportError> {
    let path = path.as_ref();
    let mut wtr = Writer::from_path(path)?;
    write_watchlist(&mut wtr, stocks)?;
    info!("Exported {} watchlist stocks to {}", stocks.len(), path.display());
    Ok(())
}

pub fn watchlist_file_name(date: NaiveDate) -> String {
    format!("watchlist-{}.csv", date.format("%Y-%m-%d"))
}

/// Default export file name for a session.
pub fn export_file_name(session_id: Option<&str>) -> String {
    format!("screening-results-{}.csv", session_id.unwrap_or("latest"))
}
