//! Filtering, sorting and summarising screening results for display.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{Rating, ScreeningResult, WatchlistStock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    Score,
    Rating,
    ChangePercent,
    Symbol,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['_', '-'], "").as_str() {
            "score" => Ok(SortKey::Score),
            "rating" => Ok(SortKey::Rating),
            "changepercent" | "change" => Ok(SortKey::ChangePercent),
            "symbol" => Ok(SortKey::Symbol),
            other => Err(format!("Unknown sort key: {}", other)),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SortKey::Score => "score",
            SortKey::Rating => "rating",
            SortKey::ChangePercent => "change-percent",
            SortKey::Symbol => "symbol",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("Unknown sort order: {}", other)),
        }
    }
}

/// `None` means "all".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFilter {
    pub rating: Option<Rating>,
    pub sector: Option<String>,
}

impl ResultFilter {
    pub fn matches(&self, result: &ScreeningResult) -> bool {
        if let Some(rating) = self.rating {
            if result.rating != rating {
                return false;
            }
        }
        if let Some(sector) = &self.sector {
            if !result.sector.eq_ignore_ascii_case(sector) {
                return false;
            }
        }
        true
    }
}

fn compare(a: &ScreeningResult, b: &ScreeningResult, key: SortKey) -> Ordering {
    match key {
        SortKey::Score => a.score.total_cmp(&b.score),
        // Ascending rating means weakest first.
        SortKey::Rating => a.rating.strength().cmp(&b.rating.strength()),
        SortKey::ChangePercent => a.change_percent.total_cmp(&b.change_percent),
        SortKey::Symbol => a.symbol.cmp(&b.symbol),
    }
}

/// Apply `filter`, then a stable sort by `key` in `order`.
pub fn filter_and_sort(
    results: &[ScreeningResult],
    filter: &ResultFilter,
    key: SortKey,
    order: SortOrder,
) -> Vec<ScreeningResult> {
    let mut view: Vec<ScreeningResult> = results.iter().filter(|r| filter.matches(r)).cloned().collect();
    view.sort_by(|a, b| match order {
        SortOrder::Asc => compare(a, b, key),
        SortOrder::Desc => compare(b, a, key),
    });
    view
}

/// Sort by score (best first) and number ranks from 1.
pub fn rank_results(mut results: Vec<ScreeningResult>) -> Vec<ScreeningResult> {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    for (index, result) in results.iter_mut().enumerate() {
        result.rank = index as u32 + 1;
    }
    results
}

/// Distinct sectors, sorted, for filter pickers.
pub fn sectors(results: &[ScreeningResult]) -> Vec<String> {
    let mut sectors: Vec<String> = results.iter().map(|r| r.sector.clone()).collect();
    sectors.sort();
    sectors.dedup();
    sectors
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningSummary {
    pub total_screened: usize,
    pub average_score: f64,
    pub strong_buys: usize,
    pub buys: usize,
    pub top_sector: String,
}

impl ScreeningSummary {
    pub fn from_results(results: &[ScreeningResult]) -> Self {
        let total = results.len();
        let average_score = if total == 0 {
            0.0
        } else {
            let mean = results.iter().map(|r| r.score).sum::<f64>() / total as f64;
            (mean * 10.0).round() / 10.0
        };

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for result in results {
            *counts.entry(result.sector.as_str()).or_default() += 1;
        }
        // Highest count wins; ties go to the alphabetically first sector.
        let top_sector = counts
            .into_iter()
            .max_by(|(sa, ca), (sb, cb)| ca.cmp(cb).then_with(|| sb.cmp(sa)))
            .map(|(sector, _)| sector.to_string())
            .unwrap_or_else(|| "N/A".to_string());

        Self {
            total_screened: total,
            average_score,
            strong_buys: results.iter().filter(|r| r.rating == Rating::StrongBuy).count(),
            buys: results.iter().filter(|r| r.rating == Rating::Buy).count(),
            top_sector,
        }
    }
}

/// Results at or above this score are offered for the watchlist after a run.
pub const SUGGESTION_MIN_SCORE: f64 = 85.0;

/// High scorers from a finished run, best first, skipping symbols for which
/// `already_watched` returns true.
pub fn watchlist_suggestions<'a>(
    results: &'a [ScreeningResult],
    already_watched: impl Fn(&str) -> bool,
) -> Vec<&'a ScreeningResult> {
    let mut picks: Vec<&ScreeningResult> = results
        .iter()
        .filter(|r| r.score >= SUGGESTION_MIN_SCORE && !already_watched(&r.symbol))
        .collect();
    picks.sort_by(|a, b| b.score.total_cmp(&a.score));
    picks
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchlistSortKey {
    Symbol,
    Score,
    Price,
    ChangePercent,
    #[default]
    AddedAt,
}

impl FromStr for WatchlistSortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['_', '-'], "").as_str() {
            "symbol" => Ok(WatchlistSortKey::Symbol),
            "score" | "latestscore" => Ok(WatchlistSortKey::Score),
            "price" | "latestprice" => Ok(WatchlistSortKey::Price),
            "changepercent" | "change" | "latestchangepercent" => Ok(WatchlistSortKey::ChangePercent),
            "addedat" | "added" => Ok(WatchlistSortKey::AddedAt),
            other => Err(format!("Unknown watchlist sort key: {}", other)),
        }
    }
}

impl fmt::Display for WatchlistSortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatchlistSortKey::Symbol => "symbol",
            WatchlistSortKey::Score => "score",
            WatchlistSortKey::Price => "price",
            WatchlistSortKey::ChangePercent => "change-percent",
            WatchlistSortKey::AddedAt => "added-at",
        };
        f.write_str(name)
    }
}

/// Missing values go last whichever way the list is sorted.
fn compare_optional(a: Option<f64>, b: Option<f64>, order: SortOrder) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match order {
            SortOrder::Asc => a.total_cmp(&b),
            SortOrder::Desc => b.total_cmp(&a),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

/// Stable sort of a watchlist. Symbols compare case-insensitively.
pub fn sort_watchlist(stocks: &[WatchlistStock], key: WatchlistSortKey, order: SortOrder) -> Vec<WatchlistStock> {
    let mut view = stocks.to_vec();
    view.sort_by(|a, b| match key {
        WatchlistSortKey::Symbol => directed(a.symbol.to_lowercase().cmp(&b.symbol.to_lowercase()), order),
        WatchlistSortKey::Score => compare_optional(a.latest_score, b.latest_score, order),
        WatchlistSortKey::Price => compare_optional(a.latest_price, b.latest_price, order),
        WatchlistSortKey::ChangePercent => compare_optional(a.latest_change_percent, b.latest_change_percent, order),
        WatchlistSortKey::AddedAt => directed(a.added_at.cmp(&b.added_at), order),
    });
    view
}
