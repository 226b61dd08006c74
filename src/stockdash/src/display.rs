//! Terminal output.

use common::poller::PollSnapshot;
use common::view::ScreeningSummary;
use common::{ScreeningResult, StockData, WatchlistStock};

pub fn banner(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("{}", title);
    println!("{}", "=".repeat(60));
}

fn signed(value: f64) -> String {
    if value >= 0.0 {
        format!("+{:.2}", value)
    } else {
        format!("{:.2}", value)
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let cut: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

pub fn print_stock(stock: &StockData) {
    banner(&format!("{} - {}", stock.symbol, stock.name));
    println!(
        "  Price:       ${:.2} ({} / {}%)",
        stock.price,
        signed(stock.change),
        signed(stock.change_percent)
    );
    println!("  Day range:   ${:.2} - ${:.2}", stock.day_low, stock.day_high);
    println!("  Open:        ${:.2}   Prev close: ${:.2}", stock.open_price, stock.previous_close);
    println!("  Volume:      {:.0}", stock.volume);
    println!("  Sector:      {}", stock.sector);
    println!("  Exchange:    {} ({})", stock.exchange, stock.country);
    println!("  Market cap:  {}", stock.market_cap);
    println!("  P/E:         {}   Beta: {}", stock.pe_ratio, stock.beta);
    println!(
        "  52w range:   {} - {}",
        stock.technicals.week_52_low, stock.technicals.week_52_high
    );
    if !stock.website.is_empty() {
        println!("  Website:     {}", stock.website);
    }
    if !stock.description.is_empty() {
        println!("\n  {}", truncate(&stock.description, 300));
    }

    if !stock.news.is_empty() {
        println!("\n  News:");
        for item in stock.news.iter().take(5) {
            println!("    [{}] {}", item.date, item.title);
        }
    }

    println!(
        "\n  Updated {} via {}",
        stock.last_update,
        if stock.data_source.is_empty() { "unknown" } else { &stock.data_source }
    );
}

pub fn print_summary(summary: &ScreeningSummary) {
    println!("\n  Screened:     {}", summary.total_screened);
    println!("  Avg score:    {:.1}", summary.average_score);
    println!("  Strong buys:  {}", summary.strong_buys);
    println!("  Buys:         {}", summary.buys);
    println!("  Top sector:   {}", summary.top_sector);
}

pub fn print_results(results: &[ScreeningResult]) {
    if results.is_empty() {
        println!("\n  No results match the current filters.");
        return;
    }

    println!(
        "\n  {:>4}  {:<7} {:<28} {:>6}  {:<12} {:>10} {:>8}  {}",
        "Rank", "Symbol", "Company", "Score", "Rating", "Price", "Chg %", "Sector"
    );
    println!("  {}", "-".repeat(100));
    for result in results {
        println!(
            "  {:>4}  {:<7} {:<28} {:>6.1}  {:<12} {:>10.2} {:>8}  {}",
            result.rank_position.map(i64::from).unwrap_or(i64::from(result.rank)),
            result.symbol,
            truncate(&result.name, 28),
            result.score,
            result.rating.as_str(),
            result.price,
            signed(result.change_percent),
            result.sector
        );
    }
}

pub fn print_watchlist(stocks: &[WatchlistStock]) {
    if stocks.is_empty() {
        println!("\n  Watchlist is empty.");
        return;
    }

    println!(
        "\n  {:<7} {:<28} {:>6}  {:<12} {:>10}  {}",
        "Symbol", "Company", "Score", "Rating", "Price", "Added"
    );
    println!("  {}", "-".repeat(84));
    for stock in stocks {
        println!(
            "  {:<7} {:<28} {:>6}  {:<12} {:>10}  {}",
            stock.symbol,
            truncate(stock.company_name.as_deref().unwrap_or("-"), 28),
            stock.latest_score.map(|s| format!("{:.1}", s)).unwrap_or_else(|| "-".to_string()),
            stock.latest_rating.as_deref().unwrap_or("-"),
            stock.latest_price.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".to_string()),
            stock.added_at.format("%Y-%m-%d")
        );
        if let Some(notes) = stock.notes.as_deref().filter(|n| !n.is_empty()) {
            println!("          {}", notes);
        }
    }
}

pub fn print_suggestions(picks: &[&ScreeningResult]) {
    println!("\n  Suggested for your watchlist ({} scored 85 or higher):", picks.len());
    for result in picks {
        println!(
            "    {:<7} {:<28} {:>6.1}  {}",
            result.symbol,
            truncate(&result.name, 28),
            result.score,
            result.rating.as_str()
        );
    }
}

/// One line per observed poll.
pub fn print_progress(snapshot: &PollSnapshot) {
    let status = snapshot
        .session
        .as_ref()
        .map(|s| s.status.progress_message())
        .unwrap_or("Waiting for the screening session...");
    let at = snapshot
        .last_poll_time
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    println!("  [{}] poll #{:<3} {}", at, snapshot.poll_count, status);
}
