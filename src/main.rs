mod config;
mod cursor;
mod dedupe;
mod error;
mod fetch;
mod http;
mod modes;
mod normalize;
mod pipeline;
mod record;
mod runlog;
mod sink;
mod summarize;

use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::{require, Settings};
use crate::http::ReqwestTransport;
use crate::pipeline::RunReport;
use crate::sink::sheet::Workbook;

#[derive(Parser)]
#[command(name = "pollsink", about = "Incremental fetch → normalize → dedupe → sink jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot the top-N search results per keyword
    Ranking {
        /// Keyword to search (repeatable; default: the KEYWORDS worksheet)
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
        /// Results kept per keyword given on the command line
        #[arg(short = 'n', long)]
        top_n: Option<usize>,
        /// Max keywords processed in this run
        #[arg(long)]
        max_keywords: Option<usize>,
    },
    /// Record current price and availability of every enabled ASIN
    Favorites,
    /// Push new Slack messages to LINE
    Mirror {
        /// Slack channel id (default: slack_channel_id setting)
        #[arg(short, long)]
        channel: Option<String>,
        /// Max messages per run
        #[arg(short, long)]
        limit: Option<usize>,
        /// Also append the messages to the MESSAGES worksheet
        #[arg(long)]
        archive: bool,
    },
    /// Summarize the last hours of a Slack channel into one LINE message
    Summary {
        /// Hours to look back (default: summary_hours setting)
        #[arg(long)]
        hours: Option<u32>,
        /// Slack channel id (default: slack_channel_id setting)
        #[arg(short, long)]
        channel: Option<String>,
    },
    /// Append one dummy row to the products worksheet
    Smoketest,
    /// Add a keyword to the KEYWORDS worksheet
    AddKeyword {
        keyword: String,
        #[arg(short = 'n', long)]
        top_n: Option<usize>,
    },
    /// Add an ASIN to the ASIN_LIST worksheet
    AddAsin {
        asin: String,
        #[arg(long, default_value = "")]
        memo: String,
    },
    /// Show the keyword watch list
    ListKeywords,
    /// Show the ASIN watch list
    ListAsins,
    /// Print the last rows of a worksheet
    Show {
        worksheet: String,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Worksheet row counts and saved cursors
    Stats,
    /// Inspect or reset saved cursors
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    /// Print one cursor, or all of them
    Show { name: Option<String> },
    /// Delete a cursor so the next run starts from the beginning
    /// (default: the configured Slack channel)
    Reset { name: Option<String> },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Ranking {
            keywords,
            top_n,
            max_keywords,
        } => {
            let book = open_workbook(&settings)?;
            let watch = if keywords.is_empty() {
                modes::load_keywords(&book, &settings.ws_keywords, settings.default_top_n)?
            } else {
                let n = top_n.unwrap_or(settings.default_top_n);
                keywords
                    .into_iter()
                    .map(|keyword| modes::KeywordWatch { keyword, top_n: n })
                    .collect()
            };
            if watch.is_empty() {
                println!(
                    "No keywords. Pass -k or run 'add-keyword' to fill {}.",
                    settings.ws_keywords
                );
                return Ok(());
            }

            let settings = Settings {
                max_keywords: max_keywords.unwrap_or(settings.max_keywords),
                ..settings
            };
            let transport = ReqwestTransport::new(settings.request_timeout())?;
            println!(
                "Ranking {} of {} keyword(s)...",
                watch.len().min(settings.max_keywords),
                watch.len()
            );
            let summary = modes::ranking(&settings, &book, &transport, &watch).await?;
            println!(
                "Done: {} rows appended to {}, {} failed keyword(s).",
                summary.appended,
                settings.ws_ranking,
                summary.failed_keywords.len()
            );
            for k in &summary.failed_keywords {
                println!("  failed: {}", k);
            }
            if summary.appended == 0 {
                anyhow::bail!("no keyword produced any rows");
            }
            Ok(())
        }
        Commands::Favorites => {
            let book = open_workbook(&settings)?;
            let transport = ReqwestTransport::new(settings.request_timeout())?;
            let report = modes::favorites(&settings, &book, &transport).await?;
            print_run("favorites", &report);
            Ok(())
        }
        Commands::Mirror {
            channel,
            limit,
            archive,
        } => {
            let book = open_workbook(&settings)?;
            let transport = ReqwestTransport::new(settings.request_timeout())?;
            let report = modes::mirror(
                &settings,
                &book,
                &transport,
                channel.as_deref(),
                limit,
                archive,
            )
            .await?;
            print_run("mirror", &report);
            Ok(())
        }
        Commands::Summary { hours, channel } => {
            let transport = ReqwestTransport::new(settings.request_timeout())?;
            let report = modes::summary(&settings, &transport, channel.as_deref(), hours).await?;
            println!("summary: {} message(s), sent to LINE:", report.messages);
            println!("{}", report.text);
            if let Some(log) = &report.log {
                println!("  run log: {}", log.display());
            }
            Ok(())
        }
        Commands::Smoketest => {
            let book = open_workbook(&settings)?;
            let report = modes::smoketest(&settings, &book).await?;
            println!(
                "Smoketest: {} row(s) appended to {} in {}",
                report.succeeded,
                settings.ws_products,
                settings.db_path.display()
            );
            Ok(())
        }
        Commands::AddKeyword { keyword, top_n } => {
            let book = open_workbook(&settings)?;
            let n = top_n.unwrap_or(settings.default_top_n);
            modes::add_keyword(&book, &settings.ws_keywords, &keyword, n)?;
            println!("Added keyword '{}' (top {})", keyword, n);
            Ok(())
        }
        Commands::AddAsin { asin, memo } => {
            let book = open_workbook(&settings)?;
            modes::add_asin(&book, &settings.ws_asin_list, &asin, &memo)?;
            println!("Added ASIN {}", asin);
            Ok(())
        }
        Commands::ListKeywords => {
            let book = open_workbook(&settings)?;
            let rows = modes::load_keywords(&book, &settings.ws_keywords, settings.default_top_n)?;
            if rows.is_empty() {
                println!("No keywords.");
                return Ok(());
            }
            println!("{:>3} | {:<30} | {:>5}", "#", "Keyword", "Top N");
            println!("{}", "-".repeat(44));
            for (i, k) in rows.iter().enumerate() {
                println!("{:>3} | {:<30} | {:>5}", i + 1, truncate(&k.keyword, 30), k.top_n);
            }
            Ok(())
        }
        Commands::ListAsins => {
            let book = open_workbook(&settings)?;
            let rows = modes::load_asins(&book, &settings.ws_asin_list)?;
            if rows.is_empty() {
                println!("No ASINs.");
                return Ok(());
            }
            println!("{:>3} | {:<12} | {:<7} | {:<30}", "#", "ASIN", "Enabled", "Memo");
            println!("{}", "-".repeat(60));
            for (i, a) in rows.iter().enumerate() {
                println!(
                    "{:>3} | {:<12} | {:<7} | {:<30}",
                    i + 1,
                    a.asin,
                    if a.enabled { "yes" } else { "no" },
                    truncate(&a.memo, 30)
                );
            }
            Ok(())
        }
        Commands::Show { worksheet, limit } => {
            let book = open_workbook(&settings)?;
            let (headers, rows) = book.tail(&worksheet, limit)?;
            println!("{}", headers.join(" | "));
            println!("{}", "-".repeat(headers.len() * 12));
            for row in &rows {
                let cells: Vec<String> = row.iter().map(|c| truncate(c, 24)).collect();
                println!("{}", cells.join(" | "));
            }
            println!("\n{} row(s) shown", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let book = open_workbook(&settings)?;
            println!("Workbook: {}", settings.db_path.display());
            for (name, count) in book.worksheets()? {
                println!("  {:<20} {:>7} rows", name, count);
            }
            println!("Cursors: {}", settings.state_dir.display());
            for (name, c) in cursor::list(&settings.state_dir)? {
                println!("  {:<20} {}", name, describe_cursor(c));
            }
            Ok(())
        }
        Commands::Cursor { action } => match action {
            CursorAction::Show { name: Some(name) } => {
                let store = cursor::FileCursorStore::in_dir(&settings.state_dir, &name);
                println!("{} = {}", name, describe_cursor(store.load()?));
                Ok(())
            }
            CursorAction::Show { name: None } => {
                let all = cursor::list(&settings.state_dir)?;
                if all.is_empty() {
                    println!("No cursors in {}", settings.state_dir.display());
                }
                for (name, c) in all {
                    println!("{} = {}", name, describe_cursor(c));
                }
                Ok(())
            }
            CursorAction::Reset { name } => {
                let store = match name {
                    Some(name) => cursor::FileCursorStore::in_dir(&settings.state_dir, &name),
                    None => modes::slack_cursor(
                        &settings,
                        require(&settings.slack_channel_id, "slack_channel_id")?,
                    ),
                };
                if store.reset()? {
                    println!("Removed {}", store.path().display());
                } else {
                    println!("No cursor at {}", store.path().display());
                }
                Ok(())
            }
        },
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_workbook(settings: &Settings) -> anyhow::Result<Workbook> {
    Workbook::open(&settings.db_path)
        .with_context(|| format!("failed to open {}", settings.db_path.display()))
}

fn print_run(mode: &str, r: &RunReport) {
    println!(
        "{}: fetched {}, appended {} ok / {} failed, {} skipped",
        mode,
        r.fetched,
        r.append.succeeded,
        r.append.failed,
        r.skipped.len()
    );
    if r.append.truncated > 0 {
        println!("  {} message(s) truncated", r.append.truncated);
    }
    for s in &r.skipped {
        println!("  skipped {}", s);
    }
    if let Some(last) = r.written.last() {
        println!("  last record: {}", last.key);
    }
    if let Some(c) = r.cursor {
        println!("  cursor {} -> {}", describe_cursor(r.since), describe_cursor(c));
    }
}

fn describe_cursor(c: record::Cursor) -> String {
    if c.is_zero() {
        return "0 (from the beginning)".to_string();
    }
    match chrono::DateTime::from_timestamp(c.0 as i64, 0) {
        Some(dt) => {
            let local = dt.with_timezone(&modes::jst());
            format!("{} ({})", c, local.format("%Y-%m-%d %H:%M:%S"))
        }
        None => c.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
