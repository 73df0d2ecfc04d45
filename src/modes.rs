use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Offset, TimeDelta, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::types::Value;
use tracing::{info, warn};

use crate::config::{require, Settings};
use crate::cursor::FileCursorStore;
use crate::dedupe::TieBreak;
use crate::error::SinkError;
use crate::fetch::amazon::{AmazonSearch, DetailCache, ProductDetails};
use crate::fetch::slack::SlackHistory;
use crate::fetch::Fetcher;
use crate::http::Transport;
use crate::normalize::{MessageNormalizer, Normalizer, ProductNormalizer};
use crate::pipeline::{Pipeline, RunReport};
use crate::record::{Availability, CanonicalRecord, Cursor, Payload, Product};
use crate::sink::line::LinePushSink;
use crate::sink::sheet::{Layout, SheetSink, Workbook, ASIN_LIST_HEADERS, KEYWORD_HEADERS};
use crate::runlog::{self, RunLogEntry};
use crate::sink::{AppendReport, Sink, Tee};
use crate::summarize::ChatSummarizer;

const JST_OFFSET_SECS: i32 = 9 * 3600;

pub fn jst() -> FixedOffset {
    FixedOffset::east_opt(JST_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

pub fn now_jst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&jst())
}

pub fn slack_cursor(settings: &Settings, channel: &str) -> FileCursorStore {
    FileCursorStore::in_dir(&settings.state_dir, &format!("slack_{}", channel))
}

// ── Watch lists ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordWatch {
    pub keyword: String,
    pub top_n: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsinWatch {
    pub asin: String,
    pub memo: String,
    pub enabled: bool,
}

fn is_false_like(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "no")
}

/// Rows of the keyword sheet. Empty keywords are dropped; a blank or
/// non-numeric `top_n` becomes `default_top_n`. A missing sheet is an empty list.
pub fn load_keywords(book: &Workbook, worksheet: &str, default_top_n: usize) -> Result<Vec<KeywordWatch>> {
    let rows = match book.read_rows(worksheet) {
        Ok(rows) => rows,
        Err(SinkError::MissingWorksheet(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e).context("failed to read keywords"),
    };
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let keyword = row.get("keyword")?.trim().to_string();
            if keyword.is_empty() {
                return None;
            }
            let top_n = row
                .get("top_n")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default_top_n);
            Some(KeywordWatch { keyword, top_n })
        })
        .collect())
}

pub fn load_asins(book: &Workbook, worksheet: &str) -> Result<Vec<AsinWatch>> {
    let rows = match book.read_rows(worksheet) {
        Ok(rows) => rows,
        Err(SinkError::MissingWorksheet(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e).context("failed to read ASIN list"),
    };
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let asin = row.get("asin")?.trim().to_string();
            if asin.is_empty() {
                return None;
            }
            Some(AsinWatch {
                asin,
                memo: row.get("memo").cloned().unwrap_or_default(),
                enabled: !row.get("enabled").is_some_and(|v| is_false_like(v)),
            })
        })
        .collect())
}

pub fn add_keyword(book: &Workbook, worksheet: &str, keyword: &str, top_n: usize) -> Result<()> {
    book.ensure_worksheet(worksheet, &KEYWORD_HEADERS)?;
    let row = vec![Value::Text(keyword.to_string()), Value::Integer(top_n as i64)];
    let report = book.append_rows(worksheet, &KEYWORD_HEADERS, &[Ok(row)])?;
    anyhow::ensure!(report.failed == 0, "{} could not take the new keyword", worksheet);
    Ok(())
}

pub fn add_asin(book: &Workbook, worksheet: &str, asin: &str, memo: &str) -> Result<()> {
    book.ensure_worksheet(worksheet, &ASIN_LIST_HEADERS)?;
    let row = vec![
        Value::Text(asin.to_string()),
        Value::Text(memo.to_string()),
        Value::Text("TRUE".to_string()),
    ];
    let report = book.append_rows(worksheet, &ASIN_LIST_HEADERS, &[Ok(row)])?;
    anyhow::ensure!(report.failed == 0, "{} could not take the new ASIN", worksheet);
    Ok(())
}

// ── Modes ──

#[derive(Debug, Default)]
pub struct RankingSummary {
    pub processed: usize,
    pub appended: usize,
    pub failed_keywords: Vec<String>,
}

/// One search snapshot per keyword, deduplicated by ASIN (lowest price wins)
/// and cut to `top_n`. A failing keyword does not stop the others.
pub async fn ranking<T: Transport>(
    settings: &Settings,
    book: &Workbook,
    transport: &T,
    keywords: &[KeywordWatch],
) -> Result<RankingSummary> {
    let selected = &keywords[..keywords.len().min(settings.max_keywords)];
    let mut summary = RankingSummary::default();
    let mut cache = DetailCache::new();

    let pb = ProgressBar::new(selected.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    for kw in selected {
        pb.set_message(kw.keyword.clone());
        let normalizer = ProductNormalizer {
            keyword: Some(kw.keyword.clone()),
            source: "amazon_search".to_string(),
            captured_at: now_jst(),
        };
        let mut pipeline = Pipeline::new(
            AmazonSearch::new(
                transport,
                settings.scrape_policy(),
                &mut cache,
                settings.detail_fetch_limit,
            ),
            normalizer,
            SheetSink::new(book, settings.ws_ranking.clone(), Layout::Ranking),
        )
        .tie_break(TieBreak::LowestPrice)
        .keep(kw.top_n);

        summary.processed += 1;
        match pipeline.run(&kw.keyword, kw.top_n).await {
            Ok(report) if report.append.succeeded > 0 => {
                summary.appended += report.append.succeeded;
            }
            Ok(_) => {
                warn!("{}: nothing appended", kw.keyword);
                summary.failed_keywords.push(kw.keyword.clone());
            }
            Err(e) => {
                warn!("{}: {}", kw.keyword, e);
                summary.failed_keywords.push(kw.keyword.clone());
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "ranking: {} keyword(s), {} rows, {} failed, {} detail pages ({} cache hits)",
        summary.processed,
        summary.appended,
        summary.failed_keywords.len(),
        cache.len(),
        cache.hits
    );
    Ok(summary)
}

/// Current detail page of every enabled ASIN into the products history.
pub async fn favorites<T: Transport>(
    settings: &Settings,
    book: &Workbook,
    transport: &T,
) -> Result<RunReport> {
    let asins: Vec<String> = load_asins(book, &settings.ws_asin_list)?
        .into_iter()
        .filter(|a| a.enabled)
        .map(|a| a.asin)
        .collect();
    if asins.is_empty() {
        info!("favorites: no enabled ASINs in {}", settings.ws_asin_list);
        return Ok(RunReport::default());
    }

    let mut cache = DetailCache::new();
    let limit = asins.len();
    let normalizer = ProductNormalizer {
        keyword: None,
        source: "amazon_detail".to_string(),
        captured_at: now_jst(),
    };
    let mut pipeline = Pipeline::new(
        ProductDetails::new(transport, settings.scrape_policy(), &mut cache, asins),
        normalizer,
        SheetSink::new(book, settings.ws_products.clone(), Layout::Products),
    );
    Ok(pipeline.run(&settings.ws_asin_list, limit).await?)
}

/// New Slack messages since the saved cursor, pushed to LINE and optionally
/// archived to the messages worksheet.
pub async fn mirror<T: Transport>(
    settings: &Settings,
    book: &Workbook,
    transport: &T,
    channel: Option<&str>,
    limit: Option<usize>,
    archive: bool,
) -> Result<RunReport> {
    let slack_token = require(&settings.slack_bot_token, "slack_bot_token")?;
    let channel = match channel {
        Some(c) => c,
        None => require(&settings.slack_channel_id, "slack_channel_id")?,
    };
    let line_token = require(&settings.line_channel_access_token, "line_channel_access_token")?;
    let line_to = require(&settings.line_to_user_id, "line_to_user_id")?;
    let limit = limit.unwrap_or(settings.slack_limit);

    let slack = SlackHistory::new(transport, settings.api_policy(), slack_token);
    let channel_name = slack.channel_name(channel).await;
    let normalizer = MessageNormalizer {
        channel: channel_name,
        captured_at: now_jst(),
    };
    let line = LinePushSink::new(
        transport,
        settings.api_policy(),
        line_token,
        line_to,
        settings.message_max_chars,
    );
    let cursor = slack_cursor(settings, channel);

    let report = if archive {
        let sink = Tee {
            primary: line,
            archive: SheetSink::new(book, settings.ws_messages.clone(), Layout::Messages),
        };
        Pipeline::new(slack, normalizer, sink)
            .with_cursor(cursor)
            .run(channel, limit)
            .await?
    } else {
        Pipeline::new(slack, normalizer, line)
            .with_cursor(cursor)
            .run(channel, limit)
            .await?
    };
    Ok(report)
}

#[derive(Debug)]
pub struct SummaryReport {
    pub messages: usize,
    /// Text sent to LINE.
    pub text: String,
    pub log: Option<PathBuf>,
}

/// Messages of the last `hours` hours, summarized by the chat model and sent to
/// LINE as one message. No cursor: every run covers its own window. Each run,
/// failed or not, appends a line to the run log.
pub async fn summary<T: Transport>(
    settings: &Settings,
    transport: &T,
    channel: Option<&str>,
    hours: Option<u32>,
) -> Result<SummaryReport> {
    let hours = hours.unwrap_or(settings.summary_hours);
    let start = now_jst();
    let outcome = summarize_window(settings, transport, channel, hours, start).await;

    let entry = RunLogEntry {
        mode: "summary",
        start,
        end: now_jst(),
        items: outcome.as_ref().map_or(0, |(n, _)| *n),
        ok: outcome.is_ok(),
        err: outcome.as_ref().err().map(|e| format!("{:#}", e)),
    };
    let log = match runlog::append(&settings.runlog_dir, &entry) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("summary: run log not written: {:#}", e);
            None
        }
    };

    let (messages, text) = outcome?;
    Ok(SummaryReport {
        messages,
        text,
        log,
    })
}

async fn summarize_window<T: Transport>(
    settings: &Settings,
    transport: &T,
    channel: Option<&str>,
    hours: u32,
    start: DateTime<FixedOffset>,
) -> Result<(usize, String)> {
    let slack_token = require(&settings.slack_bot_token, "slack_bot_token")?;
    let channel = match channel {
        Some(c) => c,
        None => require(&settings.slack_channel_id, "slack_channel_id")?,
    };
    let openai_key = require(&settings.openai_api_key, "openai_api_key")?;
    let line_token = require(&settings.line_channel_access_token, "line_channel_access_token")?;

    let since = Cursor::from_datetime(&(start - TimeDelta::hours(i64::from(hours))));
    let mut slack = SlackHistory::new(transport, settings.api_policy(), slack_token);
    let batch = slack
        .fetch(channel, since, settings.summary_max_messages)
        .await?;

    let normalizer = MessageNormalizer {
        channel: channel.to_string(),
        captured_at: start,
    };
    let mut records = Vec::with_capacity(batch.records.len());
    for (i, raw) in batch.records.iter().enumerate() {
        match normalizer.normalize(raw, i + 1) {
            Ok(r) => records.push(r),
            Err(skip) => warn!("skipped {}", skip),
        }
    }
    info!("summary: {} message(s) in the last {}h of {}", records.len(), hours, channel);

    let text = if records.is_empty() {
        format!("直近{}時間、新着なし", hours)
    } else {
        let digest = ChatSummarizer::new(
            transport,
            settings.api_policy(),
            openai_key,
            settings.openai_model.clone(),
            settings.summary_max_chars,
        )
        .summarize(&records)
        .await?;
        format!("【Slackまとめ（直近{}h）】\n\n{}", hours, digest)
    };

    let line_to = settings
        .line_to_user_id
        .as_deref()
        .map(str::trim)
        .filter(|to| !to.is_empty());
    let line = match line_to {
        Some(to) => LinePushSink::new(
            transport,
            settings.api_policy(),
            line_token,
            to,
            settings.message_max_chars,
        ),
        None => LinePushSink::broadcast(
            transport,
            settings.api_policy(),
            line_token,
            settings.message_max_chars,
        ),
    };
    line.push_text(&text).await?;
    Ok((records.len(), text))
}

/// Provisions the products worksheet and appends one placeholder row.
pub async fn smoketest(settings: &Settings, book: &Workbook) -> Result<AppendReport> {
    let captured_at = now_jst();
    let record = CanonicalRecord {
        key: "TEST-ASIN".to_string(),
        rank: 1,
        position: Cursor::from_datetime(&captured_at),
        captured_at,
        source: "smoketest".to_string(),
        payload: Payload::Product(Product {
            keyword: None,
            title: Some("smoketest product".to_string()),
            price: Some(9999),
            currency: "JPY".to_string(),
            availability: Availability::InStock,
            url: Some("https://example.com/smoketest".to_string()),
            image_url: None,
        }),
    };
    let mut sink = SheetSink::new(book, settings.ws_products.clone(), Layout::Products);
    Ok(sink.append(&[record]).await?)
}
