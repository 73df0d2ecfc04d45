use std::collections::HashMap;
use std::path::Path;

use rusqlite::types::Value;
use rusqlite::Connection;
use tracing::{info, warn};

use super::{AppendReport, Sink};
use crate::error::SinkError;
use crate::record::{CanonicalRecord, Payload};

pub const KEYWORD_HEADERS: [&str; 2] = ["keyword", "top_n"];
pub const ASIN_LIST_HEADERS: [&str; 3] = ["asin", "memo", "enabled"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column layout of an output worksheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Ranking,
    Products,
    Messages,
}

impl Layout {
    pub fn headers(&self) -> &'static [&'static str] {
        match self {
            Layout::Ranking => &[
                "keyword", "rank", "asin", "title", "price", "url", "timestamp", "source",
            ],
            Layout::Products => &[
                "asin",
                "title",
                "price",
                "currency",
                "availability",
                "url",
                "image_url",
                "timestamp",
                "source",
            ],
            Layout::Messages => &[
                "ts", "channel", "user", "text", "permalink", "timestamp", "source",
            ],
        }
    }

    /// Cells in header order. Absent fields become empty cells.
    pub fn row(&self, r: &CanonicalRecord) -> Result<Vec<Value>, String> {
        let ts = Value::Text(r.captured_at.format(TIMESTAMP_FORMAT).to_string());
        let source = Value::Text(r.source.clone());
        match (self, &r.payload) {
            (Layout::Ranking, Payload::Product(p)) => Ok(vec![
                text(&p.keyword),
                Value::Integer(r.rank as i64),
                Value::Text(r.key.clone()),
                text(&p.title),
                price(p.price),
                text(&p.url),
                ts,
                source,
            ]),
            (Layout::Products, Payload::Product(p)) => Ok(vec![
                Value::Text(r.key.clone()),
                text(&p.title),
                price(p.price),
                Value::Text(p.currency.clone()),
                Value::Text(p.availability.as_str().to_string()),
                text(&p.url),
                text(&p.image_url),
                ts,
                source,
            ]),
            (Layout::Messages, Payload::Message(m)) => Ok(vec![
                Value::Text(r.key.clone()),
                Value::Text(m.channel.clone()),
                Value::Text(m.user.clone()),
                text(&m.text),
                text(&m.permalink),
                ts,
                source,
            ]),
            (layout, _) => Err(format!("{:?} worksheet cannot hold record {}", layout, r.key)),
        }
    }
}

fn text(v: &Option<String>) -> Value {
    Value::Text(v.clone().unwrap_or_default())
}

fn price(v: Option<u64>) -> Value {
    match v.and_then(|p| i64::try_from(p).ok()) {
        Some(p) => Value::Integer(p),
        None => Value::Text(String::new()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn cell_to_string(v: Value) -> String {
    match v {
        Value::Null | Value::Blob(_) => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s,
    }
}

/// Local stand-in for a spreadsheet: one SQLite table per worksheet, columns
/// named after the header row, plus a hidden `_row` ordinal.
pub struct Workbook {
    conn: Connection,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                SinkError::Destination(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, SinkError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn exists(&self, worksheet: &str) -> Result<bool, SinkError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [worksheet],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Creates the worksheet with `headers` when missing. An existing sheet is
    /// left as it is, whatever its columns. Returns whether it was created.
    pub fn ensure_worksheet(&self, worksheet: &str, headers: &[&str]) -> Result<bool, SinkError> {
        if self.exists(worksheet)? {
            return Ok(false);
        }
        let cols: Vec<String> = headers.iter().map(|h| format!("{} TEXT", quote_ident(h))).collect();
        self.conn.execute_batch(&format!(
            "CREATE TABLE {} (_row INTEGER PRIMARY KEY, {});",
            quote_ident(worksheet),
            cols.join(", ")
        ))?;
        info!("Provisioned worksheet {} ({})", worksheet, headers.join(", "));
        Ok(true)
    }

    pub fn headers(&self, worksheet: &str) -> Result<Vec<String>, SinkError> {
        if !self.exists(worksheet)? {
            return Err(SinkError::MissingWorksheet(worksheet.to_string()));
        }
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(worksheet)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names.into_iter().filter(|n| n != "_row").collect())
    }

    /// Row-by-row insert inside one transaction; a failing row is counted and
    /// the rest continue.
    pub fn append_rows(
        &self,
        worksheet: &str,
        headers: &[&str],
        rows: &[Result<Vec<Value>, String>],
    ) -> Result<AppendReport, SinkError> {
        let mut report = AppendReport::default();
        let cols: Vec<String> = headers.iter().map(|h| quote_ident(h)).collect();
        let placeholders: Vec<String> = (1..=headers.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(worksheet),
            cols.join(", "),
            placeholders.join(", ")
        );

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = match tx.prepare(&sql) {
                Ok(s) => s,
                Err(e) => {
                    // Sheet exists with other columns; nothing can land.
                    warn!("{}: cannot append ({})", worksheet, e);
                    report.failed = rows.len();
                    return Ok(report);
                }
            };
            for row in rows {
                let outcome = match row {
                    Ok(cells) => stmt
                        .execute(rusqlite::params_from_iter(cells.iter()))
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.clone()),
                };
                match outcome {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        warn!("{}: row skipped: {}", worksheet, e);
                        report.failed += 1;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }

    /// All rows as header → cell text, in insertion order.
    pub fn read_rows(&self, worksheet: &str) -> Result<Vec<HashMap<String, String>>, SinkError> {
        let headers = self.headers(worksheet)?;
        let (_, rows) = self.select(worksheet, &headers, None)?;
        Ok(rows
            .into_iter()
            .map(|cells| headers.iter().cloned().zip(cells).collect())
            .collect())
    }

    /// Last `limit` rows, oldest first.
    pub fn tail(
        &self,
        worksheet: &str,
        limit: usize,
    ) -> Result<(Vec<String>, Vec<Vec<String>>), SinkError> {
        let headers = self.headers(worksheet)?;
        self.select(worksheet, &headers, Some(limit))
    }

    fn select(
        &self,
        worksheet: &str,
        headers: &[String],
        tail: Option<usize>,
    ) -> Result<(Vec<String>, Vec<Vec<String>>), SinkError> {
        let cols: Vec<String> = headers.iter().map(|h| quote_ident(h)).collect();
        let sql = match tail {
            Some(n) => format!(
                "SELECT * FROM (SELECT _row, {cols} FROM {ws} ORDER BY _row DESC LIMIT {n}) ORDER BY _row",
                cols = cols.join(", "),
                ws = quote_ident(worksheet),
                n = n
            ),
            None => format!(
                "SELECT _row, {} FROM {} ORDER BY _row",
                cols.join(", "),
                quote_ident(worksheet)
            ),
        };
        let width = headers.len();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                (1..=width)
                    .map(|i| row.get::<_, Value>(i).map(cell_to_string))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((headers.to_vec(), rows))
    }

    /// `(worksheet, row count)` for every sheet, by name.
    pub fn worksheets(&self) -> Result<Vec<(String, usize)>, SinkError> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for name in names {
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(&name)),
                [],
                |r| r.get(0),
            )?;
            out.push((name, count as usize));
        }
        Ok(out)
    }
}

/// Appends canonical records to one worksheet of a [`Workbook`].
pub struct SheetSink<'a> {
    book: &'a Workbook,
    worksheet: String,
    layout: Layout,
}

impl<'a> SheetSink<'a> {
    pub fn new(book: &'a Workbook, worksheet: impl Into<String>, layout: Layout) -> Self {
        Self {
            book,
            worksheet: worksheet.into(),
            layout,
        }
    }
}

impl Sink for SheetSink<'_> {
    async fn append(&mut self, records: &[CanonicalRecord]) -> Result<AppendReport, SinkError> {
        let headers = self.layout.headers();
        self.book.ensure_worksheet(&self.worksheet, headers)?;
        let rows: Vec<_> = records.iter().map(|r| self.layout.row(r)).collect();
        self.book.append_rows(&self.worksheet, headers, &rows)
    }
}
