use tracing::{debug, info, warn};

use crate::cursor::FileCursorStore;
use crate::dedupe::{deduplicate, TieBreak};
use crate::error::{PipelineError, RecordSkipped};
use crate::fetch::Fetcher;
use crate::normalize::Normalizer;
use crate::record::{CanonicalRecord, Cursor};
use crate::sink::{AppendReport, Sink};

/// Outcome of one run, for the console summary.
#[derive(Debug, Default)]
pub struct RunReport {
    pub since: Cursor,
    pub fetched: usize,
    pub skipped: Vec<RecordSkipped>,
    /// Records handed to the sink after dedupe and `keep`.
    pub written: Vec<CanonicalRecord>,
    pub append: AppendReport,
    /// Value saved to the cursor store, when it moved.
    pub cursor: Option<Cursor>,
}

/// Cursor → fetch → normalize → dedupe → refine → sink → cursor, once per `run`.
pub struct Pipeline<F, N, S> {
    pub fetcher: F,
    pub normalizer: N,
    pub sink: S,
    pub cursor: Option<FileCursorStore>,
    pub tie_break: TieBreak,
    pub keep: Option<usize>,
}

impl<F: Fetcher, N: Normalizer, S: Sink> Pipeline<F, N, S> {
    pub fn new(fetcher: F, normalizer: N, sink: S) -> Self {
        Self {
            fetcher,
            normalizer,
            sink,
            cursor: None,
            tie_break: TieBreak::FirstSeen,
            keep: None,
        }
    }

    pub fn with_cursor(mut self, store: FileCursorStore) -> Self {
        self.cursor = Some(store);
        self
    }

    pub fn tie_break(mut self, tie: TieBreak) -> Self {
        self.tie_break = tie;
        self
    }

    pub fn keep(mut self, n: usize) -> Self {
        self.keep = Some(n);
        self
    }

    pub async fn run(&mut self, source_id: &str, limit: usize) -> Result<RunReport, PipelineError> {
        let since = match &self.cursor {
            Some(store) => store.load().map_err(PipelineError::CursorLoad)?,
            None => Cursor::ZERO,
        };
        debug!("{}: starting from cursor {}", source_id, since);

        let batch = self.fetcher.fetch(source_id, since, limit).await?;
        let mut report = RunReport {
            since,
            fetched: batch.records.len(),
            skipped: batch.skipped,
            ..Default::default()
        };

        let mut records = Vec::with_capacity(batch.records.len());
        for (i, raw) in batch.records.iter().enumerate() {
            match self.normalizer.normalize(raw, i + 1) {
                Ok(r) => records.push(r),
                Err(skip) => {
                    warn!("skipped {}", skip);
                    report.skipped.push(skip);
                }
            }
        }

        let mut records = deduplicate(records, self.tie_break);
        let mut hint = batch.next_cursor_hint;
        if let Some(n) = self.keep.filter(|n| records.len() > *n) {
            // Dropped records must not be skipped past
            records.truncate(n);
            hint = None;
        }
        self.fetcher.refine(&mut records).await;
        info!(
            "{}: fetched {}, {} after dedupe, {} skipped",
            source_id,
            report.fetched,
            records.len(),
            report.skipped.len()
        );

        if !records.is_empty() {
            report.append = self.sink.append(&records).await?;
        }

        let Some(store) = &self.cursor else {
            report.written = records;
            return Ok(report);
        };

        if report.append.succeeded == 0 && report.append.failed > 0 {
            warn!("{}: every append failed, cursor stays at {}", source_id, since);
            report.written = records;
            return Ok(report);
        }

        let next = records
            .iter()
            .map(|r| r.position)
            .chain(hint)
            .fold(since, Cursor::max);
        if next > since {
            store.save(next).map_err(PipelineError::CursorPersistence)?;
            info!("{}: cursor {} -> {}", source_id, since, next);
            report.cursor = Some(next);
        }
        report.written = records;
        Ok(report)
    }
}
