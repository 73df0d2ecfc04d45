pub mod line;
pub mod sheet;

use tracing::warn;

use crate::error::SinkError;
use crate::record::CanonicalRecord;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppendReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Records written with shortened text.
    pub truncated: usize,
}

/// Best-effort batch append. `Err` means the destination as a whole is
/// unusable; a single bad record only bumps `failed`.
#[allow(async_fn_in_trait)]
pub trait Sink {
    async fn append(&mut self, records: &[CanonicalRecord]) -> Result<AppendReport, SinkError>;
}

/// Writes to `primary`, then copies the batch to `archive`. Only the primary
/// outcome is reported; archive problems are logged.
pub struct Tee<P, A> {
    pub primary: P,
    pub archive: A,
}

impl<P: Sink, A: Sink> Sink for Tee<P, A> {
    async fn append(&mut self, records: &[CanonicalRecord]) -> Result<AppendReport, SinkError> {
        let report = self.primary.append(records).await?;
        match self.archive.append(records).await {
            Ok(r) if r.failed > 0 => warn!("archive: {} of {} rows failed", r.failed, records.len()),
            Ok(_) => {}
            Err(e) => warn!("archive unavailable: {}", e),
        }
        Ok(report)
    }
}
