pub mod amazon;
pub mod slack;

use crate::error::{RecordSkipped, SourceError};
use crate::record::{CanonicalRecord, Cursor, RawRecord};

/// Records newer than the requested cursor, in source order.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub records: Vec<RawRecord>,
    /// Largest position the source reported, when it has one.
    pub next_cursor_hint: Option<Cursor>,
    pub skipped: Vec<RecordSkipped>,
}

#[allow(async_fn_in_trait)]
pub trait Fetcher {
    /// Safe to call repeatedly with the same arguments; the only side effect is
    /// the network traffic.
    async fn fetch(
        &mut self,
        source_id: &str,
        since: Cursor,
        limit: usize,
    ) -> Result<FetchBatch, SourceError>;

    /// Second look at the deduplicated records that are about to be written.
    async fn refine(&mut self, _records: &mut [CanonicalRecord]) {}
}
