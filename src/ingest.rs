use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::{ArticleStore, StoreError};
use crate::record::{ArticleRecord, PageStatus};

/// Why a record was kept out of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFetched(String),
    MissingTitle,
    MissingAbstract,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotFetched(why) => write!(f, "page not fetched ({})", why),
            SkipReason::MissingTitle => write!(f, "title not found"),
            SkipReason::MissingAbstract => write!(f, "abstract not found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Accepted,
    Skipped(SkipReason),
}

/// A record may be stored only if both title and abstract were found.
pub fn gate(record: &ArticleRecord) -> Acceptance {
    match &record.page {
        PageStatus::Fetched => {}
        PageStatus::NotFound { status } => {
            return Acceptance::Skipped(SkipReason::NotFetched(format!("HTTP {}", status)))
        }
        PageStatus::Transport(reason) => {
            return Acceptance::Skipped(SkipReason::NotFetched(reason.clone()))
        }
    }
    if record.title.is_none() {
        Acceptance::Skipped(SkipReason::MissingTitle)
    } else if record.abstract_text.is_none() {
        Acceptance::Skipped(SkipReason::MissingAbstract)
    } else {
        Acceptance::Accepted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl IngestCounts {
    pub fn total(&self) -> usize {
        self.inserted + self.skipped + self.failed
    }
}

/// Single owner of the pending batch and the store.
///
/// Every record handed in ends up in exactly one of the three counters.
/// After a fatal storage error nothing else is written and later records
/// are counted as failed.
pub struct BatchIngestor<S: ArticleStore> {
    store: S,
    batch_size: usize,
    pending: Vec<ArticleRecord>,
    counts: IngestCounts,
    flushes: usize,
    flush_time: Duration,
    fatal: Option<String>,
}

impl<S: ArticleStore> BatchIngestor<S> {
    pub fn new(store: S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        BatchIngestor {
            store,
            batch_size,
            pending: Vec::with_capacity(batch_size.min(1024)),
            counts: IngestCounts::default(),
            flushes: 0,
            flush_time: Duration::ZERO,
            fatal: None,
        }
    }

    /// Gate one record and queue it, flushing when the batch is full.
    /// Returns the error of a flush that lost the store.
    pub fn push(&mut self, record: ArticleRecord) -> Result<(), StoreError> {
        if let Acceptance::Skipped(reason) = gate(&record) {
            debug!(pmid = record.pmid, "skipped: {}", reason);
            self.counts.skipped += 1;
            return Ok(());
        }
        if self.fatal.is_some() {
            self.counts.failed += 1;
            return Ok(());
        }
        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Count a key that never produced a record (cancelled, worker died).
    pub fn fail(&mut self, pmid: i64, reason: &str) {
        warn!("pmid {} failed: {}", pmid, reason);
        self.counts.failed += 1;
    }

    /// Write the pending batch, if any.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        if self.fatal.is_some() {
            self.counts.failed += batch.len();
            return Ok(());
        }

        let t0 = Instant::now();
        let result = self.store.upsert_batch(&batch);
        self.flush_time += t0.elapsed();
        self.flushes += 1;

        match result {
            Ok(report) => {
                self.counts.inserted += report.written;
                self.counts.failed += report.rejected.len();
                info!(
                    "Flushed batch {} ({} written, {} rejected)",
                    self.flushes,
                    report.written,
                    report.rejected.len()
                );
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("Batch {} lost, storage unavailable: {}", self.flushes, e);
                self.counts.failed += batch.len();
                self.fatal = Some(e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!("Batch {} of {} rows not committed: {}", self.flushes, batch.len(), e);
                self.counts.failed += batch.len();
                Ok(())
            }
        }
    }

    /// Gate, batch and write a whole sequence of records.
    pub fn ingest<I>(&mut self, records: I) -> Result<IngestCounts, StoreError>
    where
        I: IntoIterator<Item = ArticleRecord>,
    {
        let mut first_fatal = None;
        for record in records {
            if let Err(e) = self.push(record) {
                first_fatal.get_or_insert(e);
            }
        }
        if let Err(e) = self.flush() {
            first_fatal.get_or_insert(e);
        }
        match first_fatal {
            Some(e) => Err(e),
            None => Ok(self.counts),
        }
    }

    pub fn counts(&self) -> IngestCounts {
        self.counts
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn flush_time(&self) -> Duration {
        self.flush_time
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn into_store(self) -> S {
        self.store
    }
}
