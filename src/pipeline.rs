use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MAX_CONCURRENCY;
use crate::db::ArticleStore;
use crate::fetcher::PageFetcher;
use crate::ingest::{BatchIngestor, IngestCounts};
use crate::parser;
use crate::record::{ArticleRecord, InputKey};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub concurrency: usize,
    pub batch_size: usize,
}

/// What a worker hands to the writer for one key.
enum Outcome {
    Record(ArticleRecord),
    Failed { pmid: i64, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    #[serde(flatten)]
    pub counts: IngestCounts,
    pub flushes: usize,
    pub elapsed: Duration,
    pub flush_time: Duration,
    pub fatal: Option<String>,
}

impl RunSummary {
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn print(&self) {
        println!(
            "Processed {} keys: {} inserted, {} skipped, {} failed.",
            self.total, self.counts.inserted, self.counts.skipped, self.counts.failed
        );
        println!(
            "{} flushes, {:.2}s writing to storage, {} total.",
            self.flushes,
            self.flush_time.as_secs_f64(),
            format_duration(self.elapsed)
        );
        if let Some(reason) = &self.fatal {
            println!("FATAL: {}", reason);
        }
    }
}

/// Fetch, extract and store every key.
///
/// At most `concurrency` keys are in flight: a semaphore permit is taken
/// before a worker is spawned and held until its record is handed to the
/// writer. The writer is this task; it owns the store and the pending batch.
/// Cancelling `cancel` (or a fatal storage error) stops dispatch, lets
/// in-flight workers finish, flushes what is pending and counts the keys
/// never dispatched as failed.
pub async fn run<F, S>(
    keys: Vec<InputKey>,
    fetcher: Arc<F>,
    store: S,
    opts: RunOptions,
    cancel: CancellationToken,
) -> RunSummary
where
    F: PageFetcher + 'static,
    S: ArticleStore,
{
    let started_at = Utc::now();
    let t0 = Instant::now();
    let total = keys.len();
    let concurrency = opts.concurrency.clamp(1, MAX_CONCURRENCY);
    info!(
        "Ingesting {} keys ({} workers, batch size {})",
        total, concurrency, opts.batch_size
    );

    let pb = progress_bar(total);
    let (tx, mut rx) = mpsc::channel::<Outcome>(concurrency.saturating_mul(2));
    let dispatcher = tokio::spawn(dispatch(
        keys,
        fetcher,
        Arc::new(Semaphore::new(concurrency)),
        tx,
        cancel.clone(),
    ));

    let mut ingestor = BatchIngestor::new(store, opts.batch_size);
    while let Some(outcome) = rx.recv().await {
        let result = match outcome {
            Outcome::Record(record) => ingestor.push(record),
            Outcome::Failed { pmid, reason } => {
                ingestor.fail(pmid, &reason);
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("Stopping run: {}", e);
            cancel.cancel();
        }
        pb.inc(1);
    }

    if let Err(e) = dispatcher.await {
        error!("Dispatcher task failed: {}", e);
    }
    if let Err(e) = ingestor.flush() {
        error!("Final flush failed: {}", e);
    }
    pb.finish_and_clear();

    let summary = RunSummary {
        started_at,
        total,
        counts: ingestor.counts(),
        flushes: ingestor.flushes(),
        elapsed: t0.elapsed(),
        flush_time: ingestor.flush_time(),
        fatal: ingestor.fatal().map(str::to_string),
    };
    if summary.counts.total() != total {
        warn!(
            "Outcome count {} does not match {} input keys",
            summary.counts.total(),
            total
        );
    }
    info!(
        "Run finished: {} inserted, {} skipped, {} failed in {:.1}s",
        summary.counts.inserted,
        summary.counts.skipped,
        summary.counts.failed,
        summary.elapsed.as_secs_f64()
    );
    summary
}

async fn dispatch<F: PageFetcher + 'static>(
    keys: Vec<InputKey>,
    fetcher: Arc<F>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<Outcome>,
    cancel: CancellationToken,
) {
    let mut keys = keys.into_iter();
    while let Some(key) = keys.next() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            p = Arc::clone(&semaphore).acquire_owned() => p.ok(),
        };
        let Some(permit) = permit else {
            let remaining = std::iter::once(key).chain(keys.by_ref());
            let mut n = 0;
            for k in remaining {
                n += 1;
                let _ = tx
                    .send(Outcome::Failed {
                        pmid: k.pmid,
                        reason: "cancelled before dispatch".to_string(),
                    })
                    .await;
            }
            warn!("Run cancelled, {} keys not dispatched", n);
            break;
        };

        let fetcher = Arc::clone(&fetcher);
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let pmid = key.pmid;
            let work = tokio::spawn(async move {
                let outcome = fetcher.fetch(key.pmid).await;
                parser::extract(key, outcome)
            });
            let outcome = match work.await {
                Ok(record) => {
                    debug!(pmid, "record ready");
                    Outcome::Record(record)
                }
                Err(e) => Outcome::Failed {
                    pmid,
                    reason: format!("worker failed: {}", e),
                },
            };
            let _ = tx.send(outcome).await;
        });
    }
}

fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})",
    )
    .map(|s| s.progress_chars("=> "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
