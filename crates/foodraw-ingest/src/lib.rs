//! Run orchestration: fetch pages, fingerprint each product, write it once.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use foodraw_adapters::{OffSearchClient, PageSource};
use foodraw_core::RawRecord;
use foodraw_storage::{
    BackoffPolicy, FsRawStore, HttpClientConfig, HttpFetcher, MemoryRawStore, PgRawStore,
    RawStore, TokenBucketConfig, WriteOutcome,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod fetcher;
mod report;

pub use config::{
    ClientIdentity, ConfigError, IngestConfig, RunParams, StoreKind, DEFAULT_DATABASE_URL,
    MAX_PAGE_SIZE,
};
pub use fetcher::{FetchError, FetchPlan, FetchedPage, Fetcher, StopReason};
pub use report::{
    read_checkpoint, write_checkpoint, write_run_report, Checkpoint, CHECKPOINT_FILE,
    RUN_REPORT_FILE,
};

pub const CRATE_NAME: &str = "foodraw-ingest";

/// Per-run state machine.
///
/// `NotStarted -> Fetching -> (per item) Hashing -> Writing -> (Fetching | Done)`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Fetching,
    Hashing,
    Writing,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (NotStarted, Fetching) => true,
            (Fetching, Hashing | Fetching | Done) => true,
            // A rejected item goes straight to the next item or page.
            (Hashing, Writing | Hashing | Fetching | Done) => true,
            (Writing, Hashing | Fetching | Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct RunTracker {
    state: RunState,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            state: RunState::NotStarted,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal run transition {:?} -> {:?}",
            self.state,
            next
        );
        if self.state != next && !matches!(next, RunState::Hashing | RunState::Writing) {
            debug!(from = ?self.state, to = ?next, "run state");
        }
        self.state = next;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched_pages: u32,
    /// Products taken from fetched pages, whatever their outcome.
    pub requested: u64,
    pub inserted: u64,
    pub already_exists: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Fetch,
    Write,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Done {
        reason: StopReason,
        /// Item offset just past the last processed product.
        next_offset: u64,
    },
    Failed {
        cause: FailureCause,
        message: String,
        /// Offset of the first page not fully processed.
        resume_offset: u64,
        last_processed_offset: Option<u64>,
    },
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        match self {
            RunOutcome::Done { .. } => RunState::Done,
            RunOutcome::Failed { .. } => RunState::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub store: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub params: RunParams,
    pub counts: RunCounts,
    pub outcome: RunOutcome,
}

impl IngestRunSummary {
    pub fn is_done(&self) -> bool {
        matches!(self.outcome, RunOutcome::Done { .. })
    }

    pub fn resume_offset(&self) -> Option<u64> {
        match &self.outcome {
            RunOutcome::Failed { resume_offset, .. } => Some(*resume_offset),
            RunOutcome::Done { .. } => None,
        }
    }
}

/// Wall clock that never steps backwards within a run.
#[derive(Debug, Default)]
pub struct RunClock {
    last: Option<DateTime<Utc>>,
}

impl RunClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&mut self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    pub fn observe(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = match self.last {
            Some(last) if at < last => last,
            _ => at,
        };
        self.last = Some(at);
        at
    }
}

pub struct IngestPipeline<S, P> {
    store: S,
    fetcher: Fetcher<P>,
    source_id: String,
}

impl<S: RawStore, P: PageSource> IngestPipeline<S, P> {
    pub fn new(store: S, source: P, policy: BackoffPolicy) -> Self {
        let source_id = source.source_id().to_string();
        Self {
            store,
            fetcher: Fetcher::new(source, policy),
            source_id,
        }
    }

    /// Value recorded as `source` on every record of this pipeline.
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run once. Only invalid parameters are an `Err`; a failed run is an
    /// `Ok` summary whose outcome carries the resume offset.
    pub async fn run(
        &self,
        params: &RunParams,
        cancel: &CancellationToken,
    ) -> Result<IngestRunSummary, ConfigError> {
        params.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest_run", %run_id, source = %self.source_id);
        let (counts, outcome) = self.drive(params, cancel).instrument(span.clone()).await;
        let finished_at = Utc::now().max(started_at);

        span.in_scope(|| match &outcome {
            RunOutcome::Done { reason, .. } => info!(
                ?reason,
                inserted = counts.inserted,
                already_exists = counts.already_exists,
                rejected = counts.rejected,
                "ingest run done"
            ),
            RunOutcome::Failed {
                cause,
                resume_offset,
                message,
                ..
            } => warn!(
                ?cause,
                resume_offset,
                inserted = counts.inserted,
                error = %message,
                "ingest run failed"
            ),
        });

        Ok(IngestRunSummary {
            run_id,
            source: self.source_id.clone(),
            store: self.store.describe(),
            started_at,
            finished_at,
            params: params.clone(),
            counts,
            outcome,
        })
    }

    async fn drive(&self, params: &RunParams, cancel: &CancellationToken) -> (RunCounts, RunOutcome) {
        let mut tracker = RunTracker::new();
        let mut counts = RunCounts::default();
        let mut clock = RunClock::new();
        let mut pages = self.fetcher.pages(FetchPlan::from(params));
        let mut next_offset = params.start_offset;
        let mut last_processed: Option<u64> = None;

        tracker.advance(RunState::Fetching);
        let outcome = 'run: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break 'run cancelled(next_offset, last_processed);
                }
                next = pages.next() => next,
            };
            let page = match next {
                Some(Ok(page)) => page,
                Some(Err(err)) => {
                    break 'run RunOutcome::Failed {
                        cause: FailureCause::Fetch,
                        message: err.to_string(),
                        resume_offset: err.offset,
                        last_processed_offset: last_processed,
                    };
                }
                // The page budget ran out before the limit or upstream did.
                None => {
                    break 'run RunOutcome::Done {
                        reason: StopReason::MaxPages,
                        next_offset,
                    };
                }
            };

            counts.fetched_pages += 1;
            let page_offset = page.request.offset();
            info!(
                page = page.request.page,
                offset = page_offset,
                products = page.products.len(),
                attempts = page.attempts,
                "page fetched"
            );

            let mut processed = 0u64;
            for payload in page.products {
                if cancel.is_cancelled() {
                    break 'run cancelled(page_offset, last_processed);
                }
                let item_offset = page_offset + processed;
                counts.requested += 1;

                tracker.advance(RunState::Hashing);
                let record = match RawRecord::from_payload(&self.source_id, clock.now(), payload) {
                    Ok(record) => record,
                    Err(err) => {
                        counts.rejected += 1;
                        warn!(offset = item_offset, error = %err, "payload rejected");
                        processed += 1;
                        last_processed = Some(item_offset);
                        continue;
                    }
                };

                tracker.advance(RunState::Writing);
                match self.store.insert(&record).await {
                    Ok(WriteOutcome::Inserted) => counts.inserted += 1,
                    Ok(WriteOutcome::AlreadyExists) => {
                        counts.already_exists += 1;
                        debug!(offset = item_offset, raw_hash = %record.raw_hash(), "already stored");
                    }
                    Err(err) if err.is_record_rejection() => {
                        counts.rejected += 1;
                        warn!(offset = item_offset, error = %err, "payload rejected by store");
                    }
                    Err(err) => {
                        break 'run RunOutcome::Failed {
                            cause: FailureCause::Write,
                            message: err.to_string(),
                            resume_offset: page_offset,
                            last_processed_offset: last_processed,
                        };
                    }
                }
                processed += 1;
                last_processed = Some(item_offset);
            }
            next_offset = page_offset + processed;

            if let Some(reason) = page.stop {
                break 'run RunOutcome::Done { reason, next_offset };
            }
            tracker.advance(RunState::Fetching);
        };

        tracker.advance(outcome.state());
        (counts, outcome)
    }
}

fn cancelled(resume_offset: u64, last_processed: Option<u64>) -> RunOutcome {
    RunOutcome::Failed {
        cause: FailureCause::Cancelled,
        message: "run cancelled".to_string(),
        resume_offset,
        last_processed_offset: last_processed,
    }
}

/// Open the store named by `kind`. Postgres runs pending migrations first.
pub async fn build_store(config: &IngestConfig, kind: StoreKind) -> Result<Arc<dyn RawStore>> {
    let store: Arc<dyn RawStore> = match kind {
        StoreKind::Memory => Arc::new(MemoryRawStore::new()),
        StoreKind::Fs => Arc::new(FsRawStore::new(config.raw_dir.clone())),
        StoreKind::Postgres => {
            let store = PgRawStore::connect(&config.database_url, 4)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running raw_products migrations")?;
            Arc::new(store)
        }
    };
    info!(store = %store.describe(), "raw store ready");
    Ok(store)
}

/// Open Food Facts search client paced by `params`.
pub fn build_source(config: &IngestConfig, params: &RunParams) -> Result<OffSearchClient> {
    let token_bucket = (!params.min_interval.is_zero()).then_some(TokenBucketConfig {
        capacity: 1,
        refill_every: params.min_interval,
    });
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: config.user_agent.to_string(),
        concurrency: params.concurrency,
        token_bucket,
    })
    .context("building http client")?;
    Ok(
        OffSearchClient::new(http, config.base_url.clone(), config.source_id.clone())
            .with_category(params.category_en.clone()),
    )
}

/// One full ingestion against Open Food Facts, followed by the run report
/// and checkpoint under `config.reports_dir`.
pub async fn run_ingest<S: RawStore>(
    config: &IngestConfig,
    store: S,
    params: &RunParams,
    cancel: &CancellationToken,
) -> Result<IngestRunSummary> {
    params.validate()?;
    let source = build_source(config, params)?;
    let pipeline = IngestPipeline::new(store, source, config.backoff)
        .with_source_id(config.source_id.clone());
    let summary = pipeline.run(params, cancel).await?;

    write_run_report(&config.reports_dir, &summary).await?;
    write_checkpoint(&config.reports_dir, &Checkpoint::from_summary(&summary)).await?;
    Ok(summary)
}
