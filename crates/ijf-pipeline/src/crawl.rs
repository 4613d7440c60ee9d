//! Crawl scheduler: drains discovery stubs oldest-first through the
//! board crawlers, with bounded concurrency and a run deadline.

use std::sync::Arc;

use async_trait::async_trait;
use ijf_adapters::boards::{self, CrawlOutcome};
use ijf_adapters::html::clean_html;
use ijf_core::{CanonicalJob, CrawlStatus, IngestError, RunResult, Stage, StoredJob};
use ijf_enrich::{apply_facts, EnrichInput, FallbackChain, MIN_DESCRIPTION_LEN};
use ijf_store::{HttpFetcher, JobStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::upsert::{Outcome, UpsertEngine};

/// Seam over the board crawl so the scheduler can be tested without a
/// network.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn crawl(&self, stub: &CanonicalJob) -> Result<CrawlOutcome, IngestError>;
}

/// Production crawler: board API first, JSON-LD fallback inside, and an
/// optional AI pass over raw page text when structured extraction fails.
pub struct BoardCrawler {
    http: Arc<HttpFetcher>,
    run_id: Uuid,
    chain: Option<Arc<FallbackChain>>,
}

impl BoardCrawler {
    pub fn new(http: Arc<HttpFetcher>, run_id: Uuid, chain: Option<Arc<FallbackChain>>) -> Self {
        Self { http, run_id, chain }
    }

    /// Last resort: fetch the page, strip markup, and let the model
    /// structure what the board-specific parsers could not.
    async fn ai_fallback(&self, stub: &CanonicalJob) -> Result<CrawlOutcome, IngestError> {
        let Some(chain) = &self.chain else {
            return Err(IngestError::Parse(format!(
                "no structured extraction for {}",
                stub.apply_url
            )));
        };
        let response = self
            .http
            .get(self.run_id, stub.source.as_str(), &stub.apply_url, &[])
            .await?;
        let text = clean_html(&String::from_utf8_lossy(&response.body));
        if text.len() < MIN_DESCRIPTION_LEN {
            return Err(IngestError::Parse(format!(
                "page text too short for extraction: {}",
                stub.apply_url
            )));
        }

        let input = EnrichInput {
            title: stub.title.clone(),
            organization: stub.organization_name.clone(),
            description: text.clone(),
        };
        let facts = chain.extract(&input).await?;
        let mut job = stub.clone();
        job.description = Some(text);
        apply_facts(&mut job, &facts);
        job.crawl_status = Some(CrawlStatus::Crawled);
        Ok(CrawlOutcome::Updated(Box::new(job)))
    }
}

#[async_trait]
impl Crawler for BoardCrawler {
    async fn crawl(&self, stub: &CanonicalJob) -> Result<CrawlOutcome, IngestError> {
        match boards::crawl(&self.http, self.run_id, stub).await {
            Err(IngestError::Parse(reason)) => {
                warn!(url = %stub.apply_url, %reason, "structured crawl failed, trying ai fallback");
                self.ai_fallback(stub).await
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlOptions {
    /// Run id shared with the crawler so its request spans and the
    /// returned summary tell one story.
    pub run_id: Uuid,
    pub limit: usize,
    pub dry_run: bool,
    pub concurrency: usize,
}

enum ItemResult {
    Upserted(Outcome),
    Gone,
    Failed(IngestError),
    DeadlineSkipped,
}

/// One scheduler pass. Records beyond `deadline` are left untouched for
/// the next run; everything else flips to `Crawled` or `Failed`.
pub async fn run_crawl(
    store: Arc<dyn JobStore>,
    crawler: Arc<dyn Crawler>,
    options: CrawlOptions,
    deadline: Option<Instant>,
) -> Result<RunResult, IngestError> {
    let mut fragment = RunResult::start(options.dry_run);
    fragment.run_id = options.run_id;
    let stubs = store.list_discovered(options.limit).await?;
    if stubs.is_empty() {
        return Ok(fragment.finish());
    }
    info!(count = stubs.len(), limit = options.limit, "crawl pass starting");

    let engine = Arc::new(UpsertEngine::new(Arc::clone(&store), options.dry_run));
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for stub in stubs {
        let store = Arc::clone(&store);
        let crawler = Arc::clone(&crawler);
        let engine = Arc::clone(&engine);
        let semaphore = Arc::clone(&semaphore);
        let dry_run = options.dry_run;
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return (stub, ItemResult::DeadlineSkipped);
            }
            let result = crawl_one(&store, crawler.as_ref(), &engine, &stub, dry_run).await;
            (stub, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let Ok((stub, result)) = joined else {
            fragment.record_error(Stage::Crawl, None, "crawl task panicked");
            fragment.crawl_failed += 1;
            continue;
        };
        match result {
            ItemResult::Upserted(outcome) => {
                fragment.fetched += 1;
                match outcome {
                    Outcome::Created => fragment.created += 1,
                    Outcome::Updated => fragment.updated += 1,
                    Outcome::Skipped => fragment.skipped_duplicate += 1,
                }
            }
            ItemResult::Gone => {
                fragment.crawl_failed += 1;
                fragment.deactivated += 1;
            }
            ItemResult::Failed(err) => {
                fragment.crawl_failed += 1;
                fragment.record_error(
                    Stage::Crawl,
                    Some(stub.job.source.as_str()),
                    err.to_string(),
                );
            }
            ItemResult::DeadlineSkipped => {}
        }
    }

    Ok(fragment.finish())
}

async fn crawl_one(
    store: &Arc<dyn JobStore>,
    crawler: &dyn Crawler,
    engine: &UpsertEngine,
    stub: &StoredJob,
    dry_run: bool,
) -> ItemResult {
    match crawler.crawl(&stub.job).await {
        Ok(CrawlOutcome::Updated(job)) => match engine.upsert(*job).await {
            Ok(outcome) => ItemResult::Upserted(outcome),
            Err(err) => ItemResult::Failed(err),
        },
        Ok(CrawlOutcome::Gone) => {
            // The posting disappeared upstream; retire the stub.
            if !dry_run {
                if let Err(err) = mark_failed(store, stub).await {
                    return ItemResult::Failed(err);
                }
                if let Err(err) = store.set_active(stub.id, false).await {
                    return ItemResult::Failed(err);
                }
            }
            ItemResult::Gone
        }
        Err(err) => {
            warn!(url = %stub.job.apply_url, error = %err, "crawl failed");
            if !dry_run {
                if let Err(mark_err) = mark_failed(store, stub).await {
                    return ItemResult::Failed(mark_err);
                }
            }
            ItemResult::Failed(err)
        }
    }
}

async fn mark_failed(store: &Arc<dyn JobStore>, stub: &StoredJob) -> Result<(), IngestError> {
    let mut record = stub.clone();
    record.job.crawl_status = Some(CrawlStatus::Failed);
    store.update(record).await.map(|_| ())
}
