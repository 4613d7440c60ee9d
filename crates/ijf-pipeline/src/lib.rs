//! Run orchestration: aggregator import, web-search discovery, board
//! crawl, and retention sweep, composed into one fault-isolated run.

pub mod config;
pub mod crawl;
pub mod sweep;
pub mod upsert;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ijf_adapters::discovery::{
    board_queries, stub_from_hit, GoogleCseBackend, SearchBackend, SerperBackend,
};
use ijf_adapters::eighty_thousand::{EightyThousandAdapter, EightyThousandConfig};
use ijf_adapters::reliefweb::{ReliefWebAdapter, ReliefWebConfig};
use ijf_adapters::{AdapterContext, Aggregator};
use ijf_core::{CanonicalJob, EnrichmentStatus, IngestError, RunResult, Source, Stage, IMPACT_AREAS};
use ijf_enrich::{enrich_batch, FallbackChain};
use ijf_store::{HttpClientConfig, HttpFetcher, JobStore};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{PipelineConfig, SourceRegistry};
pub use crawl::{BoardCrawler, CrawlOptions, Crawler};
pub use ijf_enrich::ProviderKind;
pub use upsert::{Outcome, UpsertEngine};

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub source: Option<Source>,
    pub limit: Option<usize>,
    pub new_only: bool,
    pub dry_run: bool,
    pub use_ai: bool,
    /// Pin enrichment to one provider instead of the cheapest-first chain.
    pub provider: Option<ProviderKind>,
    /// Override the configured enrichment batch size for this run.
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    #[default]
    Auto,
    GoogleCse,
    Serper,
}

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub board: Option<Source>,
    pub num_results: usize,
    pub backend: BackendChoice,
    pub dry_run: bool,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            board: None,
            num_results: 100,
            backend: BackendChoice::Auto,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub limit: Option<usize>,
    pub crawl_limit: usize,
    pub num_results: usize,
    pub new_only: bool,
    pub use_ai: bool,
    pub provider: Option<ProviderKind>,
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: None,
            crawl_limit: 50,
            num_results: 100,
            new_only: false,
            use_ai: false,
            provider: None,
            dry_run: false,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: SourceRegistry,
    store: Arc<dyn JobStore>,
    http: Arc<HttpFetcher>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn JobStore>) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            min_interval: config.min_interval,
            request_budget: config.request_budget,
            ..Default::default()
        })?;
        let registry = SourceRegistry::load_or_default(&config.sources_file);
        Ok(Self {
            config,
            registry,
            store,
            http: Arc::new(http),
        })
    }

    pub fn with_registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    fn deadline_instant(&self) -> Option<Instant> {
        self.config.deadline.map(|d| Instant::now() + d)
    }

    fn enrich_chain(
        &self,
        provider: Option<ProviderKind>,
    ) -> Result<Arc<FallbackChain>, IngestError> {
        let chain = match provider {
            Some(kind) => FallbackChain::pinned(kind, self.provider_key(kind)),
            None => FallbackChain::from_keys(
                self.config.deepseek_api_key.clone(),
                self.config.groq_api_key.clone(),
                self.config.mistral_api_key.clone(),
            ),
        }?;
        Ok(Arc::new(chain))
    }

    fn provider_key(&self, kind: ProviderKind) -> Option<String> {
        match kind {
            ProviderKind::DeepSeek => self.config.deepseek_api_key.clone(),
            ProviderKind::Groq => self.config.groq_api_key.clone(),
            ProviderKind::Mistral => self.config.mistral_api_key.clone(),
        }
    }

    fn aggregators(
        &self,
        filter: Option<Source>,
    ) -> Result<Vec<Box<dyn Aggregator>>, IngestError> {
        if let Some(source) = filter {
            if source.is_board() {
                return Err(IngestError::Config(format!(
                    "{source} is a crawl board, not an aggregator source"
                )));
            }
        }

        let mut adapters: Vec<Box<dyn Aggregator>> = Vec::new();
        if self.registry.is_enabled(Source::EightyThousandHours.as_str()) {
            match (&self.config.algolia_app_id, &self.config.algolia_api_key) {
                (Some(app_id), Some(api_key)) => {
                    adapters.push(Box::new(EightyThousandAdapter::new(EightyThousandConfig {
                        app_id: app_id.clone(),
                        api_key: api_key.clone(),
                    })));
                }
                _ if filter == Some(Source::EightyThousandHours) => {
                    return Err(IngestError::Config(
                        "80000hours requested but algolia credentials are missing".into(),
                    ));
                }
                _ => warn!("algolia credentials missing, skipping 80000hours"),
            }
        }
        if self.registry.is_enabled(Source::ReliefWeb.as_str()) {
            adapters.push(Box::new(ReliefWebAdapter::new(ReliefWebConfig {
                app_name: self.config.reliefweb_app_name.clone(),
            })));
        }

        let adapters: Vec<_> = adapters
            .into_iter()
            .filter(|a| filter.map_or(true, |s| a.source() == s))
            .collect();
        if adapters.is_empty() {
            return Err(IngestError::Config(
                "no aggregator sources enabled".into(),
            ));
        }
        Ok(adapters)
    }

    fn search_backend(
        &self,
        choice: BackendChoice,
    ) -> Result<Box<dyn SearchBackend>, IngestError> {
        let google = match (&self.config.google_cse_api_key, &self.config.google_cse_cx) {
            (Some(api_key), Some(cx)) => Some(GoogleCseBackend {
                api_key: api_key.clone(),
                cx: cx.clone(),
                date_binning: true,
            }),
            _ => None,
        };
        let serper = self.config.serper_api_key.clone().map(|api_key| SerperBackend { api_key });

        match choice {
            BackendChoice::GoogleCse => google
                .map(|b| Box::new(b) as Box<dyn SearchBackend>)
                .ok_or_else(|| IngestError::Config("google cse credentials missing".into())),
            BackendChoice::Serper => serper
                .map(|b| Box::new(b) as Box<dyn SearchBackend>)
                .ok_or_else(|| IngestError::Config("serper api key missing".into())),
            BackendChoice::Auto => {
                if let Some(backend) = google {
                    Ok(Box::new(backend))
                } else if let Some(backend) = serper {
                    Ok(Box::new(backend))
                } else {
                    Err(IngestError::Config("no search backend configured".into()))
                }
            }
        }
    }

    /// Stage 1: aggregator import.
    pub async fn import_aggregators(
        &self,
        opts: &ImportOptions,
    ) -> Result<RunResult, IngestError> {
        self.import_aggregators_inner(opts, self.deadline_instant())
            .await
    }

    async fn import_aggregators_inner(
        &self,
        opts: &ImportOptions,
        deadline: Option<Instant>,
    ) -> Result<RunResult, IngestError> {
        let mut fragment = RunResult::start(opts.dry_run);
        let adapters = self.aggregators(opts.source)?;
        let chain = if opts.use_ai {
            Some(self.enrich_chain(opts.provider)?)
        } else {
            None
        };
        let batch_size = opts.batch_size.unwrap_or(self.config.enrich_batch_size);
        if !opts.dry_run {
            self.store.seed_categories(IMPACT_AREAS).await?;
        }

        let engine = UpsertEngine::new(Arc::clone(&self.store), opts.dry_run);
        for adapter in adapters {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(source = %adapter.source(), "run deadline reached, skipping source");
                continue;
            }
            let source = adapter.source();
            let span = info_span!("aggregator", source = %source, run_id = %fragment.run_id);
            let ctx = AdapterContext::new(fragment.run_id, opts.limit);
            match adapter.fetch(&self.http, &ctx).instrument(span).await {
                Ok(jobs) => {
                    fragment.fetched += jobs.len() as u64;
                    import_batch(
                        &self.store,
                        &engine,
                        chain.as_ref(),
                        opts.new_only,
                        batch_size,
                        jobs,
                        &mut fragment,
                    )
                    .await;
                }
                Err(err) => {
                    warn!(source = %source, error = %err, "aggregator fetch failed");
                    fragment.record_error(Stage::Aggregators, Some(source.as_str()), err.to_string());
                }
            }
        }
        Ok(fragment.finish())
    }

    /// Stage 2: web-search discovery of board posting URLs.
    pub async fn import_discovery(
        &self,
        opts: &DiscoverOptions,
    ) -> Result<RunResult, IngestError> {
        self.import_discovery_inner(opts, self.deadline_instant())
            .await
    }

    async fn import_discovery_inner(
        &self,
        opts: &DiscoverOptions,
        deadline: Option<Instant>,
    ) -> Result<RunResult, IngestError> {
        let mut fragment = RunResult::start(opts.dry_run);
        let backend = self.search_backend(opts.backend)?;
        let engine = UpsertEngine::new(Arc::clone(&self.store), opts.dry_run);
        let mut seen: HashSet<String> = HashSet::new();

        for (board, query) in board_queries() {
            if opts.board.is_some_and(|b| b != board) {
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(%board, "run deadline reached, skipping board query");
                continue;
            }
            let hits = match backend
                .search(&self.http, fragment.run_id, &query, opts.num_results)
                .await
            {
                Ok(hits) => hits,
                Err(err) => {
                    warn!(%board, backend = backend.name(), error = %err, "search failed");
                    fragment.record_error(Stage::Discovery, Some(board.as_str()), err.to_string());
                    continue;
                }
            };
            info!(%board, backend = backend.name(), hits = hits.len(), "search returned");

            for hit in &hits {
                let Some(stub) = stub_from_hit(hit) else { continue };
                if !seen.insert(stub.apply_url.clone()) {
                    continue;
                }
                fragment.fetched += 1;
                match self.store.find_by_identity(&stub.identity_key()).await {
                    Ok(Some(_)) => fragment.skipped_duplicate += 1,
                    Ok(None) => match engine.upsert(stub).await {
                        Ok(Outcome::Created) => fragment.created += 1,
                        Ok(Outcome::Updated) => fragment.updated += 1,
                        Ok(Outcome::Skipped) => fragment.skipped_duplicate += 1,
                        Err(err) => {
                            fragment.record_error(
                                Stage::Discovery,
                                Some(board.as_str()),
                                err.to_string(),
                            );
                        }
                    },
                    Err(err) => {
                        fragment.record_error(
                            Stage::Discovery,
                            Some(board.as_str()),
                            err.to_string(),
                        );
                    }
                }
            }
        }
        Ok(fragment.finish())
    }

    /// Stage 3: crawl discovery stubs through the board APIs.
    pub async fn crawl(
        &self,
        limit: usize,
        use_ai: bool,
        provider: Option<ProviderKind>,
        dry_run: bool,
    ) -> Result<RunResult, IngestError> {
        self.crawl_inner(limit, use_ai, provider, dry_run, self.deadline_instant())
            .await
    }

    async fn crawl_inner(
        &self,
        limit: usize,
        use_ai: bool,
        provider: Option<ProviderKind>,
        dry_run: bool,
        deadline: Option<Instant>,
    ) -> Result<RunResult, IngestError> {
        let chain = if use_ai {
            Some(self.enrich_chain(provider)?)
        } else {
            None
        };
        let run_id = Uuid::new_v4();
        let crawler = Arc::new(BoardCrawler::new(Arc::clone(&self.http), run_id, chain));
        crawl::run_crawl(
            Arc::clone(&self.store),
            crawler,
            CrawlOptions {
                run_id,
                limit,
                dry_run,
                concurrency: self.config.crawl_concurrency,
            },
            deadline,
        )
        .await
    }

    /// Stage 4: retention sweep.
    pub async fn cleanup(&self, days: i64, dry_run: bool) -> Result<RunResult, IngestError> {
        sweep::run_sweep(Arc::clone(&self.store), days, dry_run).await
    }

    /// Full four-stage run. Stage failures are recorded, never fatal; the
    /// sweep runs even when every source is down.
    pub async fn run_all(&self, opts: &RunOptions) -> RunResult {
        let mut total = RunResult::start(opts.dry_run);
        let deadline = self.deadline_instant();
        info!(run_id = %total.run_id, dry_run = opts.dry_run, "pipeline run starting");

        let import_opts = ImportOptions {
            source: None,
            limit: opts.limit,
            new_only: opts.new_only,
            dry_run: opts.dry_run,
            use_ai: opts.use_ai,
            provider: opts.provider,
            batch_size: None,
        };
        match self.import_aggregators_inner(&import_opts, deadline).await {
            Ok(fragment) => total.absorb(fragment),
            Err(err) => total.record_error(Stage::Aggregators, None, err.to_string()),
        }

        let discover_opts = DiscoverOptions {
            board: None,
            num_results: opts.num_results,
            backend: BackendChoice::Auto,
            dry_run: opts.dry_run,
        };
        match self.import_discovery_inner(&discover_opts, deadline).await {
            Ok(fragment) => total.absorb(fragment),
            Err(err) => total.record_error(Stage::Discovery, None, err.to_string()),
        }

        match self
            .crawl_inner(opts.crawl_limit, opts.use_ai, opts.provider, opts.dry_run, deadline)
            .await
        {
            Ok(fragment) => total.absorb(fragment),
            Err(err) => total.record_error(Stage::Crawl, None, err.to_string()),
        }

        match self.cleanup(self.config.staleness_days, opts.dry_run).await {
            Ok(fragment) => total.absorb(fragment),
            Err(err) => total.record_error(Stage::Cleanup, None, err.to_string()),
        }

        let total = total.finish();
        info!(
            run_id = %total.run_id,
            fetched = total.fetched,
            created = total.created,
            updated = total.updated,
            skipped = total.skipped_duplicate,
            crawl_failed = total.crawl_failed,
            deactivated = total.deactivated,
            errors = total.errors.len(),
            "pipeline run finished"
        );
        total
    }
}

/// Shared post-fetch path for aggregator batches: new-only filtering,
/// optional AI enrichment, then upsert with per-item fault isolation.
async fn import_batch(
    store: &Arc<dyn JobStore>,
    engine: &UpsertEngine,
    chain: Option<&Arc<FallbackChain>>,
    new_only: bool,
    batch_size: usize,
    jobs: Vec<CanonicalJob>,
    fragment: &mut RunResult,
) {
    let mut pending = Vec::with_capacity(jobs.len());
    for job in jobs {
        if new_only && already_enriched(store, &job).await {
            fragment.skipped_duplicate += 1;
            continue;
        }
        pending.push(job);
    }

    let pending = if let Some(chain) = chain {
        let (enriched, stats) = enrich_batch(Arc::clone(chain), pending, batch_size).await;
        fragment.enrichment_failed += stats.failed;
        enriched
    } else {
        pending
    };

    for job in pending {
        let source = job.source;
        match engine.upsert(job).await {
            Ok(Outcome::Created) => fragment.created += 1,
            Ok(Outcome::Updated) => fragment.updated += 1,
            Ok(Outcome::Skipped) => fragment.skipped_duplicate += 1,
            Err(err) => {
                fragment.record_error(Stage::Aggregators, Some(source.as_str()), err.to_string());
            }
        }
    }
}

async fn already_enriched(store: &Arc<dyn JobStore>, job: &CanonicalJob) -> bool {
    match store.find_by_identity(&job.identity_key()).await {
        Ok(Some(record)) => record.job.enrichment_status == EnrichmentStatus::Succeeded,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use config::SourceEntry;
    use ijf_store::MemoryJobStore;

    fn disabled_registry() -> SourceRegistry {
        SourceRegistry {
            sources: vec![
                SourceEntry {
                    source_id: "80000hours".into(),
                    enabled: false,
                    notes: None,
                },
                SourceEntry {
                    source_id: "reliefweb".into(),
                    enabled: false,
                    notes: None,
                },
            ],
        }
    }

    fn job(external_id: &str) -> CanonicalJob {
        let mut job = CanonicalJob::new(
            Source::ReliefWeb,
            format!("Role {external_id}"),
            format!("https://reliefweb.int/job/{external_id}"),
        );
        job.external_id = Some(external_id.to_string());
        job
    }

    #[tokio::test]
    async fn new_only_skips_successfully_enriched_records() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let mut enriched = job("done");
        enriched.enrichment_status = EnrichmentStatus::Succeeded;
        store.insert(enriched).await.expect("seed enriched");
        let mut failed = job("retry");
        failed.enrichment_status = EnrichmentStatus::Failed;
        store.insert(failed).await.expect("seed failed");

        let engine = UpsertEngine::new(Arc::clone(&store), false);
        let mut fragment = RunResult::start(false);
        import_batch(
            &store,
            &engine,
            None,
            true,
            10,
            vec![job("done"), job("retry"), job("fresh")],
            &mut fragment,
        )
        .await;

        // "done" is skipped up front; "retry" is revisited; "fresh" is new.
        assert_eq!(fragment.skipped_duplicate, 2);
        assert_eq!(fragment.created, 1);
    }

    #[tokio::test]
    async fn stage_failures_do_not_block_the_sweep() {
        let store = Arc::new(MemoryJobStore::new());
        let mut expired = job("expired");
        expired.expires_at = Some(Utc::now() - ChronoDuration::days(1));
        store.insert(expired).await.expect("seed");

        let pipeline = Pipeline::new(PipelineConfig::bare(), store.clone())
            .expect("pipeline")
            .with_registry(disabled_registry());
        let result = pipeline.run_all(&RunOptions::default()).await;

        // Aggregators and discovery both fail on configuration; the sweep
        // still retires the expired record.
        assert!(result.errors.len() >= 2);
        assert_eq!(result.deactivated, 1);
        assert!(result.finished_at.is_some());
        assert!(!store.snapshot().await[0].is_active);
    }

    #[tokio::test]
    async fn dry_run_full_pipeline_leaves_the_store_unchanged() {
        let store = Arc::new(MemoryJobStore::new());
        let mut expired = job("expired");
        expired.expires_at = Some(Utc::now() - ChronoDuration::days(1));
        store.insert(expired).await.expect("seed");

        let pipeline = Pipeline::new(PipelineConfig::bare(), store.clone())
            .expect("pipeline")
            .with_registry(disabled_registry());
        let opts = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let result = pipeline.run_all(&opts).await;

        assert_eq!(result.deactivated, 1);
        assert!(store.snapshot().await[0].is_active);
    }

    #[tokio::test]
    async fn board_sources_are_rejected_as_aggregators() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = Pipeline::new(PipelineConfig::bare(), store).expect("pipeline");
        let opts = ImportOptions {
            source: Some(Source::Greenhouse),
            ..ImportOptions::default()
        };
        assert!(matches!(
            pipeline.import_aggregators(&opts).await,
            Err(IngestError::Config(_))
        ));
    }

    #[tokio::test]
    async fn pinned_provider_without_key_is_a_config_error() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = Pipeline::new(PipelineConfig::bare(), store).expect("pipeline");
        assert!(matches!(
            pipeline
                .crawl(10, true, Some(ProviderKind::Groq), false)
                .await,
            Err(IngestError::Config(_))
        ));
    }

    #[tokio::test]
    async fn missing_search_backend_is_a_config_error() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = Pipeline::new(PipelineConfig::bare(), store).expect("pipeline");
        assert!(matches!(
            pipeline.import_discovery(&DiscoverOptions::default()).await,
            Err(IngestError::Config(_))
        ));
    }
}
