//! Record-store contract + HTTP fetch utilities for IJF.
//!
//! The persistent job store is an external collaborator; `JobStore` is the
//! contract the pipeline programs against and `MemoryJobStore` is the
//! reference implementation used by tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use ijf_core::{CanonicalJob, CategorySpec, IdentityKey, IngestError, StoredJob};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ijf-store";

/// Operations the pipeline needs from a record store.
///
/// Implementations must treat the identity key as unique: `insert` with a
/// key that already exists is a contract violation, not an upsert.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_by_identity(&self, key: &IdentityKey) -> Result<Option<StoredJob>, IngestError>;

    /// Create a new record. Fails with `IdentityConflict` if the job's
    /// identity key is already present.
    async fn insert(&self, job: CanonicalJob) -> Result<StoredJob, IngestError>;

    /// Replace an existing record wholesale, keyed by its row id.
    async fn update(&self, record: StoredJob) -> Result<StoredJob, IngestError>;

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), IngestError>;

    /// Idempotent; the category vocabulary is fixed at compile time and
    /// re-seeding an existing slug is a no-op.
    async fn seed_categories(&self, categories: &[CategorySpec]) -> Result<(), IngestError>;

    /// Active records still awaiting a crawl, oldest discovery first.
    async fn list_discovered(&self, limit: usize) -> Result<Vec<StoredJob>, IngestError>;

    async fn list_active(&self) -> Result<Vec<StoredJob>, IngestError>;
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<IdentityKey, StoredJob>,
    category_slugs: Vec<String>,
}

/// In-memory `JobStore` keyed by identity key.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.jobs.is_empty()
    }

    /// Full table scan, unordered. Test helper.
    pub async fn snapshot(&self) -> Vec<StoredJob> {
        self.inner.lock().await.jobs.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_by_identity(&self, key: &IdentityKey) -> Result<Option<StoredJob>, IngestError> {
        Ok(self.inner.lock().await.jobs.get(key).cloned())
    }

    async fn insert(&self, job: CanonicalJob) -> Result<StoredJob, IngestError> {
        let key = job.identity_key();
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&key) {
            return Err(IngestError::IdentityConflict {
                key: key.to_string(),
            });
        }

        let now = Utc::now();
        let category_slug = job
            .category_hint
            .as_deref()
            .and_then(ijf_core::match_category)
            .map(|spec| spec.slug.to_string());
        let record = StoredJob {
            id: Uuid::new_v4(),
            job,
            category_slug,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            discovered_at: now,
        };
        inner.jobs.insert(key, record.clone());
        Ok(record)
    }

    async fn update(&self, mut record: StoredJob) -> Result<StoredJob, IngestError> {
        let new_key = record.identity_key();
        let mut inner = self.inner.lock().await;

        // The identity key can change when a crawl fills in an external id
        // for a URL-keyed stub, so locate the row by id.
        let old_key = inner
            .jobs
            .iter()
            .find(|(_, stored)| stored.id == record.id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| IngestError::IdentityConflict {
                key: new_key.to_string(),
            })?;

        if old_key != new_key {
            if let Some(occupant) = inner.jobs.get(&new_key) {
                if occupant.id != record.id {
                    return Err(IngestError::IdentityConflict {
                        key: new_key.to_string(),
                    });
                }
            }
            inner.jobs.remove(&old_key);
        }

        record.updated_at = Utc::now();
        inner.jobs.insert(new_key, record.clone());
        Ok(record)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().await;
        for record in inner.jobs.values_mut() {
            if record.id == id {
                record.is_active = active;
                record.updated_at = Utc::now();
                return Ok(());
            }
        }
        Err(IngestError::IdentityConflict {
            key: id.to_string(),
        })
    }

    async fn seed_categories(&self, categories: &[CategorySpec]) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().await;
        for spec in categories {
            if !inner.category_slugs.iter().any(|slug| slug == spec.slug) {
                inner.category_slugs.push(spec.slug.to_string());
            }
        }
        Ok(())
    }

    async fn list_discovered(&self, limit: usize) -> Result<Vec<StoredJob>, IngestError> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<StoredJob> = inner
            .jobs
            .values()
            .filter(|record| {
                record.is_active
                    && record.job.crawl_status == Some(ijf_core::CrawlStatus::Discovered)
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_active(&self) -> Result<Vec<StoredJob>, IngestError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|record| record.is_active)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Hard ceiling on outbound requests for one pipeline invocation.
///
/// Exhaustion is a soft stop: the fetcher refuses further sends and counts
/// the refusals so stages can report how much work they left on the table.
#[derive(Debug, Default)]
pub struct RequestBudget {
    limit: Option<u64>,
    used: AtomicU64,
    refused: AtomicU64,
}

impl RequestBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    pub fn try_take(&self) -> bool {
        match self.limit {
            None => {
                self.used.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(limit) => {
                let prior = self.used.fetch_add(1, Ordering::Relaxed);
                if prior < limit {
                    true
                } else {
                    self.refused.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    pub fn exhausted(&self) -> bool {
        match self.limit {
            None => false,
            Some(limit) => self.used.load(Ordering::Relaxed) >= limit,
        }
    }

    pub fn used(&self) -> u64 {
        let used = self.used.load(Ordering::Relaxed);
        match self.limit {
            Some(limit) => used.min(limit),
            None => used,
        }
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
    /// Minimum spacing between requests against the same source.
    pub min_interval: Option<Duration>,
    /// Total request ceiling for the run; `None` means unlimited.
    pub request_budget: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
            min_interval: None,
            request_budget: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Shared outbound HTTP client with global + per-source concurrency caps,
/// optional token-bucket pacing, retry with exponential backoff, and a
/// per-run request budget. One instance lives for one pipeline invocation.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    next_slot: Mutex<HashMap<String, Instant>>,
    min_interval: Option<Duration>,
    backoff: BackoffPolicy,
    budget: Arc<RequestBudget>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            next_slot: Mutex::new(HashMap::new()),
            min_interval: config.min_interval,
            backoff: config.backoff,
            budget: Arc::new(RequestBudget::new(config.request_budget)),
        })
    }

    pub fn budget(&self) -> &RequestBudget {
        &self.budget
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Reserve the next send slot for this source and wait for it.
    async fn pace(&self, source_id: &str) {
        let Some(interval) = self.min_interval else {
            return;
        };
        let slot = {
            let mut map = self.next_slot.lock().await;
            let now = Instant::now();
            let entry = map.entry(source_id.to_string()).or_insert(now);
            let slot = (*entry).max(now);
            *entry = slot + interval;
            slot
        };
        tokio::time::sleep_until(slot.into()).await;
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<FetchedResponse, IngestError> {
        match self.send(run_id, source_id, url, headers, None).await? {
            Some(response) => Ok(response),
            None => Err(IngestError::transport(url, "http status 404 Not Found")),
        }
    }

    /// GET that maps a 404 to `Ok(None)` instead of an error. Board APIs
    /// use 404 to say a posting or company no longer exists.
    pub async fn get_optional(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<Option<FetchedResponse>, IngestError> {
        self.send(run_id, source_id, url, headers, None).await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, String)],
        body: &JsonValue,
    ) -> Result<FetchedResponse, IngestError> {
        match self.send(run_id, source_id, url, headers, Some(body)).await? {
            Some(response) => Ok(response),
            None => Err(IngestError::transport(url, "http status 404 Not Found")),
        }
    }

    /// GET returning a parsed JSON body.
    pub async fn get_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<JsonValue, IngestError> {
        let response = self.get(run_id, source_id, url, headers).await?;
        serde_json::from_slice(&response.body)
            .map_err(|err| IngestError::Parse(format!("invalid json from {url}: {err}")))
    }

    async fn send(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, String)],
        json_body: Option<&JsonValue>,
    ) -> Result<Option<FetchedResponse>, IngestError> {
        if !self.budget.try_take() {
            warn!(source_id, url, "request budget exhausted, refusing send");
            return Err(IngestError::RateLimited {
                url: Some(url.to_string()),
            });
        }

        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        self.pace(source_id).await;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_error: Option<IngestError> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = match json_body {
                Some(body) => self.client.post(url).json(body),
                None => self.client.get(url),
            };
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| IngestError::transport(&final_url, err.to_string()))?
                            .to_vec();
                        return Ok(Some(FetchedResponse {
                            status,
                            final_url,
                            body,
                        }));
                    }

                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }

                    let error = if status == StatusCode::TOO_MANY_REQUESTS {
                        IngestError::RateLimited {
                            url: Some(final_url.clone()),
                        }
                    } else {
                        IngestError::transport(&final_url, format!("http status {status}"))
                    };

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(error);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(error);
                }
                Err(err) => {
                    let error = IngestError::transport(url, err.to_string());
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(error);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error.expect("retry loop always records an error before falling through"))
    }
}
