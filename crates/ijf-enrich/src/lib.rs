//! LLM enrichment of sparse job records.
//!
//! Crawled and aggregator-imported jobs often arrive with a raw
//! description and little else. A chat-completion provider extracts
//! structured facts (mission, candidate profile, impact area, salary)
//! which are then merged back into the record without clobbering data
//! a source already supplied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ijf_core::{CanonicalJob, EnrichmentStatus, IngestError, JobType, IMPACT_AREAS};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Descriptions shorter than this carry too little signal to be worth a
/// model call.
pub const MIN_DESCRIPTION_LEN: usize = 50;

/// Upper bound on retries against a single provider before falling
/// through to the next one in the chain.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Supported chat-completion backends, cheapest first. All three speak
/// the same OpenAI-compatible wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    DeepSeek,
    Groq,
    Mistral,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Groq => "groq",
            ProviderKind::Mistral => "mistral",
        }
    }

    pub fn base_url(self) -> &'static str {
        match self {
            ProviderKind::DeepSeek => "https://api.deepseek.com",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::Mistral => "https://api.mistral.ai/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Groq => "llama-3.1-8b-instant",
            ProviderKind::Mistral => "mistral-small-latest",
        }
    }

    /// Per-provider concurrency ceiling for batch enrichment.
    pub fn max_concurrent(self) -> usize {
        match self {
            ProviderKind::DeepSeek => 50,
            ProviderKind::Groq => 20,
            ProviderKind::Mistral => 10,
        }
    }
}

/// The slice of a job handed to the model.
#[derive(Debug, Clone)]
pub struct EnrichInput {
    pub title: String,
    pub organization: Option<String>,
    pub description: String,
}

impl EnrichInput {
    pub fn from_job(job: &CanonicalJob) -> Option<Self> {
        let description = job.description.clone()?;
        Some(Self {
            title: job.title.clone(),
            organization: job.organization_name.clone(),
            description,
        })
    }
}

#[async_trait]
pub trait EnrichProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, input: &EnrichInput) -> Result<JobFacts, IngestError>;
}

// ---------------------------------------------------------------------------
// Extracted facts
// ---------------------------------------------------------------------------

/// Structured facts pulled out of a raw posting. Every field is
/// optional; a response with none of them set fails schema validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFacts {
    #[serde(default)]
    pub mission: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub impact_area: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub salary_min: Option<f64>,
    #[serde(default)]
    pub salary_max: Option<f64>,
    #[serde(default)]
    pub salary_currency: Option<String>,
}

impl JobFacts {
    pub fn is_empty(&self) -> bool {
        self.mission.is_none()
            && self.profile.is_none()
            && self.impact_area.is_none()
            && self.location.is_none()
            && self.job_type.is_none()
            && self.salary_min.is_none()
            && self.salary_max.is_none()
            && self.salary_currency.is_none()
    }
}

/// Parse and validate a raw model response. Blank strings are treated
/// as absent so a model emitting `""` everywhere still fails validation.
pub fn parse_facts(content: &str) -> Result<JobFacts, IngestError> {
    let mut facts: JobFacts = serde_json::from_str(content.trim())
        .map_err(|err| IngestError::SchemaValidation(format!("not a facts object: {err}")))?;
    for field in [
        &mut facts.mission,
        &mut facts.profile,
        &mut facts.impact_area,
        &mut facts.location,
        &mut facts.job_type,
        &mut facts.salary_currency,
    ] {
        if field.as_deref().is_some_and(|s| s.trim().is_empty()) {
            *field = None;
        }
    }
    if facts.is_empty() {
        return Err(IngestError::SchemaValidation(
            "response contained no usable fields".into(),
        ));
    }
    Ok(facts)
}

fn job_type_from_label(label: &str) -> Option<JobType> {
    match label.trim().to_lowercase().as_str() {
        "full-time" | "full time" => Some(JobType::FullTime),
        "part-time" | "part time" => Some(JobType::PartTime),
        "contract" => Some(JobType::Contract),
        "freelance" => Some(JobType::Freelance),
        "internship" => Some(JobType::Internship),
        _ => None,
    }
}

/// Merge extracted facts into a job. Mission and profile replace the
/// raw description and requirements outright; everything else fills
/// gaps only. Marks the record as successfully enriched.
pub fn apply_facts(job: &mut CanonicalJob, facts: &JobFacts) {
    if let Some(mission) = &facts.mission {
        job.description = Some(mission.clone());
    }
    if let Some(profile) = &facts.profile {
        job.requirements = Some(profile.clone());
    }
    if let Some(area) = &facts.impact_area {
        job.category_hint = Some(area.clone());
    }
    if let Some(location) = &facts.location {
        job.location = Some(location.clone());
        if location.to_lowercase().contains("remote") {
            job.remote_flag = true;
        }
    }
    if let Some(kind) = facts.job_type.as_deref().and_then(job_type_from_label) {
        job.job_type = Some(kind);
    }
    if job.salary_min.is_none() {
        job.salary_min = facts.salary_min;
    }
    if job.salary_max.is_none() {
        job.salary_max = facts.salary_max;
    }
    if job.salary_currency.is_none() {
        job.salary_currency = facts.salary_currency.clone();
    }
    job.enrichment_status = EnrichmentStatus::Succeeded;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

const SYSTEM_MESSAGE: &str =
    "You are a service that extracts structured data from job postings. \
     You respond with valid JSON only, no prose and no markdown fences.";

fn extraction_prompt(input: &EnrichInput) -> String {
    let areas = IMPACT_AREAS
        .iter()
        .map(|area| area.slug)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Extract the following fields from the job posting below and return \
         them as a JSON object. Use null for anything the posting does not \
         state.\n\
         - mission: what the role does and why it matters, rewritten as one \
         or two clear paragraphs\n\
         - profile: the candidate requirements, as a concise summary\n\
         - impact_area: one of [{areas}]\n\
         - location: the work location\n\
         - job_type: one of [full-time, part-time, contract, freelance, internship]\n\
         - salary_min, salary_max: annual figures as numbers\n\
         - salary_currency: three-letter code\n\n\
         Title: {title}\n\
         Organization: {org}\n\n\
         Posting:\n{description}",
        areas = areas,
        title = input.title,
        org = input.organization.as_deref().unwrap_or("unknown"),
        description = input.description,
    )
}

/// Client for one OpenAI-compatible chat-completion endpoint.
pub struct ChatProvider {
    kind: ProviderKind,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl ChatProvider {
    pub fn new(kind: ProviderKind, api_key: impl Into<String>) -> Result<Self, IngestError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(IngestError::Config(format!(
                "missing api key for provider {}",
                kind.name()
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| IngestError::Config(format!("http client: {err}")))?;
        Ok(Self {
            kind,
            model: kind.default_model().to_string(),
            api_key,
            client,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.kind.base_url())
    }
}

#[async_trait]
impl EnrichProvider for ChatProvider {
    fn name(&self) -> &str {
        self.kind.name()
    }

    async fn extract(&self, input: &EnrichInput) -> Result<JobFacts, IngestError> {
        let url = self.endpoint();
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_MESSAGE.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: extraction_prompt(input),
                },
            ],
            response_format: ResponseFormat { kind: "json_object" },
            temperature: 0.1,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| IngestError::transport(&url, err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IngestError::RateLimited {
                url: Some(url),
            });
        }
        if !status.is_success() {
            return Err(IngestError::transport(&url, format!("http status {status}")));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|err| IngestError::Parse(format!("chat completion body: {err}")))?;
        let content = body
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| IngestError::Parse("chat completion had no choices".into()))?;
        debug!(provider = self.kind.name(), bytes = content.len(), "model responded");
        parse_facts(content)
    }
}

// ---------------------------------------------------------------------------
// Fallback chain
// ---------------------------------------------------------------------------

/// Retry schedule applied when a single provider rate-limits.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RATE_LIMIT_RETRIES,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Ordered list of providers. Extraction walks the list: rate limits
/// are retried with exponential backoff against the same provider,
/// every other failure moves straight on to the next one.
pub struct FallbackChain {
    providers: Vec<Arc<dyn EnrichProvider>>,
    retry: RetryPolicy,
}

impl FallbackChain {
    pub fn new(providers: Vec<Arc<dyn EnrichProvider>>) -> Result<Self, IngestError> {
        if providers.is_empty() {
            return Err(IngestError::Config("no enrichment providers configured".into()));
        }
        Ok(Self {
            providers,
            retry: RetryPolicy::default(),
        })
    }

    /// Build a chain from whichever API keys are present, cheapest
    /// provider first.
    pub fn from_keys(
        deepseek: Option<String>,
        groq: Option<String>,
        mistral: Option<String>,
    ) -> Result<Self, IngestError> {
        let mut providers: Vec<Arc<dyn EnrichProvider>> = Vec::new();
        for (kind, key) in [
            (ProviderKind::DeepSeek, deepseek),
            (ProviderKind::Groq, groq),
            (ProviderKind::Mistral, mistral),
        ] {
            if let Some(key) = key.filter(|key| !key.trim().is_empty()) {
                providers.push(Arc::new(ChatProvider::new(kind, key)?));
            }
        }
        Self::new(providers)
    }

    /// Single-provider chain for an explicitly requested backend. Unlike
    /// `from_keys`, a missing key here is an error rather than a skip.
    pub fn pinned(kind: ProviderKind, api_key: Option<String>) -> Result<Self, IngestError> {
        let key = api_key.filter(|key| !key.trim().is_empty()).ok_or_else(|| {
            IngestError::Config(format!(
                "provider {} requested but no api key is configured",
                kind.name()
            ))
        })?;
        let provider: Arc<dyn EnrichProvider> = Arc::new(ChatProvider::new(kind, key)?);
        Self::new(vec![provider])
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn extract(&self, input: &EnrichInput) -> Result<JobFacts, IngestError> {
        let mut last_err = None;
        for provider in &self.providers {
            match self.extract_with_retry(provider.as_ref(), input).await {
                Ok(facts) => return Ok(facts),
                Err(err) => {
                    warn!(provider = provider.name(), error = %err, "provider failed, falling through");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| IngestError::Config("empty provider chain".into())))
    }

    async fn extract_with_retry(
        &self,
        provider: &dyn EnrichProvider,
        input: &EnrichInput,
    ) -> Result<JobFacts, IngestError> {
        let mut attempt = 0;
        loop {
            match provider.extract(input).await {
                Err(IngestError::RateLimited { .. }) if attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        provider = provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Batch enrichment
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped_short: u64,
}

/// Enrich a batch concurrently, preserving input order. Jobs whose
/// description is missing or too short are passed through untouched;
/// per-job failures mark that job `Failed` without aborting the batch.
pub async fn enrich_batch(
    chain: Arc<FallbackChain>,
    jobs: Vec<CanonicalJob>,
    concurrency: usize,
) -> (Vec<CanonicalJob>, EnrichStats) {
    let mut stats = EnrichStats::default();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut slots: Vec<Option<CanonicalJob>> = Vec::with_capacity(jobs.len());
    let mut originals: Vec<Option<CanonicalJob>> = Vec::with_capacity(jobs.len());

    for (index, mut job) in jobs.into_iter().enumerate() {
        let Some(input) = EnrichInput::from_job(&job)
            .filter(|input| input.description.len() >= MIN_DESCRIPTION_LEN)
        else {
            stats.skipped_short += 1;
            slots.push(Some(job));
            originals.push(None);
            continue;
        };
        stats.attempted += 1;
        slots.push(None);
        originals.push(Some(job.clone()));

        let chain = Arc::clone(&chain);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            match chain.extract(&input).await {
                Ok(facts) => {
                    apply_facts(&mut job, &facts);
                    (index, job, true)
                }
                Err(err) => {
                    warn!(job = %job.identity_key(), error = %err, "enrichment failed");
                    job.enrichment_status = EnrichmentStatus::Failed;
                    (index, job, false)
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, job, succeeded)) => {
                if succeeded {
                    stats.succeeded += 1;
                } else {
                    stats.failed += 1;
                }
                slots[index] = Some(job);
            }
            Err(err) => {
                warn!(error = %err, "enrichment task panicked");
                stats.failed += 1;
            }
        }
    }

    // A panicked task loses its result; restore the pre-enrichment copy
    // so the job is never dropped from the batch.
    for (slot, original) in slots.iter_mut().zip(originals.iter_mut()) {
        if slot.is_none() {
            if let Some(mut job) = original.take() {
                job.enrichment_status = EnrichmentStatus::Failed;
                *slot = Some(job);
            }
        }
    }

    let enriched = slots.into_iter().flatten().collect::<Vec<_>>();
    info!(
        attempted = stats.attempted,
        succeeded = stats.succeeded,
        failed = stats.failed,
        skipped = stats.skipped_short,
        "enrichment batch finished"
    );
    (enriched, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ijf_core::Source;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Provider that replays a scripted sequence of results.
    struct ScriptedProvider {
        name: &'static str,
        calls: AtomicU32,
        responses: Mutex<VecDeque<Result<JobFacts, IngestError>>>,
    }

    impl ScriptedProvider {
        fn new(
            name: &'static str,
            responses: Vec<Result<JobFacts, IngestError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicU32::new(0),
                responses: Mutex::new(responses.into()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnrichProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn extract(&self, _input: &EnrichInput) -> Result<JobFacts, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(IngestError::Parse("script exhausted".into())))
        }
    }

    fn mission_facts() -> JobFacts {
        JobFacts {
            mission: Some("Run the climate program.".into()),
            impact_area: Some("climate-environment".into()),
            salary_max: Some(90_000.0),
            ..JobFacts::default()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn sample_job(description: &str) -> CanonicalJob {
        let mut job = CanonicalJob::new(
            Source::Greenhouse,
            "Program Officer",
            "https://boards.greenhouse.io/acme/jobs/123",
        );
        job.external_id = Some("123".into());
        job.description = Some(description.to_string());
        job
    }

    #[test]
    fn parse_facts_rejects_garbage_and_empty_objects() {
        assert!(matches!(
            parse_facts("not json"),
            Err(IngestError::SchemaValidation(_))
        ));
        assert!(matches!(
            parse_facts("{}"),
            Err(IngestError::SchemaValidation(_))
        ));
        assert!(matches!(
            parse_facts(r#"{"mission": "  ", "profile": ""}"#),
            Err(IngestError::SchemaValidation(_))
        ));
    }

    #[test]
    fn parse_facts_keeps_populated_fields_and_drops_blanks() {
        let facts =
            parse_facts(r#"{"mission": "Do good.", "profile": " ", "salary_min": 50000}"#)
                .expect("facts");
        assert_eq!(facts.mission.as_deref(), Some("Do good."));
        assert_eq!(facts.profile, None);
        assert_eq!(facts.salary_min, Some(50_000.0));
    }

    #[test]
    fn apply_facts_overwrites_text_but_keeps_existing_salary() {
        let mut job = sample_job("raw scraped html text");
        job.salary_max = Some(120_000.0);
        let facts = JobFacts {
            mission: Some("Clean mission.".into()),
            profile: Some("Five years experience.".into()),
            job_type: Some("part-time".into()),
            salary_min: Some(40_000.0),
            salary_max: Some(80_000.0),
            ..JobFacts::default()
        };
        apply_facts(&mut job, &facts);
        assert_eq!(job.description.as_deref(), Some("Clean mission."));
        assert_eq!(job.requirements.as_deref(), Some("Five years experience."));
        assert_eq!(job.job_type, Some(JobType::PartTime));
        assert_eq!(job.salary_min, Some(40_000.0));
        assert_eq!(job.salary_max, Some(120_000.0));
        assert_eq!(job.enrichment_status, EnrichmentStatus::Succeeded);
    }

    #[tokio::test]
    async fn rate_limits_are_retried_against_the_same_provider() {
        let provider = ScriptedProvider::new(
            "flaky",
            vec![
                Err(IngestError::RateLimited { url: None }),
                Err(IngestError::RateLimited { url: None }),
                Ok(mission_facts()),
            ],
        );
        let chain = FallbackChain::new(vec![provider.clone() as Arc<dyn EnrichProvider>])
            .expect("chain")
            .with_retry(fast_retry());
        let input = EnrichInput::from_job(&sample_job("long enough description text")).unwrap();
        let facts = chain.extract(&input).await.expect("facts");
        assert_eq!(facts.impact_area.as_deref(), Some("climate-environment"));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn non_rate_limit_failures_fall_through_to_next_provider() {
        let first = ScriptedProvider::new(
            "broken",
            vec![Err(IngestError::SchemaValidation("empty".into()))],
        );
        let second = ScriptedProvider::new("backup", vec![Ok(mission_facts())]);
        let chain = FallbackChain::new(vec![
            first.clone() as Arc<dyn EnrichProvider>,
            second.clone() as Arc<dyn EnrichProvider>,
        ])
        .expect("chain")
        .with_retry(fast_retry());
        let input = EnrichInput::from_job(&sample_job("long enough description text")).unwrap();
        let facts = chain.extract(&input).await.expect("facts");
        assert_eq!(facts.mission.as_deref(), Some("Run the climate program."));
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_falls_back_to_the_next_provider() {
        let limited = ScriptedProvider::new(
            "limited",
            vec![
                Err(IngestError::RateLimited { url: None }),
                Err(IngestError::RateLimited { url: None }),
                Err(IngestError::RateLimited { url: None }),
            ],
        );
        let backup = ScriptedProvider::new("backup", vec![Ok(mission_facts())]);
        let chain = FallbackChain::new(vec![
            limited.clone() as Arc<dyn EnrichProvider>,
            backup.clone() as Arc<dyn EnrichProvider>,
        ])
        .expect("chain")
        .with_retry(fast_retry());

        let input = EnrichInput::from_job(&sample_job("long enough description text")).unwrap();
        let facts = chain.extract(&input).await.expect("facts");

        assert_eq!(facts.mission.as_deref(), Some("Run the climate program."));
        assert_eq!(limited.calls(), 3);
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_surfaces_the_last_error() {
        let provider = ScriptedProvider::new(
            "down",
            vec![Err(IngestError::transport("https://x", "boom"))],
        );
        let chain = FallbackChain::new(vec![provider as Arc<dyn EnrichProvider>])
            .expect("chain")
            .with_retry(fast_retry());
        let input = EnrichInput::from_job(&sample_job("long enough description text")).unwrap();
        assert!(matches!(
            chain.extract(&input).await,
            Err(IngestError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn batch_skips_short_descriptions_and_isolates_failures() {
        let long = "x".repeat(MIN_DESCRIPTION_LEN + 10);
        let provider = ScriptedProvider::new(
            "mixed",
            vec![
                Ok(mission_facts()),
                Err(IngestError::SchemaValidation("empty".into())),
            ],
        );
        let chain = Arc::new(
            FallbackChain::new(vec![provider as Arc<dyn EnrichProvider>])
                .expect("chain")
                .with_retry(fast_retry()),
        );
        let jobs = vec![
            sample_job(&long),
            sample_job("tiny"),
            sample_job(&long),
        ];
        // Serial execution so the script lines up with input order.
        let (enriched, stats) = enrich_batch(chain, jobs, 1).await;
        assert_eq!(enriched.len(), 3);
        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped_short, 1);
        assert_eq!(enriched[1].enrichment_status, EnrichmentStatus::NotRequested);
        let outcomes: Vec<_> = enriched
            .iter()
            .map(|job| job.enrichment_status)
            .collect();
        assert!(outcomes.contains(&EnrichmentStatus::Succeeded));
        assert!(outcomes.contains(&EnrichmentStatus::Failed));
    }

    #[tokio::test]
    async fn panicking_provider_does_not_drop_jobs() {
        struct PanickingProvider;

        #[async_trait]
        impl EnrichProvider for PanickingProvider {
            fn name(&self) -> &str {
                "panicky"
            }

            async fn extract(&self, _input: &EnrichInput) -> Result<JobFacts, IngestError> {
                panic!("provider blew up");
            }
        }

        let long = "x".repeat(MIN_DESCRIPTION_LEN + 10);
        let chain = Arc::new(
            FallbackChain::new(vec![Arc::new(PanickingProvider) as Arc<dyn EnrichProvider>])
                .expect("chain")
                .with_retry(fast_retry()),
        );
        let (enriched, stats) = enrich_batch(chain, vec![sample_job(&long)], 1).await;

        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].enrichment_status, EnrichmentStatus::Failed);
        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn empty_provider_list_is_a_config_error() {
        assert!(matches!(
            FallbackChain::new(Vec::new()),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn pinned_chain_requires_the_named_provider_key() {
        assert!(matches!(
            FallbackChain::pinned(ProviderKind::Groq, None),
            Err(IngestError::Config(_))
        ));
        assert!(matches!(
            FallbackChain::pinned(ProviderKind::Groq, Some("  ".into())),
            Err(IngestError::Config(_))
        ));
        let chain = FallbackChain::pinned(ProviderKind::Groq, Some("gsk-test".into()))
            .expect("chain");
        assert_eq!(chain.providers.len(), 1);
        assert_eq!(chain.providers[0].name(), "groq");
    }
}
