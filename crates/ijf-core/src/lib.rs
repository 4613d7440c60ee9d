//! Core domain model for IJF: canonical job schema, identity keys, the
//! impact-area vocabulary, and per-run accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ijf-core";

/// Upstream origin of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    EightyThousandHours,
    ReliefWeb,
    Greenhouse,
    Lever,
    Ashby,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::EightyThousandHours => "80000hours",
            Source::ReliefWeb => "reliefweb",
            Source::Greenhouse => "greenhouse",
            Source::Lever => "lever",
            Source::Ashby => "ashby",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "80000hours" => Some(Source::EightyThousandHours),
            "reliefweb" => Some(Source::ReliefWeb),
            "greenhouse" => Some(Source::Greenhouse),
            "lever" => Some(Source::Lever),
            "ashby" => Some(Source::Ashby),
            _ => None,
        }
    }

    /// Sources whose records are born as discovery stubs and filled in by
    /// the crawl stage.
    pub fn is_board(&self) -> bool {
        matches!(self, Source::Greenhouse | Source::Lever | Source::Ashby)
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    FullTime,
    PartTime,
    Contract,
    Freelance,
    Internship,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullTime => "full-time",
            JobType::PartTime => "part-time",
            JobType::Contract => "contract",
            JobType::Freelance => "freelance",
            JobType::Internship => "internship",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    #[default]
    NotRequested,
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Discovered,
    Crawled,
    Failed,
}

/// The cross-run identity of a job: `(source, external_id)` when the
/// upstream source assigns ids, `(source, apply_url)` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub source: Source,
    pub reference: IdentityRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityRef {
    External(String),
    Url(String),
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reference {
            IdentityRef::External(id) => write!(f, "{}:{id}", self.source),
            IdentityRef::Url(url) => write!(f, "{}:url:{url}", self.source),
        }
    }
}

/// Normalized unit produced by any adapter before persistence.
///
/// `title` and `apply_url` are the only mandatory semantic fields; every
/// other field degrades to `None` rather than failing normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalJob {
    pub source: Source,
    pub external_id: Option<String>,
    pub title: String,
    pub apply_url: String,
    pub organization_name: Option<String>,
    pub organization_url: Option<String>,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub location: Option<String>,
    pub remote_flag: bool,
    pub job_type: Option<JobType>,
    pub category_hint: Option<String>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_currency: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Opaque source-native record, retained for re-parsing and debugging.
    pub raw_payload: JsonValue,
    pub enrichment_status: EnrichmentStatus,
    /// Present only for discovery-origin records.
    pub crawl_status: Option<CrawlStatus>,
}

impl CanonicalJob {
    /// Minimal constructor; adapters fill in the rest field by field.
    pub fn new(source: Source, title: impl Into<String>, apply_url: impl Into<String>) -> Self {
        Self {
            source,
            external_id: None,
            title: title.into(),
            apply_url: apply_url.into(),
            organization_name: None,
            organization_url: None,
            description: None,
            requirements: None,
            location: None,
            remote_flag: false,
            job_type: None,
            category_hint: None,
            salary_min: None,
            salary_max: None,
            salary_currency: None,
            posted_at: None,
            expires_at: None,
            raw_payload: JsonValue::Null,
            enrichment_status: EnrichmentStatus::NotRequested,
            crawl_status: None,
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        let reference = match &self.external_id {
            Some(id) if !id.is_empty() => IdentityRef::External(id.clone()),
            _ => IdentityRef::Url(self.apply_url.trim().to_string()),
        };
        IdentityKey {
            source: self.source,
            reference,
        }
    }

    /// One-way merge of `incoming` into `self`.
    ///
    /// Non-null incoming fields overwrite; incoming nulls never clear a
    /// stored value. Returns whether any field actually changed, which is
    /// what distinguishes an `updated` outcome from a `skipped` one.
    pub fn merge_from(&mut self, incoming: &CanonicalJob) -> bool {
        let mut changed = false;

        if !incoming.title.trim().is_empty() && incoming.title != self.title {
            self.title = incoming.title.clone();
            changed = true;
        }
        if !incoming.apply_url.trim().is_empty() && incoming.apply_url != self.apply_url {
            self.apply_url = incoming.apply_url.clone();
            changed = true;
        }
        changed |= merge_opt(&mut self.external_id, &incoming.external_id);
        changed |= merge_opt(&mut self.organization_name, &incoming.organization_name);
        changed |= merge_opt(&mut self.organization_url, &incoming.organization_url);
        changed |= merge_opt(&mut self.description, &incoming.description);
        changed |= merge_opt(&mut self.requirements, &incoming.requirements);
        changed |= merge_opt(&mut self.location, &incoming.location);
        changed |= merge_opt(&mut self.job_type, &incoming.job_type);
        changed |= merge_opt(&mut self.category_hint, &incoming.category_hint);
        changed |= merge_opt(&mut self.salary_min, &incoming.salary_min);
        changed |= merge_opt(&mut self.salary_max, &incoming.salary_max);
        changed |= merge_opt(&mut self.salary_currency, &incoming.salary_currency);
        changed |= merge_opt(&mut self.posted_at, &incoming.posted_at);
        changed |= merge_opt(&mut self.expires_at, &incoming.expires_at);

        if incoming.remote_flag != self.remote_flag {
            self.remote_flag = incoming.remote_flag;
            changed = true;
        }
        if !incoming.raw_payload.is_null() && incoming.raw_payload != self.raw_payload {
            self.raw_payload = incoming.raw_payload.clone();
            changed = true;
        }

        // Status fields never regress: a stored success is not undone by a
        // re-import that did not request enrichment.
        match (self.enrichment_status, incoming.enrichment_status) {
            (EnrichmentStatus::Succeeded, _) => {}
            (current, next) if next != EnrichmentStatus::NotRequested && next != current => {
                self.enrichment_status = next;
                changed = true;
            }
            _ => {}
        }
        match (self.crawl_status, incoming.crawl_status) {
            (Some(CrawlStatus::Crawled), _) | (_, None) => {}
            (current, next) if next != current => {
                self.crawl_status = next;
                changed = true;
            }
            _ => {}
        }

        changed
    }
}

fn merge_opt<T: Clone + PartialEq>(current: &mut Option<T>, incoming: &Option<T>) -> bool {
    match incoming {
        Some(value) if current.as_ref() != Some(value) => {
            *current = Some(value.clone());
            true
        }
        _ => false,
    }
}

/// Record-store row wrapping a canonical job with lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: Uuid,
    pub job: CanonicalJob,
    pub category_slug: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Refreshed every time any source re-confirms the record, even when no
    /// field differs. The retention sweeper keys staleness off this.
    pub last_seen_at: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
}

impl StoredJob {
    pub fn identity_key(&self) -> IdentityKey {
        self.job.identity_key()
    }
}

/// A controlled impact-area vocabulary entry. Seeded once at startup; the
/// pipeline never invents categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorySpec {
    pub slug: &'static str,
    pub name: &'static str,
    pub keywords: &'static [&'static str],
}

pub const IMPACT_AREAS: &[CategorySpec] = &[
    CategorySpec {
        slug: "ai-safety",
        name: "AI Safety & Governance",
        keywords: &["ai safety", "ai alignment", "ai governance", "ai policy", "responsible ai"],
    },
    CategorySpec {
        slug: "climate-environment",
        name: "Climate & Environment",
        keywords: &["climate", "environment", "sustainability", "carbon", "renewable", "conservation"],
    },
    CategorySpec {
        slug: "global-health",
        name: "Global Health",
        keywords: &["health", "medical", "disease", "public health", "healthcare", "nutrition"],
    },
    CategorySpec {
        slug: "biosecurity",
        name: "Biosecurity & Pandemic Preparedness",
        keywords: &["biosecurity", "pandemic", "biodefense", "infectious disease", "pathogen"],
    },
    CategorySpec {
        slug: "animal-welfare",
        name: "Animal Welfare",
        keywords: &["animal", "farmed animal", "wildlife", "factory farming"],
    },
    CategorySpec {
        slug: "poverty-development",
        name: "Poverty & Economic Development",
        keywords: &["poverty", "economic development", "cash transfer", "global development"],
    },
    CategorySpec {
        slug: "education",
        name: "Education & Research",
        keywords: &["education", "research", "academic", "university", "training"],
    },
    CategorySpec {
        slug: "human-rights",
        name: "Human Rights & Justice",
        keywords: &["human rights", "justice", "democracy", "civil liberties", "refugee"],
    },
    CategorySpec {
        slug: "humanitarian",
        name: "Humanitarian & Disaster Relief",
        keywords: &["humanitarian", "disaster", "relief", "emergency", "crisis"],
    },
    CategorySpec {
        slug: "nuclear-security",
        name: "Nuclear Security",
        keywords: &["nuclear", "disarmament", "nonproliferation", "arms control"],
    },
    CategorySpec {
        slug: "other",
        name: "Other Impact Areas",
        keywords: &[],
    },
];

/// Best-effort mapping from a free-form category hint onto the fixed
/// vocabulary. Slug and name matches win over keyword containment; an
/// unmatched hint yields `None` (never a fabricated category).
pub fn match_category(hint: &str) -> Option<&'static CategorySpec> {
    let needle = hint.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return None;
    }
    if let Some(spec) = IMPACT_AREAS.iter().find(|spec| spec.slug == needle) {
        return Some(spec);
    }
    if let Some(spec) = IMPACT_AREAS
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(&needle))
    {
        return Some(spec);
    }
    IMPACT_AREAS
        .iter()
        .find(|spec| spec.keywords.iter().any(|kw| needle.contains(kw)))
}

/// Pipeline stages as reported in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Aggregators,
    Discovery,
    Crawl,
    Cleanup,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Aggregators => "aggregators",
            Stage::Discovery => "discovery",
            Stage::Crawl => "crawl",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(label)
    }
}

/// Non-fatal error descriptor carried in a run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub stage: Stage,
    pub source: Option<String>,
    pub message: String,
}

/// Per-invocation summary. Created at run start, mutated by each stage,
/// finalized at run end; logged but never persisted as a record.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped_duplicate: u64,
    pub enrichment_failed: u64,
    pub crawl_failed: u64,
    pub deactivated: u64,
    pub errors: Vec<RunError>,
}

impl RunResult {
    pub fn start(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            fetched: 0,
            created: 0,
            updated: 0,
            skipped_duplicate: 0,
            enrichment_failed: 0,
            crawl_failed: 0,
            deactivated: 0,
            errors: Vec::new(),
        }
    }

    /// Fold a stage fragment into the run total.
    pub fn absorb(&mut self, fragment: RunResult) {
        self.fetched += fragment.fetched;
        self.created += fragment.created;
        self.updated += fragment.updated;
        self.skipped_duplicate += fragment.skipped_duplicate;
        self.enrichment_failed += fragment.enrichment_failed;
        self.crawl_failed += fragment.crawl_failed;
        self.deactivated += fragment.deactivated;
        self.errors.extend(fragment.errors);
    }

    pub fn record_error(&mut self, stage: Stage, source: Option<&str>, message: impl Into<String>) {
        self.errors.push(RunError {
            stage,
            source: source.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Shared error taxonomy for everything the pipeline talks to.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transport failure{}: {message}", fmt_url(.url))]
    Transport { url: Option<String>, message: String },
    #[error("rate limited{}", fmt_url(.url))]
    RateLimited { url: Option<String> },
    #[error("parse failure: {0}")]
    Parse(String),
    #[error("enrichment response failed schema validation: {0}")]
    SchemaValidation(String),
    #[error("identity conflict for {key}: two records share one identity key")]
    IdentityConflict { key: String },
    #[error("configuration error: {0}")]
    Config(String),
}

fn fmt_url(url: &Option<String>) -> String {
    match url {
        Some(url) => format!(" for {url}"),
        None => String::new(),
    }
}

impl IngestError {
    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Transport {
            url: Some(url.into()),
            message: message.into(),
        }
    }
}
