//! Run configuration, built once from the environment and threaded by
//! value into the orchestrator. No globals.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Total outbound request ceiling for one run; `None` means unlimited.
    pub request_budget: Option<u64>,
    /// Minimum spacing between requests against the same source.
    pub min_interval: Option<Duration>,
    /// Wall-clock cap for one run; expiry stops new work, in-flight items finish.
    pub deadline: Option<Duration>,

    pub algolia_app_id: Option<String>,
    pub algolia_api_key: Option<String>,
    pub reliefweb_app_name: String,

    pub google_cse_api_key: Option<String>,
    pub google_cse_cx: Option<String>,
    pub serper_api_key: Option<String>,

    pub deepseek_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub mistral_api_key: Option<String>,

    pub enrich_batch_size: usize,
    pub crawl_concurrency: usize,
    pub staleness_days: i64,

    pub sources_file: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            user_agent: env_string("IJF_USER_AGENT", "ijf-bot/0.1"),
            http_timeout_secs: env_parse("IJF_HTTP_TIMEOUT_SECS", 20),
            request_budget: env_opt("IJF_REQUEST_BUDGET").and_then(|v| v.parse().ok()),
            min_interval: env_opt("IJF_MIN_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            deadline: env_opt("IJF_RUN_DEADLINE_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            algolia_app_id: env_opt("IJF_ALGOLIA_APP_ID"),
            algolia_api_key: env_opt("IJF_ALGOLIA_API_KEY"),
            reliefweb_app_name: env_string("IJF_RELIEFWEB_APPNAME", "ijf"),
            google_cse_api_key: env_opt("IJF_GOOGLE_CSE_API_KEY"),
            google_cse_cx: env_opt("IJF_GOOGLE_CSE_CX"),
            serper_api_key: env_opt("IJF_SERPER_API_KEY"),
            deepseek_api_key: env_opt("IJF_DEEPSEEK_API_KEY"),
            groq_api_key: env_opt("IJF_GROQ_API_KEY"),
            mistral_api_key: env_opt("IJF_MISTRAL_API_KEY"),
            enrich_batch_size: env_parse("IJF_ENRICH_BATCH_SIZE", 10),
            crawl_concurrency: env_parse("IJF_CRAWL_CONCURRENCY", 4),
            staleness_days: env_parse("IJF_STALENESS_DAYS", 45),
            sources_file: env_opt("IJF_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
        }
    }

    /// Empty config for tests: no credentials, no budget, no deadline.
    pub fn bare() -> Self {
        Self {
            user_agent: "ijf-test/0.1".to_string(),
            http_timeout_secs: 20,
            request_budget: None,
            min_interval: None,
            deadline: None,
            algolia_app_id: None,
            algolia_api_key: None,
            reliefweb_app_name: "ijf-test".to_string(),
            google_cse_api_key: None,
            google_cse_cx: None,
            serper_api_key: None,
            deepseek_api_key: None,
            groq_api_key: None,
            mistral_api_key: None,
            enrich_batch_size: 10,
            crawl_concurrency: 4,
            staleness_days: 45,
            sources_file: PathBuf::from("sources.yaml"),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// On-disk registry of aggregator sources; lets operators disable a
/// source without a redeploy.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub source_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Missing registry file means everything is enabled.
    pub fn load_or_default(path: &std::path::Path) -> Self {
        match Self::load(path) {
            Ok(registry) => registry,
            Err(_) => Self { sources: Vec::new() },
        }
    }

    pub fn is_enabled(&self, source_id: &str) -> bool {
        self.sources
            .iter()
            .find(|entry| entry.source_id == source_id)
            .map(|entry| entry.enabled)
            .unwrap_or(true)
    }
}
