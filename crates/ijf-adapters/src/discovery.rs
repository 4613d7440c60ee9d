//! Web-search discovery of Greenhouse, Lever, and Ashby postings.
//!
//! A search backend returns candidate URLs; the validators below keep only
//! well-formed board posting URLs and turn them into crawlable stubs.

use std::collections::HashSet;

use async_trait::async_trait;
use ijf_core::{CanonicalJob, CrawlStatus, IngestError, JobType, Source};
use ijf_store::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::json_str;

const CSE_URL: &str = "https://www.googleapis.com/customsearch/v1";
const SERPER_URL: &str = "https://google.serper.dev/search";
const CSE_PAGE: u64 = 10;
const CSE_MAX_START: u64 = 91;

/// Date bins overlap on purpose; narrower windows surface postings the
/// all-time query buries past the pagination cap.
const DATE_BINS: &[(&str, Option<&str>)] = &[
    ("last_week", Some("w1")),
    ("last_month", Some("m1")),
    ("last_3_months", Some("m3")),
    ("all_time", None),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        query: &str,
        num_results: usize,
    ) -> Result<Vec<SearchHit>, IngestError>;
}

/// Per-board search queries; the sector phrasing filters out commercial
/// postings the boards are full of.
pub fn board_queries() -> Vec<(Source, String)> {
    vec![
        (
            Source::Greenhouse,
            r#"site:boards.greenhouse.io "non-profit" remote"#.to_string(),
        ),
        (
            Source::Lever,
            r#"site:jobs.lever.co "non-profit" remote"#.to_string(),
        ),
        (
            Source::Ashby,
            r#"site:jobs.ashbyhq.com "non-profit" remote"#.to_string(),
        ),
    ]
}

/// Google Custom Search: 10 results per page, hard cap of 100 per query,
/// plus date binning to widen coverage. A 429 stops the current bin and
/// keeps what was collected.
#[derive(Debug, Clone)]
pub struct GoogleCseBackend {
    pub api_key: String,
    pub cx: String,
    pub date_binning: bool,
}

#[async_trait]
impl SearchBackend for GoogleCseBackend {
    fn name(&self) -> &'static str {
        "google-cse"
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        query: &str,
        num_results: usize,
    ) -> Result<Vec<SearchHit>, IngestError> {
        let bins: &[(&str, Option<&str>)] = if self.date_binning {
            DATE_BINS
        } else {
            &[("all_time", None)]
        };

        let mut seen = HashSet::new();
        let mut hits = Vec::new();

        'bins: for (bin_label, date_restrict) in bins {
            if hits.len() >= num_results {
                break;
            }
            let mut start = 1u64;
            while start <= CSE_MAX_START && hits.len() < num_results {
                let mut url = Url::parse(CSE_URL)
                    .map_err(|err| IngestError::Config(format!("bad cse url: {err}")))?;
                {
                    let mut pairs = url.query_pairs_mut();
                    pairs
                        .append_pair("key", &self.api_key)
                        .append_pair("cx", &self.cx)
                        .append_pair("q", query)
                        .append_pair("start", &start.to_string())
                        .append_pair("num", &CSE_PAGE.to_string());
                    if let Some(restrict) = date_restrict {
                        pairs.append_pair("dateRestrict", restrict);
                    }
                }

                debug!(query, start, bin = bin_label, "google cse page");
                let body = match http.get_json(run_id, self.name(), url.as_str(), &[]).await {
                    Ok(body) => body,
                    Err(IngestError::RateLimited { .. }) => {
                        warn!(bin = bin_label, collected = hits.len(), "google cse rate limited");
                        break 'bins;
                    }
                    Err(err) => {
                        warn!(bin = bin_label, error = %err, "google cse page failed");
                        break;
                    }
                };

                let items = body.get("items").and_then(JsonValue::as_array);
                let Some(items) = items.filter(|items| !items.is_empty()) else {
                    break;
                };
                for item in items {
                    let Some(link) = json_str(item, &["link"]) else { continue };
                    if seen.insert(link.to_string()) {
                        hits.push(SearchHit {
                            url: link.to_string(),
                            title: json_str(item, &["title"]).map(ToString::to_string),
                            snippet: json_str(item, &["snippet"]).map(ToString::to_string),
                        });
                    }
                }

                let total: u64 = json_str(&body, &["searchInformation", "totalResults"])
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);
                start += CSE_PAGE;
                if start > total {
                    break;
                }
            }
        }

        info!(query, found = hits.len(), "google cse search finished");
        Ok(hits)
    }
}

/// Serper.dev: single POST, up to 100 organic results.
#[derive(Debug, Clone)]
pub struct SerperBackend {
    pub api_key: String,
}

#[async_trait]
impl SearchBackend for SerperBackend {
    fn name(&self) -> &'static str {
        "serper"
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        query: &str,
        num_results: usize,
    ) -> Result<Vec<SearchHit>, IngestError> {
        let payload = json!({
            "q": query,
            "num": num_results.min(100),
        });
        let headers = [("X-API-KEY", self.api_key.clone())];
        let response = http
            .post_json(run_id, self.name(), SERPER_URL, &headers, &payload)
            .await?;
        let body: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|err| IngestError::Parse(format!("invalid serper response: {err}")))?;

        let hits = body
            .get("organic")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(|item| {
                let link = json_str(item, &["link"])?;
                Some(SearchHit {
                    url: link.to_string(),
                    title: json_str(item, &["title"]).map(ToString::to_string),
                    snippet: json_str(item, &["snippet"]).map(ToString::to_string),
                })
            })
            .collect::<Vec<_>>();
        info!(query, found = hits.len(), "serper search finished");
        Ok(hits)
    }
}

pub fn detect_board(url: &Url) -> Option<Source> {
    match url.host_str()? {
        "boards.greenhouse.io" | "job-boards.greenhouse.io" => Some(Source::Greenhouse),
        "jobs.lever.co" => Some(Source::Lever),
        "jobs.ashbyhq.com" => Some(Source::Ashby),
        _ => None,
    }
}

fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

pub fn is_valid_job_url(url: &Url, board: Source) -> bool {
    let segments = path_segments(url);
    match board {
        // boards.greenhouse.io/{company}/jobs/{numeric_id}
        Source::Greenhouse => segments.len() >= 3 && segments[1] == "jobs",
        // jobs.lever.co/{company}/{posting_id}
        Source::Lever | Source::Ashby => segments.len() >= 2,
        _ => false,
    }
}

/// Stable posting id from the URL: the board's own id when the path
/// matches, a truncated URL hash otherwise.
pub fn extract_job_id(url: &Url, board: Source) -> String {
    let segments = path_segments(url);
    let from_path = match board {
        Source::Greenhouse => segments
            .iter()
            .position(|s| *s == "jobs")
            .and_then(|i| segments.get(i + 1))
            .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
            .map(|id| id.to_string()),
        Source::Lever | Source::Ashby => segments.get(1).map(|id| id.to_string()),
        _ => None,
    };
    from_path.unwrap_or_else(|| {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    })
}

/// Company slug from the first path segment, prettified for display.
pub fn extract_company(url: &Url) -> Option<String> {
    let segments = path_segments(url);
    let slug = urlencoding::decode(segments.first()?).ok()?;
    let name = slug
        .replace(['-', '+'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Turn one validated search hit into a discovery stub awaiting crawl.
/// Hits pointing anywhere but a known board, or at malformed board paths,
/// yield `None`.
pub fn stub_from_hit(hit: &SearchHit) -> Option<CanonicalJob> {
    let url = Url::parse(&hit.url).ok()?;
    let board = detect_board(&url)?;
    if !is_valid_job_url(&url, board) {
        debug!(url = %hit.url, "skipping invalid board url");
        return None;
    }

    let job_id = extract_job_id(&url, board);
    let company = extract_company(&url);
    let title = hit
        .title
        .clone()
        .or_else(|| company.as_ref().map(|c| format!("Job at {c}")))
        .unwrap_or_else(|| "Untitled role".to_string());

    let mut job = CanonicalJob::new(board, title, hit.url.clone());
    job.external_id = Some(job_id);
    job.organization_name = company;
    job.description = hit.snippet.clone();
    job.location = Some("Remote".to_string());
    job.remote_flag = true;
    job.job_type = Some(JobType::FullTime);
    job.crawl_status = Some(CrawlStatus::Discovered);
    job.raw_payload = json!({
        "source_url": hit.url,
        "board": board.as_str(),
        "search_title": hit.title,
        "search_snippet": hit.snippet,
    });
    Some(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: None,
            snippet: None,
        }
    }

    #[test]
    fn board_detection_is_host_exact() {
        let gh = Url::parse("https://boards.greenhouse.io/acme/jobs/123").expect("url");
        assert_eq!(detect_board(&gh), Some(Source::Greenhouse));
        let gh2 = Url::parse("https://job-boards.greenhouse.io/acme/jobs/123").expect("url");
        assert_eq!(detect_board(&gh2), Some(Source::Greenhouse));
        let lever = Url::parse("https://jobs.lever.co/acme/uuid-1").expect("url");
        assert_eq!(detect_board(&lever), Some(Source::Lever));
        let other = Url::parse("https://example.org/jobs/123").expect("url");
        assert_eq!(detect_board(&other), None);
        let lookalike = Url::parse("https://boards.greenhouse.io.evil.example/a/jobs/1").expect("url");
        assert_eq!(detect_board(&lookalike), None);
    }

    #[test]
    fn greenhouse_validation_requires_jobs_segment() {
        let valid = Url::parse("https://boards.greenhouse.io/acme/jobs/4567").expect("url");
        assert!(is_valid_job_url(&valid, Source::Greenhouse));
        let listing = Url::parse("https://boards.greenhouse.io/acme").expect("url");
        assert!(!is_valid_job_url(&listing, Source::Greenhouse));
    }

    #[test]
    fn job_id_extraction_prefers_path_ids() {
        let gh = Url::parse("https://boards.greenhouse.io/acme/jobs/4567").expect("url");
        assert_eq!(extract_job_id(&gh, Source::Greenhouse), "4567");

        let lever = Url::parse("https://jobs.lever.co/acme/f7c4-22").expect("url");
        assert_eq!(extract_job_id(&lever, Source::Lever), "f7c4-22");

        let ashby = Url::parse("https://jobs.ashbyhq.com/acme/11aa-33").expect("url");
        assert_eq!(extract_job_id(&ashby, Source::Ashby), "11aa-33");
    }

    #[test]
    fn non_numeric_greenhouse_id_hashes_the_url() {
        let odd = Url::parse("https://boards.greenhouse.io/acme/jobs/apply-now").expect("url");
        let id = extract_job_id(&odd, Source::Greenhouse);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic across runs.
        assert_eq!(id, extract_job_id(&odd, Source::Greenhouse));
    }

    #[test]
    fn company_is_prettified_from_first_segment() {
        let url = Url::parse("https://jobs.lever.co/open-philanthropy/x1").expect("url");
        assert_eq!(extract_company(&url).as_deref(), Some("Open Philanthropy"));
        let encoded = Url::parse("https://jobs.ashbyhq.com/Acme%20Labs/x1").expect("url");
        assert_eq!(extract_company(&encoded).as_deref(), Some("Acme Labs"));
    }

    #[test]
    fn stubs_carry_discovered_status_and_identity() {
        let mut search_hit = hit("https://boards.greenhouse.io/acme/jobs/4567");
        search_hit.title = Some("Program Officer - Acme".to_string());
        search_hit.snippet = Some("Remote program role.".to_string());

        let stub = stub_from_hit(&search_hit).expect("stub");
        assert_eq!(stub.source, Source::Greenhouse);
        assert_eq!(stub.external_id.as_deref(), Some("4567"));
        assert_eq!(stub.crawl_status, Some(CrawlStatus::Discovered));
        assert_eq!(stub.title, "Program Officer - Acme");
        assert_eq!(stub.description.as_deref(), Some("Remote program role."));
        assert!(stub.remote_flag);
    }

    #[test]
    fn off_board_hits_are_rejected() {
        assert!(stub_from_hit(&hit("https://example.org/careers/1")).is_none());
        assert!(stub_from_hit(&hit("https://boards.greenhouse.io/acme")).is_none());
        assert!(stub_from_hit(&hit("not a url")).is_none());
    }

    #[test]
    fn placeholder_title_names_the_company() {
        let stub = stub_from_hit(&hit("https://jobs.lever.co/ocean-cleanup/ab12")).expect("stub");
        assert_eq!(stub.title, "Job at Ocean Cleanup");
    }
}
