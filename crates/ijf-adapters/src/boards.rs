//! Board API crawlers: fill in discovery stubs from the Greenhouse, Lever,
//! and Ashby posting APIs, with a JSON-LD page fallback for URLs no API
//! pattern matches.

use ijf_core::{CanonicalJob, CrawlStatus, IngestError, JobType, Source};
use ijf_store::HttpFetcher;
use serde_json::Value as JsonValue;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::html::{clean_html, html_to_markdown, job_posting_json_ld};
use crate::normalize::{
    map_job_type, normalize_currency, parse_iso_date, sanitize_salary, text_or_none,
    timestamp_to_datetime,
};
use crate::{json_f64, json_str};

const GREENHOUSE_API_BASE: &str = "https://boards-api.greenhouse.io/v1/boards";
const LEVER_API_BASE: &str = "https://api.lever.co/v0/postings";
const ASHBY_API_BASE: &str = "https://api.ashbyhq.com/posting-api/job-board";

static RE_SALARY_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$?([\d,]+)\s*[-\u{2013}]\s*\$?([\d,]+)").expect("valid regex")
});

/// Result of crawling one stub.
#[derive(Debug, Clone)]
pub enum CrawlOutcome {
    /// The posting is live; the boxed job carries the crawled fields.
    Updated(Box<CanonicalJob>),
    /// The board says the posting (or its whole company board) is gone.
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardRef {
    pub source: Source,
    pub company: String,
    pub job_id: String,
}

/// Resolve a stub's apply URL into the `(company, job_id)` pair the board
/// API needs. `None` means the URL matches no known API pattern.
pub fn board_ref(source: Source, apply_url: &str) -> Option<BoardRef> {
    let url = Url::parse(apply_url).ok()?;
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    match source {
        Source::Greenhouse => {
            if !url.host_str()?.ends_with("greenhouse.io") {
                return None;
            }
            let jobs_at = segments.iter().position(|s| *s == "jobs")?;
            let company = segments.first()?;
            let job_id = segments.get(jobs_at + 1)?;
            if !job_id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some(BoardRef {
                source,
                company: company.to_string(),
                job_id: job_id.to_string(),
            })
        }
        Source::Lever => {
            if !url.host_str()?.ends_with("lever.co") || segments.len() < 2 {
                return None;
            }
            Some(BoardRef {
                source,
                company: segments[0].to_string(),
                job_id: segments[1].to_string(),
            })
        }
        Source::Ashby => {
            if !url.host_str()?.ends_with("ashbyhq.com") || segments.len() < 2 {
                return None;
            }
            // Company slugs can arrive percent-encoded ("Acme%20Labs").
            let company = urlencoding::decode(segments[0]).ok()?.into_owned();
            Some(BoardRef {
                source,
                company,
                job_id: segments[1].to_string(),
            })
        }
        _ => None,
    }
}

/// Crawl one discovery stub. Transport and parse failures bubble up; a
/// missing posting is reported as `Gone` so the caller can retire it.
pub async fn crawl(
    http: &HttpFetcher,
    run_id: Uuid,
    stub: &CanonicalJob,
) -> Result<CrawlOutcome, IngestError> {
    let Some(board) = board_ref(stub.source, &stub.apply_url) else {
        warn!(url = %stub.apply_url, "no board api pattern, falling back to page json-ld");
        return crawl_via_json_ld(http, run_id, stub).await;
    };

    match board.source {
        Source::Greenhouse => crawl_greenhouse(http, run_id, stub, &board).await,
        Source::Lever => crawl_lever(http, run_id, stub, &board).await,
        Source::Ashby => crawl_ashby(http, run_id, stub, &board).await,
        _ => Err(IngestError::Config(format!(
            "source {} is not a crawlable board",
            board.source
        ))),
    }
}

async fn crawl_greenhouse(
    http: &HttpFetcher,
    run_id: Uuid,
    stub: &CanonicalJob,
    board: &BoardRef,
) -> Result<CrawlOutcome, IngestError> {
    let url = format!("{GREENHOUSE_API_BASE}/{}/jobs/{}", board.company, board.job_id);
    let Some(response) = http
        .get_optional(run_id, board.source.as_str(), &url, &[])
        .await?
    else {
        return Ok(CrawlOutcome::Gone);
    };
    let data: JsonValue = serde_json::from_slice(&response.body)
        .map_err(|err| IngestError::Parse(format!("invalid greenhouse response: {err}")))?;
    Ok(CrawlOutcome::Updated(Box::new(parse_greenhouse(&data, stub))))
}

async fn crawl_lever(
    http: &HttpFetcher,
    run_id: Uuid,
    stub: &CanonicalJob,
    board: &BoardRef,
) -> Result<CrawlOutcome, IngestError> {
    // Lever's public API lists the whole company board; filter by id.
    let url = format!("{LEVER_API_BASE}/{}?mode=json", board.company);
    let Some(response) = http
        .get_optional(run_id, board.source.as_str(), &url, &[])
        .await?
    else {
        return Ok(CrawlOutcome::Gone);
    };
    let postings: JsonValue = serde_json::from_slice(&response.body)
        .map_err(|err| IngestError::Parse(format!("invalid lever response: {err}")))?;

    let posting = postings
        .as_array()
        .into_iter()
        .flatten()
        .find(|p| json_str(p, &["id"]) == Some(board.job_id.as_str()));
    match posting {
        Some(posting) => Ok(CrawlOutcome::Updated(Box::new(parse_lever(posting, stub)))),
        None => Ok(CrawlOutcome::Gone),
    }
}

async fn crawl_ashby(
    http: &HttpFetcher,
    run_id: Uuid,
    stub: &CanonicalJob,
    board: &BoardRef,
) -> Result<CrawlOutcome, IngestError> {
    let url = format!("{ASHBY_API_BASE}/{}", urlencoding::encode(&board.company));
    let Some(response) = http
        .get_optional(run_id, board.source.as_str(), &url, &[])
        .await?
    else {
        return Ok(CrawlOutcome::Gone);
    };
    let data: JsonValue = serde_json::from_slice(&response.body)
        .map_err(|err| IngestError::Parse(format!("invalid ashby response: {err}")))?;

    let posting = data
        .get("jobs")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
        .find(|p| json_str(p, &["id"]) == Some(board.job_id.as_str()));
    match posting {
        Some(posting) => Ok(CrawlOutcome::Updated(Box::new(parse_ashby(posting, stub)))),
        None => Ok(CrawlOutcome::Gone),
    }
}

async fn crawl_via_json_ld(
    http: &HttpFetcher,
    run_id: Uuid,
    stub: &CanonicalJob,
) -> Result<CrawlOutcome, IngestError> {
    let Some(response) = http
        .get_optional(run_id, stub.source.as_str(), &stub.apply_url, &[])
        .await?
    else {
        return Ok(CrawlOutcome::Gone);
    };
    let html = String::from_utf8_lossy(&response.body);
    match job_posting_json_ld(&html) {
        Some(posting) => Ok(CrawlOutcome::Updated(Box::new(parse_json_ld(&posting, stub)))),
        None => Err(IngestError::Parse(format!(
            "no JobPosting json-ld at {}",
            stub.apply_url
        ))),
    }
}

fn crawled_base(stub: &CanonicalJob, raw: &JsonValue) -> CanonicalJob {
    let mut job = stub.clone();
    job.crawl_status = Some(CrawlStatus::Crawled);
    job.raw_payload = raw.clone();
    job
}

pub(crate) fn parse_greenhouse(data: &JsonValue, stub: &CanonicalJob) -> CanonicalJob {
    let mut job = crawled_base(stub, data);

    if let Some(title) = json_str(data, &["title"]).and_then(text_or_none) {
        job.title = title;
    }
    if let Some(content) = json_str(data, &["content"]) {
        job.description = text_or_none(&html_to_markdown(content));
    }
    if let Some(location) = json_str(data, &["location", "name"]).and_then(text_or_none) {
        job.remote_flag = location.to_lowercase().contains("remote");
        job.location = Some(location);
    }

    // Salary only appears as free text in custom metadata fields.
    for meta in data.get("metadata").and_then(JsonValue::as_array).into_iter().flatten() {
        let name = json_str(meta, &["name"]).unwrap_or("").to_lowercase();
        if name != "salary" && name != "compensation" {
            continue;
        }
        let value = json_str(meta, &["value"]).unwrap_or("");
        if let Some(caps) = RE_SALARY_RANGE.captures(value) {
            job.salary_min = caps[1].replace(',', "").parse().ok().and_then(sanitize_salary);
            job.salary_max = caps[2].replace(',', "").parse().ok().and_then(sanitize_salary);
        }
    }

    job.job_type = Some(map_job_type(&job.title));
    if let Some(updated) = json_str(data, &["updated_at"]).and_then(parse_iso_date) {
        job.posted_at = Some(updated);
    }
    job
}

pub(crate) fn parse_lever(data: &JsonValue, stub: &CanonicalJob) -> CanonicalJob {
    let mut job = crawled_base(stub, data);

    if let Some(title) = json_str(data, &["text"]).and_then(text_or_none) {
        job.title = title;
    }
    if let Some(body) = json_str(data, &["descriptionBody"]).or_else(|| json_str(data, &["description"])) {
        job.description = text_or_none(&html_to_markdown(body));
    }
    if let Some(additional) = json_str(data, &["additional"]) {
        job.requirements = text_or_none(&html_to_markdown(additional));
    }

    let mut location = json_str(data, &["categories", "location"])
        .and_then(text_or_none)
        .unwrap_or_else(|| "Remote".to_string());
    if json_str(data, &["workplaceType"]) == Some("remote") {
        job.remote_flag = true;
        if !location.to_lowercase().contains("remote") {
            location = format!("{location} (Remote)");
        }
    } else {
        job.remote_flag = location.to_lowercase().contains("remote");
    }
    job.location = Some(location);

    job.job_type = Some(map_job_type(
        json_str(data, &["categories", "commitment"]).unwrap_or(""),
    ));
    job.salary_min = json_f64(data, &["salaryRange", "min"]).and_then(sanitize_salary);
    job.salary_max = json_f64(data, &["salaryRange", "max"]).and_then(sanitize_salary);
    job.salary_currency = json_str(data, &["salaryRange", "currency"]).and_then(normalize_currency);

    if let Some(created) = json_f64(data, &["createdAt"]).and_then(timestamp_to_datetime) {
        job.posted_at = Some(created);
    }
    job
}

pub(crate) fn parse_ashby(data: &JsonValue, stub: &CanonicalJob) -> CanonicalJob {
    let mut job = crawled_base(stub, data);

    if let Some(title) = json_str(data, &["title"]).and_then(text_or_none) {
        job.title = title;
    }
    if let Some(html) = json_str(data, &["descriptionHtml"]) {
        job.description = text_or_none(&html_to_markdown(html));
    }

    let is_remote = data.get("isRemote").and_then(JsonValue::as_bool).unwrap_or(false);
    let mut location = json_str(data, &["location"])
        .and_then(text_or_none)
        .unwrap_or_else(|| "Remote".to_string());
    if is_remote && !location.to_lowercase().contains("remote") {
        location = format!("{location} (Remote)");
    }
    let secondary = data
        .get("secondaryLocations")
        .and_then(JsonValue::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if secondary > 0 {
        location = format!("{location} (+{secondary} locations)");
    }
    job.remote_flag = is_remote || location.to_lowercase().contains("remote");
    job.location = Some(location);

    job.job_type = Some(match json_str(data, &["employmentType"]).unwrap_or("").to_lowercase().as_str() {
        "parttime" => JobType::PartTime,
        "contract" | "contractor" => JobType::Contract,
        "freelance" => JobType::Freelance,
        "intern" | "internship" => JobType::Internship,
        _ => JobType::FullTime,
    });

    job.salary_min = json_f64(data, &["compensation", "min"]).and_then(sanitize_salary);
    job.salary_max = json_f64(data, &["compensation", "max"]).and_then(sanitize_salary);
    job.salary_currency = json_str(data, &["compensation", "currency"]).and_then(normalize_currency);

    if let Some(published) = json_str(data, &["publishedAt"]).and_then(parse_iso_date) {
        job.posted_at = Some(published);
    }
    job
}

pub(crate) fn parse_json_ld(posting: &JsonValue, stub: &CanonicalJob) -> CanonicalJob {
    let mut job = crawled_base(stub, posting);

    if let Some(title) = json_str(posting, &["title"]).and_then(text_or_none) {
        job.title = title;
    }
    if let Some(description) = json_str(posting, &["description"]) {
        job.description = text_or_none(&clean_html(description));
    }
    if let Some(org) = json_str(posting, &["hiringOrganization", "name"]).and_then(text_or_none) {
        job.organization_name = Some(org);
    }
    if let Some(employment) = json_str(posting, &["employmentType"]) {
        job.job_type = Some(map_job_type(&employment.replace('_', " ")));
    }
    if json_str(posting, &["jobLocationType"]) == Some("TELECOMMUTE") {
        job.remote_flag = true;
    }
    if let Some(locality) =
        json_str(posting, &["jobLocation", "address", "addressLocality"]).and_then(text_or_none)
    {
        job.location = Some(locality);
    }

    job.salary_min = json_f64(posting, &["baseSalary", "value", "minValue"]).and_then(sanitize_salary);
    job.salary_max = json_f64(posting, &["baseSalary", "value", "maxValue"]).and_then(sanitize_salary);
    job.salary_currency = json_str(posting, &["baseSalary", "currency"]).and_then(normalize_currency);
    job.posted_at = json_str(posting, &["datePosted"]).and_then(parse_iso_date).or(job.posted_at);
    job.expires_at = json_str(posting, &["validThrough"]).and_then(parse_iso_date).or(job.expires_at);
    job
}
