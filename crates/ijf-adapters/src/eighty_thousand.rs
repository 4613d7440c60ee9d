//! 80,000 Hours import via the board's public Algolia search index.
//!
//! Discovery of remote-location facet values comes first, then a filtered
//! multi-query per page until `nbPages` is exhausted.

use async_trait::async_trait;
use ijf_core::{CanonicalJob, EnrichmentStatus, IngestError, Source};
use ijf_store::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::warn;
use uuid::Uuid;

use crate::normalize::{
    map_job_type, normalize_currency, sanitize_salary, text_or_none, timestamp_to_datetime,
};
use crate::{json_str, json_str_vec, AdapterContext, Aggregator};

const INDEX_NAME: &str = "jobs_prod";
const HITS_PER_PAGE: u64 = 100;
const LOCATION_FACET: &str = "tags_location_80k";

#[derive(Debug, Clone)]
pub struct EightyThousandConfig {
    pub app_id: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct EightyThousandAdapter {
    config: EightyThousandConfig,
}

impl EightyThousandAdapter {
    pub fn new(config: EightyThousandConfig) -> Self {
        Self { config }
    }

    fn queries_url(&self) -> String {
        format!(
            "https://{}-dsn.algolia.net/1/indexes/*/queries",
            self.config.app_id.to_lowercase()
        )
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-Algolia-Application-Id", self.config.app_id.clone()),
            ("X-Algolia-API-Key", self.config.api_key.clone()),
        ]
    }

    /// The index exposes location tags as a facet; anything starting with
    /// "remote" selects the remote slice of the board.
    async fn remote_location_tags(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<Vec<String>, IngestError> {
        let payload = json!({
            "requests": [{
                "indexName": INDEX_NAME,
                "facets": [LOCATION_FACET],
                "hitsPerPage": 0,
                "page": 0,
            }]
        });
        let url = self.queries_url();
        let response = http
            .post_json(run_id, Source::EightyThousandHours.as_str(), &url, &self.headers(), &payload)
            .await?;
        let body: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|err| IngestError::Parse(format!("invalid algolia response: {err}")))?;

        let mut tags: Vec<String> = body
            .pointer(&format!("/results/0/facets/{LOCATION_FACET}"))
            .and_then(JsonValue::as_object)
            .map(|facets| {
                facets
                    .keys()
                    .filter(|name| name.to_lowercase().starts_with("remote"))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if tags.is_empty() {
            tags.push("Remote, Global".to_string());
        }
        Ok(tags)
    }

    fn page_query(&self, remote_tags: &[String], page: u64) -> JsonValue {
        let filters = remote_tags
            .iter()
            .map(|tag| format!("{LOCATION_FACET}:\"{tag}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        json!({
            "requests": [{
                "indexName": INDEX_NAME,
                "hitsPerPage": HITS_PER_PAGE,
                "page": page,
                "filters": filters,
                "attributesToRetrieve": [
                    "title",
                    "description",
                    "description_short",
                    "url_external",
                    "tags_role_type",
                    "tags_area",
                    LOCATION_FACET,
                    "company_name",
                    "company_url",
                    "salary_limit",
                    "salary_currency",
                    "posted_at",
                    "closes_at",
                    "id_external_80_000_hours",
                    "objectID",
                ],
            }]
        })
    }
}

/// Normalize one Algolia hit. Non-remote hits and hits without an apply
/// URL are dropped.
pub(crate) fn transform_hit(hit: &JsonValue) -> Option<CanonicalJob> {
    let location_tags = json_str_vec(hit, &[LOCATION_FACET]);
    let location = location_tags
        .iter()
        .find(|label| label.to_lowercase().contains("remote"))?
        .clone();

    let title = text_or_none(json_str(hit, &["title"]).unwrap_or("Untitled role"))?;
    let apply_url = json_str(hit, &["url_external"])
        .or_else(|| json_str(hit, &["company_url"]))
        .and_then(text_or_none)?;

    let mut job = CanonicalJob::new(Source::EightyThousandHours, title, apply_url);
    job.external_id = json_str(hit, &["id_external_80_000_hours"])
        .or_else(|| json_str(hit, &["objectID"]))
        .map(ToString::to_string);
    job.description = json_str(hit, &["description"])
        .or_else(|| json_str(hit, &["description_short"]))
        .and_then(text_or_none);
    job.requirements = json_str(hit, &["description_short"]).and_then(text_or_none);
    job.location = Some(location);
    job.remote_flag = true;
    job.job_type = Some(map_job_type(
        json_str_vec(hit, &["tags_role_type"]).first().map(String::as_str).unwrap_or(""),
    ));
    job.category_hint = json_str_vec(hit, &["tags_area"]).into_iter().next();
    job.organization_name = json_str(hit, &["company_name"]).and_then(text_or_none);
    job.organization_url = json_str(hit, &["company_url"]).and_then(text_or_none);
    job.salary_max = crate::json_f64(hit, &["salary_limit"]).and_then(sanitize_salary);
    job.salary_currency = json_str(hit, &["salary_currency"]).and_then(normalize_currency);
    job.posted_at = crate::json_f64(hit, &["posted_at"]).and_then(timestamp_to_datetime);
    job.expires_at = crate::json_f64(hit, &["closes_at"]).and_then(timestamp_to_datetime);
    job.enrichment_status = EnrichmentStatus::NotRequested;
    job.raw_payload = hit.clone();
    Some(job)
}

#[async_trait]
impl Aggregator for EightyThousandAdapter {
    fn source(&self) -> Source {
        Source::EightyThousandHours
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<CanonicalJob>, IngestError> {
        let remote_tags = self.remote_location_tags(http, ctx.run_id).await?;
        let url = self.queries_url();
        let headers = self.headers();

        let mut jobs = Vec::new();
        let mut page = 0u64;
        loop {
            let query = self.page_query(&remote_tags, page);
            let response = match http
                .post_json(ctx.run_id, self.source().as_str(), &url, &headers, &query)
                .await
            {
                Ok(response) => response,
                Err(IngestError::RateLimited { .. }) => {
                    warn!(page, collected = jobs.len(), "rate limited, stopping pagination");
                    break;
                }
                Err(err) => return Err(err),
            };
            let body: JsonValue = serde_json::from_slice(&response.body)
                .map_err(|err| IngestError::Parse(format!("invalid algolia response: {err}")))?;
            let result = body
                .pointer("/results/0")
                .ok_or_else(|| IngestError::Parse("algolia response missing results".into()))?;

            for hit in result.get("hits").and_then(JsonValue::as_array).into_iter().flatten() {
                if let Some(job) = transform_hit(hit) {
                    jobs.push(job);
                }
                if ctx.reached(jobs.len()) {
                    return Ok(jobs);
                }
            }

            page += 1;
            let nb_pages = result.get("nbPages").and_then(JsonValue::as_u64).unwrap_or(0);
            if page >= nb_pages {
                break;
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use ijf_core::JobType;

    fn hit() -> JsonValue {
        json!({
            "title": "Biosecurity Researcher",
            "description": "Long-form description of the biosecurity role.",
            "description_short": "Short version.",
            "url_external": "https://example.org/apply/42",
            "tags_role_type": ["Contract"],
            "tags_area": ["Biosecurity & Pandemic Preparedness"],
            "tags_location_80k": ["Remote, Global", "Oxford"],
            "company_name": "Sentinel Institute",
            "company_url": "https://sentinel.example.org",
            "salary_limit": 120000.0,
            "salary_currency": "usd",
            "posted_at": 1700000000,
            "closes_at": 1710000000000i64,
            "id_external_80_000_hours": "eighty-42",
            "objectID": "obj-42"
        })
    }

    #[test]
    fn hit_transforms_into_canonical_job() {
        let job = transform_hit(&hit()).expect("remote hit");
        assert_eq!(job.source, Source::EightyThousandHours);
        assert_eq!(job.external_id.as_deref(), Some("eighty-42"));
        assert_eq!(job.apply_url, "https://example.org/apply/42");
        assert_eq!(job.location.as_deref(), Some("Remote, Global"));
        assert!(job.remote_flag);
        assert_eq!(job.job_type, Some(JobType::Contract));
        assert_eq!(job.salary_max, Some(120_000.0));
        assert_eq!(job.salary_currency.as_deref(), Some("USD"));
        assert_eq!(job.posted_at.expect("posted").year(), 2023);
        assert_eq!(job.expires_at.expect("closes").year(), 2024);
        assert_eq!(
            job.category_hint.as_deref(),
            Some("Biosecurity & Pandemic Preparedness")
        );
    }

    #[test]
    fn non_remote_hits_are_dropped() {
        let mut onsite = hit();
        onsite["tags_location_80k"] = json!(["Oxford", "London"]);
        assert!(transform_hit(&onsite).is_none());
    }

    #[test]
    fn hits_without_apply_url_are_dropped() {
        let mut bare = hit();
        bare["url_external"] = json!(null);
        bare["company_url"] = json!(null);
        assert!(transform_hit(&bare).is_none());
    }

    #[test]
    fn object_id_backfills_external_id() {
        let mut fallback = hit();
        fallback["id_external_80_000_hours"] = json!(null);
        let job = transform_hit(&fallback).expect("job");
        assert_eq!(job.external_id.as_deref(), Some("obj-42"));
    }

    #[test]
    fn page_query_joins_remote_filters() {
        let adapter = EightyThousandAdapter::new(EightyThousandConfig {
            app_id: "TESTAPP".into(),
            api_key: "key".into(),
        });
        let query = adapter.page_query(
            &["Remote, Global".to_string(), "Remote, EU".to_string()],
            2,
        );
        let filters = query["requests"][0]["filters"].as_str().expect("filters");
        assert_eq!(
            filters,
            "tags_location_80k:\"Remote, Global\" OR tags_location_80k:\"Remote, EU\""
        );
        assert_eq!(query["requests"][0]["page"], json!(2));
        assert_eq!(adapter.queries_url(), "https://testapp-dsn.algolia.net/1/indexes/*/queries");
    }
}
