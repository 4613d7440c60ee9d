//! ReliefWeb jobs import (humanitarian sector REST API).
//!
//! The list endpoint is offset-paged; every list item is followed by a
//! detail fetch because the slim list profile omits the body.

use async_trait::async_trait;
use ijf_core::{CanonicalJob, IngestError, Source};
use ijf_store::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::warn;
use url::Url;

use crate::normalize::{map_job_type, parse_iso_date, text_or_none};
use crate::{json_str, AdapterContext, Aggregator};

const API_URL: &str = "https://api.reliefweb.int/v2/jobs";
const PAGE_SIZE: u64 = 100;
const REMOTE_QUERY: &str = "(remote) AND NOT _exists_:country";

#[derive(Debug, Clone)]
pub struct ReliefWebConfig {
    /// ReliefWeb requires a registered application name on every call.
    pub app_name: String,
}

#[derive(Debug, Clone)]
pub struct ReliefWebAdapter {
    config: ReliefWebConfig,
}

impl ReliefWebAdapter {
    pub fn new(config: ReliefWebConfig) -> Self {
        Self { config }
    }

    fn list_url(&self, offset: u64) -> Result<String, IngestError> {
        let mut url = Url::parse(API_URL)
            .map_err(|err| IngestError::Config(format!("bad reliefweb url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("appname", &self.config.app_name)
            .append_pair("profile", "list")
            .append_pair("preset", "latest")
            .append_pair("slim", "1")
            .append_pair("query[value]", REMOTE_QUERY)
            .append_pair("query[operator]", "AND")
            .append_pair("limit", &PAGE_SIZE.to_string())
            .append_pair("offset", &offset.to_string());
        Ok(url.to_string())
    }

    fn detail_url(&self, id: &str) -> Result<String, IngestError> {
        let mut url = Url::parse(&format!("{API_URL}/{id}"))
            .map_err(|err| IngestError::Config(format!("bad reliefweb url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("appname", &self.config.app_name);
        Ok(url.to_string())
    }
}

fn item_id(item: &JsonValue) -> Option<String> {
    match item.get("id") {
        Some(JsonValue::String(id)) => Some(id.clone()),
        Some(JsonValue::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// Normalize one detail item. Items without a usable application URL are
/// dropped rather than stored as dead ends.
pub(crate) fn transform_item(item: &JsonValue) -> Option<CanonicalJob> {
    let fields = item.get("fields")?;
    let external_id = item_id(item)?;
    let title = text_or_none(json_str(fields, &["title"]).unwrap_or("Untitled role"))?;

    let apply_url = json_str(fields, &["url"])
        .or_else(|| json_str(fields, &["url_alias"]))
        .and_then(text_or_none)
        .or_else(|| {
            fields
                .get("redirects")
                .and_then(JsonValue::as_array)
                .and_then(|r| r.first())
                .and_then(JsonValue::as_str)
                .and_then(text_or_none)
        })?;

    let mut job = CanonicalJob::new(Source::ReliefWeb, title, apply_url);
    job.external_id = Some(external_id);
    job.description = json_str(fields, &["body"]).and_then(text_or_none);
    job.location = Some("Remote".to_string());
    job.remote_flag = true;
    job.job_type = Some(map_job_type(""));

    // Career category first, theme as fallback; both arrive as either an
    // object or a list of objects.
    job.category_hint = first_named(fields.get("career_categories"))
        .or_else(|| first_named(fields.get("theme")));

    if let Some(org) = first_entry(fields.get("source")) {
        job.organization_name = json_str(org, &["name"])
            .or_else(|| json_str(org, &["shortname"]))
            .and_then(text_or_none);
        job.organization_url = json_str(org, &["homepage"]).and_then(text_or_none);
    }

    job.posted_at = json_str(fields, &["date", "created"]).and_then(parse_iso_date);
    job.expires_at = json_str(fields, &["date", "closing"]).and_then(parse_iso_date);
    job.raw_payload = item.clone();
    Some(job)
}

fn first_entry(value: Option<&JsonValue>) -> Option<&JsonValue> {
    match value? {
        JsonValue::Array(items) => items.first(),
        object @ JsonValue::Object(_) => Some(object),
        _ => None,
    }
}

fn first_named(value: Option<&JsonValue>) -> Option<String> {
    first_entry(value)
        .and_then(|entry| json_str(entry, &["name"]))
        .and_then(text_or_none)
}

#[async_trait]
impl Aggregator for ReliefWebAdapter {
    fn source(&self) -> Source {
        Source::ReliefWeb
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<CanonicalJob>, IngestError> {
        let source_id = self.source().as_str();
        let mut jobs = Vec::new();
        let mut offset = 0u64;

        'pages: loop {
            let list_url = self.list_url(offset)?;
            let body = match http.get_json(ctx.run_id, source_id, &list_url, &[]).await {
                Ok(body) => body,
                Err(IngestError::RateLimited { .. }) => {
                    warn!(offset, collected = jobs.len(), "rate limited, stopping pagination");
                    break;
                }
                Err(err) => return Err(err),
            };
            let items = body.get("data").and_then(JsonValue::as_array);
            let Some(items) = items.filter(|items| !items.is_empty()) else {
                break;
            };

            for item in items {
                let Some(id) = item_id(item) else { continue };
                let detail_url = self.detail_url(&id)?;
                let detail = match http.get_json(ctx.run_id, source_id, &detail_url, &[]).await {
                    Ok(detail) => detail,
                    Err(IngestError::RateLimited { .. }) => {
                        warn!(job_id = %id, collected = jobs.len(), "rate limited, stopping");
                        break 'pages;
                    }
                    Err(err) => {
                        warn!(job_id = %id, error = %err, "detail fetch failed, skipping item");
                        continue;
                    }
                };
                let Some(detail_item) =
                    detail.get("data").and_then(JsonValue::as_array).and_then(|d| d.first())
                else {
                    continue;
                };
                if let Some(job) = transform_item(detail_item) {
                    jobs.push(job);
                }
                if ctx.reached(jobs.len()) {
                    break 'pages;
                }
            }

            offset += PAGE_SIZE;
            let total = body.get("totalCount").and_then(JsonValue::as_u64);
            if let Some(total) = total {
                if offset >= total {
                    break;
                }
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use serde_json::json;

    fn detail_item() -> JsonValue {
        json!({
            "id": 4101987,
            "fields": {
                "title": "WASH Coordinator",
                "body": "Coordinate water and sanitation programming.",
                "url": "https://reliefweb.int/job/4101987/wash-coordinator",
                "career_categories": [{"name": "Water Sanitation Hygiene"}],
                "source": [{"name": "Relief Org", "homepage": "https://relief.example.org"}],
                "date": {
                    "created": "2026-02-10T08:00:00+00:00",
                    "closing": "2026-03-10T23:59:59+00:00"
                }
            }
        })
    }

    #[test]
    fn detail_item_transforms_into_canonical_job() {
        let job = transform_item(&detail_item()).expect("job");
        assert_eq!(job.source, Source::ReliefWeb);
        assert_eq!(job.external_id.as_deref(), Some("4101987"));
        assert_eq!(job.title, "WASH Coordinator");
        assert_eq!(job.organization_name.as_deref(), Some("Relief Org"));
        assert_eq!(job.category_hint.as_deref(), Some("Water Sanitation Hygiene"));
        assert_eq!(job.posted_at.expect("posted").year(), 2026);
        assert_eq!(job.expires_at.expect("closing").month(), 3);
        assert!(job.remote_flag);
    }

    #[test]
    fn single_object_source_and_theme_are_accepted() {
        let mut item = detail_item();
        item["fields"]["career_categories"] = json!(null);
        item["fields"]["theme"] = json!({"name": "Health"});
        item["fields"]["source"] = json!({"shortname": "RO"});
        let job = transform_item(&item).expect("job");
        assert_eq!(job.category_hint.as_deref(), Some("Health"));
        assert_eq!(job.organization_name.as_deref(), Some("RO"));
    }

    #[test]
    fn redirects_backfill_missing_url() {
        let mut item = detail_item();
        item["fields"]["url"] = json!(null);
        item["fields"]["redirects"] = json!(["https://redirect.example.org/a"]);
        let job = transform_item(&item).expect("job");
        assert_eq!(job.apply_url, "https://redirect.example.org/a");
    }

    #[test]
    fn items_without_any_url_are_dropped() {
        let mut item = detail_item();
        item["fields"]["url"] = json!(null);
        assert!(transform_item(&item).is_none());
    }

    #[test]
    fn list_url_carries_remote_query() {
        let adapter = ReliefWebAdapter::new(ReliefWebConfig {
            app_name: "ijf-test".into(),
        });
        let url = adapter.list_url(200).expect("url");
        assert!(url.starts_with("https://api.reliefweb.int/v2/jobs?"));
        assert!(url.contains("appname=ijf-test"));
        assert!(url.contains("offset=200"));
        assert!(url.contains("query%5Bvalue%5D="));
    }
}
