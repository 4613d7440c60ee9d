//! Source adapters: aggregator imports, web-search discovery, and board
//! API crawlers, all producing `CanonicalJob`s.

pub mod boards;
pub mod discovery;
pub mod eighty_thousand;
pub mod html;
pub mod normalize;
pub mod reliefweb;

use async_trait::async_trait;
use ijf_core::{CanonicalJob, IngestError, Source};
use ijf_store::HttpFetcher;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ijf-adapters";

#[derive(Debug, Clone, Copy)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Caps how many normalized jobs the adapter collects before it stops
    /// paging. `None` means fetch everything the source offers.
    pub limit: Option<usize>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, limit: Option<usize>) -> Self {
        Self { run_id, limit }
    }

    pub(crate) fn reached(&self, collected: usize) -> bool {
        self.limit.is_some_and(|limit| collected >= limit)
    }
}

/// A full-record source: one fetch yields complete normalized jobs.
///
/// `fetch` treats rate limiting mid-pagination as a soft stop and returns
/// the jobs collected so far; only a failure before any page lands is an
/// error.
#[async_trait]
pub trait Aggregator: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<CanonicalJob>, IngestError>;
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

pub(crate) fn json_str_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return Vec::new(),
        }
    }
    match cur.as_array() {
        Some(arr) => arr
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect(),
        None => Vec::new(),
    }
}
