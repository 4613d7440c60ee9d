//! Dedup & upsert engine.
//!
//! All writes funnel through here. Same-key upserts within one run are
//! serialized by a per-identity-key async lock so paginated sources that
//! repeat an item can never produce two stored records.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use ijf_core::{CanonicalJob, IdentityKey, IngestError};
use ijf_store::JobStore;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    /// Field-equivalent re-confirmation; only `last_seen_at` moved.
    Skipped,
}

pub struct UpsertEngine {
    store: Arc<dyn JobStore>,
    dry_run: bool,
    locks: Mutex<HashMap<IdentityKey, Arc<Mutex<()>>>>,
    /// Would-be writes observed during a dry run, keyed like the store,
    /// so repeated keys count one create and then merge.
    shadow: Mutex<HashMap<IdentityKey, CanonicalJob>>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn JobStore>, dry_run: bool) -> Self {
        Self {
            store,
            dry_run,
            locks: Mutex::new(HashMap::new()),
            shadow: Mutex::new(HashMap::new()),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    async fn key_lock(&self, key: &IdentityKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    pub async fn upsert(&self, incoming: CanonicalJob) -> Result<Outcome, IngestError> {
        let key = incoming.identity_key();
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        if self.dry_run {
            return self.dry_upsert(key, incoming).await;
        }

        let Some(mut record) = self.store.find_by_identity(&key).await? else {
            debug!(key = %key, "creating record");
            self.store.insert(incoming).await?;
            return Ok(Outcome::Created);
        };

        let changed = record.job.merge_from(&incoming);
        record.last_seen_at = Utc::now();
        self.store.update(record).await?;
        if changed {
            debug!(key = %key, "record updated");
            Ok(Outcome::Updated)
        } else {
            Ok(Outcome::Skipped)
        }
    }

    /// Dry-run path: nothing touches the store, but every would-be write
    /// lands in the shadow map so the reported outcomes match what a
    /// live run would have produced.
    async fn dry_upsert(
        &self,
        key: IdentityKey,
        incoming: CanonicalJob,
    ) -> Result<Outcome, IngestError> {
        let mut shadow = self.shadow.lock().await;
        if let Some(job) = shadow.get_mut(&key) {
            let changed = job.merge_from(&incoming);
            return Ok(if changed { Outcome::Updated } else { Outcome::Skipped });
        }
        match self.store.find_by_identity(&key).await? {
            Some(record) => {
                let mut job = record.job;
                let changed = job.merge_from(&incoming);
                shadow.insert(key, job);
                Ok(if changed { Outcome::Updated } else { Outcome::Skipped })
            }
            None => {
                debug!(key = %key, "would create record");
                shadow.insert(key, incoming);
                Ok(Outcome::Created)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ijf_core::Source;
    use ijf_store::MemoryJobStore;

    fn job(external_id: &str, title: &str) -> CanonicalJob {
        let mut job = CanonicalJob::new(
            Source::ReliefWeb,
            title,
            format!("https://reliefweb.int/job/{external_id}"),
        );
        job.external_id = Some(external_id.to_string());
        job.location = Some("Remote".to_string());
        job
    }

    #[tokio::test]
    async fn same_key_twice_yields_one_record() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = UpsertEngine::new(store.clone(), false);

        let first = engine.upsert(job("123", "Analyst")).await.expect("first");
        let second = engine.upsert(job("123", "Analyst")).await.expect("second");

        assert_eq!(first, Outcome::Created);
        assert_eq!(second, Outcome::Skipped);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn changed_fields_report_updated() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = UpsertEngine::new(store.clone(), false);

        engine.upsert(job("123", "Analyst")).await.expect("create");
        let mut revised = job("123", "Senior Analyst");
        revised.salary_max = Some(80_000.0);
        let outcome = engine.upsert(revised).await.expect("update");

        assert_eq!(outcome, Outcome::Updated);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot[0].job.title, "Senior Analyst");
        assert_eq!(snapshot[0].job.salary_max, Some(80_000.0));
    }

    #[tokio::test]
    async fn merge_never_regresses_non_null_to_null() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = UpsertEngine::new(store.clone(), false);

        let mut stored = job("123", "Analyst");
        stored.location = Some("Remote, EU".to_string());
        engine.upsert(stored).await.expect("create");

        let mut sparse = job("123", "Analyst");
        sparse.location = None;
        engine.upsert(sparse).await.expect("reconfirm");

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot[0].job.location.as_deref(), Some("Remote, EU"));
    }

    #[tokio::test]
    async fn skipped_reconfirmation_still_refreshes_last_seen() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = UpsertEngine::new(store.clone(), false);

        engine.upsert(job("123", "Analyst")).await.expect("create");
        let before = store.snapshot().await[0].last_seen_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let outcome = engine.upsert(job("123", "Analyst")).await.expect("reconfirm");

        assert_eq!(outcome, Outcome::Skipped);
        assert!(store.snapshot().await[0].last_seen_at > before);
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let store = Arc::new(MemoryJobStore::new());
        let live = UpsertEngine::new(store.clone(), false);
        live.upsert(job("a", "Stored A")).await.expect("seed a");
        live.upsert(job("b", "Stored B")).await.expect("seed b");

        let engine = UpsertEngine::new(store.clone(), true);
        let mut created = 0;
        let mut skipped = 0;
        for item in [
            job("a", "Stored A"),
            job("b", "Stored B"),
            job("c", "New C"),
            job("d", "New D"),
            job("e", "New E"),
        ] {
            match engine.upsert(item).await.expect("upsert") {
                Outcome::Created => created += 1,
                Outcome::Updated => {}
                Outcome::Skipped => skipped += 1,
            }
        }

        assert_eq!(created, 3);
        assert_eq!(skipped, 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn dry_run_duplicate_key_counts_one_would_create() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = UpsertEngine::new(store.clone(), true);

        let first = engine.upsert(job("123", "Analyst")).await.expect("first");
        let second = engine.upsert(job("123", "Analyst")).await.expect("second");

        // Same split a live run reports for a duplicated key.
        assert_eq!(first, Outcome::Created);
        assert_eq!(second, Outcome::Skipped);
        assert_eq!(store.len().await, 0);

        // New fields on a repeat merge against the shadow record.
        let mut revised = job("123", "Analyst");
        revised.salary_max = Some(80_000.0);
        assert_eq!(engine.upsert(revised).await.expect("third"), Outcome::Updated);
    }

    #[tokio::test]
    async fn concurrent_same_key_upserts_are_serialized() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = Arc::new(UpsertEngine::new(store.clone(), false));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.upsert(job("123", "Analyst")).await
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.expect("join").expect("upsert") == Outcome::Created {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.len().await, 1);
    }
}
