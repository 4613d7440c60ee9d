//! Retention sweeper: deactivates expired or stale records. Never
//! deletes anything.

use std::sync::Arc;

use chrono::{Duration, Utc};
use ijf_core::{IngestError, RunResult};
use ijf_store::JobStore;
use tracing::{debug, info};

pub async fn run_sweep(
    store: Arc<dyn JobStore>,
    staleness_days: i64,
    dry_run: bool,
) -> Result<RunResult, IngestError> {
    let mut fragment = RunResult::start(dry_run);
    let now = Utc::now();
    let stale_cutoff = now - Duration::days(staleness_days);

    for record in store.list_active().await? {
        let expired = record.job.expires_at.is_some_and(|at| at < now);
        let stale = record.last_seen_at < stale_cutoff;
        if !expired && !stale {
            continue;
        }
        debug!(
            id = %record.id,
            expired,
            stale,
            "deactivating record"
        );
        if !dry_run {
            store.set_active(record.id, false).await?;
        }
        fragment.deactivated += 1;
    }

    info!(
        deactivated = fragment.deactivated,
        staleness_days, dry_run, "retention sweep finished"
    );
    Ok(fragment.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use ijf_core::{CanonicalJob, Source};
    use ijf_store::MemoryJobStore;

    async fn seed(
        store: &MemoryJobStore,
        id: &str,
        expires_in_days: Option<i64>,
        last_seen_days_ago: i64,
    ) {
        let mut job = CanonicalJob::new(
            Source::ReliefWeb,
            format!("Role {id}"),
            format!("https://reliefweb.int/job/{id}"),
        );
        job.external_id = Some(id.to_string());
        job.expires_at = expires_in_days.map(|d| Utc::now() + ChronoDuration::days(d));
        let mut record = store.insert(job).await.expect("insert");
        record.last_seen_at = Utc::now() - ChronoDuration::days(last_seen_days_ago);
        store.update(record).await.expect("age");
    }

    #[tokio::test]
    async fn expired_and_stale_records_are_deactivated() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "expired", Some(-1), 0).await;
        seed(&store, "stale", None, 60).await;
        seed(&store, "fresh", Some(30), 1).await;

        let fragment = run_sweep(store.clone(), 45, false).await.expect("sweep");
        assert_eq!(fragment.deactivated, 2);

        let active: Vec<_> = store
            .snapshot()
            .await
            .into_iter()
            .filter(|r| r.is_active)
            .map(|r| r.job.external_id.unwrap())
            .collect();
        assert_eq!(active, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "expired", Some(-1), 0).await;
        seed(&store, "fresh", Some(30), 1).await;

        let first = run_sweep(store.clone(), 45, false).await.expect("first");
        let second = run_sweep(store.clone(), 45, false).await.expect("second");
        assert_eq!(first.deactivated, 1);
        assert_eq!(second.deactivated, 0);
    }

    #[tokio::test]
    async fn dry_run_reports_without_deactivating() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "expired", Some(-1), 0).await;

        let fragment = run_sweep(store.clone(), 45, true).await.expect("sweep");
        assert_eq!(fragment.deactivated, 1);
        assert!(store.snapshot().await[0].is_active);
    }
}
