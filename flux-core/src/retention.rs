/*!
Time-based retention: destroy snapshots older than a cutoff.
*/

use crate::backend::{Dataset, DatasetBackend, DestroyMode};
use crate::catalog::list_snapshots;
use crate::{FluxError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default age after which snapshots are purged (two weeks)
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Retention settings for one purge run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Snapshots created strictly before `now - max_age` are eligible
    pub max_age: Duration,
    /// Never destroy this many of the newest snapshots, whatever their age
    pub keep_latest: usize,
    /// Report what would be destroyed without destroying anything
    pub dry_run: bool,
}

impl RetentionPolicy {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            keep_latest: 0,
            dry_run: false,
        }
    }

    pub fn with_keep_latest(mut self, keep_latest: usize) -> Self {
        self.keep_latest = keep_latest;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// `now - max_age`
    pub fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        retention_cutoff(now, self.max_age)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE)
    }
}

/// A snapshot that could not be destroyed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeFailure {
    pub snapshot: String,
    pub error: String,
}

/// Outcome of a purge over one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub dataset: String,
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
    pub destroyed: Vec<String>,
    pub would_destroy: Vec<String>,
    pub failed: Vec<PurgeFailure>,
    pub retained: usize,
}

impl PurgeReport {
    fn new(dataset: &Dataset, cutoff: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            dataset: dataset.name.clone(),
            cutoff,
            dry_run,
            destroyed: Vec::new(),
            would_destroy: Vec::new(),
            failed: Vec::new(),
            retained: 0,
        }
    }

    /// True when no destroy call failed
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Compute the retention cutoff `now - max_age`
pub fn retention_cutoff(now: DateTime<Utc>, max_age: Duration) -> Result<DateTime<Utc>> {
    let age = chrono::Duration::from_std(max_age)
        .map_err(|_| FluxError::config(format!("retention age {max_age:?} is too large")))?;
    now.checked_sub_signed(age)
        .ok_or_else(|| FluxError::config(format!("retention age {max_age:?} is too large")))
}

/// Purge snapshots of `dataset` older than `max_age`
///
/// Convenience wrapper over [`purge_at`] using the current time and no
/// keep-latest floor.
pub fn purge<B: DatasetBackend + ?Sized>(
    backend: &B,
    dataset: &Dataset,
    max_age: Duration,
    dry_run: bool,
) -> Result<PurgeReport> {
    let policy = RetentionPolicy::new(max_age).with_dry_run(dry_run);
    purge_at(backend, dataset, &policy, Utc::now())
}

/// Purge snapshots of `dataset` according to `policy`, as seen at `now`
///
/// Every snapshot created strictly before the cutoff is destroyed (or only
/// recorded, in dry-run mode). Nothing at or after the cutoff is touched.
/// A failed destroy is recorded in the report and the sweep continues.
///
/// # Errors
/// Fails only when the cutoff cannot be computed or the catalog cannot be
/// listed; individual destroy failures are in [`PurgeReport::failed`].
pub fn purge_at<B: DatasetBackend + ?Sized>(
    backend: &B,
    dataset: &Dataset,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<PurgeReport> {
    let cutoff = policy.cutoff(now)?;
    let sequence = list_snapshots(backend, dataset)?;
    let mut report = PurgeReport::new(dataset, cutoff, policy.dry_run);

    let protected_from = sequence.len().saturating_sub(policy.keep_latest);

    for (index, entry) in sequence.iter().enumerate() {
        if entry.created_at >= cutoff || index >= protected_from {
            report.retained += 1;
            continue;
        }

        if policy.dry_run {
            info!("would destroy {}", entry.qualified_name);
            report.would_destroy.push(entry.qualified_name.clone());
            continue;
        }

        debug!("destroy {}", entry.qualified_name);
        match backend.destroy(&entry.dataset, DestroyMode::Default) {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                crate::observability::FluxMetrics::global().record_destroyed();
                report.destroyed.push(entry.qualified_name.clone());
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                crate::observability::FluxMetrics::global().record_destroy_failure();
                error!("unable to destroy {}: {}", entry.qualified_name, e);
                report.failed.push(PurgeFailure {
                    snapshot: entry.qualified_name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        "purged {} of {} (cutoff {}): {} destroyed, {} would destroy, {} failed, {} retained",
        dataset.name,
        sequence.len(),
        cutoff,
        report.destroyed.len(),
        report.would_destroy.len(),
        report.failed.len(),
        report.retained
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::TimeZone;

    const DAY: i64 = 24 * 60 * 60;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_710_000_000, 0).unwrap()
    }

    fn days(n: u64) -> Duration {
        Duration::from_secs(n * DAY as u64)
    }

    fn history() -> MemoryBackend {
        let now = now().timestamp();
        MemoryBackend::new()
            .with_filesystem("tank/data")
            .with_snapshot("tank/data@ten-days", now - 10 * DAY)
            .with_snapshot("tank/data@three-days", now - 3 * DAY)
            .with_snapshot("tank/data@one-hour", now - 3600)
    }

    #[test]
    fn test_destroys_only_entries_before_cutoff() {
        let backend = history();
        let data = backend.get_dataset("tank/data").unwrap();

        let report = purge_at(&backend, &data, &RetentionPolicy::new(days(7)), now()).unwrap();

        assert_eq!(report.destroyed, vec!["tank/data@ten-days"]);
        assert_eq!(backend.destroyed(), vec!["tank/data@ten-days"]);
        assert_eq!(report.retained, 2);
        assert!(report.is_clean());
        assert!(backend.contains("tank/data@three-days"));
        assert!(backend.contains("tank/data@one-hour"));
    }

    #[test]
    fn test_entry_exactly_at_cutoff_is_kept() {
        let backend = MemoryBackend::new()
            .with_filesystem("tank/data")
            .with_snapshot("tank/data@edge", now().timestamp() - 7 * DAY)
            .with_snapshot("tank/data@older", now().timestamp() - 7 * DAY - 1);
        let data = backend.get_dataset("tank/data").unwrap();

        let report = purge_at(&backend, &data, &RetentionPolicy::new(days(7)), now()).unwrap();
        assert_eq!(report.destroyed, vec!["tank/data@older"]);
        assert!(backend.contains("tank/data@edge"));
    }

    #[test]
    fn test_dry_run_makes_no_destroy_calls() {
        let backend = history();
        let data = backend.get_dataset("tank/data").unwrap();
        let policy = RetentionPolicy::new(days(1)).with_dry_run(true);

        let report = purge_at(&backend, &data, &policy, now()).unwrap();

        assert!(report.dry_run);
        assert_eq!(
            report.would_destroy,
            vec!["tank/data@ten-days", "tank/data@three-days"]
        );
        assert!(report.destroyed.is_empty());
        assert!(backend.destroyed().is_empty());
        assert!(backend.contains("tank/data@ten-days"));
    }

    #[test]
    fn test_destroy_failure_does_not_stop_the_sweep() {
        let backend = history().failing_destroy("tank/data@ten-days");
        let data = backend.get_dataset("tank/data").unwrap();

        let report = purge_at(&backend, &data, &RetentionPolicy::new(days(1)), now()).unwrap();

        assert_eq!(report.destroyed, vec!["tank/data@three-days"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].snapshot, "tank/data@ten-days");
        assert!(!report.is_clean());
        assert!(backend.contains("tank/data@ten-days"));
    }

    #[test]
    fn test_keep_latest_protects_newest() {
        let backend = history();
        let data = backend.get_dataset("tank/data").unwrap();
        let policy = RetentionPolicy::new(Duration::ZERO).with_keep_latest(2);

        let report = purge_at(&backend, &data, &policy, now()).unwrap();
        assert_eq!(report.destroyed, vec!["tank/data@ten-days"]);
        assert_eq!(report.retained, 2);
    }

    #[test]
    fn test_never_destroys_at_or_after_cutoff_for_any_age() {
        for age_days in 0..12 {
            let backend = history();
            let data = backend.get_dataset("tank/data").unwrap();
            let policy = RetentionPolicy::new(days(age_days));
            let cutoff = policy.cutoff(now()).unwrap();

            let before = crate::catalog::list_snapshots(&backend, &data).unwrap();
            purge_at(&backend, &data, &policy, now()).unwrap();

            for entry in before.iter() {
                if entry.created_at >= cutoff {
                    assert!(
                        backend.contains(&entry.qualified_name),
                        "{} destroyed with cutoff {}",
                        entry.qualified_name,
                        cutoff
                    );
                }
            }
        }
    }

    #[test]
    fn test_empty_dataset_purges_nothing() {
        let backend = MemoryBackend::new().with_filesystem("tank/data");
        let data = backend.get_dataset("tank/data").unwrap();

        let report = purge(&backend, &data, days(7), false).unwrap();
        assert!(report.destroyed.is_empty());
        assert_eq!(report.retained, 0);
    }

    #[test]
    fn test_catalog_failure_is_fatal() {
        let backend = history().failing_children("tank/data");
        let data = backend.get_dataset("tank/data").unwrap();
        assert!(purge(&backend, &data, days(7), false).is_err());
    }

    #[test]
    fn test_oversized_age_is_config_error() {
        let err = retention_cutoff(now(), Duration::from_secs(u64::MAX)).unwrap_err();
        assert!(matches!(err, FluxError::Config(_)));
    }
}
