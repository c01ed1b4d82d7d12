/*!
Snapshot creation and incremental-chain resolution.
*/

use crate::backend::{Dataset, DatasetBackend};
use crate::catalog::{list_snapshots, parse_creation, SnapshotEntry, CREATION_PROPERTY};
use crate::{FluxError, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

/// A freshly created snapshot and the base for sending it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChain {
    pub snapshot: SnapshotEntry,
    /// `None` means the snapshot must be sent in full
    pub predecessor: Option<SnapshotEntry>,
}

impl SnapshotChain {
    pub fn is_incremental(&self) -> bool {
        self.predecessor.is_some()
    }
}

/// Create `<dataset>@<label>` and pick the predecessor for its transfer
///
/// The predecessor is the newest snapshot in the catalog *before* creation.
/// It is `None` when `initial` is set or the dataset has no snapshots yet,
/// which signals a full transfer. Creation is never recursive.
///
/// # Errors
/// Fails if the catalog cannot be listed or the snapshot cannot be created
/// (dataset busy, name collision).
pub fn create_and_resolve<B: DatasetBackend + ?Sized>(
    backend: &B,
    dataset: &Dataset,
    label: &str,
    initial: bool,
) -> Result<SnapshotChain> {
    if label.is_empty() {
        return Err(FluxError::config("snapshot label cannot be empty"));
    }

    let existing = list_snapshots(backend, dataset)?;
    let predecessor = if initial {
        debug!("initial transfer requested for {}", dataset.name);
        None
    } else {
        existing.latest().cloned()
    };

    let created = backend.create_snapshot(dataset, label, false)?;
    #[cfg(feature = "metrics")]
    crate::observability::FluxMetrics::global().record_created();

    let created_at = match backend
        .get_property(&created, CREATION_PROPERTY)
        .and_then(|raw| parse_creation(&created.name, &raw))
    {
        Ok(ts) => ts,
        Err(e) => {
            warn!("using local clock for {}: {}", created.name, e);
            Utc::now()
        }
    };

    let snapshot = SnapshotEntry::new(created, created_at);
    match &predecessor {
        Some(prev) => info!(
            "created {} (incremental from {})",
            snapshot.qualified_name, prev.qualified_name
        ),
        None => info!("created {} (full)", snapshot.qualified_name),
    }

    Ok(SnapshotChain {
        snapshot,
        predecessor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    const JAN: i64 = 1_704_067_200;
    const FEB: i64 = 1_706_745_600;

    fn two_months() -> MemoryBackend {
        MemoryBackend::new()
            .with_filesystem("tank/data")
            .with_snapshot("tank/data@2024-02-01T00:00:00Z", FEB)
            .with_snapshot("tank/data@2024-01-01T00:00:00Z", JAN)
            .with_next_creation(FEB + 86_400)
    }

    #[test]
    fn test_predecessor_is_latest_existing() {
        let backend = two_months();
        let data = backend.get_dataset("tank/data").unwrap();

        let chain = create_and_resolve(&backend, &data, "2024-02-02T00:00:00Z", false).unwrap();

        assert!(chain.is_incremental());
        assert_eq!(
            chain.predecessor.unwrap().qualified_name,
            "tank/data@2024-02-01T00:00:00Z"
        );
        assert_eq!(chain.snapshot.qualified_name, "tank/data@2024-02-02T00:00:00Z");
        assert_eq!(chain.snapshot.created_at.timestamp(), FEB + 86_400);
        assert!(backend.contains("tank/data@2024-02-02T00:00:00Z"));
    }

    #[test]
    fn test_initial_forces_full() {
        let backend = two_months();
        let data = backend.get_dataset("tank/data").unwrap();

        let chain = create_and_resolve(&backend, &data, "next", true).unwrap();
        assert!(chain.predecessor.is_none());
        assert!(!chain.is_incremental());
    }

    #[test]
    fn test_first_snapshot_is_full() {
        let backend = MemoryBackend::new().with_filesystem("tank/data");
        let data = backend.get_dataset("tank/data").unwrap();

        let chain = create_and_resolve(&backend, &data, "first", false).unwrap();
        assert!(chain.predecessor.is_none());
        assert_eq!(chain.snapshot.base_name, "tank/data");
        assert_eq!(chain.snapshot.label, "first");
    }

    #[test]
    fn test_new_snapshot_is_not_its_own_predecessor() {
        let backend = MemoryBackend::new()
            .with_filesystem("tank/data")
            .with_snapshot("tank/data@old", JAN)
            .with_next_creation(JAN - 10);
        let data = backend.get_dataset("tank/data").unwrap();

        // Even with a skewed clock the predecessor comes from the pre-creation catalog
        let chain = create_and_resolve(&backend, &data, "new", false).unwrap();
        assert_eq!(chain.predecessor.unwrap().qualified_name, "tank/data@old");
    }

    #[test]
    fn test_creation_failure() {
        let backend = two_months().failing_create("tank/data");
        let data = backend.get_dataset("tank/data").unwrap();
        assert!(matches!(
            create_and_resolve(&backend, &data, "x", false),
            Err(FluxError::Backend(_))
        ));
    }

    #[test]
    fn test_name_collision() {
        let backend = two_months();
        let data = backend.get_dataset("tank/data").unwrap();
        assert!(create_and_resolve(&backend, &data, "2024-01-01T00:00:00Z", false).is_err());
    }

    #[test]
    fn test_empty_label_rejected() {
        let backend = two_months();
        let data = backend.get_dataset("tank/data").unwrap();
        assert!(matches!(
            create_and_resolve(&backend, &data, "", false),
            Err(FluxError::Config(_))
        ));
        assert!(backend.destroyed().is_empty());
    }
}
