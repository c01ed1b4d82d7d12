/*!
Snapshot catalog: enumerate a dataset's snapshots in creation order.

The catalog is rebuilt on every query. A sequence goes stale as soon as any
snapshot is created or destroyed, so callers re-list after mutating.
*/

use crate::backend::{Dataset, DatasetBackend, SNAPSHOT_SEPARATOR};
use crate::{FluxError, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Backend property holding the creation time in epoch seconds
pub const CREATION_PROPERTY: &str = "creation";

/// One snapshot of a dataset, with its resolved creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    /// `<base_name>@<label>`
    pub qualified_name: String,
    pub base_name: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    /// Handle for destroy/send calls
    #[serde(skip)]
    pub dataset: Dataset,
}

impl SnapshotEntry {
    /// Build an entry from a snapshot handle and its creation time
    pub fn new(dataset: Dataset, created_at: DateTime<Utc>) -> Self {
        Self {
            qualified_name: dataset.name.clone(),
            base_name: dataset.base_name().to_string(),
            label: dataset.label().unwrap_or_default().to_string(),
            created_at,
            dataset,
        }
    }
}

/// Chronological order with the qualified name as tie-break
pub fn by_creation(a: &SnapshotEntry, b: &SnapshotEntry) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.qualified_name.cmp(&b.qualified_name))
}

/// Snapshot entries sorted ascending by creation time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SnapshotSequence {
    entries: Vec<SnapshotEntry>,
}

impl SnapshotSequence {
    /// Sort `entries` into a sequence
    pub fn from_entries(mut entries: Vec<SnapshotEntry>) -> Self {
        entries.sort_by(by_creation);
        Self { entries }
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<SnapshotEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest entry, if any
    pub fn latest(&self) -> Option<&SnapshotEntry> {
        self.entries.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SnapshotEntry> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a SnapshotSequence {
    type Item = &'a SnapshotEntry;
    type IntoIter = std::slice::Iter<'a, SnapshotEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Convert a raw `creation` property value (epoch seconds) to a timestamp
pub fn parse_creation(name: &str, raw: &str) -> Result<DateTime<Utc>> {
    let seconds: i64 = raw
        .trim()
        .parse()
        .map_err(|e| FluxError::timestamp(name, format!("{raw:?} is not epoch seconds: {e}")))?;

    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| FluxError::timestamp(name, format!("{seconds} is out of range")))
}

/// Label for a snapshot taken at `now`: RFC 3339, second precision, `Z` suffix
pub fn snapshot_label(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn resolve_created_at<B: DatasetBackend + ?Sized>(
    backend: &B,
    snapshot: &Dataset,
) -> Result<DateTime<Utc>> {
    let raw = backend
        .get_property(snapshot, CREATION_PROPERTY)
        .map_err(|e| FluxError::timestamp(&snapshot.name, e.to_string()))?;
    parse_creation(&snapshot.name, &raw)
}

/// List the snapshots of `dataset` in creation order
///
/// Creation times come from the backend's `creation` property. Snapshots
/// whose creation time cannot be resolved are logged and left out; they never
/// fail the listing. Ties on creation time are broken by name.
///
/// # Errors
/// Propagates the backend error when the children cannot be enumerated.
pub fn list_snapshots<B: DatasetBackend + ?Sized>(
    backend: &B,
    dataset: &Dataset,
) -> Result<SnapshotSequence> {
    let children = backend.children(dataset, 0)?;
    let prefix = format!("{}{SNAPSHOT_SEPARATOR}", dataset.name);

    let mut entries = Vec::new();
    for child in children {
        if !child.is_snapshot() {
            continue;
        }
        if !child.name.starts_with(&prefix) {
            debug!("skipping {}: not a snapshot of {}", child.name, dataset.name);
            continue;
        }

        match resolve_created_at(backend, &child) {
            Ok(created_at) => entries.push(SnapshotEntry::new(child, created_at)),
            Err(e) => warn!("skipping snapshot {}: {}", child.name, e),
        }
    }

    let sequence = SnapshotSequence::from_entries(entries);
    debug!(
        "{} has {} snapshot(s) in catalog",
        dataset.name,
        sequence.len()
    );
    Ok(sequence)
}
