/*!
In-memory dataset backend.

Keeps a small dataset tree in a map, records every destroy and send call, and
can be told to fail specific operations. Used by the test suites and handy
for dry experiments without a pool.
*/

use super::{Dataset, DatasetBackend, DatasetKind, DestroyMode, SNAPSHOT_SEPARATOR};
use crate::{FluxError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Name of the property holding the creation time in epoch seconds
const CREATION: &str = "creation";

/// One recorded send call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRecord {
    Full { snapshot: String },
    Incremental { predecessor: String, snapshot: String },
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, DatasetKind>,
    properties: HashMap<(String, String), String>,
    fail_children: HashSet<String>,
    fail_create: HashSet<String>,
    fail_destroy: HashSet<String>,
    destroyed: Vec<String>,
    sends: Vec<SendRecord>,
    stream_padding: usize,
    next_creation: Option<i64>,
}

/// Memory-based dataset backend
///
/// # Example
/// ```rust
/// use flux_core::backend::{DatasetBackend, MemoryBackend};
///
/// let backend = MemoryBackend::new()
///     .with_filesystem("tank/data")
///     .with_snapshot("tank/data@first", 1_700_000_000);
/// let data = backend.get_dataset("tank/data")?;
/// assert_eq!(backend.children(&data, 0)?.len(), 1);
/// # Ok::<(), flux_core::FluxError>(())
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a filesystem dataset
    pub fn with_filesystem(self, name: &str) -> Self {
        self.state()
            .datasets
            .insert(name.to_string(), DatasetKind::Filesystem);
        self
    }

    /// Add a snapshot with a creation time in epoch seconds
    pub fn with_snapshot(self, name: &str, created_epoch: i64) -> Self {
        self.with_snapshot_property(name, &created_epoch.to_string())
    }

    /// Add a snapshot whose creation property holds an arbitrary raw value
    pub fn with_snapshot_property(self, name: &str, raw_creation: &str) -> Self {
        {
            let mut state = self.state();
            state
                .datasets
                .insert(name.to_string(), DatasetKind::Snapshot);
            state.properties.insert(
                (name.to_string(), CREATION.to_string()),
                raw_creation.to_string(),
            );
        }
        self
    }

    /// Add a snapshot that has no creation property at all
    pub fn with_snapshot_without_creation(self, name: &str) -> Self {
        self.state()
            .datasets
            .insert(name.to_string(), DatasetKind::Snapshot);
        self
    }

    /// Make `children` fail for this dataset
    pub fn failing_children(self, dataset: &str) -> Self {
        self.state().fail_children.insert(dataset.to_string());
        self
    }

    /// Make `create_snapshot` fail for this dataset
    pub fn failing_create(self, dataset: &str) -> Self {
        self.state().fail_create.insert(dataset.to_string());
        self
    }

    /// Make `destroy` fail for this snapshot
    pub fn failing_destroy(self, snapshot: &str) -> Self {
        self.state().fail_destroy.insert(snapshot.to_string());
        self
    }

    /// Append `len` filler bytes to every send stream
    pub fn with_stream_padding(self, len: usize) -> Self {
        self.state().stream_padding = len;
        self
    }

    /// Creation time assigned to the next created snapshot (defaults to now)
    pub fn with_next_creation(self, created_epoch: i64) -> Self {
        self.state().next_creation = Some(created_epoch);
        self
    }

    /// Names passed to successful destroy calls, in call order
    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    /// Every send call, in call order
    pub fn sends(&self) -> Vec<SendRecord> {
        self.state().sends.clone()
    }

    /// Whether a dataset or snapshot currently exists
    pub fn contains(&self, name: &str) -> bool {
        self.state().datasets.contains_key(name)
    }

    /// Bytes a full send of `snapshot` produces
    pub fn full_stream(&self, snapshot: &str) -> Vec<u8> {
        let padding = self.state().stream_padding;
        stream_bytes(format!("FULL {snapshot}\n"), padding)
    }

    /// Bytes an incremental send from `predecessor` to `snapshot` produces
    pub fn incremental_stream(&self, predecessor: &str, snapshot: &str) -> Vec<u8> {
        let padding = self.state().stream_padding;
        stream_bytes(format!("INCR {predecessor} {snapshot}\n"), padding)
    }

    fn require(&self, dataset: &Dataset) -> Result<()> {
        if self.contains(&dataset.name) {
            Ok(())
        } else {
            Err(FluxError::not_found(&dataset.name))
        }
    }
}

fn stream_bytes(header: String, padding: usize) -> Vec<u8> {
    let mut bytes = header.into_bytes();
    bytes.resize(bytes.len() + padding, b'x');
    bytes
}

/// Depth of `name` below `parent`, or `None` when it is not a descendant
///
/// Snapshots sit at the same depth as an immediate child of the dataset they
/// belong to, matching `zfs list -d`.
fn relative_depth(parent: &str, name: &str) -> Option<u32> {
    let (base, is_snapshot) = match name.split_once(SNAPSHOT_SEPARATOR) {
        Some((base, _)) => (base, true),
        None => (name, false),
    };

    if is_snapshot && base == parent {
        return Some(0);
    }

    let rest = base.strip_prefix(parent)?.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let nested = rest.matches('/').count() as u32;
    Some(if is_snapshot { nested + 1 } else { nested })
}

impl DatasetBackend for MemoryBackend {
    fn get_dataset(&self, name: &str) -> Result<Dataset> {
        self.state()
            .datasets
            .get(name)
            .map(|kind| Dataset::new(name, *kind))
            .ok_or_else(|| FluxError::not_found(name))
    }

    fn children(&self, dataset: &Dataset, depth: u32) -> Result<Vec<Dataset>> {
        let state = self.state();
        if state.fail_children.contains(&dataset.name) {
            return Err(FluxError::backend(format!(
                "cannot list children of {}",
                dataset.name
            )));
        }
        if !state.datasets.contains_key(&dataset.name) {
            return Err(FluxError::not_found(&dataset.name));
        }

        Ok(state
            .datasets
            .iter()
            .filter(|(name, _)| {
                relative_depth(&dataset.name, name).is_some_and(|level| level <= depth)
            })
            .map(|(name, kind)| Dataset::new(name.clone(), *kind))
            .collect())
    }

    fn get_property(&self, dataset: &Dataset, property: &str) -> Result<String> {
        self.require(dataset)?;
        self.state()
            .properties
            .get(&(dataset.name.clone(), property.to_string()))
            .cloned()
            .ok_or_else(|| {
                FluxError::backend(format!(
                    "property {property} not set on {}",
                    dataset.name
                ))
            })
    }

    fn create_snapshot(&self, dataset: &Dataset, label: &str, recursive: bool) -> Result<Dataset> {
        self.require(dataset)?;
        let mut state = self.state();
        if state.fail_create.contains(&dataset.name) {
            return Err(FluxError::backend(format!(
                "cannot create snapshot of {}: dataset is busy",
                dataset.name
            )));
        }

        let name = format!("{}{SNAPSHOT_SEPARATOR}{label}", dataset.name);
        if state.datasets.contains_key(&name) {
            return Err(FluxError::backend(format!(
                "cannot create snapshot '{name}': dataset already exists"
            )));
        }

        let created = state
            .next_creation
            .take()
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        let mut targets = vec![name.clone()];
        if recursive {
            let prefix = format!("{}/", dataset.name);
            targets.extend(
                state
                    .datasets
                    .iter()
                    .filter(|(child, kind)| {
                        **kind != DatasetKind::Snapshot && child.starts_with(&prefix)
                    })
                    .map(|(child, _)| format!("{child}{SNAPSHOT_SEPARATOR}{label}")),
            );
        }

        for target in targets {
            state
                .properties
                .insert((target.clone(), CREATION.to_string()), created.to_string());
            state.datasets.insert(target, DatasetKind::Snapshot);
        }

        Ok(Dataset::new(name, DatasetKind::Snapshot))
    }

    fn destroy(&self, dataset: &Dataset, mode: DestroyMode) -> Result<()> {
        self.require(dataset)?;
        let mut state = self.state();
        if state.fail_destroy.contains(&dataset.name) {
            return Err(FluxError::backend(format!(
                "cannot destroy '{}': snapshot has dependent clones",
                dataset.name
            )));
        }

        let mut doomed = vec![dataset.name.clone()];
        if mode != DestroyMode::Default && mode != DestroyMode::Deferred {
            doomed.extend(
                state
                    .datasets
                    .keys()
                    .filter(|name| relative_depth(&dataset.name, name).is_some())
                    .cloned(),
            );
        }

        for name in doomed {
            state.datasets.remove(&name);
            state.properties.retain(|(owner, _), _| owner != &name);
        }
        state.destroyed.push(dataset.name.clone());
        Ok(())
    }

    fn full_send(&self, snapshot: &Dataset, writer: &mut dyn Write) -> Result<()> {
        self.require(snapshot)?;
        let bytes = self.full_stream(&snapshot.name);
        self.state().sends.push(SendRecord::Full {
            snapshot: snapshot.name.clone(),
        });
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn incremental_send(
        &self,
        predecessor: &Dataset,
        snapshot: &Dataset,
        writer: &mut dyn Write,
    ) -> Result<()> {
        self.require(predecessor)?;
        self.require(snapshot)?;
        let bytes = self.incremental_stream(&predecessor.name, &snapshot.name);
        self.state().sends.push(SendRecord::Incremental {
            predecessor: predecessor.name.clone(),
            snapshot: snapshot.name.clone(),
        });
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }
}
