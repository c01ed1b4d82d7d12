/*!
Storage backends for dataset and snapshot operations.

This module defines the backend abstraction (port) that the catalog, retention
and transfer components talk to, plus the concrete adapters. The core never
shells out to `zfs` directly; it only sees [`DatasetBackend`].
*/

pub mod memory;
#[cfg(feature = "zfs")]
pub mod zfs;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

/// Separator between a dataset name and a snapshot label
pub const SNAPSHOT_SEPARATOR: char = '@';

/// Backend classification of a dataset node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Filesystem,
    Volume,
    Snapshot,
    Bookmark,
}

impl DatasetKind {
    /// Parse the type column reported by `zfs list -o type`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "filesystem" => Some(Self::Filesystem),
            "volume" => Some(Self::Volume),
            "snapshot" => Some(Self::Snapshot),
            "bookmark" => Some(Self::Bookmark),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Volume => "volume",
            Self::Snapshot => "snapshot",
            Self::Bookmark => "bookmark",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a named node in the storage hierarchy
///
/// The backend owns the underlying object; this is just enough to address it
/// in later calls. Snapshot handles carry their fully qualified
/// `<dataset>@<label>` name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub kind: DatasetKind,
}

impl Dataset {
    pub fn new<S: Into<String>>(name: S, kind: DatasetKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.kind == DatasetKind::Snapshot
    }

    /// Name portion before `@` (the whole name for non-snapshots)
    pub fn base_name(&self) -> &str {
        self.name
            .split_once(SNAPSHOT_SEPARATOR)
            .map(|(base, _)| base)
            .unwrap_or(&self.name)
    }

    /// Label portion after `@`, if any
    pub fn label(&self) -> Option<&str> {
        self.name
            .split_once(SNAPSHOT_SEPARATOR)
            .map(|(_, label)| label)
    }
}

/// How a destroy call treats dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestroyMode {
    /// Fail if anything depends on the dataset
    #[default]
    Default,
    /// Destroy descendants (`-r`)
    Recursive,
    /// Destroy descendants and clones (`-R`)
    RecursiveClones,
    /// Defer destruction until holds are released (`-d`)
    Deferred,
}

/// Storage backend abstraction for dataset and snapshot operations
///
/// Implementations are expected to serialize their own mutations. Callers
/// must tolerate the snapshot set changing between calls.
pub trait DatasetBackend {
    /// Look up a dataset by name
    ///
    /// # Errors
    /// * `FluxError::NotFound` - If no dataset with that name exists
    fn get_dataset(&self, name: &str) -> Result<Dataset>;

    /// List children of a dataset
    ///
    /// `depth` 0 returns immediate children only (including snapshots).
    fn children(&self, dataset: &Dataset, depth: u32) -> Result<Vec<Dataset>>;

    /// Read a single property value in parsable form
    fn get_property(&self, dataset: &Dataset, property: &str) -> Result<String>;

    /// Create a snapshot `<dataset>@<label>` and return its handle
    fn create_snapshot(&self, dataset: &Dataset, label: &str, recursive: bool) -> Result<Dataset>;

    /// Destroy a dataset or snapshot
    fn destroy(&self, dataset: &Dataset, mode: DestroyMode) -> Result<()>;

    /// Stream the complete state of `snapshot` into `writer`
    fn full_send(&self, snapshot: &Dataset, writer: &mut dyn Write) -> Result<()>;

    /// Stream the changes from `predecessor` to `snapshot` into `writer`
    fn incremental_send(
        &self,
        predecessor: &Dataset,
        snapshot: &Dataset,
        writer: &mut dyn Write,
    ) -> Result<()>;
}

impl<B: DatasetBackend + ?Sized> DatasetBackend for &B {
    fn get_dataset(&self, name: &str) -> Result<Dataset> {
        (**self).get_dataset(name)
    }

    fn children(&self, dataset: &Dataset, depth: u32) -> Result<Vec<Dataset>> {
        (**self).children(dataset, depth)
    }

    fn get_property(&self, dataset: &Dataset, property: &str) -> Result<String> {
        (**self).get_property(dataset, property)
    }

    fn create_snapshot(&self, dataset: &Dataset, label: &str, recursive: bool) -> Result<Dataset> {
        (**self).create_snapshot(dataset, label, recursive)
    }

    fn destroy(&self, dataset: &Dataset, mode: DestroyMode) -> Result<()> {
        (**self).destroy(dataset, mode)
    }

    fn full_send(&self, snapshot: &Dataset, writer: &mut dyn Write) -> Result<()> {
        (**self).full_send(snapshot, writer)
    }

    fn incremental_send(
        &self,
        predecessor: &Dataset,
        snapshot: &Dataset,
        writer: &mut dyn Write,
    ) -> Result<()> {
        (**self).incremental_send(predecessor, snapshot, writer)
    }
}

// Re-export types for convenience
pub use memory::{MemoryBackend, SendRecord};
#[cfg(feature = "zfs")]
pub use zfs::ZfsCommandBackend;
