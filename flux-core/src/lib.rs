/*!
# flux core engine

Snapshot lifecycle and replication for ZFS dataset trees.

This crate provides:

- A snapshot catalog that lists a dataset's snapshots in creation order
- Time-based retention with dry-run reporting
- Snapshot creation with predecessor resolution for incremental sends
- A transfer pipeline that streams full or incremental sends into
  `ssh <host> zfs recv <dest>` under a chosen uid/gid
- A batch engine running these workflows over many datasets

## Architecture

All storage access goes through the [`DatasetBackend`] trait. The
[`ZfsCommandBackend`] adapter drives the `zfs` command-line tool;
[`MemoryBackend`] keeps everything in memory for tests.

## Usage

```rust
use flux_core::backend::MemoryBackend;
use flux_core::{create_and_resolve, list_snapshots, DatasetBackend};

let backend = MemoryBackend::new()
    .with_filesystem("tank/data")
    .with_snapshot("tank/data@2024-01-01T00:00:00Z", 1_704_067_200);
let data = backend.get_dataset("tank/data")?;

let chain = create_and_resolve(&backend, &data, "2024-02-01T00:00:00Z", false)?;
assert_eq!(
    chain.predecessor.map(|p| p.qualified_name).as_deref(),
    Some("tank/data@2024-01-01T00:00:00Z")
);
assert_eq!(list_snapshots(&backend, &data)?.len(), 2);
# Ok::<(), flux_core::FluxError>(())
```
*/

pub mod backend;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod retention;
pub mod transfer;


pub use backend::{Dataset, DatasetBackend, DatasetKind, DestroyMode, MemoryBackend};
#[cfg(feature = "zfs")]
pub use backend::ZfsCommandBackend;
pub use catalog::{list_snapshots, snapshot_label, SnapshotEntry, SnapshotSequence};
pub use chain::{create_and_resolve, SnapshotChain};
pub use config::TransportConfig;
pub use engine::{BatchReport, FluxEngine, PurgeOptions, RemoteOptions, SnapshotOptions};
pub use error::{FluxError, Result};
pub use retention::{purge, purge_at, PurgeReport, RetentionPolicy};
pub use transfer::{transfer, Identity, TransferOutcome, TransferSpec};
