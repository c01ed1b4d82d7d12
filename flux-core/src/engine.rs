/*!
Batch engine that runs the snapshot and purge workflows over many datasets.

Datasets are processed one after another. By default a failing dataset is
logged and the batch moves on; the failures are returned together at the end.
With `fail_fast` the first failure aborts the remaining datasets.
*/

use crate::backend::DatasetBackend;
use crate::catalog::{list_snapshots, snapshot_label, SnapshotSequence};
use crate::chain::{create_and_resolve, SnapshotChain};
use crate::config::TransportConfig;
use crate::retention::{purge_at, PurgeReport, RetentionPolicy};
use crate::transfer::{transfer, validate_remote, Identity, TransferOutcome, TransferSpec};
use crate::{FluxError, Result};
use chrono::{DateTime, Utc};
use flux_retry::{classify, retry_with_backoff, transfer_backoff_policy, ExponentialBackoff};
use tracing::{error, info, info_span};

/// Remote side of a snapshot run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOptions {
    pub target: String,
    pub dest: Option<String>,
    pub identity: Option<Identity>,
}

/// Options for [`FluxEngine::snapshot_datasets`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotOptions {
    /// Label for the new snapshots; defaults to the RFC 3339 start time
    pub label: Option<String>,
    /// Send the full snapshot even when a predecessor exists
    pub initial: bool,
    /// Where to send the new snapshots, if anywhere
    pub remote: Option<RemoteOptions>,
    /// Extra transfer attempts after the first
    pub retries: usize,
    /// Abort the batch on the first failing dataset
    pub fail_fast: bool,
}

impl SnapshotOptions {
    /// Check everything that can be checked before touching a dataset
    pub fn validate(&self) -> Result<()> {
        if let Some(label) = &self.label {
            if label.is_empty() || label.contains(['@', '/', ' ']) {
                return Err(FluxError::config(format!(
                    "invalid snapshot label {label:?}"
                )));
            }
        }
        if let Some(remote) = &self.remote {
            validate_remote(Some(&remote.target), remote.dest.as_deref())?;
            if remote.identity.is_some() && !cfg!(unix) {
                return Err(FluxError::config(
                    "running the transport under another uid/gid is not supported on this platform",
                ));
            }
        }
        Ok(())
    }
}

/// Options for [`FluxEngine::purge_datasets`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PurgeOptions {
    pub policy: RetentionPolicy,
    /// Abort the batch on the first failing dataset
    pub fail_fast: bool,
}

/// Per-dataset result of a snapshot run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResult {
    pub dataset: String,
    pub chain: SnapshotChain,
    pub transfer: Option<TransferOutcome>,
}

/// Outcome of a snapshot batch where every dataset succeeded
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub completed: Vec<SnapshotResult>,
}

/// Orchestrates catalog, retention, chain resolution and transfer
///
/// # Example
/// ```rust
/// use flux_core::backend::MemoryBackend;
/// use flux_core::engine::{FluxEngine, SnapshotOptions};
///
/// let backend = MemoryBackend::new().with_filesystem("tank/data");
/// let engine = FluxEngine::new(backend);
/// let report = engine.snapshot_datasets(&["tank/data"], &SnapshotOptions::default())?;
/// assert_eq!(report.completed.len(), 1);
/// # Ok::<(), flux_core::FluxError>(())
/// ```
pub struct FluxEngine<B: DatasetBackend> {
    backend: B,
    transport: TransportConfig,
    retry_policy: ExponentialBackoff,
}

impl<B: DatasetBackend> FluxEngine<B> {
    /// Create an engine using the default ssh transport
    pub fn new(backend: B) -> Self {
        Self::with_transport(backend, TransportConfig::default())
    }

    pub fn with_transport(backend: B, transport: TransportConfig) -> Self {
        Self {
            backend,
            transport,
            retry_policy: transfer_backoff_policy(),
        }
    }

    /// Replace the backoff used between transfer attempts
    pub fn with_retry_policy(mut self, policy: ExponentialBackoff) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// List snapshots of one dataset in creation order
    pub fn list(&self, name: &str) -> Result<SnapshotSequence> {
        let dataset = self.backend.get_dataset(name)?;
        list_snapshots(&self.backend, &dataset)
    }

    /// Snapshot every named dataset and optionally send it to a remote host
    ///
    /// Configuration is validated before any dataset is touched.
    ///
    /// # Errors
    /// * `FluxError::Config` - Invalid options; nothing was created
    /// * `FluxError::Batch` - One or more datasets failed (continue mode)
    /// * the dataset's own error, in fail-fast mode
    pub fn snapshot_datasets<S: AsRef<str>>(
        &self,
        names: &[S],
        options: &SnapshotOptions,
    ) -> Result<BatchReport> {
        options.validate()?;
        if options.remote.is_some() {
            self.transport.validate()?;
        }

        let label = options
            .label
            .clone()
            .unwrap_or_else(|| snapshot_label(Utc::now()));

        let mut report = BatchReport::default();
        let mut failed = Vec::new();

        for name in names {
            let name = name.as_ref();
            let span = info_span!("snapshot", dataset = name);
            let _guard = span.enter();

            match self.snapshot_one(name, &label, options) {
                Ok(result) => report.completed.push(result),
                Err(e) if options.fail_fast => {
                    error!("{}: {}", name, e);
                    return Err(e);
                }
                Err(e) => {
                    error!("{}: {}", name, e);
                    failed.push(format!("{name}: {e}"));
                }
            }
        }

        if failed.is_empty() {
            Ok(report)
        } else {
            Err(FluxError::Batch { failed })
        }
    }

    fn snapshot_one(
        &self,
        name: &str,
        label: &str,
        options: &SnapshotOptions,
    ) -> Result<SnapshotResult> {
        let dataset = self.backend.get_dataset(name)?;
        let chain = create_and_resolve(&self.backend, &dataset, label, options.initial)?;

        let transfer = match &options.remote {
            Some(remote) => {
                let spec = TransferSpec {
                    target: remote.target.clone(),
                    dest: remote.dest.clone(),
                    identity: remote.identity,
                    snapshot: chain.snapshot.dataset.clone(),
                    predecessor: chain.predecessor.as_ref().map(|p| p.dataset.clone()),
                };
                Some(self.transfer_with_retry(&spec, options.retries)?)
            }
            None => None,
        };

        Ok(SnapshotResult {
            dataset: name.to_string(),
            chain,
            transfer,
        })
    }

    fn transfer_with_retry(&self, spec: &TransferSpec, retries: usize) -> Result<TransferOutcome> {
        let attempts = retries.saturating_add(1);
        let outcome = retry_with_backoff(
            "transfer",
            self.retry_policy.clone(),
            attempts,
            |attempt| {
                if attempt > 1 {
                    info!("retrying transfer of {} (attempt {})", spec.snapshot.name, attempt);
                }
                transfer(&self.backend, &self.transport, spec)
                    .map_err(|e| classify("transfer", e))
            },
        );

        outcome.map_err(|e| match e.into_source().downcast::<FluxError>() {
            Ok(inner) => *inner,
            Err(other) => FluxError::transport(other.to_string()),
        })
    }

    /// Apply the retention policy to every named dataset
    ///
    /// Destroy failures inside a dataset are part of its report, not errors.
    pub fn purge_datasets<S: AsRef<str>>(
        &self,
        names: &[S],
        options: &PurgeOptions,
    ) -> Result<Vec<PurgeReport>> {
        self.purge_datasets_at(names, options, Utc::now())
    }

    /// [`purge_datasets`](Self::purge_datasets) with an explicit clock
    pub fn purge_datasets_at<S: AsRef<str>>(
        &self,
        names: &[S],
        options: &PurgeOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<PurgeReport>> {
        // Reject an unusable age before touching anything
        options.policy.cutoff(now)?;

        let mut reports = Vec::new();
        let mut failed = Vec::new();

        for name in names {
            let name = name.as_ref();
            let span = info_span!("purge", dataset = name);
            let _guard = span.enter();

            let result = self
                .backend
                .get_dataset(name)
                .and_then(|dataset| purge_at(&self.backend, &dataset, &options.policy, now));

            match result {
                Ok(report) => reports.push(report),
                Err(e) if options.fail_fast => {
                    error!("{}: {}", name, e);
                    return Err(e);
                }
                Err(e) => {
                    error!("{}: {}", name, e);
                    failed.push(format!("{name}: {e}"));
                }
            }
        }

        if failed.is_empty() {
            Ok(reports)
        } else {
            Err(FluxError::Batch { failed })
        }
    }
}
