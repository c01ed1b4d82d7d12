/*!
Transfer pipeline: stream a snapshot into a remote receive subprocess.

The subprocess is `ssh <target> zfs recv <dest>` (see [`TransportConfig`]),
started under an explicit uid/gid. Its stdin is fed from the backend's full
or incremental send stream; stdout and stderr go straight to ours.
*/

use crate::backend::{Dataset, DatasetBackend};
use crate::config::TransportConfig;
use crate::{FluxError, Result};
use serde::Serialize;
use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Numeric identity the transport subprocess runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Combine optional uid/gid flags; both or neither must be set
    pub fn from_parts(uid: Option<u32>, gid: Option<u32>) -> Result<Option<Self>> {
        match (uid, gid) {
            (Some(uid), Some(gid)) => Ok(Some(Self::new(uid, gid))),
            (None, None) => Ok(None),
            _ => Err(FluxError::config("uid and gid must be given together")),
        }
    }
}

/// Parameters for one transfer attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    /// Remote host as understood by the transport (`user@host`, ssh alias)
    pub target: String,
    /// Dataset path on the receiver
    pub dest: Option<String>,
    /// Identity for the local-to-remote leg; `None` inherits ours
    pub identity: Option<Identity>,
    pub snapshot: Dataset,
    /// Base for an incremental stream; `None` sends the full snapshot
    pub predecessor: Option<Dataset>,
}

impl TransferSpec {
    pub fn new<S: Into<String>>(target: S, snapshot: Dataset) -> Self {
        Self {
            target: target.into(),
            dest: None,
            identity: None,
            snapshot,
            predecessor: None,
        }
    }

    pub fn with_dest<S: Into<String>>(mut self, dest: S) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_predecessor(mut self, predecessor: Option<Dataset>) -> Self {
        self.predecessor = predecessor;
        self
    }

    pub fn is_incremental(&self) -> bool {
        self.predecessor.is_some()
    }

    /// Check the transfer parameters before anything is spawned
    pub fn validate(&self) -> Result<&str> {
        validate_remote(Some(&self.target), self.dest.as_deref())?;
        if self.identity.is_some() && !cfg!(unix) {
            return Err(FluxError::config(
                "running the transport under another uid/gid is not supported on this platform",
            ));
        }
        Ok(self.dest.as_deref().unwrap_or_default())
    }
}

/// Validate a remote target/destination pair
///
/// No target means no transfer. A target without a destination is a
/// configuration error.
pub fn validate_remote(target: Option<&str>, dest: Option<&str>) -> Result<()> {
    let Some(target) = target else {
        return Ok(());
    };
    if target.trim().is_empty() {
        return Err(FluxError::config("remote target cannot be empty"));
    }
    match dest {
        Some(dest) if !dest.trim().is_empty() => Ok(()),
        _ => Err(FluxError::config(format!(
            "no dest specified for remote target {target}"
        ))),
    }
}

/// Result of a successful transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub snapshot: String,
    pub predecessor: Option<String>,
    pub target: String,
    pub dest: String,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

/// Writer adapter counting the bytes that reach the pipe
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn build_command(transport: &TransportConfig, spec: &TransferSpec, dest: &str) -> Result<Command> {
    let mut cmd = Command::new(&transport.ssh_program);
    cmd.args(transport.arguments(&spec.target, dest))
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if let Some(identity) = spec.identity {
        apply_identity(&mut cmd, identity)?;
    }
    Ok(cmd)
}

#[cfg(unix)]
fn apply_identity(cmd: &mut Command, identity: Identity) -> Result<()> {
    use std::os::unix::process::CommandExt;

    cmd.uid(identity.uid).gid(identity.gid);
    Ok(())
}

#[cfg(not(unix))]
fn apply_identity(_cmd: &mut Command, identity: Identity) -> Result<()> {
    Err(FluxError::config(format!(
        "cannot run transport as uid {} gid {} on this platform",
        identity.uid, identity.gid
    )))
}

/// Feed the send stream into the child's stdin
///
/// Takes ownership of the pipe so it is closed when this returns, on every
/// path, before the caller waits on the child.
fn stream_into<B: DatasetBackend + ?Sized>(
    backend: &B,
    spec: &TransferSpec,
    stdin: ChildStdin,
) -> (Result<()>, u64) {
    let mut writer = CountingWriter::new(stdin);
    let result = match &spec.predecessor {
        None => backend.full_send(&spec.snapshot, &mut writer),
        Some(prev) => backend.incremental_send(prev, &spec.snapshot, &mut writer),
    };
    (result, writer.written)
}

fn wait_for(child: &mut Child, target: &str) -> Result<ExitStatus> {
    child
        .wait()
        .map_err(|e| FluxError::transport(format!("failed to wait for transport to {target}: {e}")))
}

/// Pick the error to report once the transport has been waited on
///
/// A stream error wins over the exit status; a failed wait wins over both.
/// Whatever is not reported is logged.
fn settle(target: &str, sent: Result<()>, waited: Result<ExitStatus>) -> Result<()> {
    let status = match waited {
        Ok(status) => status,
        Err(wait_err) => {
            if let Err(e) = &sent {
                warn!("stream to {} also failed: {}", target, e);
            }
            return Err(wait_err);
        }
    };

    if let Err(e) = sent {
        if !status.success() {
            warn!("transport to {} also exited with {}", target, status);
        }
        return Err(e);
    }

    if !status.success() {
        return Err(FluxError::ExitStatus {
            target: target.to_string(),
            status: status.to_string(),
        });
    }
    Ok(())
}

/// Send `spec.snapshot` to `spec.target`
///
/// Full stream when there is no predecessor, incremental otherwise. The
/// transport's stdin is closed before waiting, since the remote receive only
/// finishes once it sees end-of-stream. A failed write does not kill the
/// subprocess; the wait observes however it terminates. No retries here.
///
/// # Errors
/// * `FluxError::Config` - Missing destination or unsupported identity switch
/// * `FluxError::Transport` - The subprocess could not be started or waited on
/// * `FluxError::ExitStatus` - The subprocess exited unsuccessfully
/// * any error from the backend send stream (reported in preference to the exit status)
pub fn transfer<B: DatasetBackend + ?Sized>(
    backend: &B,
    transport: &TransportConfig,
    spec: &TransferSpec,
) -> Result<TransferOutcome> {
    let dest = spec.validate()?.to_string();
    transport.validate()?;
    let mut cmd = build_command(transport, spec, &dest)?;

    let mode = if spec.is_incremental() { "incremental" } else { "full" };
    info!(
        "sending {} ({}) to {}:{}",
        spec.snapshot.name, mode, spec.target, dest
    );
    debug!("transport command: {:?}", cmd);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        FluxError::transport(format!(
            "failed to start {} for {}: {e}",
            transport.ssh_program, spec.target
        ))
    })?;

    let (sent, bytes_sent) = match child.stdin.take() {
        Some(stdin) => stream_into(backend, spec, stdin),
        None => (
            Err(FluxError::transport("transport stdin was not captured")),
            0,
        ),
    };

    let waited = wait_for(&mut child, &spec.target);
    let elapsed = started.elapsed();

    #[cfg(feature = "metrics")]
    crate::observability::FluxMetrics::global().record_transfer(
        bytes_sent,
        elapsed,
        sent.is_ok() && waited.as_ref().is_ok_and(|status| status.success()),
    );

    settle(&spec.target, sent, waited)?;

    info!(
        "sent {} bytes of {} to {} in {:.1?}",
        bytes_sent, spec.snapshot.name, spec.target, elapsed
    );

    Ok(TransferOutcome {
        snapshot: spec.snapshot.name.clone(),
        predecessor: spec.predecessor.as_ref().map(|p| p.name.clone()),
        target: spec.target.clone(),
        dest,
        bytes_sent,
        elapsed,
    })
}
