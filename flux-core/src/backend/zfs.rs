/*!
Backend adapter driving the `zfs(8)` command-line tool.
*/

use super::{Dataset, DatasetBackend, DatasetKind, DestroyMode, SNAPSHOT_SEPARATOR};
use crate::{FluxError, Result};
use std::io::{self, Write};
use std::process::{Command, Output, Stdio};
use tracing::{debug, trace};

/// Default program name, resolved through `PATH`
pub const DEFAULT_ZFS_PROGRAM: &str = "zfs";

/// Dataset backend that shells out to `zfs`
///
/// Every call runs one `zfs` subcommand in scripted mode (`-H`, and `-p` for
/// parsable numbers). Send streams are copied from the child's stdout into
/// the caller's writer without buffering the whole stream.
///
/// # Example
/// ```rust,no_run
/// use flux_core::backend::{DatasetBackend, ZfsCommandBackend};
///
/// let backend = ZfsCommandBackend::new();
/// let data = backend.get_dataset("tank/data")?;
/// for child in backend.children(&data, 0)? {
///     println!("{} ({})", child.name, child.kind);
/// }
/// # Ok::<(), flux_core::FluxError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ZfsCommandBackend {
    program: String,
    prefix_args: Vec<String>,
}

impl ZfsCommandBackend {
    /// Use `zfs` from `PATH`
    pub fn new() -> Self {
        Self::with_program(DEFAULT_ZFS_PROGRAM)
    }

    /// Use a specific `zfs` binary
    pub fn with_program<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    /// Run `program prefix_args... <zfs arguments>`, e.g. `sudo -n zfs`
    pub fn with_command<S, I, A>(program: S, prefix_args: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            program: program.into(),
            prefix_args: prefix_args.into_iter().map(Into::into).collect(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args).args(args);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.prefix_args.iter().map(String::as_str));
        parts.extend_from_slice(args);
        parts.join(" ")
    }

    /// Run a subcommand to completion and return its stdout
    fn run(&self, args: &[&str]) -> Result<String> {
        let description = self.describe(args);
        trace!("running {}", description);

        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FluxError::backend(format!("failed to run {description}: {e}")))?;

        check_output(&description, output)
    }

    fn send(&self, args: &[&str], writer: &mut dyn Write) -> Result<()> {
        let description = self.describe(args);
        debug!("streaming {}", description);

        let mut child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| FluxError::backend(format!("failed to run {description}: {e}")))?;

        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, writer).and_then(|n| {
                writer.flush()?;
                Ok(n)
            }),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "send stream has no stdout",
            )),
        };
        // stdout is dropped here, so a sender blocked on a dead reader sees EPIPE

        let status = child
            .wait()
            .map_err(|e| FluxError::backend(format!("failed to wait for {description}: {e}")))?;

        let bytes = copied?;
        if !status.success() {
            return Err(FluxError::backend(format!(
                "{description} exited with {status}"
            )));
        }
        debug!("{} produced {} bytes", description, bytes);
        Ok(())
    }
}

impl Default for ZfsCommandBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_output(description: &str, output: Output) -> Result<String> {
    if output.status.success() {
        return String::from_utf8(output.stdout)
            .map_err(|e| FluxError::backend(format!("{description}: invalid UTF-8 output: {e}")));
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("does not exist") {
        return Err(FluxError::not_found(stderr));
    }
    Err(FluxError::backend(format!(
        "{description} exited with {}: {stderr}",
        output.status
    )))
}

/// Parse `zfs list -H -o name,type` output
///
/// Lines with an unknown type are skipped.
pub fn parse_list_output(output: &str) -> Vec<Dataset> {
    output
        .lines()
        .filter_map(|line| {
            let (name, kind) = line.split_once('\t')?;
            let kind = DatasetKind::parse(kind)?;
            Some(Dataset::new(name.trim(), kind))
        })
        .collect()
}

fn destroy_flag(mode: DestroyMode) -> Option<&'static str> {
    match mode {
        DestroyMode::Default => None,
        DestroyMode::Recursive => Some("-r"),
        DestroyMode::RecursiveClones => Some("-R"),
        DestroyMode::Deferred => Some("-d"),
    }
}

impl DatasetBackend for ZfsCommandBackend {
    fn get_dataset(&self, name: &str) -> Result<Dataset> {
        let output = self.run(&["list", "-H", "-o", "name,type", "-t", "all", name])?;
        parse_list_output(&output)
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| FluxError::not_found(name))
    }

    fn children(&self, dataset: &Dataset, depth: u32) -> Result<Vec<Dataset>> {
        // zfs counts the dataset itself as depth 0
        let depth = depth.saturating_add(1).to_string();
        let output = self.run(&[
            "list",
            "-H",
            "-o",
            "name,type",
            "-t",
            "all",
            "-d",
            depth.as_str(),
            dataset.name.as_str(),
        ])?;

        Ok(parse_list_output(&output)
            .into_iter()
            .filter(|d| d.name != dataset.name)
            .collect())
    }

    fn get_property(&self, dataset: &Dataset, property: &str) -> Result<String> {
        let output = self.run(&["get", "-H", "-p", "-o", "value", property, dataset.name.as_str()])?;
        let value = output.trim();
        if value.is_empty() || value == "-" {
            return Err(FluxError::backend(format!(
                "property {property} not set on {}",
                dataset.name
            )));
        }
        Ok(value.to_string())
    }

    fn create_snapshot(&self, dataset: &Dataset, label: &str, recursive: bool) -> Result<Dataset> {
        let name = format!("{}{SNAPSHOT_SEPARATOR}{label}", dataset.name);
        let mut args = vec!["snapshot"];
        if recursive {
            args.push("-r");
        }
        args.push(&name);
        self.run(&args)?;
        Ok(Dataset::new(name, DatasetKind::Snapshot))
    }

    fn destroy(&self, dataset: &Dataset, mode: DestroyMode) -> Result<()> {
        let mut args = vec!["destroy"];
        args.extend(destroy_flag(mode));
        args.push(&dataset.name);
        self.run(&args)?;
        Ok(())
    }

    fn full_send(&self, snapshot: &Dataset, writer: &mut dyn Write) -> Result<()> {
        self.send(&["send", snapshot.name.as_str()], writer)
    }

    fn incremental_send(
        &self,
        predecessor: &Dataset,
        snapshot: &Dataset,
        writer: &mut dyn Write,
    ) -> Result<()> {
        self.send(&["send", "-i", predecessor.name.as_str(), snapshot.name.as_str()], writer)
    }
}
