/*!
flux CLI - snapshot, replicate and prune ZFS datasets.

Typically run from cron or a systemd timer:

```text
flux snapshot tank/data --send backup-host --dest pool/backup/data --uid 1000 --gid 1000
flux purge tank/data --older-than 14d
```
*/

use anyhow::Context;
use clap::{Parser, Subcommand};
use flux_core::engine::SnapshotResult;
use flux_core::observability::{init_logging, LogOptions};
use flux_core::{
    FluxEngine, Identity, PurgeOptions, PurgeReport, RemoteOptions, RetentionPolicy,
    SnapshotOptions, TransportConfig, ZfsCommandBackend,
};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "flux")]
#[command(about = "Snapshot, replicate and prune ZFS datasets")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true, env = "FLUX_DEBUG")]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "FLUX_JSON_LOGS")]
    json_logs: bool,

    /// Write Prometheus metrics to this file on exit
    #[arg(long, global = true, env = "FLUX_METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    /// zfs binary to drive
    #[arg(long, global = true, env = "FLUX_ZFS", default_value = "zfs")]
    zfs: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a snapshot of each dataset and optionally send it
    Snapshot {
        /// Datasets to snapshot
        #[arg(required = true)]
        names: Vec<String>,

        /// Remote host to send the new snapshot to
        #[arg(short, long)]
        send: Option<String>,

        /// Dataset on the remote host receiving the stream
        #[arg(short, long, requires = "send")]
        dest: Option<String>,

        /// uid the transport runs under
        #[arg(long, requires = "send")]
        uid: Option<u32>,

        /// gid the transport runs under
        #[arg(long, requires = "send")]
        gid: Option<u32>,

        /// Send the full snapshot instead of an increment
        #[arg(long, requires = "send")]
        init: bool,

        /// Snapshot label; defaults to the current UTC time
        #[arg(long)]
        label: Option<String>,

        /// Extra transfer attempts after a failure
        #[arg(long, default_value_t = 0)]
        retries: usize,

        /// Stop at the first failing dataset
        #[arg(long)]
        fail_fast: bool,

        /// ssh program
        #[arg(long, env = "FLUX_SSH", default_value = "ssh")]
        ssh: String,

        /// Extra option passed to ssh before the target (repeatable)
        #[arg(long = "ssh-option", allow_hyphen_values = true)]
        ssh_options: Vec<String>,
    },
    /// Destroy snapshots older than a given age
    Purge {
        /// Datasets to prune
        #[arg(required = true)]
        names: Vec<String>,

        /// Maximum snapshot age (e.g. 7d, 12h, 2weeks)
        #[arg(short, long, default_value = "14d")]
        older_than: humantime::Duration,

        /// Report what would be destroyed without destroying it
        #[arg(long)]
        dry: bool,

        /// Always keep this many of the newest snapshots
        #[arg(long, default_value_t = 0)]
        keep: usize,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,

        /// Stop at the first failing dataset
        #[arg(long)]
        fail_fast: bool,

        /// Exit non-zero when any snapshot could not be destroyed
        #[arg(long)]
        strict: bool,
    },
    /// List snapshots in creation order
    List {
        /// Datasets to list
        #[arg(required = true)]
        names: Vec<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Snapshot")]
    name: String,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Created")]
    created: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(LogOptions {
        debug: cli.debug,
        json: cli.json_logs,
    })?;

    let result = run(&cli);

    if let Some(path) = &cli.metrics_file {
        write_metrics(path);
    }

    result
}

fn run(cli: &Cli) -> Result<(), anyhow::Error> {
    let backend = ZfsCommandBackend::with_program(cli.zfs.clone());

    match &cli.command {
        Commands::Snapshot {
            names,
            send,
            dest,
            uid,
            gid,
            init,
            label,
            retries,
            fail_fast,
            ssh,
            ssh_options,
        } => {
            let options = snapshot_options(
                send.clone(),
                dest.clone(),
                Identity::from_parts(*uid, *gid)?,
                *init,
                label.clone(),
                *retries,
                *fail_fast,
            );
            let transport = TransportConfig::with_program(ssh.clone())
                .with_ssh_options(ssh_options.iter().cloned());
            let engine = FluxEngine::with_transport(backend, transport);
            run_snapshot(&engine, names, &options)
        }
        Commands::Purge {
            names,
            older_than,
            dry,
            keep,
            json,
            fail_fast,
            strict,
        } => {
            let options = PurgeOptions {
                policy: RetentionPolicy::new((*older_than).into())
                    .with_keep_latest(*keep)
                    .with_dry_run(*dry),
                fail_fast: *fail_fast,
            };
            let engine = FluxEngine::new(backend);
            run_purge(&engine, names, &options, *json, *strict)
        }
        Commands::List { names, json } => {
            let engine = FluxEngine::new(backend);
            run_list(&engine, names, *json)
        }
    }
}

fn snapshot_options(
    send: Option<String>,
    dest: Option<String>,
    identity: Option<Identity>,
    initial: bool,
    label: Option<String>,
    retries: usize,
    fail_fast: bool,
) -> SnapshotOptions {
    SnapshotOptions {
        label,
        initial,
        remote: send.map(|target| RemoteOptions {
            target,
            dest,
            identity,
        }),
        retries,
        fail_fast,
    }
}

fn run_snapshot(
    engine: &FluxEngine<ZfsCommandBackend>,
    names: &[String],
    options: &SnapshotOptions,
) -> Result<(), anyhow::Error> {
    if options.remote.is_none() && options.retries > 0 {
        warn!("--retries only applies together with --send");
    }

    let report = engine.snapshot_datasets(names, options)?;
    for result in &report.completed {
        print_snapshot_result(result);
    }
    Ok(())
}

fn print_snapshot_result(result: &SnapshotResult) {
    println!("✓ {}", result.chain.snapshot.qualified_name);
    if let Some(outcome) = &result.transfer {
        let kind = match &outcome.predecessor {
            Some(prev) => format!("incremental from {prev}"),
            None => "full".to_string(),
        };
        println!(
            "  sent to {}:{} ({}, {} in {})",
            outcome.target,
            outcome.dest,
            kind,
            format_size(outcome.bytes_sent),
            humantime::format_duration(round_to_millis(outcome.elapsed)),
        );
    }
}

fn run_purge(
    engine: &FluxEngine<ZfsCommandBackend>,
    names: &[String],
    options: &PurgeOptions,
    json: bool,
    strict: bool,
) -> Result<(), anyhow::Error> {
    let reports = engine.purge_datasets(names, options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_purge_report(report);
        }
    }

    check_destroy_failures(&reports, strict)
}

/// Destroy failures are in the reports; only `--strict` turns them into an error
fn check_destroy_failures(reports: &[PurgeReport], strict: bool) -> Result<(), anyhow::Error> {
    let failures: usize = reports.iter().map(|r| r.failed.len()).sum();
    if failures == 0 {
        return Ok(());
    }
    if strict {
        anyhow::bail!("{failures} snapshot(s) could not be destroyed");
    }
    warn!("{} snapshot(s) could not be destroyed", failures);
    Ok(())
}

fn print_purge_report(report: &PurgeReport) {
    println!(
        "{} (cutoff {}):",
        report.dataset,
        format_time(&report.cutoff)
    );
    for name in &report.would_destroy {
        println!("  would destroy {name}");
    }
    for name in &report.destroyed {
        println!("  destroyed {name}");
    }
    for failure in &report.failed {
        println!("  ✗ {}: {}", failure.snapshot, failure.error);
    }
    println!("  {} snapshot(s) retained", report.retained);
}

fn run_list(
    engine: &FluxEngine<ZfsCommandBackend>,
    names: &[String],
    json: bool,
) -> Result<(), anyhow::Error> {
    let mut rows = Vec::new();
    let mut listings = Vec::new();

    for name in names {
        let sequence = engine
            .list(name)
            .with_context(|| format!("failed to list snapshots of {name}"))?;
        info!("{}: {} snapshot(s)", name, sequence.len());

        if json {
            listings.push(sequence);
        } else {
            rows.extend(sequence.iter().map(|entry| SnapshotRow {
                name: entry.qualified_name.clone(),
                label: entry.label.clone(),
                created: format_time(&entry.created_at),
            }));
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
    } else if rows.is_empty() {
        println!("No snapshots found");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

#[cfg(feature = "metrics")]
fn write_metrics(path: &std::path::Path) {
    if let Err(e) = flux_core::observability::FluxMetrics::global().write_textfile(path) {
        warn!("Failed to write metrics to {}: {}", path.display(), e);
    }
}

#[cfg(not(feature = "metrics"))]
fn write_metrics(path: &std::path::Path) {
    warn!(
        "metrics support not enabled; not writing {}",
        path.display()
    );
}

fn round_to_millis(elapsed: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(elapsed.as_millis() as u64)
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

fn format_time(time: &chrono::DateTime<chrono::Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_snapshot_flags() {
        let cli = parse(&[
            "flux", "--debug", "snapshot", "tank/a", "tank/b", "-s", "backup", "-d",
            "pool/backup", "--uid", "1000", "--gid", "1000", "--init",
        ]);
        assert!(cli.debug);
        match cli.command {
            Commands::Snapshot {
                names,
                send,
                dest,
                uid,
                gid,
                init,
                retries,
                ..
            } => {
                assert_eq!(names, vec!["tank/a", "tank/b"]);
                assert_eq!(send.as_deref(), Some("backup"));
                assert_eq!(dest.as_deref(), Some("pool/backup"));
                assert_eq!((uid, gid), (Some(1000), Some(1000)));
                assert!(init);
                assert_eq!(retries, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_purge_defaults_to_fourteen_days() {
        let cli = parse(&["flux", "purge", "tank/a"]);
        match cli.command {
            Commands::Purge {
                older_than,
                dry,
                keep,
                ..
            } => {
                assert_eq!(Duration::from(older_than), Duration::from_secs(14 * 86_400));
                assert!(!dry);
                assert_eq!(keep, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_purge_humantime_age() {
        let cli = parse(&["flux", "purge", "tank/a", "-o", "7d", "--dry", "--keep", "2"]);
        match cli.command {
            Commands::Purge {
                older_than,
                dry,
                keep,
                ..
            } => {
                assert_eq!(Duration::from(older_than), Duration::from_secs(7 * 86_400));
                assert!(dry);
                assert_eq!(keep, 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_bad_duration_rejected() {
        assert!(Cli::try_parse_from(["flux", "purge", "tank/a", "-o", "soon"]).is_err());
    }

    #[test]
    fn test_names_required() {
        assert!(Cli::try_parse_from(["flux", "snapshot"]).is_err());
        assert!(Cli::try_parse_from(["flux", "list"]).is_err());
    }

    #[test]
    fn test_ssh_options_accept_hyphens() {
        let cli = parse(&[
            "flux", "snapshot", "tank/a", "--ssh-option", "-oBatchMode=yes", "--ssh-option",
            "-p2222",
        ]);
        match cli.command {
            Commands::Snapshot { ssh_options, .. } => {
                assert_eq!(ssh_options, vec!["-oBatchMode=yes", "-p2222"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_options_without_send_has_no_remote() {
        let options = snapshot_options(None, Some("pool".into()), None, false, None, 0, false);
        assert!(options.remote.is_none());
    }

    #[test]
    fn test_snapshot_options_send_without_dest_fails_validation() {
        let options = snapshot_options(Some("host".into()), None, None, false, None, 0, false);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_remote_flags_require_send() {
        for flags in [
            &["--dest", "pool/backup"][..],
            &["--uid", "1000", "--gid", "1000"][..],
            &["--init"][..],
        ] {
            let mut args = vec!["flux", "snapshot", "tank/a"];
            args.extend_from_slice(flags);
            assert!(Cli::try_parse_from(args).is_err(), "{flags:?}");
        }
    }

    fn report_with_failure() -> PurgeReport {
        let engine = FluxEngine::new(
            flux_core::MemoryBackend::new()
                .with_filesystem("tank/a")
                .with_snapshot("tank/a@old", 1_000)
                .failing_destroy("tank/a@old"),
        );
        let options = PurgeOptions::default();
        engine
            .purge_datasets(&["tank/a"], &options)
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_destroy_failures_fail_only_in_strict_mode() {
        let reports = vec![report_with_failure()];
        assert_eq!(reports[0].failed.len(), 1);

        assert!(check_destroy_failures(&reports, false).is_ok());
        assert!(check_destroy_failures(&reports, true).is_err());
        assert!(check_destroy_failures(&[], true).is_ok());
    }

    #[test]
    fn test_purge_strict_flag() {
        let cli = parse(&["flux", "purge", "tank/a", "--strict"]);
        assert!(matches!(cli.command, Commands::Purge { strict: true, .. }));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }
}
