/*!
End-to-end scenarios for the snapshot and purge workflows.
These run against the in-memory backend and, for transfers, a local `sh`
standing in for ssh.
*/

use chrono::{DateTime, TimeZone, Utc};
use flux_core::backend::{MemoryBackend, SendRecord};
use flux_core::{
    create_and_resolve, list_snapshots, purge_at, transfer, DatasetBackend, FluxEngine,
    RemoteOptions, RetentionPolicy, SnapshotOptions, TransferSpec, TransportConfig,
};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const HOUR: i64 = 60 * 60;
const DAY: i64 = 24 * HOUR;

fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_717_200_000, 0).unwrap()
}

fn qualified_names(backend: &MemoryBackend, dataset: &str) -> Vec<String> {
    let data = backend.get_dataset(dataset).unwrap();
    list_snapshots(backend, &data)
        .unwrap()
        .iter()
        .map(|e| e.qualified_name.clone())
        .collect()
}

/// Receiver that writes its stdin to the destination path
fn file_receiver() -> TransportConfig {
    TransportConfig::with_program("sh")
        .with_ssh_options(["-c", "cat > \"$2\""])
        .with_receive_command(["recv"])
}

#[test]
fn test_purge_seven_days_destroys_only_ten_day_old_snapshot() {
    let t = now().timestamp();
    let backend = MemoryBackend::new()
        .with_filesystem("tank/data")
        .with_snapshot("tank/data@t-10d", t - 10 * DAY)
        .with_snapshot("tank/data@t-3d", t - 3 * DAY)
        .with_snapshot("tank/data@t-1h", t - HOUR);
    let data = backend.get_dataset("tank/data").unwrap();

    let policy = RetentionPolicy::new(Duration::from_secs(7 * DAY as u64));
    let report = purge_at(&backend, &data, &policy, now()).unwrap();

    assert_eq!(report.destroyed, vec!["tank/data@t-10d"]);
    assert_eq!(backend.destroyed(), vec!["tank/data@t-10d"]);
    assert_eq!(
        qualified_names(&backend, "tank/data"),
        vec!["tank/data@t-3d", "tank/data@t-1h"]
    );
}

#[test]
fn test_first_snapshot_of_empty_dataset_has_no_predecessor() {
    let backend = MemoryBackend::new().with_filesystem("tank/data");
    let data = backend.get_dataset("tank/data").unwrap();

    let chain = create_and_resolve(&backend, &data, "2024-03-01T00:00:00Z", false).unwrap();

    assert!(chain.predecessor.is_none());
    assert_eq!(qualified_names(&backend, "tank/data"), vec!["tank/data@2024-03-01T00:00:00Z"]);
}

#[test]
fn test_predecessor_is_february_snapshot() {
    let backend = MemoryBackend::new()
        .with_filesystem("tank/data")
        .with_snapshot("tank/data@2024-01-01T00:00:00Z", 1_704_067_200)
        .with_snapshot("tank/data@2024-02-01T00:00:00Z", 1_706_745_600);
    let data = backend.get_dataset("tank/data").unwrap();

    let chain = create_and_resolve(&backend, &data, "2024-03-01T00:00:00Z", false).unwrap();

    assert_eq!(
        chain.predecessor.unwrap().qualified_name,
        "tank/data@2024-02-01T00:00:00Z"
    );
}

#[test]
fn test_malformed_snapshot_is_left_out_of_listing() {
    let backend = MemoryBackend::new()
        .with_filesystem("tank/data")
        .with_snapshot_property("tank/data@not-a-timestamp", "not-a-timestamp")
        .with_snapshot("tank/data@2024-01-01T00:00:00Z", 1_704_067_200);

    assert_eq!(
        qualified_names(&backend, "tank/data"),
        vec!["tank/data@2024-01-01T00:00:00Z"]
    );
}

#[test]
fn test_malformed_snapshot_is_never_purged() {
    let backend = MemoryBackend::new()
        .with_filesystem("tank/data")
        .with_snapshot_property("tank/data@not-a-timestamp", "0x10")
        .with_snapshot("tank/data@ancient", 1_000);
    let data = backend.get_dataset("tank/data").unwrap();

    let report = purge_at(&backend, &data, &RetentionPolicy::new(Duration::ZERO), now()).unwrap();

    assert_eq!(report.destroyed, vec!["tank/data@ancient"]);
    assert!(backend.contains("tank/data@not-a-timestamp"));
}

#[test]
fn test_transfer_without_predecessor_is_full() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("stream");
    let backend = MemoryBackend::new()
        .with_filesystem("tank/data")
        .with_snapshot("tank/data@a", 1_000)
        .with_snapshot("tank/data@b", 2_000);
    let snapshot = backend.get_dataset("tank/data@b").unwrap();

    let spec = TransferSpec::new("backup-host", snapshot).with_dest(out.to_string_lossy());
    transfer(&backend, &file_receiver(), &spec).unwrap();

    assert_eq!(
        backend.sends(),
        vec![SendRecord::Full {
            snapshot: "tank/data@b".to_string()
        }]
    );
    assert_eq!(fs::read(&out).unwrap(), backend.full_stream("tank/data@b"));
}

#[test]
fn test_daily_cycle_snapshot_send_then_purge() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("stream");
    let backend = MemoryBackend::new()
        .with_filesystem("tank/data")
        .with_snapshot("tank/data@2024-01-01T00:00:00Z", 1_704_067_200);
    let engine = FluxEngine::with_transport(backend, file_receiver());

    let options = SnapshotOptions {
        label: Some("2024-06-01T00:00:00Z".to_string()),
        remote: Some(RemoteOptions {
            target: "backup-host".to_string(),
            dest: Some(out.to_string_lossy().to_string()),
            identity: None,
        }),
        ..Default::default()
    };
    let report = engine.snapshot_datasets(&["tank/data"], &options).unwrap();
    let sent = report.completed[0].transfer.as_ref().unwrap();
    assert_eq!(sent.predecessor.as_deref(), Some("tank/data@2024-01-01T00:00:00Z"));
    assert_eq!(
        fs::read(&out).unwrap(),
        engine
            .backend()
            .incremental_stream("tank/data@2024-01-01T00:00:00Z", "tank/data@2024-06-01T00:00:00Z")
    );

    // The new snapshot is stamped with the real clock, so it survives a 14-day purge
    let purge = flux_core::PurgeOptions::default();
    let reports = engine.purge_datasets(&["tank/data"], &purge).unwrap();
    assert_eq!(reports[0].destroyed, vec!["tank/data@2024-01-01T00:00:00Z"]);
    assert_eq!(
        qualified_names(engine.backend(), "tank/data"),
        vec!["tank/data@2024-06-01T00:00:00Z"]
    );
}
