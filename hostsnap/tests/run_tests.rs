//! End-to-end backup runs against real `tar` and `gzip`.

use hostsnap::executor::{DestinationStatus, RunOutcome};
use hostsnap::planner::BackupKind;
use hostsnap::{BackupExecutor, Config};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    backup_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let backup_dir = root.join("backups");
        fs::create_dir(&backup_dir).unwrap();
        Self {
            _dir: dir,
            root,
            backup_dir,
        }
    }

    fn source(&self, name: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("a.conf"), b"alpha\n").unwrap();
        path
    }

    /// `destinations` and `extra` are raw YAML spliced into the backup section
    fn config(&self, compression: &str, destinations: &str, extra: &str) -> Config {
        let yaml = format!(
            r#"
backup:
  log_file: {log}
  backup_dir: {backup}
  full_backup_interval: 3
  compression: {compression}
  retention_time: false
  hostname: HOST
  tools:
    dpkg: /nonexistent/dpkg
    rpm: /nonexistent/rpm
{extra}
  destinations:
{destinations}
"#,
            log = self.root.join("backup.log").display(),
            backup = self.backup_dir.display(),
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn counter(&self, archive: &str) -> String {
        fs::read_to_string(self.backup_dir.join(format!("incremental_count_{}.txt", archive)))
            .unwrap()
    }

    fn snapshot(&self, archive: &str) -> PathBuf {
        self.backup_dir.join(format!("snapshot_{}.snar", archive))
    }
}

fn destination(path: &Path, archive: &str, kind: &str) -> String {
    format!(
        "    - path: {}\n      archive: {}\n      type: {}\n",
        path.display(),
        archive,
        kind
    )
}

/// Stand-in archiver that never finishes on its own
#[cfg(unix)]
fn stalled_tar(fx: &Fixture) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = fx.root.join("stalled-tar");
    fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn file_name(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_incremental_cycle() {
    let fx = Fixture::new();
    let src = fx.source("etc");
    let config = fx.config("tar", &destination(&src, "etc", "incremental"), "");
    let executor = BackupExecutor::new(config);

    let expected = [
        ("HOST_etc_full-0.tar", BackupKind::Full, "1"),
        ("HOST_etc_incremental-1.tar", BackupKind::Incremental, "2"),
        ("HOST_etc_incremental-2.tar", BackupKind::Incremental, "3"),
        ("HOST_etc_full-3.tar", BackupKind::Full, "1"),
    ];

    for (run, (name, kind, counter)) in expected.iter().enumerate() {
        fs::write(src.join(format!("run-{}.txt", run)), b"changed").unwrap();

        let report = executor.execute_run().await.unwrap();
        assert!(report.is_success(), "run {} failed: {:?}", run, report);

        let dest = &report.destinations[0];
        assert_eq!(file_name(&dest.file), *name);
        assert_eq!(dest.kind, Some(*kind));
        assert!(dest.file.as_ref().unwrap().is_file());
        assert_eq!(fx.counter("etc"), *counter);
        assert!(fx.snapshot("etc").is_file());
    }

    let report = executor.execute_run().await.unwrap();
    assert_eq!(
        file_name(&report.destinations[0].file),
        "HOST_etc_incremental-1.tar"
    );
}

#[tokio::test]
async fn test_full_single_gzip_leaves_no_state() {
    let fx = Fixture::new();
    let src = fx.source("srv");
    let config = fx.config("gzip", &destination(&src, "srv", "full-single"), "");

    let report = BackupExecutor::new(config).execute_run().await.unwrap();
    assert!(report.is_success());

    let file = report.destinations[0].file.clone().unwrap();
    assert_eq!(file_name(&Some(file.clone())), "HOST_srv_full-single-0.tar.gz");
    let bytes = fs::read(&file).unwrap();
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

    assert!(!fx.backup_dir.join("incremental_count_srv.txt").exists());
    assert!(!fx.snapshot("srv").exists());
}

#[tokio::test]
async fn test_zstd_archive() {
    let fx = Fixture::new();
    let src = fx.source("home");
    let config = fx.config("zstd", &destination(&src, "home", "full"), "");

    let report = BackupExecutor::new(config).execute_run().await.unwrap();
    assert!(report.is_success());

    let file = report.destinations[0].file.clone().unwrap();
    assert!(file.to_string_lossy().ends_with(".tar.zst"));
    let bytes = fs::read(&file).unwrap();
    assert_eq!(&bytes[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
}

#[tokio::test]
async fn test_failed_archive_keeps_previous_state() {
    let fx = Fixture::new();
    let src = fx.source("etc");

    let good = fx.config("gzip", &destination(&src, "etc", "incremental"), "");
    let report = BackupExecutor::new(good).execute_run().await.unwrap();
    assert!(report.is_success());

    let counter_before = fx.counter("etc");
    let snar_before = fs::read(fx.snapshot("etc")).unwrap();

    let broken = fx.config(
        "gzip",
        &destination(&src, "etc", "incremental"),
        "    gzip: /nonexistent/gzip",
    );
    let report = BackupExecutor::new(broken).execute_run().await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(matches!(
        report.destinations[0].status,
        DestinationStatus::Failed { .. }
    ));
    assert_eq!(fx.counter("etc"), counter_before);
    assert_eq!(fs::read(fx.snapshot("etc")).unwrap(), snar_before);
    assert!(!fx.backup_dir.join("snapshot_etc.snar.pending").exists());
}

#[tokio::test]
async fn test_failing_destination_does_not_stop_the_run() {
    let fx = Fixture::new();
    let src = fx.source("var");
    let missing = fx.root.join("missing");

    let destinations = format!(
        "{}{}",
        destination(&missing, "missing", "full"),
        destination(&src, "var", "full")
    );
    let config = fx.config("tar", &destinations, "");

    let report = BackupExecutor::new(config).execute_run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.destinations.len(), 2);
    assert!(matches!(
        report.destinations[0].status,
        DestinationStatus::Failed { .. }
    ));
    assert!(matches!(
        report.destinations[1].status,
        DestinationStatus::Succeeded { .. }
    ));
    assert!(!fx.backup_dir.join("incremental_count_missing.txt").exists());
    assert_eq!(fx.counter("var"), "1");

    // Exporters and pruning still ran.
    assert!(report.packages.is_some());
    assert!(report.pruning.is_some());
}

#[tokio::test]
async fn test_existing_backup_set_is_reused() {
    let fx = Fixture::new();
    let src = fx.source("opt");
    let config = fx.config("tar", &destination(&src, "opt", "full-single"), "");
    let executor = BackupExecutor::new(config);

    let first = executor.execute_run().await.unwrap();
    let marker = first.backup_set.join("marker.txt");
    fs::write(&marker, b"keep").unwrap();

    let second = executor.execute_run().await.unwrap();
    assert_eq!(first.backup_set, second.backup_set);
    assert_eq!(fs::read(&marker).unwrap(), b"keep");
}

#[tokio::test]
async fn test_cancelled_run_aborts_before_exporters() {
    let fx = Fixture::new();
    let src = fx.source("etc");
    let config = fx.config("tar", &destination(&src, "etc", "incremental"), "");

    let token = CancellationToken::new();
    token.cancel();
    let report = BackupExecutor::with_cancel(config, token)
        .execute_run()
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
    assert!(report.destinations.is_empty());
    assert!(report.packages.is_none());
    assert!(report.pruning.is_none());
    assert!(!fx.backup_dir.join("incremental_count_etc.txt").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancel_during_capture_aborts_run() {
    let fx = Fixture::new();
    let etc = fx.source("etc");
    let var = fx.source("var");
    let destinations = format!(
        "{}{}",
        destination(&etc, "etc", "incremental"),
        destination(&var, "var", "full")
    );

    let good = fx.config("tar", &destinations, "");
    assert!(BackupExecutor::new(good).execute_run().await.unwrap().is_success());
    let counter_before = fx.counter("etc");
    let snar_before = fs::read(fx.snapshot("etc")).unwrap();

    let stalled = fx.config(
        "tar",
        &destinations,
        &format!("    tar: {}", stalled_tar(&fx).display()),
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let report = BackupExecutor::with_cancel(stalled, token)
        .execute_run()
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
    assert_eq!(report.destinations.len(), 1);
    assert_eq!(report.destinations[0].archive, "etc");
    assert!(matches!(
        report.destinations[0].status,
        DestinationStatus::Failed { .. }
    ));
    assert!(report.packages.is_none());
    assert!(report.databases.is_empty());
    assert!(report.pruning.is_none());

    assert_eq!(fx.counter("etc"), counter_before);
    assert_eq!(fs::read(fx.snapshot("etc")).unwrap(), snar_before);
    assert!(!fx.backup_dir.join("snapshot_etc.snar.pending").exists());
    assert_eq!(fx.counter("var"), "1");
}

#[cfg(unix)]
#[tokio::test]
async fn test_timed_out_capture_is_a_destination_failure() {
    let fx = Fixture::new();
    let etc = fx.source("etc");
    let var = fx.source("var");
    let destinations = format!(
        "{}{}",
        destination(&etc, "etc", "incremental"),
        destination(&var, "var", "full")
    );

    let config = fx.config(
        "tar",
        &destinations,
        &format!(
            "    tar: {}\n  pipeline_timeout_secs: 1",
            stalled_tar(&fx).display()
        ),
    );
    let report = BackupExecutor::new(config).execute_run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.destinations.len(), 2);
    for dest in &report.destinations {
        match &dest.status {
            DestinationStatus::Failed { reason } => assert!(reason.contains("timed out")),
            other => panic!("{} should have timed out, got {:?}", dest.archive, other),
        }
    }
    assert!(report.packages.is_some());
    assert!(report.pruning.is_some());

    assert!(!fx.backup_dir.join("incremental_count_etc.txt").exists());
    assert!(!fx.backup_dir.join("incremental_count_var.txt").exists());
    assert!(!fx.backup_dir.join("snapshot_etc.snar.pending").exists());
}
