//! Runs the `hostsnap` binary and checks what lands on stdout.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn write_config(root: &Path) -> std::path::PathBuf {
    let source = root.join("etc");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("hosts"), b"127.0.0.1 localhost\n").unwrap();
    fs::create_dir_all(root.join("backups")).unwrap();

    let path = root.join("backup_config.yaml");
    let yaml = format!(
        r#"
backup:
  log_file: {root}/backup.log
  backup_dir: {root}/backups
  full_backup_interval: 3
  compression: gzip
  retention_time: 7
  hostname: HOST
  tools:
    dpkg: /nonexistent/dpkg
    rpm: /nonexistent/rpm
  destinations:
    - path: {root}/etc
      archive: etc
      type: incremental
"#,
        root = root.display()
    );
    fs::write(&path, yaml).unwrap();
    path
}

fn hostsnap(args: &[&str], config: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hostsnap"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn test_json_report_is_the_only_stdout() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    let output = hostsnap(&["--json"], &config);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["hostname"], "HOST");
    assert_eq!(report["outcome"]["state"], "completed");
    assert_eq!(report["destinations"][0]["status"]["status"], "succeeded");
    assert_eq!(report["destinations"][0]["status"]["counter"], 1);

    // Console logging goes to stderr, the sink file still gets its lines.
    assert!(String::from_utf8_lossy(&output.stderr).contains("Starting backup process..."));
    let log = fs::read_to_string(dir.path().join("backup.log")).unwrap();
    assert!(log.lines().any(|l| l.ends_with(" - Starting backup process...")));
}

#[test]
fn test_prune_only_json() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    let output = hostsnap(&["--prune-only", "--json"], &config);
    assert!(output.status.success());

    let pruned: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(pruned["removed"].as_array().unwrap().is_empty());
    assert!(pruned["failed"].as_array().unwrap().is_empty());
}
