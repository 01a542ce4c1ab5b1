//! Tests for the `berth` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn berth(root: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("berth").unwrap();
    cmd.env("BERTH_ROOT", root.path()).env_remove("RUST_LOG");
    cmd
}

fn setup() -> TempDir {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("images/alpine/rootfs/etc")).unwrap();
    root
}

#[test]
fn named_volume_lifecycle() {
    let root = setup();

    berth(&root)
        .args(["volume", "create", "data", "--label", "team=web"])
        .assert()
        .success()
        .stdout("data\n");

    berth(&root)
        .args(["create", "alpine", "-v", "data:/data", "--name", "web"])
        .assert()
        .success()
        .stdout("web\n");

    berth(&root)
        .args(["volume", "ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data").and(predicate::str::contains("named")));

    berth(&root)
        .args(["volume", "rm", "data"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Volume in use: data"));

    berth(&root).args(["rm", "web"]).assert().success();

    berth(&root)
        .args(["volume", "rm", "data"])
        .assert()
        .success()
        .stdout("data\n");

    berth(&root)
        .args(["volume", "ls", "-q"])
        .assert()
        .success()
        .stdout("");
}

#[test]
fn volume_ls_json() {
    let root = setup();
    berth(&root)
        .args(["create", "alpine", "-v", "/scratch", "--rm", "--name", "job"])
        .assert()
        .success();

    let output = berth(&root)
        .args(["volume", "ls", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let volumes: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(volumes[0]["kind"], "anonymous");
    assert_eq!(volumes[0]["ref_count"], 1);

    berth(&root).args(["stop", "job"]).assert().success();
    berth(&root)
        .args(["volume", "ls", "-q"])
        .assert()
        .success()
        .stdout("");
}

#[test]
fn start_prints_mount_table() {
    let root = setup();
    let host = root.path().join("src");

    berth(&root)
        .args(["create", "alpine", "--name", "web", "-v"])
        .arg(format!("{}:/app:ro", host.display()))
        .args(["-v", "/app/deps"])
        .assert()
        .success();

    berth(&root)
        .args(["start", "web"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("/app/deps")
                .and(predicate::str::contains("anonymous"))
                .and(predicate::str::contains("ro")),
        );
}

#[test]
fn invalid_mount_spec_is_rejected() {
    let root = setup();
    berth(&root)
        .args(["create", "alpine", "-v", "data:relative"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid mount spec"));

    berth(&root)
        .args(["volume", "ls", "-q"])
        .assert()
        .success()
        .stdout("");
}

#[test]
fn prune_reports_count() {
    let root = setup();
    berth(&root).args(["volume", "create", "old"]).assert().success();

    berth(&root)
        .args(["volume", "prune"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total volumes removed: 1"));
}

#[test]
fn unknown_image() {
    let root = setup();
    berth(&root)
        .args(["create", "busybox"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("busybox"));
}

#[test]
fn rootless_engine_refuses_to_mount() {
    let root = setup();
    let config = root.path().join("berth.toml");
    std::fs::write(&config, "rootless = true\n").unwrap();

    berth(&root)
        .args(["create", "alpine", "-v", "/cache", "--name", "web"])
        .assert()
        .success();

    berth(&root)
        .arg("--config")
        .arg(&config)
        .args(["start", "web", "--mount"])
        .arg(root.path().join("mnt"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("rootless"));

    berth(&root)
        .args(["ps", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"created\""));
}
