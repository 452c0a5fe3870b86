//! Integration tests for the Charm CLI
//!
//! These tests run the actual binary against a temp store and storage root.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn media(&self) -> PathBuf {
        self.path().join("media")
    }

    /// `charm` bound to this workspace's config, store and storage root
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("charm").unwrap();
        cmd.env_remove("CHARM_PMAN_HOST")
            .env_remove("CHARM_PMAN_PORT")
            .env_remove("CHARM_MODE")
            .env("CHARM_STORAGE_ROOT", self.media())
            .env("NO_COLOR", "1")
            .env("RUST_LOG", "warn")
            .arg("--config")
            .arg(self.path().join("charm.yaml"))
            .arg("--store")
            .arg(self.path().join("store.yaml"));
        cmd
    }

    fn add_plugin(&self, yaml: &str) {
        let file = self.path().join("plugin.yaml");
        fs::write(&file, yaml).unwrap();
        self.cmd()
            .args(["plugin", "add"])
            .arg(&file)
            .assert()
            .success();
    }
}

const DCM2NII: &str = r#"
name: dcm2nii
type: fs
selfpath: /opt/plugins
selfexec: dcm2nii
"#;

#[test]
fn test_help_flag() {
    Command::cargo_bin("charm")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plugin execution dispatch"));
}

#[test]
fn test_plugin_add_and_create() {
    let ws = Workspace::new();
    let file = ws.path().join("plugin.yaml");
    fs::write(&file, DCM2NII).unwrap();

    ws.cmd()
        .args(["plugin", "add"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("dcm2nii"));

    ws.cmd()
        .args(["create", "--plugin", "dcm2nii", "--owner", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created record 1"));

    ws.cmd()
        .args(["show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("started"))
        .stdout(predicate::str::contains("alice"));
}

#[test]
fn test_path_prints_output_directory() {
    let ws = Workspace::new();
    ws.add_plugin(DCM2NII);
    ws.cmd()
        .args(["create", "--plugin", "dcm2nii", "--owner", "alice"])
        .assert()
        .success();

    let expected = ws.media().join("alice/feed_1/dcm2nii_1/data");
    ws.cmd()
        .args(["path", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected.to_string_lossy().to_string()));
    assert!(expected.is_dir());
}

#[test]
fn test_unknown_plugin_prints_fix() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["create", "--plugin", "nope", "--owner", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"))
        .stderr(predicate::str::contains("CHARM-021"))
        .stderr(predicate::str::contains("Fix:"));
}

#[test]
fn test_undeclared_parameter_rejected() {
    let ws = Workspace::new();
    ws.add_plugin(DCM2NII);
    ws.cmd()
        .args([
            "create", "--plugin", "dcm2nii", "--owner", "alice", "--param", "threads=4",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CHARM-011"));
}

#[test]
fn test_local_run_registers_files() {
    let ws = Workspace::new();
    let script = ws.path().join("touch.sh");
    fs::write(&script, "for last; do :; done\necho ok > \"$last/result.txt\"\n").unwrap();
    ws.add_plugin(&format!(
        "name: toucher\ntype: fs\nexecshell: /bin/sh\nselfpath: {}\nselfexec: touch.sh\n",
        ws.path().display()
    ));
    ws.cmd()
        .args(["create", "--plugin", "toucher", "--owner", "bob"])
        .assert()
        .success();

    ws.cmd()
        .args(["run", "1", "--mode", "crunner"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 file(s) registered"));

    ws.cmd()
        .args(["show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("finished-on-remote"))
        .stdout(predicate::str::contains("result.txt"));
}

#[test]
fn test_run_without_mode_uses_subprocess() {
    let ws = Workspace::new();
    let script = ws.path().join("touch.sh");
    fs::write(&script, "for last; do :; done\necho ok > \"$last/result.txt\"\n").unwrap();
    ws.add_plugin(&format!(
        "name: toucher\ntype: fs\nexecshell: /bin/sh\nselfpath: {}\nselfexec: touch.sh\n",
        ws.path().display()
    ));
    ws.cmd()
        .args(["create", "--plugin", "toucher", "--owner", "bob"])
        .assert()
        .success();

    ws.cmd()
        .args(["run", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 file(s) registered"));

    ws.cmd()
        .args(["show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("local-subprocess"));
}

#[test]
fn test_owner_outside_storage_root_rejected() {
    let ws = Workspace::new();
    ws.add_plugin(DCM2NII);
    ws.cmd()
        .args(["create", "--plugin", "dcm2nii", "--owner", "../../escaped"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CHARM-011"));
    assert!(!ws.path().join("escaped").exists());
}

#[test]
fn test_failed_run_is_persisted() {
    let ws = Workspace::new();
    let script = ws.path().join("fail.sh");
    fs::write(&script, "echo 'no dicom found' >&2\nexit 4\n").unwrap();
    ws.add_plugin(&format!(
        "name: failer\ntype: fs\nexecshell: /bin/sh\nselfpath: {}\nselfexec: fail.sh\n",
        ws.path().display()
    ));
    ws.cmd()
        .args(["create", "--plugin", "failer", "--owner", "bob"])
        .assert()
        .success();

    ws.cmd()
        .args(["run", "1", "--mode", "crunner"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CHARM-031"));

    ws.cmd()
        .args(["show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("finishedWithError"))
        .stdout(predicate::str::contains("stderr : no dicom found"))
        .stdout(predicate::str::contains("returncode : 4"));
}

#[test]
fn test_poll_requires_id_or_all() {
    let ws = Workspace::new();
    ws.cmd().arg("poll").assert().failure();
}

#[test]
fn test_poll_all_with_nothing_running() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["poll", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No records running"));
}

#[test]
fn test_invalid_mode_is_configuration_error() {
    let ws = Workspace::new();
    ws.add_plugin(DCM2NII);
    ws.cmd()
        .args(["create", "--plugin", "dcm2nii", "--owner", "alice"])
        .assert()
        .success();
    ws.cmd()
        .args(["run", "1", "--mode", "docker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CHARM-010"));
}
