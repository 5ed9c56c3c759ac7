//! Smoke tests for the command line surface
//!
//! Scenarios covered:
//! - help lists every subcommand
//! - a missing configuration file fails with a non-zero exit code
//! - sha1 prints a table, with `-` for sidecars without artifact
//! - setup writes profile scripts next to the configuration

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str as pred_str;
use std::fs;
use tempfile::TempDir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("cloud-sidecars").unwrap();
    cmd.env_remove("VCAP_APPLICATION")
        .env_remove("BUILDPACKS_IO_LAUNCHER_PATH")
        .env_remove("SIDECAR_APP_PORT")
        .env_remove("SIDECARS_LOG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn smoke_help_lists_commands() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(pred_str::contains("launch"))
        .stdout(pred_str::contains("setup"))
        .stdout(pred_str::contains("vendor"))
        .stdout(pred_str::contains("sha1"));
}

#[test]
fn smoke_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    cli()
        .args(["sha1", "--dir"])
        .arg(tmp.path())
        .assert()
        .failure()
        .stderr(pred_str::contains("Configuration file not found"));
}

#[test]
fn smoke_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("sidecars-config.yml"),
        "sidecars:\n  - executable: agent\n",
    )
    .unwrap();
    cli()
        .args(["sha1", "--dir"])
        .arg(tmp.path())
        .assert()
        .failure()
        .stderr(pred_str::contains("name"));
}

#[test]
fn smoke_sha1_table() {
    let tmp = TempDir::new().unwrap();
    let artifact = tmp.path().join("agent.tar");
    fs::write(&artifact, b"not really a tarball").unwrap();
    let config = format!(
        "sidecars:\n  - name: agent\n    executable: bin/agent\n    artifact_uri: {}\n  - name: plain\n    executable: /bin/true\n",
        artifact.display()
    );
    fs::write(tmp.path().join("sidecars-config.yml"), config).unwrap();

    cli()
        .args(["sha1", "--dir"])
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(pred_str::contains("Sidecar Name"))
        .stdout(pred_str::is_match(r"agent\s+\| [0-9a-f]{40}").unwrap())
        .stdout(pred_str::is_match(r"plain\s+\| -").unwrap());
}

#[test]
fn smoke_setup_writes_profiles() {
    let tmp = TempDir::new().unwrap();
    let config = "sidecars:\n  - name: proxy\n    executable: /bin/true\n    profiled: export FROM_PROXY=1\n    app_env:\n      HTTP_PROXY: http://localhost:3128\n";
    fs::write(tmp.path().join("sidecars-config.yml"), config).unwrap();

    cli()
        .args(["setup", "--dir"])
        .arg(tmp.path())
        .assert()
        .success();

    let profile_dir = tmp.path().join("profile.d");
    let proxy = fs::read_to_string(profile_dir.join("proxy.sh")).unwrap();
    assert_eq!(proxy, "export FROM_PROXY=1");
    let starter = fs::read_to_string(profile_dir.join("starter.sh")).unwrap();
    assert!(predicate::str::contains("export HTTP_PROXY=http://localhost:3128").eval(&starter));
}
