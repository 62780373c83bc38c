use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn bin() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("hcv").expect("binary");
    for key in ["HCV_CONFIG", "HCV_STATE_DIR", "HCV_AUDIT_DIR", "HCV_AUDIT_KIND", "HCV_LOG_DIR"] {
        cmd.env_remove(key);
    }
    cmd
}

/// Config pinned to a scratch state dir.
fn scratch() -> (TempDir, PathBuf) {
    let tmp = tempdir().expect("tmpdir");
    let cfg = tmp.path().join("hcv.toml");
    let state = tmp.path().join("state");
    fs::write(&cfg, format!("state_dir = {:?}\n", state.display().to_string())).expect("config");
    (tmp, cfg)
}

fn stdout_json(cmd: &mut assert_cmd::Command) -> Value {
    let out = cmd.output().expect("run");
    serde_json::from_slice(&out.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not json ({e}): {}",
            String::from_utf8_lossy(&out.stdout)
        )
    })
}

fn empty_dir(root: &Path) -> PathBuf {
    let dir = root.join("desired");
    fs::create_dir_all(&dir).expect("mkdir");
    dir
}

#[test]
fn config_schema_prints_json_schema() {
    bin()
        .args(["config", "schema"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"properties\""))
        .stdout(predicate::str::contains("system_repo"));
}

#[test]
fn invalid_config_is_rejected() {
    let tmp = tempdir().expect("tmpdir");
    let cfg = tmp.path().join("bad.toml");
    fs::write(&cfg, "[limits]\nread_only_rps = \"fast\"\n").expect("config");
    bin()
        .arg("--config")
        .arg(&cfg)
        .args(["audit", "info"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("schema"));
}

#[test]
fn plan_without_desired_files_is_empty() {
    let (tmp, cfg) = scratch();
    let dir = empty_dir(tmp.path());
    let v = stdout_json(
        bin()
            .arg("--config")
            .arg(&cfg)
            .arg("plan")
            .arg("--dir")
            .arg(&dir),
    );
    assert_eq!(v["plan"], serde_json::json!({}));
    assert_eq!(v["summary"], "brew(inst:0 up:0 rm:0) mise(inst:0 up:0 rm:0)");
    assert_eq!(v["plan_sha"].as_str().map(str::len), Some(64));
}

#[test]
fn converge_without_yes_only_plans() {
    let (tmp, cfg) = scratch();
    let dir = empty_dir(tmp.path());
    let mut cmd = bin();
    cmd.arg("--config").arg(&cfg).arg("converge").arg("--dir").arg(&dir);
    cmd.assert().success();
    let v = stdout_json(&mut cmd);
    assert_eq!(v["status"], "planned");
    assert_eq!(v["aborted"], false);
    assert!(v["run_id"].as_str().is_some_and(|s| !s.is_empty()));
}

#[test]
fn system_converge_without_repo_exits_nonzero() {
    let (_tmp, cfg) = scratch();
    let mut cmd = bin();
    cmd.arg("--config").arg(&cfg).args(["system-converge", "--host", "box1"]);
    cmd.assert().code(2);
    let v = stdout_json(&mut cmd);
    assert_eq!(v["status"], "aborted");
    assert_eq!(v["reason"], "repo_sync_failed");
}

#[test]
fn rollback_plan_without_history_is_null() {
    let (_tmp, cfg) = scratch();
    let v = stdout_json(bin().arg("--config").arg(&cfg).arg("rollback-plan"));
    assert!(v["plan"].is_null());
}

#[test]
fn audit_info_reports_configured_backend() {
    let (tmp, cfg) = scratch();
    let v = stdout_json(bin().arg("--config").arg(&cfg).args(["audit", "info"]));
    assert_eq!(v["configured"], "sqlite");
    assert_eq!(v["rows"], 0);
    let audit_dir = tmp.path().join("state").join("audit");
    assert_eq!(v["dir"], audit_dir.display().to_string());
}

#[test]
fn audit_dir_env_override_applies() {
    let (tmp, cfg) = scratch();
    let elsewhere = tmp.path().join("elsewhere");
    let v = stdout_json(
        bin()
            .env("HCV_AUDIT_DIR", &elsewhere)
            .arg("--config")
            .arg(&cfg)
            .args(["audit", "retain", "--days", "7"]),
    );
    assert_eq!(v["retain_days"], 7);
    assert_eq!(v["removed"]["calls_removed"], 0);
}

#[test]
fn portable_audit_is_exported_on_exit() {
    let (tmp, cfg) = scratch();
    let v = stdout_json(
        bin()
            .env("HCV_AUDIT_KIND", "sqlite_portable")
            .arg("--config")
            .arg(&cfg)
            .args(["audit", "info"]),
    );
    assert_eq!(v["backend"], "sqlite_portable");
    let export = tmp.path().join("state").join("audit").join("audit.mem.sqlite");
    assert!(export.is_file(), "missing {}", export.display());
}
