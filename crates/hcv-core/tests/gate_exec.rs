#![cfg(unix)]

use hcv_core::gate::{CODE_EXEC_ERROR, CODE_POLICY_VIOLATION, CODE_TIMEOUT};
use hcv_core::{ExecRequest, Executor, GatePolicy, PolicyGate, SecretResolver};
use serial_test::serial;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct Sandbox {
    _tmp: tempfile::TempDir,
    bin: PathBuf,
    work: PathBuf,
    outside: PathBuf,
}

fn sandbox() -> Sandbox {
    let tmp = tempfile::tempdir().unwrap();
    let bin = tmp.path().join("bin");
    let work = tmp.path().join("work");
    let outside = tmp.path().join("work-evil");
    for d in [&bin, &work, &outside] {
        std::fs::create_dir_all(d).unwrap();
    }
    Sandbox {
        bin,
        work,
        outside,
        _tmp: tmp,
    }
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn gate(sb: &Sandbox, allowed: &[&str]) -> PolicyGate {
    PolicyGate::new(GatePolicy {
        allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
        trusted_dirs: vec![sb.bin.clone()],
        allowed_roots: vec![sb.work.clone()],
        default_cwd: Some(sb.work.clone()),
        default_timeout: Duration::from_secs(10),
        per_command_timeout: BTreeMap::new(),
        env_allow: BTreeMap::new(),
        max_output_bytes: 1024,
    })
}

#[tokio::test]
#[serial]
async fn runs_allowlisted_command_by_name() {
    let sb = sandbox();
    script(&sb.bin, "hello", r#"echo "hi $1""#);
    let res = gate(&sb, &["hello"])
        .execute(ExecRequest::new("hello", ["there"]))
        .await;
    assert_eq!(res.code, 0, "{res:?}");
    assert_eq!(res.stdout, "hi there\n");
}

#[tokio::test]
#[serial]
async fn nonzero_exit_is_returned_not_raised() {
    let sb = sandbox();
    script(&sb.bin, "fail", "echo oops >&2\nexit 3");
    let res = gate(&sb, &["fail"]).execute(ExecRequest::new("fail", Vec::<String>::new())).await;
    assert_eq!(res.code, 3);
    assert_eq!(res.stderr, "oops\n");
}

#[tokio::test]
#[serial]
async fn unlisted_command_never_runs() {
    let sb = sandbox();
    let marker = sb.work.join("ran");
    let tool = script(&sb.bin, "touchy", &format!(": > {}", marker.display()));
    let g = gate(&sb, &["hello"]);
    for program in [tool.display().to_string(), "touchy".to_string()] {
        let res = g
            .execute(ExecRequest::new(program, Vec::<String>::new()))
            .await;
        assert_eq!(res.code, CODE_POLICY_VIOLATION);
        assert!(res.stderr.starts_with("policy_violation:"), "{}", res.stderr);
    }
    assert!(!marker.exists());
}

#[tokio::test]
#[serial]
async fn absolute_path_outside_trusted_dirs_is_rejected() {
    let sb = sandbox();
    script(&sb.bin, "echo", "echo trusted");
    let res = gate(&sb, &["echo"])
        .execute(ExecRequest::new("/bin/echo", ["x"]))
        .await;
    assert_eq!(res.code, CODE_POLICY_VIOLATION);
}

#[tokio::test]
#[serial]
async fn cwd_outside_roots_is_rejected() {
    let sb = sandbox();
    script(&sb.bin, "hello", "echo hi");
    let g = gate(&sb, &["hello"]);
    for cwd in [sb.outside.clone(), PathBuf::from("/etc"), sb.work.join("..")] {
        let res = g
            .execute(ExecRequest::new("hello", Vec::<String>::new()).cwd(cwd))
            .await;
        assert_eq!(res.code, CODE_POLICY_VIOLATION);
        assert!(res.stderr.contains("cwd"));
    }
    let nested = sb.work.join("nested");
    std::fs::create_dir_all(&nested).unwrap();
    let res = g
        .execute(ExecRequest::new("hello", Vec::<String>::new()).cwd(nested))
        .await;
    assert_eq!(res.code, 0);
}

#[tokio::test]
#[serial]
async fn environment_is_scrubbed() {
    let sb = sandbox();
    script(&sb.bin, "showenv", r#"echo "$HOME|$LANG|$LC_ALL|$EXTRA|$PATH""#);
    std::env::set_var("HCV_GATE_LEAK", "1");
    let res = gate(&sb, &["showenv"])
        .execute(ExecRequest::new("showenv", Vec::<String>::new()).env("EXTRA", "yes"))
        .await;
    std::env::remove_var("HCV_GATE_LEAK");
    assert_eq!(
        res.stdout.trim(),
        format!("|C|C|yes|{}", sb.bin.display())
    );
}

#[tokio::test]
#[serial]
async fn timeout_returns_124() {
    let sb = sandbox();
    script(&sb.bin, "spin", "while :; do :; done");
    let res = gate(&sb, &["spin"])
        .execute(ExecRequest::new("spin", Vec::<String>::new()).timeout(Duration::from_millis(200)))
        .await;
    assert_eq!(res.code, CODE_TIMEOUT);
    assert_eq!(res.stderr, "timeout");
}

#[tokio::test]
#[serial]
async fn output_overflow_is_an_error() {
    let sb = sandbox();
    script(
        &sb.bin,
        "chatty",
        "i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done",
    );
    let res = gate(&sb, &["chatty"])
        .execute(ExecRequest::new("chatty", Vec::<String>::new()))
        .await;
    assert_eq!(res.code, CODE_EXEC_ERROR);
    assert!(res.stderr.contains("output_overflow"), "{}", res.stderr);
}

struct StaticSecret;

#[async_trait::async_trait]
impl SecretResolver for StaticSecret {
    async fn resolve(&self, reference: &str) -> Option<String> {
        (reference == "secret://gopass/team/token").then(|| "s3cr3t".to_string())
    }
}

#[tokio::test]
#[serial]
async fn secret_refs_reach_child_env_only() {
    let sb = sandbox();
    script(&sb.bin, "usetoken", r#"test "$TOKEN" = s3cr3t && echo matched"#);
    let g = gate(&sb, &["usetoken"]).with_secrets(Arc::new(StaticSecret));
    let res = g
        .execute(
            ExecRequest::new("usetoken", Vec::<String>::new())
                .secret_ref("TOKEN", "secret://gopass/team/token"),
        )
        .await;
    assert_eq!(res.code, 0);
    assert_eq!(res.stdout, "matched\n");
    assert!(!res.stdout.contains("s3cr3t"));
}
