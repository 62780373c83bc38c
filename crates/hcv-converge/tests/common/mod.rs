#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hcv_converge::{Converger, DesiredSources};
use hcv_core::{Config, ExecRequest, ExecResult, Executor};
use hcv_events::{Bus, Envelope};
use hcv_kernel::ProvenanceStore;

/// Simulated host: brew, mise, chezmoi and git operating on in-memory state.
#[derive(Default)]
pub struct HostState {
    pub brew_installed: BTreeSet<String>,
    pub brew_outdated: BTreeSet<String>,
    pub mise: BTreeMap<String, String>,
    /// Installs that exit 0 but leave nothing installed.
    pub sticky: BTreeSet<String>,
    /// Installs that fail on their first attempt only.
    pub flaky_once: BTreeSet<String>,
    pub dotfile_diffs: usize,
    pub chezmoi_apply_fails: bool,
    pub signature_ok: bool,
    /// Copied into the checkout on `git clone`.
    pub repo_template: Option<PathBuf>,
}

#[derive(Default)]
pub struct FakeHost {
    pub state: Mutex<HostState>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new(state: HostState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn ran(&self, line: &str) -> bool {
        self.calls.lock().iter().any(|c| c == line)
    }

    fn brew(&self, args: &[&str]) -> ExecResult {
        let mut st = self.state.lock();
        let formulae = |names: &BTreeSet<String>| {
            let items: Vec<_> = names.iter().map(|n| json!({ "name": n })).collect();
            json!({ "formulae": items, "casks": [] }).to_string()
        };
        match args {
            ["info", "--json=v2", "--installed"] => ExecResult::success(formulae(&st.brew_installed)),
            ["outdated", "--json=v2"] => ExecResult::success(formulae(&st.brew_outdated)),
            ["install", name] => {
                let name = name.to_string();
                if st.flaky_once.remove(&name) {
                    return ExecResult::exec_error("Error: download failed");
                }
                if !st.sticky.contains(&name) {
                    st.brew_installed.insert(name);
                }
                ExecResult::success("")
            }
            ["upgrade", name] => {
                st.brew_outdated.remove(*name);
                ExecResult::success("")
            }
            ["uninstall", name] => {
                st.brew_installed.remove(*name);
                st.brew_outdated.remove(*name);
                ExecResult::success("")
            }
            _ => ExecResult::exec_error("unsupported brew call"),
        }
    }

    fn mise(&self, args: &[&str]) -> ExecResult {
        let mut st = self.state.lock();
        match args {
            ["ls", "--json"] => {
                let map: serde_json::Map<_, _> = st
                    .mise
                    .iter()
                    .map(|(k, v)| (k.clone(), json!([{ "version": v }])))
                    .collect();
                ExecResult::success(serde_json::Value::Object(map).to_string())
            }
            ["use", "-g", spec] => match spec.split_once('@') {
                Some((tool, ver)) => {
                    st.mise.insert(tool.to_string(), ver.to_string());
                    ExecResult::success("")
                }
                None => ExecResult::exec_error("bad spec"),
            },
            ["install"] => ExecResult::success(""),
            ["uninstall", tool] => {
                st.mise.remove(*tool);
                ExecResult::success("")
            }
            _ => ExecResult::exec_error("unsupported mise call"),
        }
    }

    fn chezmoi(&self, args: &[&str]) -> ExecResult {
        let mut st = self.state.lock();
        let pending = st.dotfile_diffs;
        let diff = move || {
            (0..pending)
                .map(|i| format!("diff --git a/.f{i} b/.f{i}\n+line\n"))
                .collect::<String>()
        };
        match args {
            ["doctor"] => ExecResult::success("ok"),
            ["data"] => ExecResult::success("{}"),
            ["diff", "--no-pager"] => ExecResult::success(diff()),
            ["apply", "--dry-run", "--verbose"] => ExecResult::success(diff()),
            ["apply"] => {
                if st.chezmoi_apply_fails {
                    return ExecResult::exec_error("chezmoi: permission denied");
                }
                st.dotfile_diffs = 0;
                ExecResult::success("")
            }
            _ => ExecResult::exec_error("unsupported chezmoi call"),
        }
    }

    fn git(&self, args: &[&str]) -> ExecResult {
        let st = self.state.lock();
        match args {
            ["clone", .., dest] => {
                let dest = Path::new(dest);
                if let Err(err) = std::fs::create_dir_all(dest) {
                    return ExecResult::exec_error(err.to_string());
                }
                if let Some(template) = &st.repo_template {
                    copy_tree(template, dest);
                }
                ExecResult::success("")
            }
            ["fetch", ..] | ["checkout", _] => ExecResult::success(""),
            ["rev-parse", "HEAD"] => ExecResult::success("0123abcd\n"),
            ["verify-commit", "HEAD"] if st.signature_ok => ExecResult::success(""),
            ["verify-commit", "HEAD"] => ExecResult::exec_error("no signature found"),
            _ => ExecResult::exec_error("unsupported git call"),
        }
    }
}

fn copy_tree(from: &Path, to: &Path) {
    for entry in std::fs::read_dir(from).unwrap().flatten() {
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            std::fs::create_dir_all(&target).unwrap();
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}

#[async_trait]
impl Executor for FakeHost {
    async fn execute(&self, req: ExecRequest) -> ExecResult {
        let line = format!("{} {}", req.program, req.args.join(" "));
        self.calls.lock().push(line);
        let args: Vec<&str> = req.args.iter().map(String::as_str).collect();
        match req.program.as_str() {
            "brew" => self.brew(&args),
            "mise" => self.mise(&args),
            "chezmoi" => self.chezmoi(&args),
            "git" => self.git(&args),
            other => ExecResult::policy_violation(format!("command {other} not allowlisted")),
        }
    }
}

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub cfg: Config,
    pub host: Arc<FakeHost>,
    pub bus: Bus,
    pub events: tokio::sync::broadcast::Receiver<Envelope>,
    pub converger: Converger,
}

impl Harness {
    pub fn new(state: HostState) -> Self {
        Self::with_config(state, "")
    }

    /// `extra` is appended to a base config rooted in a temp dir.
    pub fn with_config(state: HostState, extra: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().display().to_string().replace('\\', "/");
        let toml = format!(
            r#"
state_dir = "{root}/data"

[limits]
read_only_rps = 1000
pkg_admin_rps = 1000

[locks]
ttl_ms = 5000
poll_ms = 10

{extra}
"#
        );
        let cfg = hcv_core::parse_config(&toml).unwrap();
        let host = FakeHost::new(state);
        let bus = Bus::new(1024);
        let events = bus.subscribe();
        let audit = ProvenanceStore::open(cfg.audit_options()).with_bus(bus.clone());
        let converger = Converger::new(&cfg, host.clone(), audit, bus.clone());
        Self {
            tmp,
            cfg,
            host,
            bus,
            events,
            converger,
        }
    }

    /// Writes desired-state files into a fresh directory.
    pub fn desired(&self, brewfile: Option<&str>, mise: Option<&str>) -> DesiredSources {
        let dir = self.tmp.path().join("desired");
        std::fs::create_dir_all(&dir).unwrap();
        if let Some(body) = brewfile {
            std::fs::write(dir.join("Brewfile"), body).unwrap();
        }
        if let Some(body) = mise {
            std::fs::write(dir.join("mise.toml"), body).unwrap();
        }
        DesiredSources::from_dir(&dir)
    }

    pub fn drain_events(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

pub fn kinds(events: &[Envelope]) -> Vec<&str> {
    events.iter().map(|e| e.kind.as_str()).collect()
}
