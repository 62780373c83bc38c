//! Provenance store: durable, content-addressed record of every privileged call.
//!
//! Three backends sit behind [`ProvenanceStore`]: a WAL-mode SQLite file, an
//! in-memory SQLite database exported as a whole file on checkpoint, and an
//! append-only JSONL log. The structured backend is chosen at open time and is
//! re-attempted on the next call after any failure; the JSONL log catches
//! whatever the structured backend could not take unless fallback is disabled.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod jsonl;
mod sqlite;

use jsonl::JsonlLog;
use sqlite::SqliteBackend;

const NATIVE_DB: &str = "audit.sqlite";
const PORTABLE_DB: &str = "audit.mem.sqlite";
const JSONL_LOG: &str = "audit.jsonl";

static FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    SqlitePortable,
    Jsonl,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::SqlitePortable => "sqlite_portable",
            BackendKind::Jsonl => "jsonl",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(BackendKind::Sqlite),
            "sqlite_portable" | "sqlite_memory" | "sqlite_wasm" => {
                Some(BackendKind::SqlitePortable)
            }
            "jsonl" => Some(BackendKind::Jsonl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub dir: PathBuf,
    pub kind: BackendKind,
    pub max_blob_bytes: usize,
    pub fallback_jsonl: bool,
    /// Opportunistic checkpoint after this many structured writes (0 disables).
    pub checkpoint_every: u64,
    /// Rotate the JSONL log once it reaches this size (0 disables).
    pub jsonl_max_bytes: u64,
    pub busy_timeout_ms: u64,
    /// Rows deleted per lock hold during retention.
    pub retain_batch: usize,
}

impl AuditOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let busy_timeout_ms = std::env::var("HCV_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        Self {
            dir: dir.into(),
            kind: BackendKind::Sqlite,
            max_blob_bytes: 262_144,
            fallback_jsonl: true,
            checkpoint_every: 200,
            jsonl_max_bytes: 64 * 1024 * 1024,
            busy_timeout_ms,
            retain_batch: 500,
        }
    }
}

/// One privileged call as reported by a caller. Raw captures are hashed and
/// stored as blobs; raw arguments are only hashed.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub tool: String,
    pub args: Value,
    pub inputs_redacted: bool,
    pub exit_code: Option<i32>,
    pub ok: bool,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub latency_ms: Option<u64>,
    pub summary: Option<String>,
    pub run_id: Option<String>,
}

impl AuditEntry {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            ts: Utc::now(),
            tool: tool.into(),
            args,
            inputs_redacted: false,
            exit_code: None,
            ok: false,
            stdout: None,
            stderr: None,
            latency_ms: None,
            summary: None,
            run_id: None,
        }
    }

    pub fn result(mut self, exit_code: i32, ok: bool) -> Self {
        self.exit_code = Some(exit_code);
        self.ok = ok;
        self
    }

    pub fn ok(mut self, ok: bool) -> Self {
        self.ok = ok;
        self
    }

    pub fn output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn run_id(mut self, run_id: Option<&str>) -> Self {
        self.run_id = run_id.map(str::to_string);
        self
    }

    pub fn redacted(mut self) -> Self {
        self.inputs_redacted = true;
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }
}

/// Index row shared by the structured tables and the JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    pub id: String,
    /// Milliseconds since the unix epoch.
    pub ts: i64,
    pub tool: String,
    pub args_hash: String,
    pub inputs_redacted: bool,
    pub exit_code: Option<i32>,
    pub ok: bool,
    pub stdout_sha: Option<String>,
    pub stderr_sha: Option<String>,
    pub latency_ms: Option<i64>,
    pub summary: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReceipt {
    pub id: String,
    /// True when the row reached the configured primary backend.
    pub persisted: bool,
    /// Backend that actually holds the row, if any.
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RetainStats {
    pub calls_removed: u64,
    pub blobs_removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditInfo {
    pub backend: BackendKind,
    pub configured: BackendKind,
    pub dir: String,
    pub last_checkpoint: Option<String>,
    pub rows: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// sha256 over the compact JSON form. `serde_json::Map` keeps keys sorted,
/// so equal values hash equally regardless of construction order.
pub fn hash_json(value: &Value) -> String {
    let text = serde_json::to_string(value).unwrap_or_default();
    sha256_hex(text.as_bytes())
}

struct StoreInner {
    opts: AuditOptions,
    structured: Option<SqliteBackend>,
    jsonl: JsonlLog,
    writes: u64,
    last_checkpoint: Option<DateTime<Utc>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let Some(backend) = self.structured.as_mut() else {
            return;
        };
        if backend.kind() != BackendKind::SqlitePortable {
            return;
        }
        if let Err(err) = backend.checkpoint() {
            tracing::warn!("portable audit export on drop failed: {err:#}");
        }
    }
}

#[derive(Clone)]
pub struct ProvenanceStore {
    inner: Arc<Mutex<StoreInner>>,
    bus: Option<hcv_events::Bus>,
}

impl ProvenanceStore {
    /// Opens the store. Never fails: an unusable structured backend leaves the
    /// store on the JSONL log until a later call manages to open it.
    pub fn open(opts: AuditOptions) -> Self {
        if let Err(err) = std::fs::create_dir_all(&opts.dir) {
            tracing::warn!(dir = %opts.dir.display(), "audit dir unavailable: {err}");
        }
        let jsonl = JsonlLog::new(opts.dir.join(JSONL_LOG), opts.jsonl_max_bytes);
        let structured = match open_structured(&opts) {
            Ok(backend) => backend,
            Err(err) => {
                tracing::warn!("structured audit backend unavailable: {err:#}");
                None
            }
        };
        if let Some(b) = &structured {
            tracing::debug!(backend = b.kind().as_str(), dir = %opts.dir.display(), "audit store open");
        }
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                opts,
                structured,
                jsonl,
                writes: 0,
                last_checkpoint: None,
            })),
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: hcv_events::Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Records one call; true iff the row reached the primary backend.
    pub fn append(&self, entry: &AuditEntry) -> bool {
        self.record(entry).persisted
    }

    pub fn record(&self, entry: &AuditEntry) -> AuditReceipt {
        let mut inner = self.inner.lock();
        let (row, blobs) = prepare(entry, inner.opts.max_blob_bytes);

        if inner.opts.kind == BackendKind::Jsonl {
            return match inner.jsonl.append(&row) {
                Ok(()) => AuditReceipt {
                    id: row.id,
                    persisted: true,
                    backend: Some(BackendKind::Jsonl),
                },
                Err(err) => {
                    tracing::error!(tool = %row.tool, "audit jsonl write failed: {err:#}");
                    AuditReceipt {
                        id: row.id,
                        persisted: false,
                        backend: None,
                    }
                }
            };
        }

        if inner.structured.is_none() {
            match open_structured(&inner.opts) {
                Ok(found) => inner.structured = found,
                Err(err) => tracing::debug!("structured audit backend still unavailable: {err:#}"),
            }
        }

        let structured_err = match inner.structured.as_mut() {
            Some(backend) => match backend.insert(&row, &blobs) {
                Ok(()) => None,
                Err(err) => Some(err),
            },
            None => Some(anyhow!("no structured backend")),
        };

        match structured_err {
            None => {
                let kind = inner.structured.as_ref().map(SqliteBackend::kind);
                inner.writes += 1;
                let every = inner.opts.checkpoint_every;
                if every > 0 && inner.writes % every == 0 {
                    if let Err(err) = checkpoint_locked(&mut inner) {
                        tracing::warn!("opportunistic audit checkpoint failed: {err:#}");
                    }
                }
                AuditReceipt {
                    id: row.id,
                    persisted: true,
                    backend: kind,
                }
            }
            Some(err) => {
                // Drop the handle so the next call reopens it from scratch.
                inner.structured = None;
                self.note_fallback(&err);
                if !inner.opts.fallback_jsonl {
                    tracing::error!(tool = %row.tool, "audit row lost, jsonl fallback disabled: {err:#}");
                    return AuditReceipt {
                        id: row.id,
                        persisted: false,
                        backend: None,
                    };
                }
                let backend = match inner.jsonl.append(&row) {
                    Ok(()) => Some(BackendKind::Jsonl),
                    Err(jerr) => {
                        tracing::error!(tool = %row.tool, "audit jsonl fallback failed: {jerr:#}");
                        None
                    }
                };
                AuditReceipt {
                    id: row.id,
                    persisted: false,
                    backend,
                }
            }
        }
    }

    fn note_fallback(&self, err: &anyhow::Error) {
        if !FALLBACK_WARNED.swap(true, Ordering::SeqCst) {
            tracing::warn!("audit store falling back to jsonl: {err:#}");
            if let Some(bus) = &self.bus {
                bus.publish(
                    hcv_topics::TOPIC_AUDIT_FALLBACK,
                    &serde_json::json!({"error": err.to_string()}),
                );
            }
        }
    }

    /// Deletes rows older than `retain_days` and blobs no surviving row references.
    ///
    /// Structured deletes run in batches of `retain_batch`; the lock is
    /// released between batches.
    pub fn retain(&self, retain_days: u32) -> Result<RetainStats> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retain_days));
        let cutoff_ms = cutoff.timestamp_millis();
        let batch = self.inner.lock().opts.retain_batch.max(1);
        let mut stats = RetainStats::default();
        loop {
            let mut inner = self.inner.lock();
            let Some(backend) = inner.structured.as_mut() else {
                break;
            };
            let removed = backend.retain_calls(cutoff_ms, batch)?;
            stats.calls_removed += removed;
            if (removed as usize) < batch {
                break;
            }
        }
        loop {
            let mut inner = self.inner.lock();
            let Some(backend) = inner.structured.as_mut() else {
                break;
            };
            let removed = backend.collect_blobs(batch)?;
            stats.blobs_removed += removed;
            if (removed as usize) < batch {
                break;
            }
        }
        stats.calls_removed += self.inner.lock().jsonl.retain(cutoff_ms)?;
        tracing::info!(
            retain_days,
            calls_removed = stats.calls_removed,
            blobs_removed = stats.blobs_removed,
            "audit retention sweep"
        );
        if let Some(bus) = &self.bus {
            bus.publish(hcv_topics::TOPIC_AUDIT_RETAINED, &stats);
        }
        Ok(stats)
    }

    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        checkpoint_locked(&mut inner)
    }

    /// Flushes everything to disk: WAL checkpoint, portable export, JSONL sync.
    /// Call before the process exits; dropping the last handle only exports
    /// the portable backend, and only best-effort.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()
    }

    pub fn vacuum(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(backend) = inner.structured.as_mut() {
            backend.vacuum()?;
        }
        Ok(())
    }

    pub fn info(&self) -> AuditInfo {
        let inner = self.inner.lock();
        let rows = count_locked(&inner).unwrap_or_else(|err| {
            tracing::warn!("audit row count failed: {err:#}");
            0
        });
        AuditInfo {
            backend: inner
                .structured
                .as_ref()
                .map(SqliteBackend::kind)
                .unwrap_or(BackendKind::Jsonl),
            configured: inner.opts.kind,
            dir: inner.opts.dir.display().to_string(),
            last_checkpoint: inner
                .last_checkpoint
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            rows,
        }
    }

    /// Rows across the structured backend and the JSONL log.
    pub fn row_count(&self) -> Result<u64> {
        let inner = self.inner.lock();
        count_locked(&inner)
    }

    /// Most recent rows first, from the structured backend when present.
    pub fn recent(&self, limit: usize) -> Result<Vec<CallRecord>> {
        let inner = self.inner.lock();
        match inner.structured.as_ref() {
            Some(backend) => backend.recent(limit),
            None => inner.jsonl.recent(limit),
        }
    }

    pub fn blob(&self, sha: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        match inner.structured.as_ref() {
            Some(backend) => backend.blob(sha),
            None => Ok(None),
        }
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.inner.lock().jsonl.path().to_path_buf()
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn record_async(&self, entry: AuditEntry) -> AuditReceipt {
        let store = self.clone();
        match tokio::task::spawn_blocking(move || store.record(&entry)).await {
            Ok(receipt) => receipt,
            Err(err) => {
                tracing::error!("audit writer join error: {err}");
                AuditReceipt {
                    id: uuid::Uuid::new_v4().to_string(),
                    persisted: false,
                    backend: None,
                }
            }
        }
    }

    pub async fn retain_async(&self, retain_days: u32) -> Result<RetainStats> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.retain(retain_days))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn checkpoint_async(&self) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.checkpoint())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn vacuum_async(&self) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.vacuum())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    /// Periodic checkpoint, retention and vacuum. Abort the handle to stop it.
    pub fn spawn_maintenance(&self, schedule: MaintenanceSchedule) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut checkpoint = tokio::time::interval(schedule.checkpoint_every);
            let mut retention = tokio::time::interval(schedule.retain_every);
            let mut vacuum = tokio::time::interval(schedule.vacuum_every);
            // The first tick of each interval fires immediately; skip those.
            checkpoint.tick().await;
            retention.tick().await;
            vacuum.tick().await;
            loop {
                tokio::select! {
                    _ = checkpoint.tick() => {
                        if let Err(err) = store.checkpoint_async().await {
                            tracing::warn!("scheduled audit checkpoint failed: {err:#}");
                        }
                    }
                    _ = retention.tick() => {
                        if let Err(err) = store.retain_async(schedule.retain_days).await {
                            tracing::warn!("scheduled audit retention failed: {err:#}");
                        }
                    }
                    _ = vacuum.tick() => {
                        if let Err(err) = store.vacuum_async().await {
                            tracing::warn!("scheduled audit vacuum failed: {err:#}");
                        }
                    }
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceSchedule {
    pub checkpoint_every: Duration,
    pub retain_every: Duration,
    pub vacuum_every: Duration,
    pub retain_days: u32,
}

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        Self {
            checkpoint_every: Duration::from_secs(10 * 60),
            retain_every: Duration::from_secs(6 * 60 * 60),
            vacuum_every: Duration::from_secs(24 * 60 * 60),
            retain_days: 30,
        }
    }
}

fn open_structured(opts: &AuditOptions) -> Result<Option<SqliteBackend>> {
    match opts.kind {
        BackendKind::Jsonl => Ok(None),
        BackendKind::Sqlite => {
            match SqliteBackend::open_native(&opts.dir.join(NATIVE_DB), opts.busy_timeout_ms) {
                Ok(backend) => Ok(Some(backend)),
                Err(err) => {
                    tracing::warn!("native audit backend unavailable, trying portable: {err:#}");
                    SqliteBackend::open_portable(&opts.dir.join(PORTABLE_DB)).map(Some)
                }
            }
        }
        BackendKind::SqlitePortable => {
            SqliteBackend::open_portable(&opts.dir.join(PORTABLE_DB)).map(Some)
        }
    }
}

fn checkpoint_locked(inner: &mut StoreInner) -> Result<()> {
    if let Some(backend) = inner.structured.as_mut() {
        backend.checkpoint()?;
    }
    inner.jsonl.sync()?;
    inner.last_checkpoint = Some(Utc::now());
    Ok(())
}

fn count_locked(inner: &StoreInner) -> Result<u64> {
    let structured = match inner.structured.as_ref() {
        Some(backend) => backend.count()?,
        None => 0,
    };
    Ok(structured + inner.jsonl.count()?)
}

fn prepare(entry: &AuditEntry, max_blob_bytes: usize) -> (CallRecord, Vec<(String, Vec<u8>)>) {
    let mut blobs = Vec::new();
    let mut capture = |text: &Option<String>| -> Option<String> {
        let text = text.as_ref()?;
        let sha = sha256_hex(text.as_bytes());
        if text.len() <= max_blob_bytes {
            blobs.push((sha.clone(), text.as_bytes().to_vec()));
        }
        Some(sha)
    };
    let stdout_sha = capture(&entry.stdout);
    let stderr_sha = capture(&entry.stderr);
    let row = CallRecord {
        id: uuid::Uuid::new_v4().to_string(),
        ts: entry.ts.timestamp_millis(),
        tool: entry.tool.clone(),
        args_hash: hash_json(&entry.args),
        inputs_redacted: entry.inputs_redacted,
        exit_code: entry.exit_code,
        ok: entry.ok,
        stdout_sha,
        stderr_sha,
        latency_ms: entry.latency_ms.map(|ms| ms as i64),
        summary: entry.summary.clone(),
        run_id: entry.run_id.clone(),
    };
    (row, blobs)
}
