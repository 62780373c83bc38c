//! Named mutual exclusion.
//!
//! In-process callers queue on a per-name `tokio::sync::Mutex`, which hands the
//! lock out in FIFO order. Cross-process exclusion uses an exclusive-create
//! file `<dir>/<name>.lock` holding `{pid, ts}`; a file whose holder is gone
//! or whose age exceeds the TTL is reclaimed by the next acquirer.
//!
//! Reclaiming is serialized through a second exclusive-create file,
//! `<name>.lock.reclaim`, and staleness is re-checked while it is held. Two
//! acquirers that both saw the same stale file therefore cannot delete each
//! other's fresh lock. The one remaining window is a reclaimer dying while it
//! holds the guard: the guard is then broken after `RECLAIM_GUARD_TTL` without
//! further coordination.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Unparseable lock files younger than this may still be mid-write.
const UNREADABLE_GRACE: Duration = Duration::from_secs(2);
/// A reclaim guard older than this belongs to a reclaimer that died.
const RECLAIM_GUARD_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock_busy: {name}")]
    Busy { name: String },
    #[error("invalid lock name `{0}`")]
    InvalidName(String),
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// When false a held lock fails immediately instead of polling.
    pub wait: bool,
    /// Staleness bound for foreign lock files; also the overall wait deadline.
    pub ttl: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait: true,
            ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    /// Acquisition time, milliseconds since the unix epoch.
    ts: i64,
}

pub struct LockManager {
    dir: PathBuf,
    poll: Duration,
    defaults: LockOptions,
    chains: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll: Duration::from_millis(100),
            defaults: LockOptions::default(),
            chains: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self::new(cfg.locks_dir())
            .with_poll(Duration::from_millis(cfg.locks.poll_ms))
            .with_defaults(LockOptions {
                wait: true,
                ttl: Duration::from_millis(cfg.locks.ttl_ms),
            })
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_defaults(mut self, defaults: LockOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> LockOptions {
        self.defaults
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Runs `f` exclusively for `name` within this process and against other
    /// processes sharing the lock directory.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        opts: LockOptions,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        validate_name(name)?;
        self.with_mutex(name, move || async move {
            let _file = self.acquire_file(name, opts).await?;
            Ok(f().await)
        })
        .await?
    }

    /// In-process exclusion only. Waiters run in arrival order.
    pub async fn with_mutex<F, Fut, T>(&self, name: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        validate_name(name)?;
        let chain = {
            let mut chains = self.chains.lock();
            chains
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let out = {
            let _turn = chain.lock().await;
            f().await
        };
        // Clones are taken and released under the map lock, so the last
        // caller out sees only the map's reference.
        let mut chains = self.chains.lock();
        drop(chain);
        if chains.get(name).is_some_and(|c| Arc::strong_count(c) == 1) {
            chains.remove(name);
        }
        Ok(out)
    }

    /// Cross-process exclusion only.
    pub async fn with_file_lock<F, Fut, T>(
        &self,
        name: &str,
        opts: LockOptions,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        validate_name(name)?;
        let _file = self.acquire_file(name, opts).await?;
        Ok(f().await)
    }

    async fn acquire_file(&self, name: &str, opts: LockOptions) -> Result<FileLock, LockError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.lock_path(name);
        let deadline = Instant::now() + opts.ttl;
        loop {
            match try_create(&path) {
                Ok(()) => {
                    tracing::debug!(lock = name, "lock acquired");
                    return Ok(FileLock { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, opts.ttl) && reclaim(&path, opts.ttl)? {
                        tracing::warn!(lock = name, "reclaimed stale lock");
                        continue;
                    }
                    if !opts.wait || Instant::now() >= deadline {
                        return Err(LockError::Busy {
                            name: name.to_string(),
                        });
                    }
                    tokio::time::sleep(self.poll).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Removes the lock file when dropped, on every exit path.
struct FileLock {
    path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "failed to release lock: {err}");
            }
        }
    }
}

fn validate_name(name: &str) -> Result<(), LockError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(LockError::InvalidName(name.to_string()))
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let record = LockRecord {
        pid: std::process::id(),
        ts: crate::util::now_ms(),
    };
    let body = serde_json::to_vec(&record).map_err(std::io::Error::other)?;
    file.write_all(&body)?;
    Ok(())
}

fn reclaim_guard_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".reclaim");
    PathBuf::from(name)
}

/// Deletes `path` if it is still stale once the reclaim guard is held.
/// False means another acquirer is reclaiming or the file is live again.
fn reclaim(path: &Path, ttl: Duration) -> std::io::Result<bool> {
    let guard = reclaim_guard_path(path);
    if let Err(err) = try_create(&guard) {
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(err);
        }
        if file_age(&guard).is_some_and(|age| age > RECLAIM_GUARD_TTL) {
            tracing::warn!(path = %guard.display(), "breaking abandoned reclaim guard");
            let _ = std::fs::remove_file(&guard);
        }
        return Ok(false);
    }
    let _guard = FileLock { path: guard };
    if !path.exists() {
        return Ok(true);
    }
    if !is_stale(path, ttl) {
        return Ok(false);
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

fn is_stale(path: &Path, ttl: Duration) -> bool {
    let record = std::fs::read(path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<LockRecord>(&raw).ok());
    let Some(record) = record else {
        return file_age(path).is_some_and(|age| age > UNREADABLE_GRACE);
    };
    let age_ms = crate::util::now_ms().saturating_sub(record.ts);
    age_ms > ttl.as_millis() as i64 || !pid_alive(record.pid)
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(ttl_ms: u64) -> LockOptions {
        LockOptions {
            wait: true,
            ttl: Duration::from_millis(ttl_ms),
        }
    }

    fn manager(dir: &Path) -> Arc<LockManager> {
        Arc::new(LockManager::new(dir).with_poll(Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn concurrent_callers_never_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        let spans = Arc::new(Mutex::new(Vec::<(Instant, Instant)>::new()));
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let locks = locks.clone();
            let spans = spans.clone();
            tasks.push(tokio::spawn(async move {
                locks
                    .with_lock("pkg", fast(5_000), || async {
                        let start = Instant::now();
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        spans.lock().push((start, Instant::now()));
                    })
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let mut spans = spans.lock().clone();
        spans.sort_by_key(|(s, _)| *s);
        assert_eq!(spans.len(), 2);
        assert!(spans[1].0 >= spans[0].1, "bodies overlapped: {spans:?}");
        assert!(!locks.lock_path("pkg").exists());
    }

    #[tokio::test]
    async fn mutex_is_fifo() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());

        let first = {
            let (locks, order, gate) = (locks.clone(), order.clone(), gate.clone());
            tokio::spawn(async move {
                locks
                    .with_mutex("q", || async {
                        gate.notified().await;
                        order.lock().push(0);
                    })
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut rest = Vec::new();
        for i in 1..4 {
            let (locks, order) = (locks.clone(), order.clone());
            rest.push(tokio::spawn(async move {
                locks
                    .with_mutex("q", || async {
                        order.lock().push(i);
                    })
                    .await
                    .unwrap();
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        gate.notify_one();
        first.await.unwrap();
        for t in rest {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert!(locks.chains.lock().is_empty());
    }

    fn write_record(path: &Path, pid: u32, ts: i64) {
        std::fs::write(path, serde_json::to_vec(&LockRecord { pid, ts }).unwrap()).unwrap();
    }

    #[test]
    fn second_reclaimer_keeps_the_fresh_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pkg.lock");
        let ttl = Duration::from_secs(60);
        write_record(&path, 4_000_000, crate::util::now_ms());
        assert!(is_stale(&path, ttl));

        // First acquirer reclaims and takes the lock.
        assert!(reclaim(&path, ttl).unwrap());
        try_create(&path).unwrap();
        // Second acquirer judged the old file stale before the swap.
        assert!(!reclaim(&path, ttl).unwrap());

        let held: LockRecord = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(held.pid, std::process::id());
        assert!(!reclaim_guard_path(&path).exists());
    }

    #[test]
    fn held_reclaim_guard_defers_to_its_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pkg.lock");
        write_record(&path, 4_000_000, crate::util::now_ms());
        try_create(&reclaim_guard_path(&path)).unwrap();
        assert!(!reclaim(&path, Duration::from_secs(60)).unwrap());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn dead_holder_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        std::fs::write(
            locks.lock_path("pkg"),
            serde_json::to_vec(&LockRecord {
                pid: 4_000_000,
                ts: crate::util::now_ms(),
            })
            .unwrap(),
        )
        .unwrap();
        let ran = locks
            .with_lock("pkg", fast(60_000), || async { 7 })
            .await
            .unwrap();
        assert_eq!(ran, 7);
        assert!(!locks.lock_path("pkg").exists());
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimed_even_if_holder_lives() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        std::fs::write(
            locks.lock_path("dotfiles"),
            serde_json::to_vec(&LockRecord {
                pid: std::process::id(),
                ts: crate::util::now_ms() - 120_000,
            })
            .unwrap(),
        )
        .unwrap();
        let out = locks
            .with_file_lock("dotfiles", fast(60_000), || async { "ok" })
            .await
            .unwrap();
        assert_eq!(out, "ok");
    }

    #[tokio::test]
    async fn live_holder_times_out_as_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        std::fs::write(
            locks.lock_path("pkg"),
            serde_json::to_vec(&LockRecord {
                pid: std::process::id(),
                ts: crate::util::now_ms(),
            })
            .unwrap(),
        )
        .unwrap();
        let calls = AtomicUsize::new(0);
        let err = locks
            .with_file_lock("pkg", fast(150), || async {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));
        assert_eq!(err.to_string(), "lock_busy: pkg");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Someone else's lock is left in place.
        assert!(locks.lock_path("pkg").exists());
    }

    #[tokio::test]
    async fn no_wait_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        std::fs::write(
            locks.lock_path("pkg"),
            serde_json::to_vec(&LockRecord {
                pid: std::process::id(),
                ts: crate::util::now_ms(),
            })
            .unwrap(),
        )
        .unwrap();
        let started = Instant::now();
        let err = locks
            .with_file_lock(
                "pkg",
                LockOptions {
                    wait: false,
                    ttl: Duration::from_secs(60),
                },
                || async {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn lock_released_when_body_panics() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        let path = locks.lock_path("pkg");
        let handle = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .with_lock("pkg", fast(1_000), || async {
                        panic!("body failed");
                    })
                    .await
            })
        };
        assert!(handle.await.is_err());
        assert!(!path.exists());
        let ok = locks.with_lock("pkg", fast(1_000), || async { 1 }).await;
        assert_eq!(ok.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        for bad in ["", "..", "a/b", "x y"] {
            let err = locks.with_lock(bad, fast(10), || async {}).await;
            assert!(matches!(err, Err(LockError::InvalidName(_))), "{bad:?}");
        }
    }

    #[test]
    fn fresh_unreadable_file_is_not_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.lock");
        std::fs::write(&path, b"").unwrap();
        assert!(!is_stale(&path, Duration::from_secs(60)));
    }
}
