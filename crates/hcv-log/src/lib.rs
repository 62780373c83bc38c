//! Process-wide tracing setup for the `hcv` binaries.
//!
//! Console output always goes to stderr so stdout stays reserved for JSON
//! results. A daily-rolling file sink is added when `logs.dir` is set.

use hcv_core::config::LogsConfig;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

pub const FILE_PREFIX: &str = "hcv.log";

/// Filter directives from `HCV_LOG`, then `RUST_LOG`, else `default`.
pub fn filter_directives(default: &str) -> String {
    ["HCV_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_filter(default: &str) -> EnvFilter {
    let directives = filter_directives(default);
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Resolved file sink directory, `HCV_LOG_DIR` taking precedence.
pub fn log_dir(cfg: &LogsConfig) -> Option<PathBuf> {
    std::env::var("HCV_LOG_DIR")
        .ok()
        .filter(|d| !d.trim().is_empty())
        .or_else(|| cfg.dir.clone())
        .map(|d| hcv_core::paths::expand_tilde(&d))
}

/// Installs the global subscriber. Calling it again is a no-op.
pub fn init(cfg: &LogsConfig) {
    let json = cfg.json || std::env::var("HCV_LOG_JSON").ok().as_deref() == Some("1");
    let console = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter("info"))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(env_filter("info"))
            .boxed()
    };
    let registry = tracing_subscriber::registry().with(console);

    let Some(dir) = log_dir(cfg) else {
        let _ = registry.try_init();
        return;
    };
    if let Err(err) = std::fs::create_dir_all(&dir) {
        let _ = registry.try_init();
        tracing::warn!(directory = %dir.display(), %err, "failed to create log directory");
        return;
    }
    let writer = tracing_appender::rolling::daily(&dir, FILE_PREFIX);
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(env_filter("info"));
    let _ = registry.with(file_layer).try_init();
}
