use std::path::{Path, PathBuf};

const QUALIFIER: &str = "dev";
const ORGANIZATION: &str = "hcv";
const APPLICATION: &str = "hcv";

/// Expands a leading `~/` (or a bare `~`) to the user's home directory.
pub fn expand_tilde(p: &str) -> PathBuf {
    let home = || directories::BaseDirs::new().map(|b| b.home_dir().to_path_buf());
    if p == "~" {
        if let Some(h) = home() {
            return h;
        }
    }
    if let Some(rest) = p.strip_prefix("~/") {
        if let Some(h) = home() {
            return h.join(rest);
        }
    }
    PathBuf::from(p)
}

/// Platform data directory (XDG data home, Application Support, LocalAppData).
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".hcv"))
}

pub fn default_config_file() -> Option<PathBuf> {
    directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .map(|d| d.config_dir().join("config.toml"))
}

/// True when `candidate` resolves to one of `roots` or a path beneath one.
///
/// Both sides are canonicalized first, and the comparison is per path
/// component, so `/allowed-evil` never matches the root `/allowed`.
/// Missing paths are never contained.
pub fn is_within(roots: &[PathBuf], candidate: &Path) -> bool {
    let Ok(cand) = std::fs::canonicalize(candidate) else {
        return false;
    };
    roots.iter().any(|root| match std::fs::canonicalize(root) {
        Ok(r) => cand.starts_with(&r),
        Err(_) => false,
    })
}
