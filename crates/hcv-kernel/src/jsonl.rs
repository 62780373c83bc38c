use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::CallRecord;

/// Append-only line-delimited audit log. One JSON object per call.
///
/// Once the live file reaches `max_bytes` it is renamed to the next numbered
/// segment (`audit.jsonl.1`, `audit.jsonl.2`, ...). Segments are never
/// overwritten; only retention shrinks or removes them.
pub(crate) struct JsonlLog {
    path: PathBuf,
    max_bytes: u64,
}

impl JsonlLog {
    pub(crate) fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self { path, max_bytes }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn segment(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Numbered segments present on disk, oldest first.
    fn segments(&self) -> Result<Vec<(u32, PathBuf)>> {
        let (Some(dir), Some(base)) = (self.path.parent(), self.path.file_name()) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}.", base.to_string_lossy());
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(n) = name
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.parse::<u32>().ok())
            else {
                continue;
            };
            found.push((n, entry.path()));
        }
        found.sort_by_key(|(n, _)| *n);
        Ok(found)
    }

    /// Segments followed by the live file, in write order.
    fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = self.segments()?.into_iter().map(|(_, p)| p).collect();
        if self.path.exists() {
            files.push(self.path.clone());
        }
        Ok(files)
    }

    pub(crate) fn append(&self, row: &CallRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        f.write_all(line.as_bytes())?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Ok(());
        }
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if len < self.max_bytes {
            return Ok(());
        }
        let next = self.segments()?.last().map(|(n, _)| n + 1).unwrap_or(1);
        let target = self.segment(next);
        if target.exists() {
            anyhow::bail!("jsonl segment {} already exists", target.display());
        }
        std::fs::rename(&self.path, &target)
            .with_context(|| format!("rotate {}", self.path.display()))?;
        tracing::info!(path = %target.display(), bytes = len, "rotated audit jsonl");
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        if self.path.exists() {
            OpenOptions::new().append(true).open(&self.path)?.sync_all()?;
        }
        Ok(())
    }

    /// Lines across every segment and the live file.
    pub(crate) fn count(&self) -> Result<u64> {
        let mut total = 0u64;
        for path in self.files()? {
            let reader = BufReader::new(std::fs::File::open(&path)?);
            for line in reader.lines() {
                if !line?.trim().is_empty() {
                    total += 1;
                }
            }
        }
        Ok(total)
    }

    /// Drop lines older than `cutoff_ms` from every segment and the live file.
    /// Lines that do not parse are kept. Segments left empty are deleted.
    pub(crate) fn retain(&self, cutoff_ms: i64) -> Result<u64> {
        let mut removed = 0u64;
        for (_, segment) in self.segments()? {
            removed += retain_file(&segment, cutoff_ms, true)?;
        }
        if self.path.exists() {
            removed += retain_file(&self.path, cutoff_ms, false)?;
        }
        Ok(removed)
    }

    pub(crate) fn recent(&self, limit: usize) -> Result<Vec<CallRecord>> {
        let mut rows: Vec<CallRecord> = Vec::new();
        for path in self.files()?.into_iter().rev() {
            let reader = BufReader::new(std::fs::File::open(&path)?);
            let mut file_rows: Vec<CallRecord> = Vec::new();
            for line in reader.lines() {
                if let Ok(row) = serde_json::from_str::<CallRecord>(&line?) {
                    file_rows.push(row);
                }
            }
            rows.extend(file_rows.into_iter().rev());
            if rows.len() >= limit {
                break;
            }
        }
        rows.truncate(limit);
        Ok(rows)
    }
}

fn retain_file(path: &Path, cutoff_ms: i64, remove_if_empty: bool) -> Result<u64> {
    let reader = BufReader::new(
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?,
    );
    let mut kept = String::new();
    let mut removed = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CallRecord>(&line) {
            Ok(row) if row.ts < cutoff_ms => removed += 1,
            _ => {
                kept.push_str(&line);
                kept.push('\n');
            }
        }
    }
    if removed == 0 {
        return Ok(0);
    }
    if kept.is_empty() && remove_if_empty {
        std::fs::remove_file(path)?;
        return Ok(removed);
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, kept)?;
    std::fs::rename(&tmp, path)?;
    Ok(removed)
}
