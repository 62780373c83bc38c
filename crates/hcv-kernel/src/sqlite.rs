use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::{BackendKind, CallRecord};

/// Where the structured rows live: a WAL-mode file, or an in-memory database
/// that is exported as a whole file on checkpoint.
enum Mode {
    Native,
    Portable { export: PathBuf },
}

pub(crate) struct SqliteBackend {
    conn: Connection,
    mode: Mode,
}

impl SqliteBackend {
    pub(crate) fn open_native(path: &Path, busy_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open audit db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        init_schema(&conn)?;
        Ok(Self {
            conn,
            mode: Mode::Native,
        })
    }

    pub(crate) fn open_portable(export: &Path) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        if export.exists() {
            let src = export
                .to_str()
                .context("portable audit path is not valid utf-8")?;
            conn.execute("ATTACH DATABASE ?1 AS disk", params![src])
                .with_context(|| format!("attach {}", export.display()))?;
            let copied = conn.execute_batch(
                r#"
                INSERT OR IGNORE INTO main.calls SELECT * FROM disk.calls;
                INSERT OR IGNORE INTO main.blobs SELECT * FROM disk.blobs;
                "#,
            );
            conn.execute_batch("DETACH DATABASE disk")?;
            copied.context("load portable audit export")?;
        }
        Ok(Self {
            conn,
            mode: Mode::Portable {
                export: export.to_path_buf(),
            },
        })
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self.mode {
            Mode::Native => BackendKind::Sqlite,
            Mode::Portable { .. } => BackendKind::SqlitePortable,
        }
    }

    pub(crate) fn insert(&mut self, row: &CallRecord, blobs: &[(String, Vec<u8>)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut put_blob =
                tx.prepare_cached("INSERT OR IGNORE INTO blobs(sha, bytes) VALUES(?1, ?2)")?;
            for (sha, bytes) in blobs {
                put_blob.execute(params![sha, bytes])?;
            }
            tx.execute(
                "INSERT INTO calls(id, ts, tool, args_hash, inputs_redacted, exit_code, ok, stdout_sha, stderr_sha, latency_ms, summary, run_id)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.id,
                    row.ts,
                    row.tool,
                    row.args_hash,
                    row.inputs_redacted,
                    row.exit_code,
                    row.ok,
                    row.stdout_sha,
                    row.stderr_sha,
                    row.latency_ms,
                    row.summary,
                    row.run_id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Deletes at most `limit` calls older than `cutoff_ms`.
    pub(crate) fn retain_calls(&mut self, cutoff_ms: i64, limit: usize) -> Result<u64> {
        let removed = self.conn.execute(
            "DELETE FROM calls WHERE rowid IN (SELECT rowid FROM calls WHERE ts < ?1 LIMIT ?2)",
            params![cutoff_ms, limit as i64],
        )?;
        Ok(removed as u64)
    }

    /// Deletes at most `limit` blobs no call references.
    pub(crate) fn collect_blobs(&mut self, limit: usize) -> Result<u64> {
        // NOT IN over a set containing NULL matches nothing, so filter NULL shas out.
        let removed = self.conn.execute(
            r#"
            DELETE FROM blobs WHERE rowid IN (
              SELECT rowid FROM blobs WHERE sha NOT IN (
                SELECT stdout_sha FROM calls WHERE stdout_sha IS NOT NULL
                UNION
                SELECT stderr_sha FROM calls WHERE stderr_sha IS NOT NULL
              )
              LIMIT ?1
            )
            "#,
            params![limit as i64],
        )?;
        Ok(removed as u64)
    }

    pub(crate) fn checkpoint(&mut self) -> Result<()> {
        match &self.mode {
            Mode::Native => {
                self.conn
                    .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
                Ok(())
            }
            Mode::Portable { export } => export_to(&self.conn, export),
        }
    }

    pub(crate) fn vacuum(&mut self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        if let Mode::Portable { export } = &self.mode {
            export_to(&self.conn, export)?;
        }
        Ok(())
    }

    pub(crate) fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM calls", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    pub(crate) fn blob(&self, sha: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row("SELECT bytes FROM blobs WHERE sha=?1", params![sha], |r| {
                r.get(0)
            })
            .optional()?)
    }

    pub(crate) fn recent(&self, limit: usize) -> Result<Vec<CallRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ts, tool, args_hash, inputs_redacted, exit_code, ok, stdout_sha, stderr_sha, latency_ms, summary, run_id
             FROM calls ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(CallRecord {
                id: r.get(0)?,
                ts: r.get(1)?,
                tool: r.get(2)?,
                args_hash: r.get(3)?,
                inputs_redacted: r.get(4)?,
                exit_code: r.get(5)?,
                ok: r.get(6)?,
                stdout_sha: r.get(7)?,
                stderr_sha: r.get(8)?,
                latency_ms: r.get(9)?,
                summary: r.get(10)?,
                run_id: r.get(11)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
          id TEXT PRIMARY KEY,
          ts INTEGER NOT NULL,
          tool TEXT NOT NULL,
          args_hash TEXT NOT NULL,
          inputs_redacted INTEGER NOT NULL DEFAULT 0,
          exit_code INTEGER,
          ok INTEGER NOT NULL DEFAULT 0,
          stdout_sha TEXT,
          stderr_sha TEXT,
          latency_ms INTEGER,
          summary TEXT,
          run_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_calls_ts ON calls(ts);
        CREATE INDEX IF NOT EXISTS idx_calls_run ON calls(run_id);

        -- content-addressed captures, keyed by sha256 hex
        CREATE TABLE IF NOT EXISTS blobs (
          sha TEXT PRIMARY KEY,
          bytes BLOB NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// `VACUUM INTO` refuses an existing target, so export beside it and rename.
fn export_to(conn: &Connection, export: &Path) -> Result<()> {
    let tmp = export.with_extension("export.tmp");
    if tmp.exists() {
        std::fs::remove_file(&tmp)?;
    }
    let tmp_str = tmp.to_str().context("export path is not valid utf-8")?;
    conn.execute("VACUUM INTO ?1", params![tmp_str])?;
    std::fs::rename(&tmp, export)
        .with_context(|| format!("replace {}", export.display()))?;
    Ok(())
}
