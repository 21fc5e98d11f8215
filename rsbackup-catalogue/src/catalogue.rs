use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use rsbackup_api_types::{Backup, BackupStatus};

use crate::schema::{self, CURRENT_VERSION};

const BUSY_RETRY_SLEEP: Duration = Duration::from_millis(1);
const BUSY_WARN_EVERY: u64 = 1024;

/// The backup catalogue: one row per attempted (host, volume, device, id)
/// backup.
///
/// Opened read-write, a missing database file is created. Opened read-only
/// against a missing file, [`Catalogue::open_read_only`] instead falls back
/// to a throwaway in-memory instance so dry-run reporting still has
/// something to query (spec.md §4.4).
pub struct Catalogue {
    conn: Connection,
    in_use_version: u32,
}

impl Catalogue {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening catalogue {}", path.as_ref().display()))?;
        Self::from_connection(conn)
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            log::warn!(
                "catalogue {} does not exist, using an empty in-memory catalogue",
                path.as_ref().display()
            );
            let conn = Connection::open_in_memory()?;
            return Self::from_connection(conn);
        }
        let conn = Connection::open_with_flags(
            path.as_ref(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .with_context(|| format!("opening catalogue {} read-only", path.as_ref().display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let in_use_version = schema::ensure_schema(&conn)?;
        Ok(Catalogue {
            conn,
            in_use_version,
        })
    }

    pub fn in_use_version(&self) -> u32 {
        self.in_use_version
    }

    /// Retries `f` while it reports SQLite busy, sleeping 1 ms between
    /// attempts and warning every 1024 retries (spec.md §4.4 "Retry
    /// discipline"). Any other error is returned immediately.
    fn retry_busy<T>(&self, mut f: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut retries: u64 = 0;
        loop {
            match f(&self.conn) {
                Ok(v) => return Ok(v),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::DatabaseBusy =>
                {
                    retries += 1;
                    if retries % BUSY_WARN_EVERY == 0 {
                        log::warn!("catalogue busy, retried {} times", retries);
                    }
                    sleep(BUSY_RETRY_SLEEP);
                }
                Err(err) => return Err(err).context("catalogue operation failed"),
            }
        }
    }

    /// Inserts a new row with status `Underway` (spec.md §4.8 step 3).
    pub fn insert(&self, backup: &Backup) -> Result<()> {
        self.retry_busy(|conn| {
            conn.execute("BEGIN", [])?;
            let result = conn.execute(
                "INSERT INTO backup (host, volume, device, id, time, pruned, rc, status, log, finishtime) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    backup.host,
                    backup.volume,
                    backup.device,
                    backup.id,
                    backup.start_time,
                    backup.prune_time,
                    backup.rc,
                    backup.status.code(),
                    backup.log,
                    backup.finish_time,
                ],
            );
            match result {
                Ok(n) => {
                    conn.execute("COMMIT", [])?;
                    Ok(n)
                }
                Err(err) => {
                    let _ = conn.execute("ROLLBACK", []);
                    Err(err)
                }
            }
        })?;
        Ok(())
    }

    /// Updates an existing row's mutable fields after a backup or prune
    /// transition (spec.md §4.8 step 8, §4.9).
    pub fn update(&self, backup: &Backup) -> Result<()> {
        self.retry_busy(|conn| {
            conn.execute("BEGIN", [])?;
            let result = conn.execute(
                "UPDATE backup SET rc = ?1, status = ?2, log = ?3, finishtime = ?4, pruned = ?5 \
                 WHERE host = ?6 AND volume = ?7 AND device = ?8 AND id = ?9",
                params![
                    backup.rc,
                    backup.status.code(),
                    backup.log,
                    backup.finish_time,
                    backup.prune_time,
                    backup.host,
                    backup.volume,
                    backup.device,
                    backup.id,
                ],
            );
            match result {
                Ok(n) => {
                    conn.execute("COMMIT", [])?;
                    Ok(n)
                }
                Err(err) => {
                    let _ = conn.execute("ROLLBACK", []);
                    Err(err)
                }
            }
        })?;
        Ok(())
    }

    fn row_to_backup(row: &rusqlite::Row) -> rusqlite::Result<Backup> {
        Ok(Backup {
            host: row.get("host")?,
            volume: row.get("volume")?,
            device: row.get("device")?,
            id: row.get("id")?,
            start_time: row.get("time")?,
            finish_time: row.get("finishtime").unwrap_or(0),
            prune_time: row.get("pruned")?,
            rc: row.get("rc")?,
            status: BackupStatus::from_code(row.get("status")?),
            log: row.get("log").unwrap_or_default(),
        })
    }

    /// All records for a given (host, volume, device), newest first.
    pub fn for_volume_device(
        &self,
        host: &str,
        volume: &str,
        device: &str,
    ) -> Result<Vec<Backup>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM backup WHERE host = ?1 AND volume = ?2 AND device = ?3 \
             ORDER BY time DESC",
        )?;
        let rows = stmt
            .query_map(params![host, volume, device], Self::row_to_backup)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// A single record by its full key.
    pub fn get(&self, host: &str, volume: &str, device: &str, id: &str) -> Result<Option<Backup>> {
        let result = self
            .conn
            .query_row(
                "SELECT * FROM backup WHERE host = ?1 AND volume = ?2 AND device = ?3 AND id = ?4",
                params![host, volume, device, id],
                Self::row_to_backup,
            )
            .optional()?;
        Ok(result)
    }

    /// Every live (non-pruned) record, used to seed in-memory Volume state
    /// at startup.
    pub fn all_live(&self) -> Result<Vec<Backup>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM backup WHERE status != ?1 ORDER BY host, volume, device, time")?;
        let rows = stmt
            .query_map(params![BackupStatus::Pruned.code()], Self::row_to_backup)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Deletes `Pruned` rows whose prune-time is older than `retention`
    /// seconds before `now` (spec.md §4.4 "Prune-log retention").
    pub fn expire_prune_log(&self, now: i64, retention: i64) -> Result<usize> {
        let cutoff = now - retention;
        let n = self.retry_busy(|conn| {
            conn.execute(
                "DELETE FROM backup WHERE status = ?1 AND pruned < ?2",
                params![BackupStatus::Pruned.code(), cutoff],
            )
        })?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, status: BackupStatus, start: i64) -> Backup {
        let mut b = Backup::new("host1", "vol1", "dev1", id, start);
        b.status = status;
        b
    }

    #[test]
    fn insert_then_get_round_trips() {
        let cat = Catalogue::open_in_memory().unwrap();
        let backup = sample("20260101T000000", BackupStatus::Underway, 1000);
        cat.insert(&backup).unwrap();
        let fetched = cat.get("host1", "vol1", "dev1", "20260101T000000").unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().status, BackupStatus::Underway);
    }

    #[test]
    fn update_transitions_status() {
        let cat = Catalogue::open_in_memory().unwrap();
        let mut backup = sample("id1", BackupStatus::Underway, 1000);
        cat.insert(&backup).unwrap();
        backup.status = BackupStatus::Complete;
        backup.finish_time = 1050;
        backup.rc = 0;
        cat.update(&backup).unwrap();
        let fetched = cat.get("host1", "vol1", "dev1", "id1").unwrap().unwrap();
        assert_eq!(fetched.status, BackupStatus::Complete);
        assert_eq!(fetched.finish_time, 1050);
    }

    #[test]
    fn for_volume_device_orders_newest_first() {
        let cat = Catalogue::open_in_memory().unwrap();
        cat.insert(&sample("a", BackupStatus::Complete, 100)).unwrap();
        cat.insert(&sample("b", BackupStatus::Complete, 300)).unwrap();
        cat.insert(&sample("c", BackupStatus::Complete, 200)).unwrap();
        let rows = cat.for_volume_device("host1", "vol1", "dev1").unwrap();
        let ids: Vec<&str> = rows.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn expire_prune_log_removes_old_pruned_rows() {
        let cat = Catalogue::open_in_memory().unwrap();
        let mut old = sample("old", BackupStatus::Pruned, 0);
        old.prune_time = 100;
        let mut recent = sample("recent", BackupStatus::Pruned, 0);
        recent.prune_time = 990;
        cat.insert(&old).unwrap();
        cat.insert(&recent).unwrap();

        let removed = cat.expire_prune_log(1000, 500).unwrap();
        assert_eq!(removed, 1);
        assert!(cat.get("host1", "vol1", "dev1", "old").unwrap().is_none());
        assert!(cat.get("host1", "vol1", "dev1", "recent").unwrap().is_some());
    }

    #[test]
    fn schema_is_at_current_version_on_open() {
        let cat = Catalogue::open_in_memory().unwrap();
        assert_eq!(cat.in_use_version(), CURRENT_VERSION);
    }

    #[test]
    fn read_only_open_of_missing_file_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.db");
        let cat = Catalogue::open_read_only(&path).unwrap();
        assert!(cat.all_live().unwrap().is_empty());
    }
}
