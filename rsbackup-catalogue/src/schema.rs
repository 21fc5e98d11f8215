//! Column manifest and schema evolution for the `backup` table (spec.md
//! §4.4 "Schema evolution").
//!
//! Each column knows the schema version it first appeared in. At open time
//! we introspect the live table, compute the highest version for which
//! every column it requires is present (the *in-use version*), and issue
//! `ALTER TABLE ADD COLUMN` for every column from a later version. Readers
//! branch on the in-use version rather than assuming every column exists,
//! so a newer binary can still read a catalogue written by an older one
//! mid-upgrade.

use anyhow::{Context, Result};
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: &'static str,
    /// Schema version this column was introduced in.
    pub since_version: u32,
    /// Value to use for this column on rows written before it existed, or
    /// when reading at an in-use version below `since_version`.
    pub default_sql: &'static str,
}

/// The full manifest, current through [`CURRENT_VERSION`]. `finishtime` was
/// added in version 2 to let a prune pass tell an `Underway` row (no
/// finish time yet) apart from a `Complete` one.
pub const COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { name: "host", sql_type: "TEXT", since_version: 1, default_sql: "''" },
    ColumnSpec { name: "volume", sql_type: "TEXT", since_version: 1, default_sql: "''" },
    ColumnSpec { name: "device", sql_type: "TEXT", since_version: 1, default_sql: "''" },
    ColumnSpec { name: "id", sql_type: "TEXT", since_version: 1, default_sql: "''" },
    ColumnSpec { name: "time", sql_type: "INTEGER", since_version: 1, default_sql: "0" },
    ColumnSpec { name: "pruned", sql_type: "INTEGER", since_version: 1, default_sql: "0" },
    ColumnSpec { name: "rc", sql_type: "INTEGER", since_version: 1, default_sql: "0" },
    ColumnSpec { name: "status", sql_type: "INTEGER", since_version: 1, default_sql: "0" },
    ColumnSpec { name: "log", sql_type: "BLOB", since_version: 1, default_sql: "NULL" },
    ColumnSpec { name: "finishtime", sql_type: "INTEGER", since_version: 2, default_sql: "0" },
];

pub const CURRENT_VERSION: u32 = 2;

fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Computes the in-use version: the highest version for which every column
/// introduced at or before it is present in `existing`.
pub fn in_use_version(existing: &[String]) -> u32 {
    let mut version = 0;
    'versions: for v in 1..=CURRENT_VERSION {
        for col in COLUMNS.iter().filter(|c| c.since_version <= v) {
            if !existing.iter().any(|e| e == col.name) {
                break 'versions;
            }
        }
        version = v;
    }
    version
}

/// Creates the table fresh at [`CURRENT_VERSION`], or migrates an existing
/// one up to it with `ALTER TABLE ADD COLUMN`. Returns the in-use version
/// after migration (always `CURRENT_VERSION` on success).
pub fn ensure_schema(conn: &Connection) -> Result<u32> {
    let table_exists: bool = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='backup'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .context("checking for backup table")?
        > 0;

    if !table_exists {
        let cols = COLUMNS
            .iter()
            .map(|c| format!("{} {}", c.name, c.sql_type))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "CREATE TABLE backup ({}, PRIMARY KEY(host, volume, device, id))",
                cols
            ),
            [],
        )
        .context("creating backup table")?;
        return Ok(CURRENT_VERSION);
    }

    let existing = existing_columns(conn, "backup")?;
    let mut in_use = in_use_version(&existing);
    if in_use >= CURRENT_VERSION {
        return Ok(in_use);
    }

    for col in COLUMNS.iter().filter(|c| c.since_version > in_use) {
        if existing.iter().any(|e| e == col.name) {
            continue;
        }
        conn.execute(
            &format!(
                "ALTER TABLE backup ADD COLUMN {} {} DEFAULT {}",
                col.name, col.sql_type, col.default_sql
            ),
            [],
        )
        .with_context(|| format!("adding column {}", col.name))?;
    }
    in_use = CURRENT_VERSION;
    Ok(in_use)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        let version = ensure_schema(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn migrating_v1_table_adds_finishtime() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE backup (host TEXT, volume TEXT, device TEXT, id TEXT, time INTEGER, \
             pruned INTEGER, rc INTEGER, status INTEGER, log BLOB, PRIMARY KEY(host, volume, device, id))",
            [],
        )
        .unwrap();
        let existing = existing_columns(&conn, "backup").unwrap();
        assert_eq!(in_use_version(&existing), 1);

        let version = ensure_schema(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
        let existing = existing_columns(&conn, "backup").unwrap();
        assert!(existing.iter().any(|c| c == "finishtime"));
    }

    #[test]
    fn idempotent_on_already_current_schema() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        // Running again must not error (no duplicate ALTER TABLE).
        let version = ensure_schema(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
