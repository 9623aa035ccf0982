//! # Schema migrations.
//!
//! Applied exactly once at store construction, guarded by `PRAGMA
//! user_version`. Each entry runs inside the opening transaction; adding a
//! migration means appending to [`MIGRATIONS`], never editing an existing one.

use rusqlite::Connection;

use crate::error::Result;

/// Ordered migration scripts. `user_version` equals the number applied.
const MIGRATIONS: &[&str] = &[
    // v1: core tables.
    "
    CREATE TABLE servers (
        id               INTEGER PRIMARY KEY,
        name             TEXT NOT NULL UNIQUE,
        distribution     TEXT NOT NULL,
        version          TEXT NOT NULL,
        path             TEXT NOT NULL,
        port             INTEGER NOT NULL,
        memory           TEXT NOT NULL,
        java_path        TEXT,
        jvm_args         TEXT,
        restart_on_crash INTEGER NOT NULL DEFAULT 0,
        running          INTEGER NOT NULL DEFAULT 0,
        pid              INTEGER,
        created_at       TEXT NOT NULL,
        last_started     TEXT,
        last_stopped     TEXT
    );

    CREATE TABLE backups (
        id         INTEGER PRIMARY KEY,
        server_id  INTEGER NOT NULL,
        path       TEXT NOT NULL,
        size_bytes INTEGER,
        kind       TEXT NOT NULL DEFAULT 'manual',
        status     TEXT NOT NULL DEFAULT 'completed',
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_backups_server ON backups(server_id);

    CREATE TABLE schedules (
        id         INTEGER PRIMARY KEY,
        server_id  INTEGER NOT NULL,
        action     TEXT NOT NULL,
        cron       TEXT NOT NULL,
        payload    TEXT,
        enabled    INTEGER NOT NULL DEFAULT 1,
        last_run   TEXT,
        next_run   TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_schedules_server ON schedules(server_id);

    CREATE TABLE plugins (
        id                INTEGER PRIMARY KEY,
        server_id         INTEGER NOT NULL,
        name              TEXT NOT NULL,
        source            TEXT NOT NULL,
        project_id        TEXT,
        installed_version TEXT,
        file_path         TEXT NOT NULL,
        enabled           INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX idx_plugins_server ON plugins(server_id);

    CREATE TABLE api_keys (
        id          INTEGER PRIMARY KEY,
        label       TEXT NOT NULL,
        prefix      TEXT NOT NULL,
        key_hash    TEXT NOT NULL UNIQUE,
        permissions TEXT NOT NULL DEFAULT '[]',
        active      INTEGER NOT NULL DEFAULT 1,
        created_at  TEXT NOT NULL,
        last_used   TEXT
    );
    CREATE INDEX idx_api_keys_prefix ON api_keys(prefix);
    ",
];

/// Brings the database up to the current schema version.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let applied: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let applied = applied as usize;
    if applied >= MIGRATIONS.len() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (index, script) in MIGRATIONS.iter().enumerate().skip(applied) {
        tx.execute_batch(script)?;
        // PRAGMA does not accept bound parameters.
        tx.execute_batch(&format!("PRAGMA user_version = {}", index + 1))?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version as usize, MIGRATIONS.len());
    }

    #[test]
    fn tables_exist_after_migration() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        for table in ["servers", "backups", "schedules", "plugins", "api_keys"] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
