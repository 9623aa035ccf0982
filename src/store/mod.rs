//! # Data store gateway: scoped unit-of-work over SQLite.
//!
//! Every read or mutation of persistent entities happens inside an acquired
//! [`Scope`] that is released on all exit paths: commit when the closure
//! returns `Ok`, rollback on `Err` or panic unwind. The gateway hands out
//! value-typed records ([`records`]), never live rows, so nothing can escape
//! its transaction detached.
//!
//! ## Files & responsibilities
//! - **mod.rs**: [`Store`] (connection owner) and [`Scope`] (one transaction).
//! - **records.rs**: owned snapshot structs and their enum codecs.
//! - **schema.rs**: migrations guarded by `PRAGMA user_version`.
//!
//! ## Rules
//! - Scopes serialize on the connection mutex; SQLite's own locking covers
//!   any second process.
//! - Timestamps are RFC 3339 text in UTC.
//! - The store never spawns tasks and never blocks on anything but SQLite.

mod records;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{Error, Result};

pub use records::{
    ApiKeyRecord, BackupKind, BackupRecord, BackupStatus, Distribution, NewServer, PluginRecord,
    PluginSource, ScheduleAction, ScheduleRecord, ServerRecord,
};

/// Connection owner. Cheap to share behind `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and migrates it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&mut conn)?;
        debug!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Database file path (`:memory:` for test stores).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` inside one transaction-backed scope.
    ///
    /// Commit on `Ok`, rollback on `Err`. The scope borrow ends with the
    /// closure, so no entity can outlive its transaction.
    pub fn with_scope<T>(&self, f: impl FnOnce(&mut Scope<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Resource("store connection lock poisoned".into()))?;
        let tx = conn.transaction()?;
        let mut scope = Scope { tx: &tx };
        let out = f(&mut scope)?;
        tx.commit()?;
        Ok(out)
    }
}

/// One transactional unit-of-work. All entity operations live here.
pub struct Scope<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl Scope<'_> {
    // ---------------------------
    // Servers
    // ---------------------------

    pub fn insert_server(&mut self, new: &NewServer) -> Result<ServerRecord> {
        self.tx.execute(
            "INSERT INTO servers (name, distribution, version, path, port, memory, java_path, jvm_args, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.name,
                new.distribution.as_str(),
                new.version,
                path_to_sql(&new.path),
                new.port as i64,
                new.memory,
                new.java_path,
                new.jvm_args,
                ts_to_sql(Utc::now()),
            ],
        )?;
        let id = self.tx.last_insert_rowid();
        self.find_server_by_id(id)?
            .ok_or_else(|| Error::not_found("server", id))
    }

    pub fn find_server_by_id(&mut self, id: i64) -> Result<Option<ServerRecord>> {
        let row = self
            .tx
            .query_row(
                &format!("{SERVER_SELECT} WHERE id = ?1"),
                params![id],
                server_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_server_by_name(&mut self, name: &str) -> Result<Option<ServerRecord>> {
        let row = self
            .tx
            .query_row(
                &format!("{SERVER_SELECT} WHERE name = ?1"),
                params![name],
                server_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_servers(&mut self) -> Result<Vec<ServerRecord>> {
        let mut stmt = self
            .tx
            .prepare(&format!("{SERVER_SELECT} ORDER BY name"))?;
        let rows = stmt.query_map([], server_from_row)?;
        collect(rows)
    }

    /// Servers whose row claims they are running; reconciler input.
    pub fn servers_marked_running(&mut self) -> Result<Vec<ServerRecord>> {
        let mut stmt = self
            .tx
            .prepare(&format!("{SERVER_SELECT} WHERE running = 1"))?;
        let rows = stmt.query_map([], server_from_row)?;
        collect(rows)
    }

    /// Writes all mutable configuration fields of a server row.
    pub fn update_server(&mut self, server: &ServerRecord) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE servers SET name=?2, version=?3, port=?4, memory=?5,
                    java_path=?6, jvm_args=?7, restart_on_crash=?8 WHERE id=?1",
            params![
                server.id,
                server.name,
                server.version,
                server.port as i64,
                server.memory,
                server.java_path,
                server.jvm_args,
                server.restart_on_crash,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("server", server.id));
        }
        Ok(())
    }

    /// Transitions a row to running with the spawned pid.
    pub fn mark_server_running(&mut self, id: i64, pid: u32) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE servers SET running=1, pid=?2, last_started=?3 WHERE id=?1",
            params![id, pid as i64, ts_to_sql(Utc::now())],
        )?;
        if changed == 0 {
            return Err(Error::not_found("server", id));
        }
        Ok(())
    }

    /// Transitions a row to stopped.
    ///
    /// `stamp` controls whether `last_stopped` is touched: healing a stale
    /// row keeps the old stamp, a real stop records now.
    pub fn mark_server_stopped(&mut self, id: i64, stamp: bool) -> Result<()> {
        let changed = if stamp {
            self.tx.execute(
                "UPDATE servers SET running=0, pid=NULL, last_stopped=?2 WHERE id=?1",
                params![id, ts_to_sql(Utc::now())],
            )?
        } else {
            self.tx
                .execute("UPDATE servers SET running=0, pid=NULL WHERE id=?1", params![id])?
        };
        if changed == 0 {
            return Err(Error::not_found("server", id));
        }
        Ok(())
    }

    pub fn set_restart_on_crash(&mut self, id: i64, enabled: bool) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE servers SET restart_on_crash=?2 WHERE id=?1",
            params![id, enabled],
        )?;
        if changed == 0 {
            return Err(Error::not_found("server", id));
        }
        Ok(())
    }

    /// Deletes the server row and its plugin rows. Backups stay (weak ref).
    pub fn delete_server(&mut self, id: i64) -> Result<()> {
        self.tx
            .execute("DELETE FROM plugins WHERE server_id=?1", params![id])?;
        let changed = self
            .tx
            .execute("DELETE FROM servers WHERE id=?1", params![id])?;
        if changed == 0 {
            return Err(Error::not_found("server", id));
        }
        Ok(())
    }

    // ---------------------------
    // Backups
    // ---------------------------

    pub fn insert_backup(
        &mut self,
        server_id: i64,
        path: &Path,
        kind: BackupKind,
        status: BackupStatus,
        size_bytes: Option<u64>,
    ) -> Result<BackupRecord> {
        self.tx.execute(
            "INSERT INTO backups (server_id, path, size_bytes, kind, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                server_id,
                path_to_sql(path),
                size_bytes.map(|s| s as i64),
                kind.as_str(),
                status.as_str(),
                ts_to_sql(Utc::now()),
            ],
        )?;
        let id = self.tx.last_insert_rowid();
        self.find_backup(id)?
            .ok_or_else(|| Error::not_found("backup", id))
    }

    pub fn find_backup(&mut self, id: i64) -> Result<Option<BackupRecord>> {
        let row = self
            .tx
            .query_row(
                &format!("{BACKUP_SELECT} WHERE id = ?1"),
                params![id],
                backup_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_backups(&mut self, server_id: Option<i64>) -> Result<Vec<BackupRecord>> {
        match server_id {
            Some(sid) => {
                let mut stmt = self.tx.prepare(&format!(
                    "{BACKUP_SELECT} WHERE server_id = ?1 ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map(params![sid], backup_from_row)?;
                collect(rows)
            }
            None => {
                let mut stmt = self
                    .tx
                    .prepare(&format!("{BACKUP_SELECT} ORDER BY created_at DESC"))?;
                let rows = stmt.query_map([], backup_from_row)?;
                collect(rows)
            }
        }
    }

    pub fn update_backup_status(
        &mut self,
        id: i64,
        status: BackupStatus,
        size_bytes: Option<u64>,
    ) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE backups SET status=?2, size_bytes=coalesce(?3, size_bytes) WHERE id=?1",
            params![id, status.as_str(), size_bytes.map(|s| s as i64)],
        )?;
        if changed == 0 {
            return Err(Error::not_found("backup", id));
        }
        Ok(())
    }

    pub fn delete_backup(&mut self, id: i64) -> Result<()> {
        let changed = self
            .tx
            .execute("DELETE FROM backups WHERE id=?1", params![id])?;
        if changed == 0 {
            return Err(Error::not_found("backup", id));
        }
        Ok(())
    }

    // ---------------------------
    // Schedules
    // ---------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_schedule(
        &mut self,
        server_id: i64,
        action: ScheduleAction,
        cron: &str,
        payload: Option<&str>,
        enabled: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<ScheduleRecord> {
        self.tx.execute(
            "INSERT INTO schedules (server_id, action, cron, payload, enabled, next_run, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                server_id,
                action.as_str(),
                cron,
                payload,
                enabled,
                next_run.map(ts_to_sql),
                ts_to_sql(Utc::now()),
            ],
        )?;
        let id = self.tx.last_insert_rowid();
        self.find_schedule(id)?
            .ok_or_else(|| Error::not_found("schedule", id))
    }

    pub fn find_schedule(&mut self, id: i64) -> Result<Option<ScheduleRecord>> {
        let row = self
            .tx
            .query_row(
                &format!("{SCHEDULE_SELECT} WHERE id = ?1"),
                params![id],
                schedule_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_schedules(&mut self, server_id: Option<i64>) -> Result<Vec<ScheduleRecord>> {
        match server_id {
            Some(sid) => {
                let mut stmt = self.tx.prepare(&format!(
                    "{SCHEDULE_SELECT} WHERE server_id = ?1 ORDER BY next_run"
                ))?;
                let rows = stmt.query_map(params![sid], schedule_from_row)?;
                collect(rows)
            }
            None => {
                let mut stmt = self
                    .tx
                    .prepare(&format!("{SCHEDULE_SELECT} ORDER BY next_run"))?;
                let rows = stmt.query_map([], schedule_from_row)?;
                collect(rows)
            }
        }
    }

    pub fn enabled_schedules(&mut self) -> Result<Vec<ScheduleRecord>> {
        let mut stmt = self
            .tx
            .prepare(&format!("{SCHEDULE_SELECT} WHERE enabled = 1"))?;
        let rows = stmt.query_map([], schedule_from_row)?;
        collect(rows)
    }

    pub fn update_schedule(&mut self, schedule: &ScheduleRecord) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE schedules SET action=?2, cron=?3, payload=?4, enabled=?5,
                    last_run=?6, next_run=?7 WHERE id=?1",
            params![
                schedule.id,
                schedule.action.as_str(),
                schedule.cron,
                schedule.payload,
                schedule.enabled,
                schedule.last_run.map(ts_to_sql),
                schedule.next_run.map(ts_to_sql),
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("schedule", schedule.id));
        }
        Ok(())
    }

    pub fn delete_schedule(&mut self, id: i64) -> Result<()> {
        let changed = self
            .tx
            .execute("DELETE FROM schedules WHERE id=?1", params![id])?;
        if changed == 0 {
            return Err(Error::not_found("schedule", id));
        }
        Ok(())
    }

    // ---------------------------
    // Plugins
    // ---------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_plugin(
        &mut self,
        server_id: i64,
        name: &str,
        source: PluginSource,
        project_id: Option<&str>,
        installed_version: Option<&str>,
        file_path: &Path,
    ) -> Result<PluginRecord> {
        self.tx.execute(
            "INSERT INTO plugins (server_id, name, source, project_id, installed_version, file_path, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![
                server_id,
                name,
                source.as_str(),
                project_id,
                installed_version,
                path_to_sql(file_path),
            ],
        )?;
        let id = self.tx.last_insert_rowid();
        self.find_plugin(id)?
            .ok_or_else(|| Error::not_found("plugin", id))
    }

    pub fn find_plugin(&mut self, id: i64) -> Result<Option<PluginRecord>> {
        let row = self
            .tx
            .query_row(
                &format!("{PLUGIN_SELECT} WHERE id = ?1"),
                params![id],
                plugin_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_plugins(&mut self, server_id: i64) -> Result<Vec<PluginRecord>> {
        let mut stmt = self.tx.prepare(&format!(
            "{PLUGIN_SELECT} WHERE server_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![server_id], plugin_from_row)?;
        collect(rows)
    }

    /// Record follows the file: called after a successful rename.
    pub fn set_plugin_state(&mut self, id: i64, file_path: &Path, enabled: bool) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE plugins SET file_path=?2, enabled=?3 WHERE id=?1",
            params![id, path_to_sql(file_path), enabled],
        )?;
        if changed == 0 {
            return Err(Error::not_found("plugin", id));
        }
        Ok(())
    }

    pub fn delete_plugin(&mut self, id: i64) -> Result<()> {
        let changed = self
            .tx
            .execute("DELETE FROM plugins WHERE id=?1", params![id])?;
        if changed == 0 {
            return Err(Error::not_found("plugin", id));
        }
        Ok(())
    }

    // ---------------------------
    // API keys
    // ---------------------------

    pub fn insert_api_key(
        &mut self,
        label: &str,
        prefix: &str,
        key_hash: &str,
        permissions: &[String],
    ) -> Result<ApiKeyRecord> {
        let permissions_json = serde_json::to_string(permissions)
            .map_err(|e| Error::Resource(format!("encode permissions: {e}")))?;
        self.tx.execute(
            "INSERT INTO api_keys (label, prefix, key_hash, permissions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![label, prefix, key_hash, permissions_json, ts_to_sql(Utc::now())],
        )?;
        let id = self.tx.last_insert_rowid();
        let row = self
            .tx
            .query_row(
                &format!("{API_KEY_SELECT} WHERE id = ?1"),
                params![id],
                api_key_from_row,
            )
            .optional()?;
        row.ok_or_else(|| Error::not_found("api key", id))
    }

    pub fn list_api_keys(&mut self) -> Result<Vec<ApiKeyRecord>> {
        let mut stmt = self
            .tx
            .prepare(&format!("{API_KEY_SELECT} ORDER BY created_at"))?;
        let rows = stmt.query_map([], api_key_from_row)?;
        collect(rows)
    }

    /// Candidates for a presented key, looked up by public prefix.
    pub fn find_api_keys_by_prefix(&mut self, prefix: &str) -> Result<Vec<ApiKeyRecord>> {
        let mut stmt = self.tx.prepare(&format!(
            "{API_KEY_SELECT} WHERE prefix = ?1 AND active = 1"
        ))?;
        let rows = stmt.query_map(params![prefix], api_key_from_row)?;
        collect(rows)
    }

    /// True when any active key exists; gates API authentication.
    pub fn any_active_api_keys(&mut self) -> Result<bool> {
        let count: i64 = self
            .tx
            .query_row("SELECT count(*) FROM api_keys WHERE active = 1", [], |r| {
                r.get(0)
            })?;
        Ok(count > 0)
    }

    pub fn touch_api_key(&mut self, id: i64) -> Result<()> {
        self.tx.execute(
            "UPDATE api_keys SET last_used=?2 WHERE id=?1",
            params![id, ts_to_sql(Utc::now())],
        )?;
        Ok(())
    }

    pub fn revoke_api_key(&mut self, id: i64) -> Result<()> {
        let changed = self
            .tx
            .execute("UPDATE api_keys SET active=0 WHERE id=?1", params![id])?;
        if changed == 0 {
            return Err(Error::not_found("api key", id));
        }
        Ok(())
    }
}

// ---------------------------
// Row mapping
// ---------------------------

const SERVER_SELECT: &str = "SELECT id, name, distribution, version, path, port, memory, java_path,
        jvm_args, restart_on_crash, running, pid, created_at, last_started, last_stopped FROM servers";

const BACKUP_SELECT: &str =
    "SELECT id, server_id, path, size_bytes, kind, status, created_at FROM backups";

const SCHEDULE_SELECT: &str = "SELECT id, server_id, action, cron, payload, enabled, last_run,
        next_run, created_at FROM schedules";

const PLUGIN_SELECT: &str = "SELECT id, server_id, name, source, project_id, installed_version,
        file_path, enabled FROM plugins";

const API_KEY_SELECT: &str = "SELECT id, label, prefix, key_hash, permissions, active, created_at,
        last_used FROM api_keys";

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ServerRecord> {
    let distribution: String = row.get(2)?;
    Ok(ServerRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        distribution: Distribution::parse(&distribution)
            .ok_or_else(|| bad_column(2, &distribution))?,
        version: row.get(3)?,
        path: PathBuf::from(row.get::<_, String>(4)?),
        port: row.get::<_, i64>(5)? as u16,
        memory: row.get(6)?,
        java_path: row.get(7)?,
        jvm_args: row.get(8)?,
        restart_on_crash: row.get(9)?,
        running: row.get(10)?,
        pid: row.get::<_, Option<i64>>(11)?.map(|p| p as u32),
        created_at: ts_from_sql(row, 12)?,
        last_started: ts_opt_from_sql(row, 13)?,
        last_stopped: ts_opt_from_sql(row, 14)?,
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    let kind: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(BackupRecord {
        id: row.get(0)?,
        server_id: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        size_bytes: row.get::<_, Option<i64>>(3)?.map(|s| s as u64),
        kind: BackupKind::parse(&kind).ok_or_else(|| bad_column(4, &kind))?,
        status: BackupStatus::parse(&status).ok_or_else(|| bad_column(5, &status))?,
        created_at: ts_from_sql(row, 6)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    let action: String = row.get(2)?;
    Ok(ScheduleRecord {
        id: row.get(0)?,
        server_id: row.get(1)?,
        action: ScheduleAction::parse(&action).ok_or_else(|| bad_column(2, &action))?,
        cron: row.get(3)?,
        payload: row.get(4)?,
        enabled: row.get(5)?,
        last_run: ts_opt_from_sql(row, 6)?,
        next_run: ts_opt_from_sql(row, 7)?,
        created_at: ts_from_sql(row, 8)?,
    })
}

fn plugin_from_row(row: &Row<'_>) -> rusqlite::Result<PluginRecord> {
    let source: String = row.get(3)?;
    Ok(PluginRecord {
        id: row.get(0)?,
        server_id: row.get(1)?,
        name: row.get(2)?,
        source: PluginSource::parse(&source).ok_or_else(|| bad_column(3, &source))?,
        project_id: row.get(4)?,
        installed_version: row.get(5)?,
        file_path: PathBuf::from(row.get::<_, String>(6)?),
        enabled: row.get(7)?,
    })
}

fn api_key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    let permissions: String = row.get(4)?;
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        label: row.get(1)?,
        prefix: row.get(2)?,
        key_hash: row.get(3)?,
        permissions: serde_json::from_str(&permissions)
            .map_err(|_| bad_column(4, &permissions))?,
        active: row.get(5)?,
        created_at: ts_from_sql(row, 6)?,
        last_used: ts_opt_from_sql(row, 7)?,
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn path_to_sql(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn ts_to_sql(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn ts_from_sql(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(index)?;
    parse_ts(&text).ok_or_else(|| bad_column(index, &text))
}

fn ts_opt_from_sql(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(index)?;
    match text {
        None => Ok(None),
        Some(t) => parse_ts(&t).map(Some).ok_or_else(|| bad_column(index, &t)),
    }
}

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn bad_column(index: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("unexpected stored value: {value}").into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_server(name: &str, port: u16) -> NewServer {
        NewServer {
            name: name.to_string(),
            distribution: Distribution::Vanilla,
            version: "1.20.4".to_string(),
            path: PathBuf::from(format!("/data/msm/servers/{name}")),
            port,
            memory: "1G".to_string(),
            java_path: None,
            jvm_args: None,
        }
    }

    #[test]
    fn insert_and_read_back_server() {
        let store = Store::in_memory().unwrap();
        let created = store
            .with_scope(|s| s.insert_server(&sample_server("alpha", 25565)))
            .unwrap();
        assert_eq!(created.name, "alpha");
        assert!(!created.running);
        assert_eq!(created.pid, None);

        let fetched = store
            .with_scope(|s| s.find_server_by_name("alpha"))
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.distribution, Distribution::Vanilla);
        assert_eq!(fetched.port, 25565);
    }

    #[test]
    fn snapshots_survive_store_drop() {
        // Scope closure is the only place rows are live; the returned record
        // must stay usable after the whole store is gone.
        let store = Store::in_memory().unwrap();
        let record = store
            .with_scope(|s| s.insert_server(&sample_server("beta", 25566)))
            .unwrap();
        drop(store);
        assert_eq!(record.name, "beta");
        assert_eq!(record.memory, "1G");
    }

    #[test]
    fn failed_scope_rolls_back() {
        let store = Store::in_memory().unwrap();
        let result: Result<()> = store.with_scope(|s| {
            s.insert_server(&sample_server("gamma", 25567))?;
            Err(Error::Resource("forced failure".into()))
        });
        assert!(result.is_err());

        let servers = store.with_scope(|s| s.list_servers()).unwrap();
        assert!(servers.is_empty(), "rollback must drop the insert");
    }

    #[test]
    fn running_transitions() {
        let store = Store::in_memory().unwrap();
        let server = store
            .with_scope(|s| s.insert_server(&sample_server("delta", 25568)))
            .unwrap();

        store
            .with_scope(|s| s.mark_server_running(server.id, 4242))
            .unwrap();
        let running = store
            .with_scope(|s| s.find_server_by_id(server.id))
            .unwrap()
            .unwrap();
        assert!(running.running);
        assert_eq!(running.pid, Some(4242));
        assert!(running.last_started.is_some());

        store
            .with_scope(|s| s.mark_server_stopped(server.id, true))
            .unwrap();
        let stopped = store
            .with_scope(|s| s.find_server_by_id(server.id))
            .unwrap()
            .unwrap();
        assert!(!stopped.running);
        assert_eq!(stopped.pid, None);
        assert!(stopped.last_stopped.is_some());
    }

    #[test]
    fn healing_does_not_stamp_last_stopped() {
        let store = Store::in_memory().unwrap();
        let server = store
            .with_scope(|s| s.insert_server(&sample_server("stale", 25569)))
            .unwrap();
        store
            .with_scope(|s| s.mark_server_running(server.id, 999_999))
            .unwrap();
        store
            .with_scope(|s| s.mark_server_stopped(server.id, false))
            .unwrap();
        let healed = store
            .with_scope(|s| s.find_server_by_id(server.id))
            .unwrap()
            .unwrap();
        assert!(!healed.running);
        assert_eq!(healed.last_stopped, None);
    }

    #[test]
    fn unique_name_is_enforced() {
        let store = Store::in_memory().unwrap();
        store
            .with_scope(|s| s.insert_server(&sample_server("dup", 25570)))
            .unwrap();
        let second = store.with_scope(|s| s.insert_server(&sample_server("dup", 25571)));
        assert!(second.is_err());
    }

    #[test]
    fn schedule_crud_round_trip() {
        let store = Store::in_memory().unwrap();
        let server = store
            .with_scope(|s| s.insert_server(&sample_server("sched", 25572)))
            .unwrap();

        let schedule = store
            .with_scope(|s| {
                s.insert_schedule(
                    server.id,
                    ScheduleAction::Backup,
                    "*/5 * * * *",
                    None,
                    true,
                    None,
                )
            })
            .unwrap();
        assert!(schedule.enabled);
        assert_eq!(schedule.action, ScheduleAction::Backup);

        let mut updated = schedule.clone();
        updated.enabled = false;
        store.with_scope(|s| s.update_schedule(&updated)).unwrap();
        let read = store
            .with_scope(|s| s.find_schedule(schedule.id))
            .unwrap()
            .unwrap();
        assert!(!read.enabled);

        store
            .with_scope(|s| s.delete_schedule(schedule.id))
            .unwrap();
        assert!(store
            .with_scope(|s| s.find_schedule(schedule.id))
            .unwrap()
            .is_none());
    }

    #[test]
    fn api_key_prefix_lookup() {
        let store = Store::in_memory().unwrap();
        store
            .with_scope(|s| {
                s.insert_api_key("ci", "abcd1234", "deadbeef", &["servers:write".into()])
            })
            .unwrap();

        let found = store
            .with_scope(|s| s.find_api_keys_by_prefix("abcd1234"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].permissions, vec!["servers:write".to_string()]);
        assert!(store.with_scope(|s| s.any_active_api_keys()).unwrap());

        store
            .with_scope(|s| s.revoke_api_key(found[0].id))
            .unwrap();
        assert!(!store.with_scope(|s| s.any_active_api_keys()).unwrap());
    }
}
