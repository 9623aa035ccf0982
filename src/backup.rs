//! # Backup creation, restore, and pruning.
//!
//! Archives are gzip-compressed tars of the server's working directory with
//! the server name as the single top-level entry, written to
//! `backups/<name>_<YYYYMMDD_HHMMSS>.tar.gz`. The file on disk is the source
//! of truth; the database row is a catalog entry, and rows whose archive
//! went missing are surfaced as broken rather than silently removed.
//!
//! Archive I/O runs on the blocking pool so the runtime stays responsive
//! while multi-gigabyte worlds are packed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lifecycle::{StopOutcome, Supervisor};
use crate::platform::paths;
use crate::store::{BackupKind, BackupRecord, BackupStatus, Store};

/// Catalog row plus the on-disk truth.
#[derive(Debug, Clone, Serialize)]
pub struct BackupView {
    #[serde(flatten)]
    pub record: BackupRecord,
    /// True when the archive file is missing.
    pub broken: bool,
}

/// Creates, restores, lists, and prunes backups.
pub struct BackupManager {
    store: Arc<Store>,
    supervisor: Arc<Supervisor>,
    backups_dir: PathBuf,
}

impl BackupManager {
    pub fn new(cfg: &Config, store: Arc<Store>, supervisor: Arc<Supervisor>) -> Arc<Self> {
        Arc::new(Self {
            store,
            supervisor,
            backups_dir: paths::backups_dir(&cfg.data_root),
        })
    }

    /// Creates a backup. With `stop_first` the server is stopped for the
    /// duration and restarted afterwards.
    pub async fn create(
        &self,
        server_id: i64,
        kind: BackupKind,
        stop_first: bool,
    ) -> Result<BackupRecord> {
        let server = self
            .store
            .with_scope(|scope| scope.find_server_by_id(server_id))?
            .ok_or_else(|| Error::not_found("server", server_id))?;

        if !server.path.exists() {
            return Err(Error::Backup(format!(
                "server directory does not exist: {}",
                server.path.display()
            )));
        }

        let was_running = stop_first
            && matches!(
                self.supervisor.stop(server_id).await?,
                StopOutcome::Stopped
            );

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let archive = self.backups_dir.join(format!("{}_{stamp}.tar.gz", server.name));
        std::fs::create_dir_all(&self.backups_dir)?;

        // Catalog the attempt first so a crash mid-archive leaves a row
        // pointing at the truth.
        let record = self.store.with_scope(|scope| {
            scope.insert_backup(server_id, &archive, kind, BackupStatus::InProgress, None)
        })?;

        info!(server = %server.name, archive = %archive.display(), "creating backup");
        let result = {
            let source = server.path.clone();
            let target = archive.clone();
            let root_name = server.name.clone();
            tokio::task::spawn_blocking(move || write_archive(&source, &target, &root_name))
                .await
                .map_err(|e| Error::Backup(format!("archive task panicked: {e}")))?
        };

        let outcome = match result {
            Ok(size) => {
                self.store.with_scope(|scope| {
                    scope.update_backup_status(record.id, BackupStatus::Completed, Some(size))
                })?;
                info!(server = %server.name, size, "backup completed");
                self.store
                    .with_scope(|scope| scope.find_backup(record.id))?
                    .ok_or_else(|| Error::not_found("backup", record.id))
            }
            Err(err) => {
                error!(server = %server.name, error = %err, "backup failed");
                let _ = std::fs::remove_file(&archive);
                self.store.with_scope(|scope| {
                    scope.update_backup_status(record.id, BackupStatus::Failed, None)
                })?;
                Err(err)
            }
        };

        if was_running {
            if let Err(err) = self.supervisor.start(server_id).await {
                warn!(server = %server.name, error = %err, "restart after backup failed");
            }
        }
        outcome
    }

    /// Restores a backup over the server's working directory, stopping and
    /// restarting the server when it was running.
    pub async fn restore(&self, backup_id: i64) -> Result<()> {
        let (backup, server) = self.store.with_scope(|scope| {
            let backup = scope
                .find_backup(backup_id)?
                .ok_or_else(|| Error::not_found("backup", backup_id))?;
            let server = scope
                .find_server_by_id(backup.server_id)?
                .ok_or_else(|| Error::not_found("server", backup.server_id))?;
            Ok((backup, server))
        })?;

        if !backup.path.exists() {
            return Err(Error::Backup(format!(
                "archive missing: {}",
                backup.path.display()
            )));
        }

        let was_running = matches!(
            self.supervisor.stop(server.id).await?,
            StopOutcome::Stopped
        );

        info!(server = %server.name, archive = %backup.path.display(), "restoring backup");
        let result = {
            let archive = backup.path.clone();
            let dest = server.path.clone();
            let root_name = server.name.clone();
            tokio::task::spawn_blocking(move || unpack_archive(&archive, &dest, &root_name))
                .await
                .map_err(|e| Error::Backup(format!("restore task panicked: {e}")))?
        };

        if was_running {
            if let Err(err) = self.supervisor.start(server.id).await {
                warn!(server = %server.name, error = %err, "restart after restore failed");
            }
        }
        result
    }

    /// Lists catalog entries, flagging rows whose archive is gone.
    pub async fn list(&self, server_id: Option<i64>) -> Result<Vec<BackupView>> {
        let records = self
            .store
            .with_scope(|scope| scope.list_backups(server_id))?;
        Ok(records
            .into_iter()
            .map(|record| {
                let broken = !record.path.exists();
                BackupView { record, broken }
            })
            .collect())
    }

    /// Deletes a backup row and, by default, its archive.
    pub async fn delete(&self, backup_id: i64, delete_file: bool) -> Result<()> {
        let backup = self
            .store
            .with_scope(|scope| scope.find_backup(backup_id))?
            .ok_or_else(|| Error::not_found("backup", backup_id))?;

        if delete_file && backup.path.exists() {
            std::fs::remove_file(&backup.path)?;
        }
        self.store
            .with_scope(|scope| scope.delete_backup(backup_id))?;
        info!(backup = backup_id, "backup deleted");
        Ok(())
    }

    /// Prunes completed backups beyond `keep_count` per server, optionally
    /// only those older than `keep_days`. Returns how many were removed.
    pub async fn prune(
        &self,
        server_id: Option<i64>,
        keep_count: usize,
        keep_days: Option<i64>,
    ) -> Result<usize> {
        let all = self.list(server_id).await?;
        let cutoff = keep_days.map(|days| Utc::now() - chrono::Duration::days(days));

        let mut by_server: std::collections::HashMap<i64, Vec<&BackupView>> =
            std::collections::HashMap::new();
        for view in &all {
            if view.record.status == BackupStatus::Completed {
                by_server.entry(view.record.server_id).or_default().push(view);
            }
        }

        let mut pruned = 0;
        for views in by_server.values() {
            // list() returns newest first.
            for view in views.iter().skip(keep_count) {
                if let Some(cutoff) = cutoff {
                    if view.record.created_at >= cutoff {
                        continue;
                    }
                }
                match self.delete(view.record.id, true).await {
                    Ok(()) => pruned += 1,
                    Err(err) => {
                        warn!(backup = view.record.id, error = %err, "prune failed for backup")
                    }
                }
            }
        }
        info!(pruned, "backup prune finished");
        Ok(pruned)
    }
}

/// Packs `source` into a gzip tar at `target` with `root_name` as the
/// top-level entry. Returns the archive size in bytes.
fn write_archive(source: &Path, target: &Path, root_name: &str) -> Result<u64> {
    let file = std::fs::File::create(target)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(root_name, source)
        .map_err(|e| Error::Backup(format!("archiving {}: {e}", source.display())))?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| Error::Backup(format!("finalizing archive: {e}")))?;
    Ok(std::fs::metadata(target)?.len())
}

/// Unpacks an archive into `dest`, stripping the `root_name/` prefix that
/// [`write_archive`] added.
fn unpack_archive(archive: &Path, dest: &Path, root_name: &str) -> Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)?;

    let file = std::fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    for entry in tar.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(Error::Io)?;
        let path = entry.path().map_err(Error::Io)?.into_owned();

        let stripped = match path.strip_prefix(root_name) {
            Ok(rest) if rest.as_os_str().is_empty() => continue, // the root dir itself
            Ok(rest) => rest.to_path_buf(),
            // Foreign layout: take the entry as-is, contained below.
            Err(_) => path,
        };
        // unpack_in refuses `..` escapes.
        let mut target_entry = entry;
        let full = dest.join(&stripped);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        target_entry
            .unpack(&full)
            .map_err(|e| Error::Backup(format!("unpacking {}: {e}", stripped.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_round_trip_preserves_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("alpha");
        std::fs::create_dir_all(source.join("world/region")).unwrap();
        std::fs::write(source.join("server.properties"), "motd=hi\n").unwrap();
        std::fs::write(source.join("world/region/r.0.0.mca"), vec![7u8; 512]).unwrap();

        let archive = dir.path().join("alpha_20240301_120000.tar.gz");
        let size = write_archive(&source, &archive, "alpha").unwrap();
        assert!(size > 0);
        assert!(archive.is_file());

        let dest = dir.path().join("restored");
        unpack_archive(&archive, &dest, "alpha").unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("server.properties")).unwrap(),
            "motd=hi\n"
        );
        assert_eq!(
            std::fs::read(dest.join("world/region/r.0.0.mca")).unwrap(),
            vec![7u8; 512]
        );
    }

    #[test]
    fn restore_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("beta");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("keep.txt"), "new").unwrap();

        let archive = dir.path().join("beta.tar.gz");
        write_archive(&source, &archive, "beta").unwrap();

        let dest = dir.path().join("target");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        unpack_archive(&archive, &dest, "beta").unwrap();
        assert!(dest.join("keep.txt").is_file());
        assert!(!dest.join("stale.txt").exists(), "stale files must be gone");
    }
}
