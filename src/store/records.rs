//! # Value-typed records handed out by the store.
//!
//! Every struct here is a plain owned snapshot. Nothing borrows the
//! connection, so results stay valid after the scope that produced them has
//! committed and closed. This is the crate-wide rule: no live database handle
//! ever crosses the gateway boundary.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream distribution a server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Paper,
    Vanilla,
    Fabric,
    Purpur,
    Forge,
}

impl Distribution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distribution::Paper => "paper",
            Distribution::Vanilla => "vanilla",
            Distribution::Fabric => "fabric",
            Distribution::Purpur => "purpur",
            Distribution::Forge => "forge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "paper" => Some(Distribution::Paper),
            "vanilla" => Some(Distribution::Vanilla),
            "fabric" => Some(Distribution::Fabric),
            "purpur" => Some(Distribution::Purpur),
            "forge" => Some(Distribution::Forge),
            _ => None,
        }
    }
}

/// One managed server: configuration plus reconciled runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct ServerRecord {
    pub id: i64,
    pub name: String,
    pub distribution: Distribution,
    pub version: String,
    /// Working directory owning the server's files.
    pub path: PathBuf,
    pub port: u16,
    /// Heap size as a human string, e.g. `2G`.
    pub memory: String,
    /// Explicit runtime path; `None` means "pick the best discovered one".
    pub java_path: Option<String>,
    /// Extra JVM arguments inserted before `-jar`.
    pub jvm_args: Option<String>,
    /// Restart automatically after a crash that was not operator-initiated.
    pub restart_on_crash: bool,
    // Runtime state; if `running` then `pid` is non-null, and the reconciler
    // heals rows where the OS disagrees.
    pub running: bool,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_stopped: Option<DateTime<Utc>>,
}

/// Fields required to insert a server row.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub distribution: Distribution,
    pub version: String,
    pub path: PathBuf,
    pub port: u16,
    pub memory: String,
    pub java_path: Option<String>,
    pub jvm_args: Option<String>,
}

/// Why a backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    Manual,
    Scheduled,
    PreUpdate,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Scheduled => "scheduled",
            BackupKind::PreUpdate => "pre-update",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(BackupKind::Manual),
            "scheduled" => Some(BackupKind::Scheduled),
            "pre-update" => Some(BackupKind::PreUpdate),
            _ => None,
        }
    }
}

/// Catalog status of a backup archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in-progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in-progress" => Some(BackupStatus::InProgress),
            "completed" => Some(BackupStatus::Completed),
            "failed" => Some(BackupStatus::Failed),
            _ => None,
        }
    }
}

/// Catalog entry for one archive; the file on disk is the source of truth.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    pub id: i64,
    /// Weak reference: deleting a server does not cascade to archives.
    pub server_id: i64,
    pub path: PathBuf,
    pub size_bytes: Option<u64>,
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
}

/// Action a schedule triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleAction {
    Backup,
    Restart,
    Stop,
    Start,
    Command,
}

impl ScheduleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleAction::Backup => "backup",
            ScheduleAction::Restart => "restart",
            ScheduleAction::Stop => "stop",
            ScheduleAction::Start => "start",
            ScheduleAction::Command => "command",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backup" => Some(ScheduleAction::Backup),
            "restart" => Some(ScheduleAction::Restart),
            "stop" => Some(ScheduleAction::Stop),
            "start" => Some(ScheduleAction::Start),
            "command" => Some(ScheduleAction::Command),
            _ => None,
        }
    }
}

/// Durable time-triggered action.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRecord {
    pub id: i64,
    pub server_id: i64,
    pub action: ScheduleAction,
    /// 5-field cron expression.
    pub cron: String,
    /// Opaque payload; required iff `action == Command`.
    pub payload: Option<String>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Registry a plugin was installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginSource {
    Modrinth,
    Hangar,
    Url,
}

impl PluginSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginSource::Modrinth => "modrinth",
            PluginSource::Hangar => "hangar",
            PluginSource::Url => "url",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "modrinth" => Some(PluginSource::Modrinth),
            "hangar" => Some(PluginSource::Hangar),
            "url" => Some(PluginSource::Url),
            _ => None,
        }
    }
}

/// Installed plugin; the `.jar` / `.jar.disabled` file drives `enabled`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginRecord {
    pub id: i64,
    pub server_id: i64,
    pub name: String,
    pub source: PluginSource,
    pub project_id: Option<String>,
    pub installed_version: Option<String>,
    pub file_path: PathBuf,
    pub enabled: bool,
}

/// API key at rest. The raw secret exists only at issuance.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub label: String,
    /// Public short prefix used for lookup.
    pub prefix: String,
    /// SHA-256 of the secret, hex-encoded.
    pub key_hash: String,
    /// Permission names granted to this key.
    pub permissions: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for d in [
            Distribution::Paper,
            Distribution::Vanilla,
            Distribution::Fabric,
            Distribution::Purpur,
            Distribution::Forge,
        ] {
            assert_eq!(Distribution::parse(d.as_str()), Some(d));
        }
        assert_eq!(Distribution::parse("bukkit"), None);
        assert_eq!(BackupKind::parse("pre-update"), Some(BackupKind::PreUpdate));
        assert_eq!(ScheduleAction::parse("command"), Some(ScheduleAction::Command));
        assert_eq!(PluginSource::parse("modrinth"), Some(PluginSource::Modrinth));
    }
}
