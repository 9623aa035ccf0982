//! # REST handlers.
//!
//! Thin adapters from JSON bodies onto the supervision core. Body DTOs live
//! here; response bodies are the store's own snapshot records.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fetch::PluginRequest;
use crate::lifecycle::{CreateSpec, ImportSpec, StopOutcome, UpdateSpec};
use crate::platform::{discover_runtimes, JavaRuntime};
use crate::properties;
use crate::store::{
    BackupKind, Distribution, PluginRecord, PluginSource, ScheduleAction, ScheduleRecord,
    ServerRecord,
};

use super::{ApiError, AppState};

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ---------------------------
// Servers
// ---------------------------

#[derive(Deserialize)]
pub struct CreateServerBody {
    pub name: String,
    pub distribution: Distribution,
    pub version: String,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// When set, import this existing directory instead of downloading.
    #[serde(default)]
    pub import_path: Option<String>,
}

pub async fn list_servers(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ServerRecord>> {
    Ok(Json(state.supervisor.list().await?))
}

pub async fn create_server(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateServerBody>,
) -> ApiResult<ServerRecord> {
    let record = match body.import_path {
        Some(path) => {
            state
                .supervisor
                .import(ImportSpec {
                    name: body.name,
                    distribution: body.distribution,
                    version: body.version,
                    path: path.into(),
                    memory: body.memory,
                    port: body.port,
                })
                .await?
        }
        None => {
            state
                .supervisor
                .create(CreateSpec {
                    name: body.name,
                    distribution: body.distribution,
                    version: body.version,
                    memory: body.memory,
                    port: body.port,
                })
                .await?
        }
    };
    Ok(Json(record))
}

pub async fn get_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<ServerRecord> {
    Ok(Json(state.supervisor.get(id).await?))
}

#[derive(Deserialize)]
pub struct UpdateServerBody {
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub java_path: Option<String>,
    #[serde(default)]
    pub jvm_args: Option<String>,
    #[serde(default)]
    pub restart_on_crash: Option<bool>,
}

pub async fn update_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateServerBody>,
) -> ApiResult<ServerRecord> {
    let record = state
        .supervisor
        .update(
            id,
            UpdateSpec {
                memory: body.memory,
                port: body.port,
                java_path: body.java_path,
                jvm_args: body.jvm_args,
                restart_on_crash: body.restart_on_crash,
            },
        )
        .await?;
    Ok(Json(record))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub keep_files: bool,
}

pub async fn delete_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<serde_json::Value> {
    state.supervisor.delete(id, query.keep_files).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

pub async fn start_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let pid = state.supervisor.start(id).await?;
    Ok(Json(serde_json::json!({"pid": pid})))
}

pub async fn stop_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let outcome = state.supervisor.stop(id).await?;
    let outcome = match outcome {
        StopOutcome::Stopped => "stopped",
        StopOutcome::AlreadyStopped => "already_stopped",
    };
    Ok(Json(serde_json::json!({"outcome": outcome})))
}

pub async fn restart_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let pid = state.supervisor.restart(id).await?;
    Ok(Json(serde_json::json!({"pid": pid})))
}

pub async fn server_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<crate::lifecycle::StatusReport> {
    Ok(Json(state.supervisor.status(id).await?))
}

#[derive(Deserialize)]
pub struct CommandBody {
    pub command: String,
}

pub async fn send_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<CommandBody>,
) -> ApiResult<serde_json::Value> {
    state.supervisor.send_command(id, &body.command).await?;
    Ok(Json(serde_json::json!({"sent": true})))
}

// ---------------------------
// Backups
// ---------------------------

#[derive(Deserialize)]
pub struct CreateBackupBody {
    #[serde(default)]
    pub stop_first: bool,
}

pub async fn list_backups(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::backup::BackupView>> {
    Ok(Json(state.backups.list(Some(id)).await?))
}

pub async fn create_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<CreateBackupBody>,
) -> ApiResult<crate::store::BackupRecord> {
    let record = state
        .backups
        .create(id, BackupKind::Manual, body.stop_first)
        .await?;
    Ok(Json(record))
}

pub async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.backups.restore(id).await?;
    Ok(Json(serde_json::json!({"restored": id})))
}

pub async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.backups.delete(id, true).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

// ---------------------------
// Plugins
// ---------------------------

#[derive(Deserialize)]
pub struct InstallPluginBody {
    pub source: PluginSource,
    /// Project id / slug for registries, full URL for `url`.
    pub reference: String,
    #[serde(default)]
    pub game_version: Option<String>,
}

pub async fn list_plugins(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<PluginRecord>> {
    Ok(Json(state.plugins.list(id).await?))
}

pub async fn install_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<InstallPluginBody>,
) -> ApiResult<PluginRecord> {
    let record = state
        .plugins
        .install(
            id,
            PluginRequest {
                source: body.source,
                reference: body.reference,
                game_version: body.game_version,
            },
        )
        .await?;
    Ok(Json(record))
}

#[derive(Deserialize)]
pub struct TogglePluginBody {
    pub enabled: bool,
}

pub async fn toggle_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TogglePluginBody>,
) -> ApiResult<PluginRecord> {
    Ok(Json(state.plugins.set_enabled(id, body.enabled).await?))
}

pub async fn remove_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.plugins.remove(id, true).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

// ---------------------------
// Schedules
// ---------------------------

#[derive(Deserialize)]
pub struct CreateScheduleBody {
    pub action: ScheduleAction,
    pub cron: String,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<ScheduleRecord>> {
    Ok(Json(state.scheduler.list(Some(id)).await?))
}

pub async fn list_all_schedules(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<ScheduleRecord>> {
    Ok(Json(state.scheduler.list(None).await?))
}

pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<CreateScheduleBody>,
) -> ApiResult<ScheduleRecord> {
    let record = state
        .scheduler
        .create(id, body.action, &body.cron, body.payload, body.enabled)
        .await?;
    Ok(Json(record))
}

#[derive(Deserialize)]
pub struct UpdateScheduleBody {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub payload: Option<String>,
}

pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateScheduleBody>,
) -> ApiResult<ScheduleRecord> {
    let record = state
        .scheduler
        .update(
            id,
            crate::sched::ScheduleUpdate {
                cron: body.cron,
                enabled: body.enabled,
                payload: body.payload,
            },
        )
        .await?;
    Ok(Json(record))
}

pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.delete(id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

// ---------------------------
// Properties
// ---------------------------

pub async fn get_properties(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<BTreeMap<String, String>> {
    let server = state.supervisor.get(id).await?;
    Ok(Json(properties::load(&server.path)?))
}

pub async fn update_properties(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(updates): Json<BTreeMap<String, String>>,
) -> ApiResult<BTreeMap<String, String>> {
    let server = state.supervisor.get(id).await?;
    properties::update(&server.path, &updates)?;
    Ok(Json(properties::load(&server.path)?))
}

// ---------------------------
// Services
// ---------------------------

pub async fn install_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<crate::services::ServiceInfo> {
    Ok(Json(state.services.install(id).await?))
}

// ---------------------------
// Java runtimes
// ---------------------------

pub async fn list_java(State(state): State<Arc<AppState>>) -> ApiResult<Vec<JavaRuntime>> {
    Ok(Json(discover_runtimes(&state.cfg.data_root).await))
}

#[derive(Deserialize)]
pub struct InstallJavaBody {
    pub major: u32,
}

pub async fn install_java(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InstallJavaBody>,
) -> ApiResult<JavaRuntime> {
    let runtimes_dir = crate::platform::paths::runtimes_dir(&state.cfg.data_root);
    let client = crate::fetch::http_client();
    let runtime = crate::fetch::install_runtime(&client, body.major, &runtimes_dir).await?;
    Ok(Json(runtime))
}

// ---------------------------
// API keys
// ---------------------------

/// Public view of a key: never the hash.
#[derive(Serialize)]
pub struct KeyView {
    pub id: i64,
    pub label: String,
    pub prefix: String,
    pub permissions: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

impl From<crate::store::ApiKeyRecord> for KeyView {
    fn from(record: crate::store::ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            label: record.label,
            prefix: record.prefix,
            permissions: record.permissions,
            active: record.active,
            created_at: record.created_at,
            last_used: record.last_used,
        }
    }
}

pub async fn list_keys(State(state): State<Arc<AppState>>) -> ApiResult<Vec<KeyView>> {
    let keys = state.keys.list()?;
    Ok(Json(keys.into_iter().map(KeyView::from).collect()))
}

#[derive(Deserialize)]
pub struct CreateKeyBody {
    pub label: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Serialize)]
pub struct IssuedKeyView {
    #[serde(flatten)]
    pub key: KeyView,
    /// Shown exactly once.
    pub token: String,
}

pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateKeyBody>,
) -> ApiResult<IssuedKeyView> {
    let issued = state.keys.issue(&body.label, &body.permissions)?;
    Ok(Json(IssuedKeyView {
        key: issued.record.into(),
        token: issued.token,
    }))
}

pub async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.keys.revoke(id)?;
    Ok(Json(serde_json::json!({"revoked": id})))
}
