//! # Lifecycle engine: the public start/stop/create/delete contract.
//!
//! [`Supervisor`] is the one entry point HTTP handlers, CLI commands, and the
//! scheduler call. It wires the platform backend, the store gateway, and the
//! console fabric together and owns the server state machine:
//!
//! ```text
//!             create/import                    start
//!    (none) ─────────────────▶ Stopped ────────────────▶ Starting
//!                                 ▲                        │
//!                                 │ exit/stop-success      │ first output line
//!                                 │                        ▼
//!                               Stopping ◀───────────── Running
//!                                 ▲          stop          │
//!                                 │                        │ out-of-band exit
//!                                 └────────────────────────┘
//!                                         (reconciler)
//! ```
//!
//! ## Rules
//! - Every database touch happens inside one store scope; results are
//!   snapshots.
//! - `start` heals stale "running" rows instead of refusing on them.
//! - `stop` is idempotent (`AlreadyStopped`) and never stamps
//!   `last_stopped` on a server that was not running.
//! - Working-directory deletion requires the canonicalised path to be a
//!   strict descendant of the servers root, and never runs elevated.

mod exit;
mod validate;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::Config;
use crate::console::ConsoleFabric;
use crate::error::{Error, Result};
use crate::fetch;
use crate::platform::{paths, Platform};
use crate::store::{Distribution, NewServer, ServerRecord, Store};

pub use exit::{CrashRestartHook, PersistStopHook};
pub use validate::{memory as validate_memory, port as validate_port, server_name};

/// Outcome of a [`Supervisor::stop`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The child was asked to stop and has exited.
    Stopped,
    /// The server was not running; nothing was touched.
    AlreadyStopped,
}

/// Parameters for creating a server from scratch.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub distribution: Distribution,
    pub version: String,
    pub memory: Option<String>,
    pub port: Option<u16>,
}

/// Parameters for importing an existing directory.
#[derive(Debug, Clone)]
pub struct ImportSpec {
    pub name: String,
    pub distribution: Distribution,
    pub version: String,
    pub path: PathBuf,
    pub memory: Option<String>,
    pub port: Option<u16>,
}

/// Partial configuration update; `Some("")` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct UpdateSpec {
    pub memory: Option<String>,
    pub port: Option<u16>,
    pub java_path: Option<String>,
    pub jvm_args: Option<String>,
    pub restart_on_crash: Option<bool>,
}

/// Reconciled point-in-time view returned by [`Supervisor::status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub id: i64,
    pub name: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
}

/// Orchestrates server lifecycle across platform, store, and fabric.
pub struct Supervisor {
    store: Arc<Store>,
    platform: Arc<dyn Platform>,
    fabric: Arc<ConsoleFabric>,
    http: reqwest::Client,
    cfg: Config,
    /// Servers with an operator-initiated stop in flight; consulted by the
    /// crash-restart hook.
    stopping: DashMap<i64, ()>,
}

impl Supervisor {
    /// Builds the engine and installs the exit-callback chain.
    pub async fn new(
        cfg: Config,
        store: Arc<Store>,
        platform: Arc<dyn Platform>,
        fabric: Arc<ConsoleFabric>,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            store: Arc::clone(&store),
            platform,
            fabric: Arc::clone(&fabric),
            http: fetch::http_client(),
            cfg,
            stopping: DashMap::new(),
        });

        fabric.set_exit_handler(Arc::new(PersistStopHook::new(Arc::clone(&store))));
        fabric
            .add_exit_hook(Arc::new(CrashRestartHook::new(
                Arc::downgrade(&supervisor),
                store,
            )))
            .await;

        supervisor
    }

    /// The store this engine persists to.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The console fabric serving this engine's children.
    pub fn fabric(&self) -> &Arc<ConsoleFabric> {
        &self.fabric
    }

    /// The platform backend in use.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// True while an operator stop for `server_id` is in flight.
    pub fn is_operator_stop(&self, server_id: i64) -> bool {
        self.stopping.contains_key(&server_id)
    }

    // ---------------------------
    // Create / import / delete
    // ---------------------------

    /// Creates a server: validates, allocates the working directory, fetches
    /// the server JAR, and inserts the record.
    pub async fn create(&self, spec: CreateSpec) -> Result<ServerRecord> {
        server_name(&spec.name)?;
        let memory = validate_memory(spec.memory.as_deref().unwrap_or(&self.cfg.default_memory))?;
        let port = validate_port(spec.port.unwrap_or(self.cfg.default_port))?;

        let taken = self
            .store
            .with_scope(|scope| scope.find_server_by_name(&spec.name))?;
        if taken.is_some() {
            return Err(Error::NameInUse { name: spec.name });
        }

        let dir = paths::server_dir(&self.cfg.data_root, &spec.name);
        std::fs::create_dir_all(&dir)?;

        info!(name = %spec.name, distribution = spec.distribution.as_str(),
              version = %spec.version, dir = %dir.display(), "creating server");

        if let Err(err) =
            fetch::install_distribution(&self.http, spec.distribution, &spec.version, &dir).await
        {
            // A half-installed directory is worse than none.
            let _ = std::fs::remove_dir_all(&dir);
            return Err(err);
        }

        self.store.with_scope(|scope| {
            scope.insert_server(&NewServer {
                name: spec.name.clone(),
                distribution: spec.distribution,
                version: spec.version.clone(),
                path: dir.clone(),
                port,
                memory: memory.clone(),
                java_path: None,
                jvm_args: None,
            })
        })
    }

    /// Imports an existing server directory without downloading anything.
    pub async fn import(&self, spec: ImportSpec) -> Result<ServerRecord> {
        server_name(&spec.name)?;
        let memory = validate_memory(spec.memory.as_deref().unwrap_or(&self.cfg.default_memory))?;
        let port = validate_port(spec.port.unwrap_or(self.cfg.default_port))?;

        let path = spec
            .path
            .canonicalize()
            .map_err(|_| Error::validation("path", "directory does not exist"))?;
        if find_server_jar(&path).is_none() {
            return Err(Error::validation("path", "no server JAR found in directory"));
        }

        self.store.with_scope(|scope| {
            if scope.find_server_by_name(&spec.name)?.is_some() {
                return Err(Error::NameInUse {
                    name: spec.name.clone(),
                });
            }
            scope.insert_server(&NewServer {
                name: spec.name.clone(),
                distribution: spec.distribution,
                version: spec.version.clone(),
                path: path.clone(),
                port,
                memory: memory.clone(),
                java_path: None,
                jvm_args: None,
            })
        })
    }

    /// Deletes a stopped server. With `keep_files == false` the working
    /// directory is removed, guarded against traversal and elevation.
    pub async fn delete(&self, server_id: i64, keep_files: bool) -> Result<()> {
        let record = self
            .store
            .with_scope(|scope| scope.find_server_by_id(server_id))?
            .ok_or_else(|| Error::not_found("server", server_id))?;

        if record.running && record.pid.map(|p| self.platform.is_alive(p)).unwrap_or(false) {
            return Err(Error::AlreadyRunning {
                name: record.name,
                pid: record.pid.unwrap_or_default(),
            });
        }

        // Resolve the removal target before touching the database, so a
        // refusal leaves both the record and the files in place.
        let removal = if keep_files {
            None
        } else {
            self.resolve_safe_removal(&record)?
        };

        self.store.with_scope(|scope| scope.delete_server(server_id))?;
        self.fabric.remove(server_id).await;

        if let Some(dir) = removal {
            info!(server_id, dir = %dir.display(), "removing server files");
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Anti-traversal check: the canonicalised working directory must be a
    /// strict descendant of the servers root, and the supervisor must not be
    /// elevated. Returns `None` when there is nothing on disk to remove.
    fn resolve_safe_removal(&self, record: &ServerRecord) -> Result<Option<PathBuf>> {
        let resolved = match record.path.canonicalize() {
            Ok(p) => p,
            // Nothing on disk; deleting the record alone is fine.
            Err(_) => return Ok(None),
        };
        let servers_root = paths::server_dir(&self.cfg.data_root, "")
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.cfg.data_root.join("servers"));
        let servers_root = servers_root
            .canonicalize()
            .map_err(|e| Error::Resource(format!("cannot resolve servers root: {e}")))?;

        if resolved == servers_root || !resolved.starts_with(&servers_root) {
            warn!(server = %record.name, path = %resolved.display(),
                  "delete refused: path escapes the servers root");
            return Err(Error::Security(format!(
                "server path '{}' is outside the managed servers directory",
                resolved.display()
            )));
        }

        if self.platform.is_elevated() {
            return Err(Error::Security(
                "refusing to delete server files while running as root/Administrator".into(),
            ));
        }
        Ok(Some(resolved))
    }

    // ---------------------------
    // Start / stop / restart / status
    // ---------------------------

    /// Starts a server and returns the child pid.
    pub async fn start(&self, server_id: i64) -> Result<u32> {
        // Load and heal under one scope; the OS probe is cheap and sync.
        let record = self.store.with_scope(|scope| {
            let record = scope
                .find_server_by_id(server_id)?
                .ok_or_else(|| Error::not_found("server", server_id))?;
            if record.running {
                let confirmed = record
                    .pid
                    .map(|pid| {
                        self.platform.is_alive(pid)
                            && self
                                .platform
                                .process_stats(pid)
                                .map(|s| s.looks_like_java())
                                .unwrap_or(false)
                    })
                    .unwrap_or(false);
                if confirmed {
                    return Err(Error::AlreadyRunning {
                        name: record.name.clone(),
                        pid: record.pid.unwrap_or_default(),
                    });
                }
                warn!(server = %record.name, stale_pid = ?record.pid,
                      "healing stale running state before start");
                scope.mark_server_stopped(server_id, false)?;
            }
            Ok(record)
        })?;

        if let Some(child) = self.fabric.get_active(server_id).await {
            return Err(Error::AlreadyRunning {
                name: record.name,
                pid: child.pid,
            });
        }

        std::fs::create_dir_all(&record.path)?;
        let jar = match find_server_jar(&record.path) {
            Some(jar) => jar,
            None => {
                info!(server = %record.name, "server JAR missing, fetching");
                fetch::install_distribution(
                    &self.http,
                    record.distribution,
                    &record.version,
                    &record.path,
                )
                .await?;
                find_server_jar(&record.path)
                    .ok_or_else(|| Error::Resource("server JAR missing after install".into()))?
            }
        };

        check_eula(&record.path)?;

        let probe = self.platform.free_port(record.port).await;
        if !probe.free {
            return Err(Error::PortInUse {
                port: record.port,
                holder_pid: probe.holder_pid,
            });
        }

        let java = self.resolve_java(&record).await?;
        if self.platform.is_elevated() {
            // Advisory only for an already-configured server.
            warn!(server = %record.name, "starting a server as root/Administrator is discouraged");
        }

        let mut argv = vec![
            java,
            format!("-Xmx{}", record.memory),
            format!("-Xms{}", record.memory),
        ];
        if let Some(args) = &record.jvm_args {
            argv.extend(args.split_whitespace().map(str::to_string));
        }
        argv.push("-jar".into());
        argv.push(jar);
        argv.push("nogui".into());

        info!(server = %record.name, command = %argv.join(" "), "starting server");
        let spawned = self
            .platform
            .spawn(&record.path, &argv, &HashMap::new())
            .map_err(|err| match err {
                e @ Error::Validation { .. } => e,
                e => Error::Resource(format!("failed to spawn server process: {e}")),
            })?;
        let pid = spawned.pid;

        self.fabric.register(server_id, spawned).await;
        self.store
            .with_scope(|scope| scope.mark_server_running(server_id, pid))?;

        info!(server = %record.name, pid, "server started");
        Ok(pid)
    }

    /// Stops a server with the two-stage grace: console `stop`, graceful
    /// signal, force kill. Idempotent on not-running servers.
    pub async fn stop(&self, server_id: i64) -> Result<StopOutcome> {
        self.stop_with_grace(server_id, self.cfg.stop_grace()).await
    }

    /// [`Supervisor::stop`] with an explicit grace window per stage.
    pub async fn stop_with_grace(&self, server_id: i64, grace: Duration) -> Result<StopOutcome> {
        let record = self
            .store
            .with_scope(|scope| scope.find_server_by_id(server_id))?
            .ok_or_else(|| Error::not_found("server", server_id))?;

        let pid = match (record.running, record.pid) {
            (true, Some(pid)) => pid,
            // Not running: succeed without touching last_stopped.
            _ => return Ok(StopOutcome::AlreadyStopped),
        };

        self.stopping.insert(server_id, ());
        let outcome = self.drive_stop(&record, server_id, pid, grace).await;
        self.stopping.remove(&server_id);
        outcome
    }

    async fn drive_stop(
        &self,
        record: &ServerRecord,
        server_id: i64,
        pid: u32,
        grace: Duration,
    ) -> Result<StopOutcome> {
        info!(server = %record.name, pid, "stopping server");

        if let Some(child) = self.fabric.get_active(server_id).await {
            if let Err(err) = child.send_command("stop").await {
                warn!(server = %record.name, error = %err, "console stop command failed");
            }
            if tokio::time::timeout(grace, child.wait_exited()).await.is_ok() {
                info!(server = %record.name, "server stopped gracefully");
                return Ok(StopOutcome::Stopped);
            }

            warn!(server = %record.name, grace_secs = grace.as_secs(),
                  "no exit after console stop, sending graceful signal");
            let _ = self.platform.signal_graceful(pid);
            if tokio::time::timeout(grace, child.wait_exited()).await.is_ok() {
                return Ok(StopOutcome::Stopped);
            }

            warn!(server = %record.name, "graceful signal ignored, force killing");
            let _ = self.platform.signal_force(pid);
            let _ = tokio::time::timeout(Duration::from_secs(10), child.wait_exited()).await;
            return Ok(StopOutcome::Stopped);
        }

        // No registered child (supervisor restarted since the spawn): fall
        // back to signals plus process-table polling.
        let _ = self.platform.signal_graceful(pid);
        if !self.await_death(pid, grace).await {
            warn!(server = %record.name, "orphan ignored graceful signal, force killing");
            let _ = self.platform.signal_force(pid);
            self.await_death(pid, grace).await;
        }
        self.store
            .with_scope(|scope| scope.mark_server_stopped(server_id, true))?;
        Ok(StopOutcome::Stopped)
    }

    /// Polls the process table until `pid` disappears or the window closes.
    async fn await_death(&self, pid: u32, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        while tokio::time::Instant::now() < deadline {
            if !self.platform.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        !self.platform.is_alive(pid)
    }

    /// Stop followed by start; the intermediate stopped state is visible.
    pub async fn restart(&self, server_id: i64) -> Result<u32> {
        self.stop(server_id).await?;
        self.start(server_id).await
    }

    /// Returns the reconciled status, healing the row inline when the OS
    /// disagrees with the database.
    pub async fn status(&self, server_id: i64) -> Result<StatusReport> {
        self.store.with_scope(|scope| {
            let record = scope
                .find_server_by_id(server_id)?
                .ok_or_else(|| Error::not_found("server", server_id))?;

            let stats = record.pid.and_then(|pid| {
                self.platform
                    .process_stats(pid)
                    .filter(|s| s.looks_like_java())
            });
            let actually_running = stats.is_some();

            if record.running != actually_running {
                info!(server = %record.name, db = record.running, os = actually_running,
                      "state mismatch, correcting database");
                if actually_running {
                    // The OS knows better only in the stopped→running
                    // direction when a pid is still recorded.
                    if let Some(pid) = record.pid {
                        scope.mark_server_running(record.id, pid)?;
                    }
                } else {
                    scope.mark_server_stopped(record.id, true)?;
                }
            }

            Ok(StatusReport {
                id: record.id,
                name: record.name,
                running: actually_running,
                pid: if actually_running { record.pid } else { None },
                uptime_seconds: stats.as_ref().map(|s| s.uptime_seconds),
                cpu_percent: stats.as_ref().map(|s| s.cpu_percent),
                memory_bytes: stats.as_ref().map(|s| s.memory_bytes),
            })
        })
    }

    /// Lists all servers, healing rows whose pid died out-of-band.
    pub async fn list(&self) -> Result<Vec<ServerRecord>> {
        self.store.with_scope(|scope| {
            let mut servers = scope.list_servers()?;
            for server in &mut servers {
                if server.running {
                    let alive = server
                        .pid
                        .map(|pid| self.platform.is_alive(pid))
                        .unwrap_or(false);
                    if !alive {
                        scope.mark_server_stopped(server.id, true)?;
                        server.running = false;
                        server.pid = None;
                    }
                }
            }
            Ok(servers)
        })
    }

    /// Looks a server up by id.
    pub async fn get(&self, server_id: i64) -> Result<ServerRecord> {
        self.store
            .with_scope(|scope| scope.find_server_by_id(server_id))?
            .ok_or_else(|| Error::not_found("server", server_id))
    }

    /// Looks a server up by name.
    pub async fn get_by_name(&self, name: &str) -> Result<ServerRecord> {
        self.store
            .with_scope(|scope| scope.find_server_by_name(name))?
            .ok_or_else(|| Error::not_found("server", name))
    }

    /// Applies a partial configuration update.
    pub async fn update(&self, server_id: i64, update: UpdateSpec) -> Result<ServerRecord> {
        self.store.with_scope(|scope| {
            let mut record = scope
                .find_server_by_id(server_id)?
                .ok_or_else(|| Error::not_found("server", server_id))?;

            if let Some(memory) = &update.memory {
                record.memory = validate_memory(memory)?;
            }
            if let Some(port) = update.port {
                record.port = validate_port(port)?;
            }
            if let Some(java_path) = &update.java_path {
                record.java_path = (!java_path.is_empty()).then(|| java_path.clone());
            }
            if let Some(jvm_args) = &update.jvm_args {
                record.jvm_args = (!jvm_args.is_empty()).then(|| jvm_args.clone());
            }
            scope.update_server(&record)?;
            if let Some(enabled) = update.restart_on_crash {
                scope.set_restart_on_crash(server_id, enabled)?;
                record.restart_on_crash = enabled;
            }
            Ok(record)
        })
    }

    /// Injects one command line into a running server's console.
    pub async fn send_command(&self, server_id: i64, command: &str) -> Result<()> {
        self.fabric.send_command(server_id, command).await
    }

    /// Picks the runtime for a server: explicit `java_path` wins, otherwise
    /// the newest discovered runtime.
    async fn resolve_java(&self, record: &ServerRecord) -> Result<String> {
        if let Some(java) = &record.java_path {
            return Ok(java.clone());
        }
        let runtimes = crate::platform::discover_runtimes(&self.cfg.data_root).await;
        runtimes
            .into_iter()
            .next()
            .map(|r| r.path.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Resource(
                    "no Java runtime found; install one or set java_path on the server".into(),
                )
            })
    }
}

/// Finds the server JAR in a working directory: well-known names first, then
/// the largest `.jar` at the top level (server JARs dwarf library JARs).
pub fn find_server_jar(dir: &Path) -> Option<String> {
    const WELL_KNOWN: &[&str] = &[
        "server.jar",
        "paper.jar",
        "purpur.jar",
        "spigot.jar",
        "fabric-server-launch.jar",
        "forge.jar",
        "minecraft_server.jar",
    ];
    for name in WELL_KNOWN {
        if dir.join(name).is_file() {
            return Some((*name).to_string());
        }
    }

    let mut jars: Vec<(u64, String)> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?.to_string();
            if !name.ends_with(".jar") || !path.is_file() {
                return None;
            }
            let size = entry.metadata().ok()?.len();
            Some((size, name))
        })
        .collect();
    jars.sort_by(|a, b| b.0.cmp(&a.0));
    jars.into_iter().next().map(|(_, name)| name)
}

/// Verifies `eula.txt` exists and accepts the EULA. The file is never
/// created here: acceptance is an explicit operator action.
fn check_eula(dir: &Path) -> Result<()> {
    let path = dir.join("eula.txt");
    let text = std::fs::read_to_string(&path).map_err(|_| Error::EulaMissing { path: path.clone() })?;
    let accepted = text.lines().any(|line| {
        let line = line.trim();
        !line.starts_with('#') && line.to_ascii_lowercase().replace(' ', "") == "eula=true"
    });
    if accepted {
        Ok(())
    } else {
        Err(Error::EulaMissing { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eula_accepts_only_explicit_true() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            check_eula(dir.path()),
            Err(Error::EulaMissing { .. })
        ));

        std::fs::write(dir.path().join("eula.txt"), "#comment\neula=false\n").unwrap();
        assert!(check_eula(dir.path()).is_err());

        std::fs::write(dir.path().join("eula.txt"), "# accepted\neula=true\n").unwrap();
        assert!(check_eula(dir.path()).is_ok());

        std::fs::write(dir.path().join("eula.txt"), "EULA = TRUE\n").unwrap();
        assert!(check_eula(dir.path()).is_ok());
    }

    #[test]
    fn jar_lookup_prefers_well_known_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big-library.jar"), vec![0u8; 4096]).unwrap();
        std::fs::write(dir.path().join("server.jar"), vec![0u8; 16]).unwrap();
        assert_eq!(find_server_jar(dir.path()).as_deref(), Some("server.jar"));
    }

    #[test]
    fn jar_lookup_falls_back_to_largest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.jar"), vec![0u8; 16]).unwrap();
        std::fs::write(dir.path().join("large.jar"), vec![0u8; 4096]).unwrap();
        std::fs::write(dir.path().join("readme.txt"), "not a jar").unwrap();
        assert_eq!(find_server_jar(dir.path()).as_deref(), Some("large.jar"));
    }

    #[test]
    fn jar_lookup_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_server_jar(dir.path()), None);
    }
}
