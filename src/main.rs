//! Craftvisor binary: the `serve` daemon plus direct CLI subcommands.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use craftvisor::api::{self, AppState};
use craftvisor::auth::ApiKeys;
use craftvisor::backup::BackupManager;
use craftvisor::config::Config;
use craftvisor::console::ConsoleFabric;
use craftvisor::lifecycle::{CreateSpec, StopOutcome, Supervisor};
use craftvisor::platform;
use craftvisor::plugins::PluginManager;
use craftvisor::reconcile::Reconciler;
use craftvisor::sched::Scheduler;
use craftvisor::services::ServiceManager;
use craftvisor::store::{BackupKind, Distribution, ScheduleAction, Store};

#[derive(Parser)]
#[command(name = "craftvisor", version, about = "Minecraft server supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor daemon (API, reconciler, scheduler).
    Serve,
    /// Create a new server.
    Create {
        name: String,
        #[arg(long, default_value = "paper")]
        distribution: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Import an existing server directory.
    Import {
        name: String,
        path: std::path::PathBuf,
        #[arg(long, default_value = "vanilla")]
        distribution: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// List servers with their reconciled state.
    List,
    /// Start a server by name.
    Start { name: String },
    /// Stop a server by name.
    Stop { name: String },
    /// Restart a server by name.
    Restart { name: String },
    /// Show reconciled status for a server.
    Status { name: String },
    /// Send a console command to a running server.
    Cmd { name: String, command: Vec<String> },
    /// Delete a stopped server.
    Delete {
        name: String,
        #[arg(long)]
        keep_files: bool,
    },
    /// Create a backup of a server.
    Backup {
        name: String,
        #[arg(long)]
        stop_first: bool,
    },
    /// Prune old completed backups, keeping the most recent per server.
    PruneBackups {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 5)]
        keep: usize,
        #[arg(long)]
        keep_days: Option<i64>,
    },
    /// Generate (or remove) a platform service unit for a server.
    Service {
        name: String,
        #[arg(long)]
        remove: bool,
    },
    /// Add a schedule for a server.
    Schedule {
        name: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        cron: String,
        #[arg(long)]
        payload: Option<String>,
    },
    /// List discovered Java runtimes.
    Java,
    /// Issue a new API key.
    IssueKey {
        label: String,
        #[arg(long)]
        permission: Vec<String>,
    },
}

/// Everything a subcommand needs, fully wired.
struct App {
    cfg: Config,
    supervisor: Arc<Supervisor>,
    scheduler: Arc<Scheduler>,
    backups: Arc<BackupManager>,
    plugins: Arc<PluginManager>,
    services: Arc<ServiceManager>,
    keys: Arc<ApiKeys>,
}

async fn build_app() -> anyhow::Result<App> {
    let cfg = Config::load();
    std::fs::create_dir_all(&cfg.data_root)
        .with_context(|| format!("creating data root {}", cfg.data_root.display()))?;

    let store = Arc::new(Store::open(&cfg.database_path()).context("opening database")?);
    let platform = platform::select();
    let fabric = ConsoleFabric::new(cfg.fabric());
    let supervisor = Supervisor::new(cfg.clone(), Arc::clone(&store), platform.clone(), fabric).await;
    let backups = BackupManager::new(&cfg, Arc::clone(&store), Arc::clone(&supervisor));
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&supervisor),
        Arc::clone(&backups),
    );
    let plugins = PluginManager::new(Arc::clone(&store));
    let services = ServiceManager::new(Arc::clone(&store), platform);
    let keys = ApiKeys::new(store);

    Ok(App {
        cfg,
        supervisor,
        scheduler,
        backups,
        plugins,
        services,
        keys,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let app = build_app().await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(app).await,
        Command::Create {
            name,
            distribution,
            version,
            memory,
            port,
        } => {
            let distribution = Distribution::parse(&distribution)
                .with_context(|| format!("unknown distribution '{distribution}'"))?;
            let record = app
                .supervisor
                .create(CreateSpec {
                    name,
                    distribution,
                    version,
                    memory,
                    port,
                })
                .await?;
            println!("created server '{}' (id {})", record.name, record.id);
            Ok(())
        }
        Command::Import {
            name,
            path,
            distribution,
            version,
            memory,
            port,
        } => {
            let distribution = Distribution::parse(&distribution)
                .with_context(|| format!("unknown distribution '{distribution}'"))?;
            let record = app
                .supervisor
                .import(craftvisor::lifecycle::ImportSpec {
                    name,
                    distribution,
                    version,
                    path,
                    memory,
                    port,
                })
                .await?;
            println!("imported server '{}' (id {})", record.name, record.id);
            Ok(())
        }
        Command::List => {
            for server in app.supervisor.list().await? {
                let state = if server.running { "running" } else { "stopped" };
                println!(
                    "{:4}  {:24}  {:8}  {:10}  {:7}  {}",
                    server.id,
                    server.name,
                    server.distribution.as_str(),
                    server.version,
                    state,
                    server.port,
                );
            }
            Ok(())
        }
        Command::Start { name } => {
            let server = app.supervisor.get_by_name(&name).await?;
            let pid = app.supervisor.start(server.id).await?;
            println!("started '{name}' (pid {pid})");
            Ok(())
        }
        Command::Stop { name } => {
            let server = app.supervisor.get_by_name(&name).await?;
            match app.supervisor.stop(server.id).await? {
                StopOutcome::Stopped => println!("stopped '{name}'"),
                StopOutcome::AlreadyStopped => println!("'{name}' was not running"),
            }
            Ok(())
        }
        Command::Restart { name } => {
            let server = app.supervisor.get_by_name(&name).await?;
            let pid = app.supervisor.restart(server.id).await?;
            println!("restarted '{name}' (pid {pid})");
            Ok(())
        }
        Command::Status { name } => {
            let server = app.supervisor.get_by_name(&name).await?;
            let status = app.supervisor.status(server.id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Cmd { name, command } => {
            let server = app.supervisor.get_by_name(&name).await?;
            app.supervisor
                .send_command(server.id, &command.join(" "))
                .await?;
            println!("sent");
            Ok(())
        }
        Command::Delete { name, keep_files } => {
            let server = app.supervisor.get_by_name(&name).await?;
            app.supervisor.delete(server.id, keep_files).await?;
            println!("deleted '{name}'");
            Ok(())
        }
        Command::Backup { name, stop_first } => {
            let server = app.supervisor.get_by_name(&name).await?;
            let record = app
                .backups
                .create(server.id, BackupKind::Manual, stop_first)
                .await?;
            println!("backup written to {}", record.path.display());
            Ok(())
        }
        Command::PruneBackups {
            name,
            keep,
            keep_days,
        } => {
            let server_id = match name {
                Some(name) => Some(app.supervisor.get_by_name(&name).await?.id),
                None => None,
            };
            let pruned = app.backups.prune(server_id, keep, keep_days).await?;
            println!("pruned {pruned} backup(s)");
            Ok(())
        }
        Command::Service { name, remove } => {
            let server = app.supervisor.get_by_name(&name).await?;
            if remove {
                let removed = app.services.remove(&server.name).await?;
                println!(
                    "{}",
                    if removed {
                        "service removed"
                    } else {
                        "no service unit found"
                    }
                );
            } else {
                let info = app.services.install(server.id).await?;
                println!("created {} unit at {}", info.kind, info.service_path.display());
                for (what, command) in info.commands {
                    println!("  {what}: {command}");
                }
            }
            Ok(())
        }
        Command::Schedule {
            name,
            action,
            cron,
            payload,
        } => {
            let server = app.supervisor.get_by_name(&name).await?;
            let action = ScheduleAction::parse(&action)
                .with_context(|| format!("unknown action '{action}'"))?;
            let record = app
                .scheduler
                .create(server.id, action, &cron, payload, true)
                .await?;
            println!(
                "schedule {} created, next run {:?}",
                record.id, record.next_run
            );
            Ok(())
        }
        Command::Java => {
            for runtime in platform::discover_runtimes(&app.cfg.data_root).await {
                println!(
                    "{:3}  {:16}  {}  {}",
                    runtime.major_version,
                    runtime.vendor,
                    runtime.version,
                    runtime.path.display(),
                );
            }
            Ok(())
        }
        Command::IssueKey { label, permission } => {
            let issued = app.keys.issue(&label, &permission)?;
            println!("key issued; store it now, it will not be shown again:");
            println!("{}", issued.token);
            Ok(())
        }
    }
}

/// Daemon mode: reconciler + scheduler + API until a termination signal.
async fn serve(app: App) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let reconciler = Reconciler::new(
        Arc::clone(app.supervisor.store()),
        Arc::clone(app.supervisor.platform()),
        Arc::clone(app.supervisor.fabric()),
        app.cfg.reconcile_interval(),
        app.cfg.sweep_interval(),
    );
    let reconcile_task = tokio::spawn(reconciler.run(cancel.child_token()));
    let scheduler_task = tokio::spawn(Arc::clone(&app.scheduler).run(cancel.child_token()));

    let state = Arc::new(AppState {
        cfg: app.cfg,
        supervisor: app.supervisor,
        scheduler: app.scheduler,
        backups: app.backups,
        plugins: app.plugins,
        services: app.services,
        keys: app.keys,
        started_at: Instant::now(),
    });

    let api_cancel = cancel.child_token();
    let api_task = tokio::spawn(async move { api::serve(state, api_cancel).await });

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");
    cancel.cancel();

    let _ = api_task.await;
    let _ = scheduler_task.await;
    let _ = reconcile_task.await;
    info!("supervisor stopped");
    Ok(())
}

/// Waits for a termination signal (SIGINT/SIGTERM/SIGQUIT on Unix, Ctrl-C
/// elsewhere).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
