//! # Reconciler: the OS process table is the source of truth.
//!
//! One periodic task heals the database when it disagrees with reality:
//!
//! - A row marked running whose pid is dead (or no longer a Java process)
//!   gets the full exit-callback chain with an unknown exit code.
//! - A live registered child whose row says stopped is **not** auto-stopped;
//!   the inconsistency is logged for the operator to resolve.
//! - The dead-console sweep frees rings of long-gone children.
//!
//! Children with a live exit watcher are skipped here: their watcher already
//! owns the exit transition, and reaping them twice would double-fire hooks.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::console::ConsoleFabric;
use crate::error::Result;
use crate::platform::Platform;
use crate::store::Store;

/// Periodic OS-vs-database state synchronizer.
pub struct Reconciler {
    store: Arc<Store>,
    platform: Arc<dyn Platform>,
    fabric: Arc<ConsoleFabric>,
    interval: Duration,
    sweep_interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        platform: Arc<dyn Platform>,
        fabric: Arc<ConsoleFabric>,
        interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            platform,
            fabric,
            interval,
            sweep_interval,
        }
    }

    /// Runs the reconcile loop until cancelled. The first pass fires
    /// immediately so stale state from a previous supervisor run is healed
    /// at startup.
    pub async fn run(self, cancel: CancellationToken) {
        if self.platform.is_elevated() {
            warn!(
                "supervisor is running as root/Administrator; service installation and \
                 file deletion are disabled, and running game servers this way is discouraged"
            );
        }

        let mut reconcile_tick = tokio::time::interval(self.interval);
        reconcile_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(self.sweep_interval);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = reconcile_tick.tick() => {
                    if let Err(err) = self.pass().await {
                        warn!(error = %err, "reconcile pass failed");
                    }
                }
                _ = sweep_tick.tick() => {
                    let swept = self.fabric.sweep_dead().await;
                    if swept > 0 {
                        debug!(swept, "freed dead console entries");
                    }
                }
            }
        }
        info!("reconciler stopped");
    }

    /// One reconcile pass. Also used directly by tests and by startup.
    pub async fn pass(&self) -> Result<()> {
        let marked_running = self
            .store
            .with_scope(|scope| scope.servers_marked_running())?;
        let registered = self.fabric.snapshot_children().await;

        for server in marked_running {
            // A child with a live watcher owns its own exit transition.
            let watched = registered
                .iter()
                .any(|(id, _, exited)| *id == server.id && !exited);
            if watched {
                continue;
            }

            let alive = server
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

            if !alive {
                warn!(
                    server = %server.name,
                    pid = ?server.pid,
                    "row says running but the process is gone; applying exit chain"
                );
                self.fabric.fire_exit(server.id, None).await;
            }
        }

        // The inverse disagreement is only reported, never auto-resolved.
        for (server_id, pid, exited) in registered {
            if exited {
                continue;
            }
            let row_running = self
                .store
                .with_scope(|scope| scope.find_server_by_id(server_id))?
                .map(|s| s.running)
                .unwrap_or(false);
            if !row_running && self.platform.is_alive(pid) {
                warn!(
                    server_id,
                    pid,
                    "registered child is alive but its row says stopped; leaving for the operator"
                );
            }
        }

        Ok(())
    }
}
