//! # Exit-callback chain members.
//!
//! The console fabric invokes these when a managed child terminates:
//!
//! 1. [`PersistStopHook`] (primary): records `{running: false, pid: null,
//!    last_stopped: now}` under one store scope.
//! 2. Fabric notifies subscribers with `server_stopped{exit_code}`.
//! 3. [`CrashRestartHook`]: optional restart-on-crash policy.
//!
//! ## Restart-on-crash rules
//! - Off by default; enabled per server via the `restart_on_crash` flag.
//! - Operator-initiated stops never trigger a restart.
//! - The restart delay starts at 30 s, doubles on each consecutive crash up
//!   to a 10-minute cap, and resets after a clean 10-minute run. A child
//!   that outlived the current threshold restarts immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::console::ExitHook;
use crate::error::Result;
use crate::store::Store;

use super::Supervisor;

/// First chain member: makes the database agree that the child is gone.
pub struct PersistStopHook {
    store: Arc<Store>,
}

impl PersistStopHook {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExitHook for PersistStopHook {
    async fn on_exit(&self, server_id: i64, exit_code: Option<i32>) -> Result<()> {
        info!(server_id, ?exit_code, "persisting stopped state");
        self.store.with_scope(|scope| {
            // The row may already be gone (server deleted mid-exit); that is
            // not a chain failure.
            if scope.find_server_by_id(server_id)?.is_some() {
                scope.mark_server_stopped(server_id, true)?;
            }
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "persist_stop"
    }
}

/// Initial restart delay after a crash.
const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
/// Upper bound for the doubled delay.
const MAX_BACKOFF: Duration = Duration::from_secs(600);
/// A run at least this long resets the backoff.
const CLEAN_RUN: Duration = Duration::from_secs(600);

/// Per-server crash backoff state.
struct CrashState {
    threshold: Duration,
}

/// Last chain member: re-starts crashed servers that opted in.
pub struct CrashRestartHook {
    supervisor: Weak<Supervisor>,
    store: Arc<Store>,
    state: Mutex<HashMap<i64, CrashState>>,
}

impl CrashRestartHook {
    pub fn new(supervisor: Weak<Supervisor>, store: Arc<Store>) -> Self {
        Self {
            supervisor,
            store,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Computes the delay before the restart attempt and advances the
    /// per-server backoff. `uptime` is how long the crashed run lasted.
    fn next_delay(&self, server_id: i64, uptime: Duration) -> Duration {
        let mut state = self.state.lock().expect("crash state lock poisoned");
        let entry = state.entry(server_id).or_insert(CrashState {
            threshold: INITIAL_BACKOFF,
        });

        if uptime >= CLEAN_RUN {
            entry.threshold = INITIAL_BACKOFF;
        }

        let delay = if uptime >= entry.threshold {
            Duration::ZERO
        } else {
            entry.threshold - uptime
        };
        entry.threshold = (entry.threshold * 2).min(MAX_BACKOFF);
        delay
    }
}

#[async_trait]
impl ExitHook for CrashRestartHook {
    async fn on_exit(&self, server_id: i64, exit_code: Option<i32>) -> Result<()> {
        let supervisor = match self.supervisor.upgrade() {
            Some(s) => s,
            None => return Ok(()),
        };

        if supervisor.is_operator_stop(server_id) {
            return Ok(());
        }

        let record = self
            .store
            .with_scope(|scope| scope.find_server_by_id(server_id))?;
        let record = match record {
            Some(r) if r.restart_on_crash => r,
            _ => return Ok(()),
        };

        let uptime = record
            .last_started
            .map(|started| {
                (Utc::now() - started)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            })
            .unwrap_or(Duration::ZERO);

        let delay = self.next_delay(server_id, uptime);
        info!(
            server_id,
            ?exit_code,
            delay_secs = delay.as_secs(),
            "crash detected, scheduling restart"
        );

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(err) = supervisor.start(server_id).await {
                warn!(server_id, error = %err, "crash restart failed");
            }
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "crash_restart"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook() -> CrashRestartHook {
        CrashRestartHook::new(Weak::new(), Arc::new(Store::in_memory().unwrap()))
    }

    #[test]
    fn rapid_crashes_double_the_delay() {
        let hook = hook();
        let instant_crash = Duration::ZERO;

        assert_eq!(hook.next_delay(1, instant_crash), Duration::from_secs(30));
        assert_eq!(hook.next_delay(1, instant_crash), Duration::from_secs(60));
        assert_eq!(hook.next_delay(1, instant_crash), Duration::from_secs(120));
    }

    #[test]
    fn delay_caps_at_ten_minutes() {
        let hook = hook();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = hook.next_delay(1, Duration::ZERO);
        }
        assert_eq!(last, MAX_BACKOFF);
    }

    #[test]
    fn clean_run_resets_backoff() {
        let hook = hook();
        hook.next_delay(1, Duration::ZERO);
        hook.next_delay(1, Duration::ZERO);

        // Outlived the clean-run bar: restart immediately, backoff reset.
        assert_eq!(hook.next_delay(1, CLEAN_RUN), Duration::ZERO);
        // Next rapid crash starts from the initial threshold again (doubled
        // once by the reset call above).
        assert_eq!(hook.next_delay(1, Duration::ZERO), Duration::from_secs(60));
    }

    #[test]
    fn uptime_beyond_threshold_restarts_immediately() {
        let hook = hook();
        assert_eq!(hook.next_delay(7, Duration::from_secs(45)), Duration::ZERO);
    }

    #[test]
    fn servers_track_independent_backoff() {
        let hook = hook();
        assert_eq!(hook.next_delay(1, Duration::ZERO), Duration::from_secs(30));
        assert_eq!(hook.next_delay(2, Duration::ZERO), Duration::from_secs(30));
    }
}
