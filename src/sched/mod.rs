//! # Cron-driven task scheduler.
//!
//! Durable schedules live in the store; one dispatch task sleeps until the
//! earliest `next_run` and fires everything due.
//!
//! ```text
//! Scheduler::run()
//!   loop {
//!     earliest = min(next_run of enabled schedules)
//!     sleep_until(earliest)  ──  woken early on schedule mutation
//!     for each due schedule (one scope):
//!       re-read, confirm enabled
//!       persist next_run = first-fire-after(now), last_run = now
//!     dispatch actions OUTSIDE the scope
//!   }
//! ```
//!
//! ## Rules
//! - `next_run` is advanced **before** the action runs: a long action never
//!   delays the following tick computation, and missed fires are not
//!   replayed (fire-once-per-tick, no catch-up).
//! - At most one in-flight action per `(server, action)` pair; a second
//!   fire while the first is still running is dropped with a log entry.
//! - Action failures are logged and never propagate; the schedule lives on.

mod cron;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::BackupManager;
use crate::error::{Error, Result};
use crate::lifecycle::Supervisor;
use crate::store::{BackupKind, ScheduleAction, ScheduleRecord, Store};

pub use cron::CronExpr;

/// Fields accepted when updating a schedule.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub cron: Option<String>,
    pub enabled: Option<bool>,
    pub payload: Option<String>,
}

/// Durable cron scheduler dispatching into the lifecycle engine.
pub struct Scheduler {
    store: Arc<Store>,
    supervisor: Arc<Supervisor>,
    backups: Arc<BackupManager>,
    /// Wakes the dispatch loop when schedules change.
    changed: Notify,
    /// Guard against overlapping runs of the same `(server, action)`.
    in_flight: DashMap<(i64, ScheduleAction), ()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<Supervisor>,
        backups: Arc<BackupManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            supervisor,
            backups,
            changed: Notify::new(),
            in_flight: DashMap::new(),
        })
    }

    // ---------------------------
    // Schedule CRUD
    // ---------------------------

    /// Creates a schedule after validating the cron expression, the payload
    /// requirement, and the server reference.
    pub async fn create(
        &self,
        server_id: i64,
        action: ScheduleAction,
        cron: &str,
        payload: Option<String>,
        enabled: bool,
    ) -> Result<ScheduleRecord> {
        let expr = CronExpr::parse(cron)?;
        if action == ScheduleAction::Command && payload.as_deref().unwrap_or("").is_empty() {
            return Err(Error::validation(
                "payload",
                "command schedules require a payload",
            ));
        }

        let next_run = enabled.then(|| expr.next_after(Utc::now())).flatten();
        let record = self.store.with_scope(|scope| {
            if scope.find_server_by_id(server_id)?.is_none() {
                return Err(Error::not_found("server", server_id));
            }
            scope.insert_schedule(server_id, action, cron, payload.as_deref(), enabled, next_run)
        })?;

        self.changed.notify_one();
        Ok(record)
    }

    /// Applies a partial update and recomputes `next_run`.
    pub async fn update(&self, schedule_id: i64, update: ScheduleUpdate) -> Result<ScheduleRecord> {
        if let Some(cron) = &update.cron {
            CronExpr::parse(cron)?;
        }

        let record = self.store.with_scope(|scope| {
            let mut record = scope
                .find_schedule(schedule_id)?
                .ok_or_else(|| Error::not_found("schedule", schedule_id))?;

            if let Some(cron) = &update.cron {
                record.cron = cron.clone();
            }
            if let Some(enabled) = update.enabled {
                record.enabled = enabled;
            }
            if let Some(payload) = &update.payload {
                record.payload = (!payload.is_empty()).then(|| payload.clone());
            }
            if record.action == ScheduleAction::Command && record.payload.is_none() {
                return Err(Error::validation(
                    "payload",
                    "command schedules require a payload",
                ));
            }

            record.next_run = if record.enabled {
                // The expression was validated above or at creation.
                CronExpr::parse(&record.cron)?.next_after(Utc::now())
            } else {
                None
            };
            scope.update_schedule(&record)?;
            Ok(record)
        })?;

        self.changed.notify_one();
        Ok(record)
    }

    pub async fn delete(&self, schedule_id: i64) -> Result<()> {
        self.store
            .with_scope(|scope| scope.delete_schedule(schedule_id))?;
        self.changed.notify_one();
        Ok(())
    }

    pub async fn get(&self, schedule_id: i64) -> Result<ScheduleRecord> {
        self.store
            .with_scope(|scope| scope.find_schedule(schedule_id))?
            .ok_or_else(|| Error::not_found("schedule", schedule_id))
    }

    pub async fn list(&self, server_id: Option<i64>) -> Result<Vec<ScheduleRecord>> {
        self.store.with_scope(|scope| scope.list_schedules(server_id))
    }

    // ---------------------------
    // Dispatch loop
    // ---------------------------

    /// Runs the dispatch loop until cancelled. Call once at startup.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(err) = self.recompute_all() {
            error!(error = %err, "scheduler failed to prime next_run values");
        }

        loop {
            let sleep = self.sleep_until_earliest();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.changed.notified() => continue,
                _ = sleep => {}
            }

            if let Err(err) = self.fire_due() {
                error!(error = %err, "scheduler pass failed");
            }
        }
        info!("scheduler stopped");
    }

    /// Evaluates everything due now and dispatches it, returning how many
    /// schedules fired. The dispatch loop calls this on every wake-up.
    pub fn fire_due(self: &Arc<Self>) -> Result<usize> {
        let due = self.collect_due()?;
        let fired = due.len();
        for schedule in due {
            self.dispatch(schedule);
        }
        Ok(fired)
    }

    /// Startup pass: `next_run = first-fire-after(now)` for every enabled
    /// schedule.
    fn recompute_all(&self) -> Result<()> {
        self.store.with_scope(|scope| {
            let now = Utc::now();
            for mut schedule in scope.enabled_schedules()? {
                match CronExpr::parse(&schedule.cron) {
                    Ok(expr) => {
                        schedule.next_run = expr.next_after(now);
                        scope.update_schedule(&schedule)?;
                    }
                    Err(err) => {
                        warn!(schedule = schedule.id, error = %err,
                              "stored cron no longer parses; disabling");
                        schedule.enabled = false;
                        schedule.next_run = None;
                        scope.update_schedule(&schedule)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Future resolving at the earliest enabled `next_run` (far future when
    /// nothing is scheduled).
    async fn sleep_until_earliest(&self) {
        let earliest = self
            .store
            .with_scope(|scope| {
                Ok(scope
                    .enabled_schedules()?
                    .into_iter()
                    .filter_map(|s| s.next_run)
                    .min())
            })
            .ok()
            .flatten();

        match earliest {
            Some(at) => {
                let wait = (at - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait).await;
            }
            None => {
                // Nothing scheduled; the Notify wakes us on mutation.
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
        }
    }

    /// One scope: confirm, advance `next_run`, stamp `last_run`, return the
    /// snapshots to dispatch.
    fn collect_due(&self) -> Result<Vec<ScheduleRecord>> {
        self.store.with_scope(|scope| {
            let now = Utc::now();
            let mut due = Vec::new();
            for mut schedule in scope.enabled_schedules()? {
                let is_due = schedule.next_run.map(|at| at <= now).unwrap_or(false);
                if !is_due {
                    continue;
                }
                let expr = match CronExpr::parse(&schedule.cron) {
                    Ok(expr) => expr,
                    Err(err) => {
                        warn!(schedule = schedule.id, error = %err, "skipping unparseable cron");
                        continue;
                    }
                };
                schedule.last_run = Some(now);
                schedule.next_run = expr.next_after(now);
                scope.update_schedule(&schedule)?;
                due.push(schedule);
            }
            Ok(due)
        })
    }

    /// Spawns the action outside any scope, guarded per `(server, action)`.
    fn dispatch(self: &Arc<Self>, schedule: ScheduleRecord) {
        let key = (schedule.server_id, schedule.action);
        if self.in_flight.insert(key, ()).is_some() {
            warn!(
                schedule = schedule.id,
                server = schedule.server_id,
                action = schedule.action.as_str(),
                "previous run still in flight, dropping this fire"
            );
            return;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                schedule = schedule.id,
                server = schedule.server_id,
                action = schedule.action.as_str(),
                "executing scheduled action"
            );
            let result = scheduler.execute(&schedule).await;
            scheduler.in_flight.remove(&key);
            match result {
                Ok(()) => info!(schedule = schedule.id, "scheduled action completed"),
                Err(err) => {
                    error!(schedule = schedule.id, error = %err, "scheduled action failed")
                }
            }
        });
    }

    async fn execute(&self, schedule: &ScheduleRecord) -> Result<()> {
        match schedule.action {
            ScheduleAction::Start => {
                self.supervisor.start(schedule.server_id).await?;
            }
            ScheduleAction::Stop => {
                self.supervisor.stop(schedule.server_id).await?;
            }
            ScheduleAction::Restart => {
                self.supervisor.restart(schedule.server_id).await?;
            }
            ScheduleAction::Backup => {
                self.backups
                    .create(schedule.server_id, BackupKind::Scheduled, false)
                    .await?;
            }
            ScheduleAction::Command => {
                let command = command_from_payload(schedule.payload.as_deref())?;
                self.supervisor
                    .send_command(schedule.server_id, &command)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Extracts the command from a payload: either raw text or a JSON object
/// with a `command` key.
fn command_from_payload(payload: Option<&str>) -> Result<String> {
    let payload = payload
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::validation("payload", "command schedules require a payload"))?;
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if let Some(command) = value.get("command").and_then(|c| c.as_str()) {
            return Ok(command.to_string());
        }
    }
    Ok(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_accepts_raw_and_json() {
        assert_eq!(command_from_payload(Some("say hi")).unwrap(), "say hi");
        assert_eq!(
            command_from_payload(Some(r#"{"command":"save-all"}"#)).unwrap(),
            "save-all"
        );
        assert!(command_from_payload(None).is_err());
        assert!(command_from_payload(Some("")).is_err());
    }
}
