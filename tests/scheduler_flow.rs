//! Scheduler dispatch: due schedules fire once and next_run stays ahead.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use craftvisor::backup::BackupManager;
use craftvisor::sched::Scheduler;
use craftvisor::store::ScheduleAction;

async fn scheduler_for(harness: &common::Harness) -> Arc<Scheduler> {
    let backups = BackupManager::new(
        &harness.cfg,
        Arc::clone(&harness.store),
        Arc::clone(&harness.supervisor),
    );
    Scheduler::new(
        Arc::clone(&harness.store),
        Arc::clone(&harness.supervisor),
        backups,
    )
}

#[tokio::test]
async fn created_schedule_has_a_future_next_run() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;
    let scheduler = scheduler_for(&harness).await;

    let before = Utc::now();
    let schedule = scheduler
        .create(server.id, ScheduleAction::Backup, "*/1 * * * *", None, true)
        .await
        .unwrap();

    let next = schedule.next_run.expect("enabled schedule needs next_run");
    assert!(next > before, "next_run must be strictly in the future");

    // A disabled schedule carries no next_run.
    let disabled = scheduler
        .create(server.id, ScheduleAction::Stop, "0 4 * * *", None, false)
        .await
        .unwrap();
    assert_eq!(disabled.next_run, None);
}

#[tokio::test]
async fn command_schedules_require_a_payload() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;
    let scheduler = scheduler_for(&harness).await;

    let err = scheduler
        .create(server.id, ScheduleAction::Command, "* * * * *", None, true)
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "validation");

    scheduler
        .create(
            server.id,
            ScheduleAction::Command,
            "* * * * *",
            Some("save-all".into()),
            true,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn bad_cron_is_rejected() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;
    let scheduler = scheduler_for(&harness).await;

    for cron in ["* * * *", "61 * * * *", "nope"] {
        let err = scheduler
            .create(server.id, ScheduleAction::Restart, cron, None, true)
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "validation", "cron {cron:?} must be rejected");
    }
}

#[tokio::test]
async fn due_schedule_fires_and_advances_monotonically() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;
    let scheduler = scheduler_for(&harness).await;

    // A stop action on a stopped server completes as AlreadyStopped without
    // touching any process.
    let schedule = scheduler
        .create(server.id, ScheduleAction::Stop, "* * * * *", None, true)
        .await
        .unwrap();

    // Backdate next_run so the dispatcher sees it as due immediately.
    harness
        .store
        .with_scope(|scope| {
            let mut record = scope.find_schedule(schedule.id)?.unwrap();
            record.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
            scope.update_schedule(&record)
        })
        .unwrap();

    let fired = scheduler.fire_due().unwrap();
    assert_eq!(fired, 1, "exactly one schedule was due");

    // last_run and next_run were advanced inside the firing scope, before
    // the action itself ran.
    let record = scheduler.get(schedule.id).await.unwrap();
    let last_run = record.last_run.expect("fire must stamp last_run");
    let next_run = record.next_run.expect("fire must recompute next_run");
    assert!(
        next_run > last_run,
        "next_run {next_run} must be strictly after last_run {last_run}"
    );

    // Give the dispatched action a moment to finish cleanly.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Nothing else is due now.
    assert_eq!(scheduler.fire_due().unwrap(), 0);
}
