//! Deletion guards: running servers and path traversal.

#![cfg(unix)]

mod common;

use craftvisor::error::Error;
use craftvisor::store::{Distribution, NewServer};

#[tokio::test]
async fn delete_refuses_while_running() {
    let harness = common::harness().await;

    // A row pointing at the test process itself models "running and the OS
    // confirms" without spawning anything.
    let record = harness
        .store
        .with_scope(|scope| {
            let record = scope.insert_server(&NewServer {
                name: "busy".into(),
                distribution: Distribution::Vanilla,
                version: "1.20.4".into(),
                path: harness.cfg.data_root.join("servers/busy"),
                port: 25565,
                memory: "1G".into(),
                java_path: None,
                jvm_args: None,
            })?;
            scope.mark_server_running(record.id, std::process::id())?;
            Ok(record)
        })
        .unwrap();

    let err = harness.supervisor.delete(record.id, false).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning { .. }), "got {err:?}");

    // The record survives the refusal.
    assert!(harness.supervisor.get(record.id).await.is_ok());
}

#[tokio::test]
async fn delete_refuses_symlink_escape_and_touches_nothing() {
    let harness = common::harness().await;

    // A victim directory outside the data root, reached via a symlink that
    // sits inside the servers root.
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("precious.txt"), "do not delete").unwrap();

    let servers_root = harness.cfg.data_root.join("servers");
    std::fs::create_dir_all(&servers_root).unwrap();
    let link = servers_root.join("sneaky");
    std::os::unix::fs::symlink(outside.path(), &link).unwrap();

    let record = harness
        .store
        .with_scope(|scope| {
            scope.insert_server(&NewServer {
                name: "sneaky".into(),
                distribution: Distribution::Vanilla,
                version: "1.20.4".into(),
                path: link.clone(),
                port: 25566,
                memory: "1G".into(),
                java_path: None,
                jvm_args: None,
            })
        })
        .unwrap();

    let err = harness.supervisor.delete(record.id, false).await.unwrap_err();
    assert!(matches!(err, Error::Security(_)), "got {err:?}");

    // Nothing was removed: not the victim, not the link, not the record.
    assert!(outside.path().join("precious.txt").exists());
    assert!(link.exists());
    assert!(harness.supervisor.get(record.id).await.is_ok());
}

#[tokio::test]
async fn delete_with_keep_files_leaves_the_directory() {
    let harness = common::harness().await;
    let record = common::provision_server(&harness, "keepme").await;

    harness.supervisor.delete(record.id, true).await.unwrap();
    assert!(record.path.exists(), "keep_files must leave the directory");
    assert!(harness.supervisor.get(record.id).await.is_err());
}

#[tokio::test]
async fn delete_removes_a_proper_descendant_directory() {
    let harness = common::harness().await;
    let record = common::provision_server(&harness, "gone").await;

    if harness.platform.is_elevated() {
        // The elevation guard forbids file removal outright; that refusal
        // has its own test below.
        let err = harness.supervisor.delete(record.id, false).await.unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        assert!(record.path.exists());
        return;
    }

    harness.supervisor.delete(record.id, false).await.unwrap();
    assert!(!record.path.exists());
}

#[tokio::test]
async fn elevated_supervisor_never_removes_files() {
    let harness = common::harness().await;
    if !harness.platform.is_elevated() {
        return;
    }
    let record = common::provision_server(&harness, "rooted").await;

    let err = harness.supervisor.delete(record.id, false).await.unwrap_err();
    assert!(matches!(err, Error::Security(_)), "got {err:?}");
    assert!(record.path.exists(), "no file may be removed while elevated");
}
