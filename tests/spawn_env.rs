//! Spawn contract: the child inherits the supervisor's full environment.

#![cfg(unix)]

mod common;

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::AsyncReadExt;

#[tokio::test]
async fn child_env_is_a_superset_of_the_supervisor_env() {
    let harness = common::harness().await;
    let dir = tempfile::tempdir().unwrap();

    // A marker the child could only see through inheritance.
    std::env::set_var("CRAFTVISOR_TEST_MARKER", "inherited-42");

    let argv = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "printf '%s|%s' \"$CRAFTVISOR_TEST_MARKER\" \"$PATH\"".to_string(),
    ];
    // An empty overlay must not strip anything.
    let mut spawned = harness
        .platform
        .spawn(dir.path(), &argv, &HashMap::new())
        .unwrap();

    let mut output = String::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        spawned.stdout.read_to_string(&mut output),
    )
    .await
    .expect("child produced no output in time")
    .unwrap();
    let _ = spawned.child.wait().await;

    let (marker, path) = output.split_once('|').expect("marker|path output");
    assert_eq!(marker, "inherited-42");
    assert!(!path.is_empty(), "PATH must survive an empty overlay");
}

#[tokio::test]
async fn overlay_adds_without_replacing() {
    let harness = common::harness().await;
    let dir = tempfile::tempdir().unwrap();

    let mut overlay = HashMap::new();
    overlay.insert("CRAFTVISOR_OVERLAY".to_string(), "extra".to_string());

    let argv = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "printf '%s|%s' \"$CRAFTVISOR_OVERLAY\" \"$HOME\"".to_string(),
    ];
    let mut spawned = harness.platform.spawn(dir.path(), &argv, &overlay).unwrap();

    let mut output = String::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        spawned.stdout.read_to_string(&mut output),
    )
    .await
    .expect("child produced no output in time")
    .unwrap();
    let _ = spawned.child.wait().await;

    let (overlayed, home) = output.split_once('|').expect("overlay|home output");
    assert_eq!(overlayed, "extra");
    assert!(!home.is_empty(), "inherited variables must survive an overlay");
}
