//! End-to-end lifecycle flows against a real (fake-java) child process.

#![cfg(unix)]

mod common;

use std::time::Duration;

use craftvisor::console::{Frame, Subscription};
use craftvisor::error::Error;
use craftvisor::lifecycle::StopOutcome;

/// Pulls frames from a subscription until one satisfies `pred` or the
/// timeout elapses.
async fn await_frame(
    subscription: &mut Subscription,
    timeout: Duration,
    mut pred: impl FnMut(&Frame) -> bool,
) -> Option<Frame> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, subscription.frames.recv()).await {
            Ok(Some(frame)) if pred(&frame) => return Some(frame),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn import_then_list_shows_one_stopped_server() {
    let harness = common::harness().await;
    common::provision_server(&harness, "alpha").await;

    let servers = harness.supervisor.list().await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].name, "alpha");
    assert!(!servers[0].running);
    assert_eq!(servers[0].pid, None);
}

#[tokio::test]
async fn start_command_echo_and_graceful_stop() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;

    let pid = harness.supervisor.start(server.id).await.unwrap();
    assert!(pid > 0);

    let after_start = harness.supervisor.get(server.id).await.unwrap();
    assert!(after_start.running);
    assert_eq!(after_start.pid, Some(pid));
    assert!(after_start.last_started.is_some());

    // A subscriber sees the echo of an injected command within seconds.
    let mut sub = harness.fabric.subscribe(server.id).await.unwrap();
    harness
        .supervisor
        .send_command(server.id, "say hi")
        .await
        .unwrap();
    let frame = await_frame(&mut sub, Duration::from_secs(5), |f| {
        matches!(f, Frame::Output { data } if data.line.contains("say hi"))
    })
    .await;
    assert!(frame.is_some(), "expected an output frame echoing the command");

    // Graceful stop goes through the console `stop` path.
    let outcome = harness.supervisor.stop(server.id).await.unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);

    let after_stop = harness.supervisor.get(server.id).await.unwrap();
    assert!(!after_stop.running);
    assert_eq!(after_stop.pid, None);
    assert!(after_stop.last_stopped.is_some());
}

#[tokio::test]
async fn stop_is_idempotent_and_preserves_last_stopped() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;

    harness.supervisor.start(server.id).await.unwrap();
    assert_eq!(
        harness.supervisor.stop(server.id).await.unwrap(),
        StopOutcome::Stopped
    );
    let first = harness.supervisor.get(server.id).await.unwrap();
    let stamp = first.last_stopped.expect("stop must stamp last_stopped");

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(
        harness.supervisor.stop(server.id).await.unwrap(),
        StopOutcome::AlreadyStopped
    );
    let second = harness.supervisor.get(server.id).await.unwrap();
    assert_eq!(
        second.last_stopped,
        Some(stamp),
        "an idempotent stop must not move last_stopped"
    );
}

#[tokio::test]
async fn two_subscribers_see_lines_in_the_same_order() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;
    harness.supervisor.start(server.id).await.unwrap();

    let mut sub_a = harness.fabric.subscribe(server.id).await.unwrap();
    let mut sub_b = harness.fabric.subscribe(server.id).await.unwrap();

    for n in 1..=3 {
        harness
            .supervisor
            .send_command(server.id, &format!("line-{n}"))
            .await
            .unwrap();
    }

    for sub in [&mut sub_a, &mut sub_b] {
        // The shim echoes each command back; both subscribers must observe
        // the echoes in submission order.
        for n in 1..=3 {
            let expected = format!("got: line-{n}");
            let frame = await_frame(sub, Duration::from_secs(5), |f| {
                matches!(f, Frame::Output { data } if data.line.contains("got: line-"))
            })
            .await
            .expect("missing echo frame");
            match frame {
                Frame::Output { data } => assert_eq!(data.line, expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    harness.supervisor.stop(server.id).await.unwrap();
}

#[tokio::test]
async fn out_of_band_kill_notifies_and_heals() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;
    let pid = harness.supervisor.start(server.id).await.unwrap();

    harness.platform.signal_force(pid).unwrap();

    // The exit watcher reaps the child and runs the chain; a fresh
    // subscriber then gets history plus the stop notice.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut sub = harness.fabric.subscribe(server.id).await.unwrap();
    let stopped = await_frame(&mut sub, Duration::from_secs(10), |f| {
        matches!(f, Frame::ServerStopped { .. })
    })
    .await;
    assert!(stopped.is_some(), "expected a server_stopped frame");

    // The database row follows within the exit chain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let record = harness.supervisor.get(server.id).await.unwrap();
        if !record.running {
            assert_eq!(record.pid, None);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "row was never healed after the kill"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn second_server_on_same_port_is_refused() {
    let harness = common::harness().await;
    let first = common::provision_server(&harness, "alpha").await;
    let second = common::provision_server(&harness, "beta").await;

    // Put both on the same port.
    harness
        .supervisor
        .update(
            second.id,
            craftvisor::lifecycle::UpdateSpec {
                port: Some(first.port),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    harness.supervisor.start(first.id).await.unwrap();

    // The shim does not actually listen, so occupy the port ourselves to
    // model a real server holding it.
    let _listener = std::net::TcpListener::bind(("127.0.0.1", first.port)).unwrap();

    let err = harness.supervisor.start(second.id).await.unwrap_err();
    assert!(matches!(err, Error::PortInUse { .. }), "got {err:?}");

    let record = harness.supervisor.get(second.id).await.unwrap();
    assert!(!record.running);
    assert_eq!(record.pid, None);

    harness.supervisor.stop(first.id).await.unwrap();
}

#[tokio::test]
async fn start_refuses_without_accepted_eula() {
    let harness = common::harness().await;
    let server = common::provision_server(&harness, "alpha").await;
    std::fs::remove_file(server.path.join("eula.txt")).unwrap();

    let err = harness.supervisor.start(server.id).await.unwrap_err();
    assert!(matches!(err, Error::EulaMissing { .. }), "got {err:?}");

    // Refusal must not create the file behind the operator's back.
    assert!(!server.path.join("eula.txt").exists());
}
