//! Digest enforcement on downloads: a wrong hash must leave no trace.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use craftvisor::error::Error;
use craftvisor::fetch::{download, http_client, ArtifactDigest};

/// Serves `body` to every connection on a loopback port until dropped.
async fn spawn_http_server(body: &'static [u8]) -> String {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // Drain the request head before answering.
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}/artifact.jar")
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest;
    hex::encode(sha2::Sha256::digest(data))
}

fn assert_no_artifacts(target: &Path) {
    assert!(!target.exists(), "target must not exist after failure");
    let part = target.with_file_name("server.jar.part");
    assert!(!part.exists(), ".part must be cleaned up");
}

#[tokio::test]
async fn wrong_sha256_never_lands_and_part_is_removed() {
    let url = spawn_http_server(b"these are not the bytes you expect").await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("server.jar");

    let err = download(
        &http_client(),
        &url,
        &target,
        Some(&ArtifactDigest::Sha256("ab".repeat(32))),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::DigestMismatch { .. }), "got {err:?}");
    assert_no_artifacts(&target);
}

#[tokio::test]
async fn correct_sha256_lands_atomically() {
    let body: &'static [u8] = b"jar bytes of a perfectly fine artifact";
    let url = spawn_http_server(body).await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("server.jar");

    let size = download(
        &http_client(),
        &url,
        &target,
        Some(&ArtifactDigest::Sha256(sha256_hex(body))),
    )
    .await
    .unwrap();

    assert_eq!(size, body.len() as u64);
    assert_eq!(std::fs::read(&target).unwrap(), body);
    assert!(
        !target.with_file_name("server.jar.part").exists(),
        "no .part may remain after success"
    );
}

#[tokio::test]
async fn sha512_is_verified_too() {
    use sha2::Digest;

    let body: &'static [u8] = b"plugin bytes";
    let url = spawn_http_server(body).await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("plugin.jar");

    let good = hex::encode(sha2::Sha512::digest(body));
    download(
        &http_client(),
        &url,
        &target,
        Some(&ArtifactDigest::Sha512(good)),
    )
    .await
    .unwrap();
    assert!(target.is_file());

    let target_bad = dir.path().join("plugin2.jar");
    let err = download(
        &http_client(),
        &url,
        &target_bad,
        Some(&ArtifactDigest::Sha512("cd".repeat(64))),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::DigestMismatch { .. }));
    assert!(!target_bad.exists());
}
