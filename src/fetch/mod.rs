//! # External fetchers: download, verify, rename.
//!
//! Every fetcher follows one template:
//!
//! ```text
//! GET url ──► <target>.part ──► fsync ──► digest check ──► rename <target>
//!                                  │
//!                                  └─ mismatch: delete .part, hard failure
//! ```
//!
//! HTTP failures retry with exponential backoff (base 1 s, factor 2, max 5
//! attempts, ±20 % jitter). Each attempt is bounded to 60 s and the whole
//! operation to 10 minutes. Digest mismatches are **never** retried: a
//! registry serving wrong bytes will serve them again.
//!
//! ## Files & responsibilities
//! - **mod.rs**: shared [`download`] template, [`RetryPolicy`], digests.
//! - **jars.rs**: server JAR registries (Paper, Mojang, Fabric, Purpur).
//! - **java.rs**: Adoptium runtime download and extraction.
//! - **plugins.rs**: Modrinth / Hangar / direct-URL plugin artifacts.

mod jars;
mod java;
mod plugins;

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use sha2::{Digest as _, Sha256, Sha512};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use jars::install_distribution;
pub use java::install_runtime;
pub use plugins::{fetch_plugin, PluginArtifact, PluginRequest};

/// Per-attempt request bound.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
/// Whole-operation bound across all retries.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Shared HTTP client with the per-attempt timeout baked in.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(ATTEMPT_TIMEOUT)
        .user_agent(concat!("craftvisor/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("reqwest client construction cannot fail with static options")
}

/// Retry backoff for transient HTTP failures.
///
/// Delays grow as `first * factor^n`, each sample jittered by ±`jitter`
/// to spread simultaneous retries apart.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub first: Duration,
    pub factor: f64,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// Base 1 s, factor 2, 5 attempts, ±20 % jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            factor: 2.0,
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `failed_attempts` (1-based).
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let base = self
            .first
            .mul_f64(self.factor.powi(failed_attempts.saturating_sub(1) as i32));
        self.apply_jitter(base)
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::rng().random_range(1.0 - spread..=1.0 + spread);
        base.mul_f64(factor)
    }
}

/// Published digest of an artifact, hex-encoded.
#[derive(Debug, Clone)]
pub enum ArtifactDigest {
    Sha256(String),
    Sha512(String),
}

enum RunningDigest {
    None,
    Sha256(Sha256, String),
    Sha512(Sha512, String),
}

impl RunningDigest {
    fn new(expected: Option<&ArtifactDigest>) -> Self {
        match expected {
            None => RunningDigest::None,
            Some(ArtifactDigest::Sha256(hex)) => {
                RunningDigest::Sha256(Sha256::new(), hex.to_ascii_lowercase())
            }
            Some(ArtifactDigest::Sha512(hex)) => {
                RunningDigest::Sha512(Sha512::new(), hex.to_ascii_lowercase())
            }
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            RunningDigest::None => {}
            RunningDigest::Sha256(hasher, _) => hasher.update(chunk),
            RunningDigest::Sha512(hasher, _) => hasher.update(chunk),
        }
    }

    /// Returns the integrity error on mismatch.
    fn verify(self) -> Result<()> {
        let (actual, expected) = match self {
            RunningDigest::None => return Ok(()),
            RunningDigest::Sha256(hasher, expected) => (hex::encode(hasher.finalize()), expected),
            RunningDigest::Sha512(hasher, expected) => (hex::encode(hasher.finalize()), expected),
        };
        if actual == expected {
            Ok(())
        } else {
            Err(Error::DigestMismatch { expected, actual })
        }
    }
}

/// Downloads `url` into `target` atomically, verifying `digest` when the
/// registry published one. Returns the byte count.
pub async fn download(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
    digest: Option<&ArtifactDigest>,
) -> Result<u64> {
    tokio::time::timeout(OPERATION_TIMEOUT, download_with_retries(client, url, target, digest))
        .await
        .map_err(|_| Error::Download {
            url: url.to_string(),
            reason: "operation deadline (10 min) exceeded".into(),
        })?
}

async fn download_with_retries(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
    digest: Option<&ArtifactDigest>,
) -> Result<u64> {
    let policy = RetryPolicy::default();
    let mut failures = 0u32;
    loop {
        match download_once(client, url, target, digest).await {
            Ok(size) => return Ok(size),
            // Integrity failures are terminal; the partial file is gone.
            Err(e @ Error::DigestMismatch { .. }) => return Err(e),
            // 4xx answers will not change on retry.
            Err(err) if is_client_error(&err) => {
                return Err(Error::Download {
                    url: url.to_string(),
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                failures += 1;
                if failures >= policy.max_attempts {
                    return Err(Error::Download {
                        url: url.to_string(),
                        reason: format!("{err} (after {failures} attempts)"),
                    });
                }
                let delay = policy.delay_after(failures);
                warn!(url, attempt = failures, delay_ms = delay.as_millis() as u64,
                      error = %err, "download attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One attempt: stream to `<target>.part`, fsync, verify, rename.
async fn download_once(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
    digest: Option<&ArtifactDigest>,
) -> Result<u64> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(target);

    let outcome = stream_to_part(client, url, &part, digest).await;
    match outcome {
        Ok(size) => {
            tokio::fs::rename(&part, target).await?;
            info!(url, target = %target.display(), size, "download complete");
            Ok(size)
        }
        Err(err) => {
            // Never leave a partial artifact behind.
            let _ = tokio::fs::remove_file(&part).await;
            Err(err)
        }
    }
}

async fn stream_to_part(
    client: &reqwest::Client,
    url: &str,
    part: &Path,
    digest: Option<&ArtifactDigest>,
) -> Result<u64> {
    debug!(url, "starting download attempt");
    let response = client.get(url).send().await?.error_for_status()?;

    let mut file = tokio::fs::File::create(part).await?;
    let mut hasher = RunningDigest::new(digest);
    let mut size: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    hasher.verify()?;
    Ok(size)
}

fn is_client_error(err: &Error) -> bool {
    matches!(err, Error::Http(e)
        if e.status().map(|s| s.is_client_error()).unwrap_or(false))
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());
    name.push_str(".part");
    target.with_file_name(name)
}
