//! # Java runtime download (Eclipse Temurin via the Adoptium API).
//!
//! Fetches the latest JDK build for a major version, verifies the published
//! SHA-256, unpacks the tar.gz archive under the supervisor's `runtimes/`
//! directory, and proves the installation works by running `-version`.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::platform::{probe_runtime, JavaRuntime};

use super::{download, ArtifactDigest};

const ADOPTIUM_API: &str = "https://api.adoptium.net/v3";

/// Downloads and installs a Temurin JDK, returning the probed runtime.
pub async fn install_runtime(
    client: &reqwest::Client,
    major: u32,
    runtimes_dir: &Path,
) -> Result<JavaRuntime> {
    let (os, arch) = adoptium_target()?;
    let assets: Value = client
        .get(format!("{ADOPTIUM_API}/assets/latest/{major}/hotspot"))
        .query(&[("architecture", arch), ("os", os), ("image_type", "jdk")])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let package = assets
        .as_array()
        .and_then(|a| a.first())
        .map(|asset| &asset["binary"]["package"])
        .ok_or_else(|| {
            Error::validation(
                "version",
                format!("no Java {major} build published for {os}/{arch}"),
            )
        })?;

    let link = package["link"]
        .as_str()
        .ok_or_else(|| Error::Resource("adoptium response missing download link".into()))?;
    let name = package["name"]
        .as_str()
        .ok_or_else(|| Error::Resource("adoptium response missing package name".into()))?;
    let checksum = package["checksum"]
        .as_str()
        .ok_or_else(|| Error::Resource("adoptium response missing checksum".into()))?
        .to_string();

    if !name.ends_with(".tar.gz") && !name.ends_with(".tgz") {
        return Err(Error::Unsupported(format!(
            "runtime archive format of {name}; unpack it manually into {}",
            runtimes_dir.display()
        )));
    }

    std::fs::create_dir_all(runtimes_dir)?;
    let archive = runtimes_dir.join(name);
    info!(major, archive = %archive.display(), "downloading Java runtime");
    download(client, link, &archive, Some(&ArtifactDigest::Sha256(checksum))).await?;

    let extracted = extract_tar_gz(&archive, runtimes_dir)?;
    tokio::fs::remove_file(&archive).await?;

    let java = extracted.join("bin").join(if cfg!(windows) {
        "java.exe"
    } else {
        "java"
    });
    probe_runtime(&java)
        .await
        .ok_or_else(|| Error::Resource("installed runtime failed its -version probe".into()))
}

/// Unpacks the archive and returns the top-level directory it created.
fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let file = std::fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    let mut top_level: Option<PathBuf> = None;
    for entry in tar.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(Error::Io)?;
        let path = entry.path().map_err(Error::Io)?.into_owned();
        if top_level.is_none() {
            if let Some(first) = path.components().next() {
                top_level = Some(dest.join(first.as_os_str()));
            }
        }
        entry.unpack_in(dest).map_err(Error::Io)?;
    }

    top_level.ok_or_else(|| Error::Resource("runtime archive was empty".into()))
}

fn adoptium_target() -> Result<(&'static str, &'static str)> {
    let os = if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else if cfg!(windows) {
        "windows"
    } else {
        return Err(Error::Unsupported("runtime download on this OS".into()));
    };
    let arch = if cfg!(target_arch = "x86_64") {
        "x64"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else {
        return Err(Error::Unsupported("runtime download on this CPU".into()));
    };
    Ok((os, arch))
}
