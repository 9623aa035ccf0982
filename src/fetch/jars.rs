//! # Server JAR fetchers.
//!
//! One function per upstream registry, all landing the artifact at
//! `<dir>/server.jar`. Digest verification follows what each registry
//! publishes: Paper ships SHA-256 (verified), Mojang ships SHA-1 and Purpur
//! MD5 (neither is a supported digest, so those downloads are unverified),
//! Fabric ships nothing.

use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::store::Distribution;

use super::{download, ArtifactDigest};

const PAPER_API: &str = "https://api.papermc.io/v2";
const MOJANG_MANIFEST: &str = "https://launchermeta.mojang.com/mc/game/version_manifest.json";
const FABRIC_META: &str = "https://meta.fabricmc.net/v2";
const PURPUR_API: &str = "https://api.purpurmc.org/v2";

/// Name the JAR lands under in every working directory.
const JAR_NAME: &str = "server.jar";

/// Installs the requested distribution's server JAR into `dir`.
pub async fn install_distribution(
    client: &reqwest::Client,
    distribution: Distribution,
    version: &str,
    dir: &Path,
) -> Result<()> {
    match distribution {
        Distribution::Paper => install_paper(client, version, dir).await,
        Distribution::Vanilla => install_vanilla(client, version, dir).await,
        Distribution::Fabric => install_fabric(client, version, dir).await,
        Distribution::Purpur => install_purpur(client, version, dir).await,
        Distribution::Forge => Err(Error::validation(
            "distribution",
            "forge requires its own installer and is not supported",
        )),
    }
}

async fn install_paper(client: &reqwest::Client, version: &str, dir: &Path) -> Result<()> {
    let builds: Value = client
        .get(format!("{PAPER_API}/projects/paper/versions/{version}/builds"))
        .send()
        .await?
        .error_for_status()
        .map_err(|_| unknown_version("paper", version))?
        .json()
        .await?;

    let latest = builds["builds"]
        .as_array()
        .and_then(|b| b.last())
        .ok_or_else(|| unknown_version("paper", version))?;
    let build = latest["build"]
        .as_i64()
        .ok_or_else(|| bad_registry("paper", "missing build number"))?;
    let application = &latest["downloads"]["application"];
    let jar = application["name"]
        .as_str()
        .ok_or_else(|| bad_registry("paper", "missing artifact name"))?;
    let sha256 = application["sha256"]
        .as_str()
        .ok_or_else(|| bad_registry("paper", "missing sha256"))?
        .to_string();

    let url = format!(
        "{PAPER_API}/projects/paper/versions/{version}/builds/{build}/downloads/{jar}"
    );
    info!(version, build, "installing Paper");
    download(
        client,
        &url,
        &dir.join(JAR_NAME),
        Some(&ArtifactDigest::Sha256(sha256)),
    )
    .await?;
    Ok(())
}

async fn install_vanilla(client: &reqwest::Client, version: &str, dir: &Path) -> Result<()> {
    let manifest: Value = client
        .get(MOJANG_MANIFEST)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let entry = manifest["versions"]
        .as_array()
        .and_then(|versions| {
            versions
                .iter()
                .find(|v| v["id"].as_str() == Some(version))
        })
        .ok_or_else(|| unknown_version("vanilla", version))?;
    let detail_url = entry["url"]
        .as_str()
        .ok_or_else(|| bad_registry("mojang", "missing version detail url"))?;

    let detail: Value = client
        .get(detail_url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let server_url = detail["downloads"]["server"]["url"]
        .as_str()
        .ok_or_else(|| unknown_version("vanilla", version))?;

    // Mojang publishes SHA-1 only, which is not a supported digest.
    info!(version, "installing Vanilla");
    download(client, server_url, &dir.join(JAR_NAME), None).await?;
    Ok(())
}

async fn install_fabric(client: &reqwest::Client, version: &str, dir: &Path) -> Result<()> {
    let loaders: Value = client
        .get(format!("{FABRIC_META}/versions/loader"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let loader = pick_stable(&loaders)
        .ok_or_else(|| bad_registry("fabric", "no loader versions published"))?;

    let installers: Value = client
        .get(format!("{FABRIC_META}/versions/installer"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let installer = pick_stable(&installers)
        .ok_or_else(|| bad_registry("fabric", "no installer versions published"))?;

    let url =
        format!("{FABRIC_META}/versions/loader/{version}/{loader}/{installer}/server/jar");
    info!(version, loader = %loader, "installing Fabric");
    download(client, &url, &dir.join(JAR_NAME), None)
        .await
        .map_err(|err| match err {
            Error::Download { .. } => unknown_version("fabric", version),
            other => other,
        })?;
    Ok(())
}

async fn install_purpur(client: &reqwest::Client, version: &str, dir: &Path) -> Result<()> {
    let detail: Value = client
        .get(format!("{PURPUR_API}/purpur/{version}"))
        .send()
        .await?
        .error_for_status()
        .map_err(|_| unknown_version("purpur", version))?
        .json()
        .await?;
    let build = detail["builds"]["latest"]
        .as_str()
        .ok_or_else(|| unknown_version("purpur", version))?;

    // Purpur publishes MD5 only, which is not a supported digest.
    let url = format!("{PURPUR_API}/purpur/{version}/{build}/download");
    info!(version, build, "installing Purpur");
    download(client, &url, &dir.join(JAR_NAME), None).await?;
    Ok(())
}

/// First stable version from a Fabric meta list, else the first entry.
fn pick_stable(list: &Value) -> Option<String> {
    let entries = list.as_array()?;
    let stable = entries
        .iter()
        .find(|e| e["stable"].as_bool().unwrap_or(false))
        .or_else(|| entries.first())?;
    stable["version"].as_str().map(str::to_string)
}

fn unknown_version(registry: &str, version: &str) -> Error {
    Error::validation(
        "version",
        format!("{registry} has no release for version {version}"),
    )
}

fn bad_registry(registry: &str, what: &str) -> Error {
    Error::Resource(format!("{registry} registry response: {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_stable_prefers_stable_entries() {
        let list: Value = serde_json::json!([
            {"version": "0.16.0-beta", "stable": false},
            {"version": "0.15.7", "stable": true},
        ]);
        assert_eq!(pick_stable(&list).as_deref(), Some("0.15.7"));
    }

    #[test]
    fn pick_stable_falls_back_to_first() {
        let list: Value = serde_json::json!([
            {"version": "1.0.1", "stable": false},
            {"version": "1.0.0", "stable": false},
        ]);
        assert_eq!(pick_stable(&list).as_deref(), Some("1.0.1"));
    }

    #[test]
    fn pick_stable_empty_is_none() {
        assert_eq!(pick_stable(&serde_json::json!([])), None);
    }

    #[tokio::test]
    async fn forge_is_rejected_up_front() {
        let client = super::super::http_client();
        let dir = tempfile::tempdir().unwrap();
        let err = install_distribution(&client, Distribution::Forge, "1.20.4", dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "validation");
    }
}
