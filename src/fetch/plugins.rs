//! # Plugin artifact fetchers.
//!
//! Resolves a plugin request against its registry and lands the JAR in the
//! server's `plugins/` directory. Modrinth publishes SHA-512 digests, which
//! are verified; Hangar and direct URLs publish none.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::store::PluginSource;

use super::{download, ArtifactDigest};

const MODRINTH_API: &str = "https://api.modrinth.com/v2";
const HANGAR_API: &str = "https://hangar.papermc.io/api/v1";

/// What to install and from where.
#[derive(Debug, Clone)]
pub struct PluginRequest {
    pub source: PluginSource,
    /// Project id / slug for registries, full URL for `PluginSource::Url`.
    pub reference: String,
    /// Minecraft version used to filter compatible plugin builds.
    pub game_version: Option<String>,
}

/// A downloaded plugin artifact.
#[derive(Debug, Clone)]
pub struct PluginArtifact {
    pub name: String,
    pub version: Option<String>,
    pub file_path: PathBuf,
}

/// Fetches the requested plugin into `plugins_dir`.
pub async fn fetch_plugin(
    client: &reqwest::Client,
    request: &PluginRequest,
    plugins_dir: &Path,
) -> Result<PluginArtifact> {
    tokio::fs::create_dir_all(plugins_dir).await?;
    match request.source {
        PluginSource::Modrinth => fetch_modrinth(client, request, plugins_dir).await,
        PluginSource::Hangar => fetch_hangar(client, request, plugins_dir).await,
        PluginSource::Url => fetch_url(client, &request.reference, plugins_dir).await,
    }
}

async fn fetch_modrinth(
    client: &reqwest::Client,
    request: &PluginRequest,
    plugins_dir: &Path,
) -> Result<PluginArtifact> {
    let project = &request.reference;
    let mut query: Vec<(&str, String)> =
        vec![("loaders", r#"["paper","spigot","bukkit"]"#.to_string())];
    if let Some(game_version) = &request.game_version {
        query.push(("game_versions", format!(r#"["{game_version}"]"#)));
    }

    let versions: Value = client
        .get(format!("{MODRINTH_API}/project/{project}/version"))
        .query(&query)
        .send()
        .await?
        .error_for_status()
        .map_err(|_| Error::not_found("plugin", project))?
        .json()
        .await?;

    let latest = versions
        .as_array()
        .and_then(|v| v.first())
        .ok_or_else(|| {
            Error::validation("plugin", format!("no compatible builds of {project}"))
        })?;
    let file = latest["files"]
        .as_array()
        .and_then(|f| f.first())
        .ok_or_else(|| Error::Resource("modrinth version has no files".into()))?;

    let url = file["url"]
        .as_str()
        .ok_or_else(|| Error::Resource("modrinth file missing url".into()))?;
    let filename = file["filename"]
        .as_str()
        .ok_or_else(|| Error::Resource("modrinth file missing name".into()))?;
    let sha512 = file["hashes"]["sha512"].as_str().map(str::to_string);
    let version_number = latest["version_number"].as_str().map(str::to_string);

    // Project title for the catalog; the slug is a fine fallback.
    let title = client
        .get(format!("{MODRINTH_API}/project/{project}"))
        .send()
        .await
        .ok()
        .and_then(|r| r.error_for_status().ok());
    let name = match title {
        Some(response) => response
            .json::<Value>()
            .await
            .ok()
            .and_then(|p| p["title"].as_str().map(str::to_string))
            .unwrap_or_else(|| project.clone()),
        None => project.clone(),
    };

    let target = plugins_dir.join(filename);
    info!(project = %project, file = filename, "installing plugin from Modrinth");
    download(
        client,
        url,
        &target,
        sha512.map(ArtifactDigest::Sha512).as_ref(),
    )
    .await?;

    Ok(PluginArtifact {
        name,
        version: version_number,
        file_path: target,
    })
}

async fn fetch_hangar(
    client: &reqwest::Client,
    request: &PluginRequest,
    plugins_dir: &Path,
) -> Result<PluginArtifact> {
    let slug = &request.reference;
    let latest: String = client
        .get(format!("{HANGAR_API}/projects/{slug}/latestrelease"))
        .send()
        .await?
        .error_for_status()
        .map_err(|_| Error::not_found("plugin", slug))?
        .text()
        .await?;
    let version = latest.trim().trim_matches('"').to_string();

    let url = format!("{HANGAR_API}/projects/{slug}/versions/{version}/PAPER/download");
    let target = plugins_dir.join(format!("{slug}-{version}.jar"));
    info!(project = %slug, %version, "installing plugin from Hangar");
    download(client, &url, &target, None).await?;

    Ok(PluginArtifact {
        name: slug.clone(),
        version: Some(version),
        file_path: target,
    })
}

async fn fetch_url(
    client: &reqwest::Client,
    url: &str,
    plugins_dir: &Path,
) -> Result<PluginArtifact> {
    let filename = filename_from_url(url);
    let target = plugins_dir.join(&filename);
    info!(url, file = %filename, "installing plugin from URL");
    download(client, url, &target, None).await?;

    Ok(PluginArtifact {
        name: filename.trim_end_matches(".jar").to_string(),
        version: None,
        file_path: target,
    })
}

/// Last path segment of the URL, query stripped, `.jar` enforced.
fn filename_from_url(url: &str) -> String {
    let tail = url
        .rsplit('/')
        .next()
        .unwrap_or("plugin")
        .split('?')
        .next()
        .unwrap_or("plugin");
    let tail = if tail.is_empty() { "plugin" } else { tail };
    if tail.ends_with(".jar") {
        tail.to_string()
    } else {
        format!("{tail}.jar")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_filenames_are_sanitized() {
        assert_eq!(
            filename_from_url("https://example.com/files/Essentials.jar?key=1"),
            "Essentials.jar"
        );
        assert_eq!(
            filename_from_url("https://example.com/download"),
            "download.jar"
        );
        assert_eq!(filename_from_url("https://example.com/"), "plugin.jar");
    }
}
