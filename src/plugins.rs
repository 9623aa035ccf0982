//! # Plugin management.
//!
//! Installs plugin JARs into `<workdir>/plugins/`, catalogs them, and
//! toggles them by renaming `.jar` ↔ `.jar.disabled`; the record always
//! follows the file. Removal deletes both.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::fetch::{self, PluginRequest};
use crate::store::{PluginRecord, Store};

/// Suffix appended to a disabled plugin's file name.
const DISABLED_SUFFIX: &str = ".disabled";

/// Installs and toggles plugins for managed servers.
pub struct PluginManager {
    store: Arc<Store>,
    http: reqwest::Client,
}

impl PluginManager {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            http: fetch::http_client(),
        })
    }

    /// Fetches and catalogs a plugin for a server.
    pub async fn install(&self, server_id: i64, request: PluginRequest) -> Result<PluginRecord> {
        let server = self
            .store
            .with_scope(|scope| scope.find_server_by_id(server_id))?
            .ok_or_else(|| Error::not_found("server", server_id))?;

        let mut request = request;
        if request.game_version.is_none() {
            request.game_version = Some(server.version.clone());
        }

        let plugins_dir = server.path.join("plugins");
        let artifact = fetch::fetch_plugin(&self.http, &request, &plugins_dir).await?;

        info!(server = %server.name, plugin = %artifact.name, "plugin installed");
        self.store.with_scope(|scope| {
            scope.insert_plugin(
                server_id,
                &artifact.name,
                request.source,
                Some(request.reference.as_str()).filter(|r| !r.is_empty()),
                artifact.version.as_deref(),
                &artifact.file_path,
            )
        })
    }

    /// Enables or disables a plugin by renaming its file; the record follows
    /// the rename.
    pub async fn set_enabled(&self, plugin_id: i64, enabled: bool) -> Result<PluginRecord> {
        let plugin = self
            .store
            .with_scope(|scope| scope.find_plugin(plugin_id))?
            .ok_or_else(|| Error::not_found("plugin", plugin_id))?;

        if plugin.enabled == enabled {
            return Ok(plugin);
        }
        if !plugin.file_path.exists() {
            return Err(Error::Resource(format!(
                "plugin file missing: {}",
                plugin.file_path.display()
            )));
        }

        let new_path = if enabled {
            strip_disabled(&plugin.file_path)
        } else {
            add_disabled(&plugin.file_path)
        };
        std::fs::rename(&plugin.file_path, &new_path)?;
        info!(plugin = %plugin.name, enabled, "plugin toggled");

        self.store.with_scope(|scope| {
            scope.set_plugin_state(plugin_id, &new_path, enabled)?;
            scope
                .find_plugin(plugin_id)?
                .ok_or_else(|| Error::not_found("plugin", plugin_id))
        })
    }

    /// Removes a plugin's row and, by default, its file.
    pub async fn remove(&self, plugin_id: i64, delete_file: bool) -> Result<()> {
        let plugin = self
            .store
            .with_scope(|scope| scope.find_plugin(plugin_id))?
            .ok_or_else(|| Error::not_found("plugin", plugin_id))?;

        if delete_file && plugin.file_path.exists() {
            std::fs::remove_file(&plugin.file_path)?;
        }
        self.store.with_scope(|scope| scope.delete_plugin(plugin_id))?;
        info!(plugin = %plugin.name, "plugin removed");
        Ok(())
    }

    pub async fn list(&self, server_id: i64) -> Result<Vec<PluginRecord>> {
        self.store.with_scope(|scope| scope.list_plugins(server_id))
    }
}

fn add_disabled(path: &std::path::Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(DISABLED_SUFFIX);
    path.with_file_name(name)
}

fn strip_disabled(path: &std::path::Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_suffix(DISABLED_SUFFIX) {
        Some(stripped) => path.with_file_name(stripped),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn disabled_suffix_round_trips() {
        let enabled = Path::new("/srv/plugins/Essentials.jar");
        let disabled = add_disabled(enabled);
        assert_eq!(
            disabled,
            Path::new("/srv/plugins/Essentials.jar.disabled")
        );
        assert_eq!(strip_disabled(&disabled), enabled);
    }

    #[test]
    fn strip_on_enabled_name_is_identity() {
        let path = Path::new("/srv/plugins/Worldedit.jar");
        assert_eq!(strip_disabled(path), path);
    }
}
