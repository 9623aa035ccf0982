//! # Application path resolution.
//!
//! Leaf module with no dependency on the rest of the crate: both the core and
//! the platform backends import it, which keeps the dependency graph acyclic.
//!
//! Layout under the data root:
//! ```text
//! <data root>/
//!   msm.sqlite        supervisor database
//!   config.json       supervisor configuration
//!   servers/<name>/   one working directory per managed server
//!   backups/          gzip tar archives
//!   runtimes/         Java runtimes installed by the supervisor
//! ```

use std::env;
use std::path::PathBuf;

/// Directory name used on every platform.
const APP_DIR: &str = "msm";

/// Returns the platform data root for the supervisor.
///
/// - Windows: `%APPDATA%\msm`
/// - macOS: `~/Library/Application Support/msm`
/// - Linux and other Unix: `$XDG_DATA_HOME/msm` or `~/.local/share/msm`
pub fn data_root() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(appdata) = env::var_os("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR);
        }
        // APPDATA is always set on a sane Windows install; last resort only.
        return PathBuf::from(r"C:\").join(APP_DIR);
    }

    #[cfg(target_os = "macos")]
    {
        return home()
            .join("Library")
            .join("Application Support")
            .join(APP_DIR);
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        if let Some(xdg) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(xdg).join(APP_DIR);
        }
        home().join(".local").join("share").join(APP_DIR)
    }
}

/// Working directory allocated for a named server.
pub fn server_dir(root: &std::path::Path, name: &str) -> PathBuf {
    root.join("servers").join(name)
}

/// Directory holding backup archives.
pub fn backups_dir(root: &std::path::Path) -> PathBuf {
    root.join("backups")
}

/// Directory holding supervisor-installed Java runtimes.
pub fn runtimes_dir(root: &std::path::Path) -> PathBuf {
    root.join("runtimes")
}

/// Path of the supervisor database.
pub fn database_path(root: &std::path::Path) -> PathBuf {
    root.join("msm.sqlite")
}

/// Path of the supervisor configuration file.
pub fn config_path(root: &std::path::Path) -> PathBuf {
    root.join("config.json")
}

#[cfg(unix)]
fn home() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_root_ends_with_app_dir() {
        assert_eq!(
            data_root().file_name().and_then(|n| n.to_str()),
            Some("msm")
        );
    }

    #[test]
    fn server_dir_nests_under_servers() {
        let root = PathBuf::from("/data/msm");
        assert_eq!(
            server_dir(&root, "alpha"),
            PathBuf::from("/data/msm/servers/alpha")
        );
    }
}
