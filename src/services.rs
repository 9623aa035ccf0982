//! # Platform service-unit generation.
//!
//! Renders systemd user units (Linux), launchd agents (macOS), and NSSM
//! install scripts (Windows) for a managed server, so operators can run it
//! under the host's own service manager. Installation is refused outright
//! when the supervisor is elevated: game servers must not run privileged.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::lifecycle::find_server_jar;
use crate::platform::Platform;
use crate::store::{ServerRecord, Store};

/// Outcome of a service generation: where the unit landed and how to drive it.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service_name: String,
    pub service_path: PathBuf,
    pub kind: &'static str,
    pub commands: Vec<(String, String)>,
}

/// Generates and removes per-server service units.
pub struct ServiceManager {
    store: Arc<Store>,
    platform: Arc<dyn Platform>,
}

impl ServiceManager {
    pub fn new(store: Arc<Store>, platform: Arc<dyn Platform>) -> Arc<Self> {
        Arc::new(Self { store, platform })
    }

    /// Creates the platform-appropriate service unit for a server.
    pub async fn install(&self, server_id: i64) -> Result<ServiceInfo> {
        // Mandatory guard: a unit written by root would run the server
        // privileged forever after.
        if self.platform.is_elevated() {
            return Err(Error::Security(
                "refusing to create a service as root/Administrator".into(),
            ));
        }

        let server = self
            .store
            .with_scope(|scope| scope.find_server_by_id(server_id))?
            .ok_or_else(|| Error::not_found("server", server_id))?;

        let jar = find_server_jar(&server.path).ok_or_else(|| {
            Error::Resource(format!("no server JAR in {}", server.path.display()))
        })?;

        if cfg!(target_os = "linux") {
            self.install_systemd(&server, &jar)
        } else if cfg!(target_os = "macos") {
            self.install_launchd(&server, &jar)
        } else if cfg!(windows) {
            self.install_nssm(&server, &jar)
        } else {
            Err(Error::Unsupported("service generation on this OS".into()))
        }
    }

    /// Removes a previously generated unit. Best effort; returns whether a
    /// unit file was found and deleted.
    pub async fn remove(&self, server_name: &str) -> Result<bool> {
        let unit = unit_name(server_name);
        if cfg!(target_os = "linux") {
            let path = home()?.join(".config/systemd/user").join(format!("{unit}.service"));
            if path.exists() {
                std::fs::remove_file(&path)?;
                info!(service = %unit, "removed systemd unit");
                return Ok(true);
            }
            Ok(false)
        } else if cfg!(target_os = "macos") {
            let path = home()?
                .join("Library/LaunchAgents")
                .join(format!("com.msm.{server_name}.plist"));
            if path.exists() {
                std::fs::remove_file(&path)?;
                info!(service = %unit, "removed launchd agent");
                return Ok(true);
            }
            Ok(false)
        } else {
            Ok(false)
        }
    }

    fn install_systemd(&self, server: &ServerRecord, jar: &str) -> Result<ServiceInfo> {
        let unit = unit_name(&server.name);
        let java = server.java_path.as_deref().unwrap_or("java");
        let jvm_args = server
            .jvm_args
            .clone()
            .unwrap_or_else(|| format!("-Xmx{0} -Xms{0}", server.memory));

        let content = format!(
            "[Unit]\n\
             Description=Minecraft Server - {name}\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             WorkingDirectory={dir}\n\
             ExecStart={java} {jvm_args} -jar {jar} nogui\n\
             Restart=on-failure\n\
             RestartSec=30\n\
             NoNewPrivileges=true\n\
             ProtectSystem=strict\n\
             ProtectHome=read-only\n\
             ReadWritePaths={dir}\n\
             PrivateTmp=true\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n",
            name = server.name,
            dir = server.path.display(),
        );

        let dir = home()?.join(".config/systemd/user");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{unit}.service"));
        std::fs::write(&path, content)?;
        info!(service = %unit, path = %path.display(), "created systemd unit");

        Ok(ServiceInfo {
            service_name: unit.clone(),
            service_path: path,
            kind: "systemd",
            commands: vec![
                ("enable".into(), format!("systemctl --user enable {unit}")),
                ("start".into(), format!("systemctl --user start {unit}")),
                ("stop".into(), format!("systemctl --user stop {unit}")),
                ("logs".into(), format!("journalctl --user -u {unit} -f")),
            ],
        })
    }

    fn install_launchd(&self, server: &ServerRecord, jar: &str) -> Result<ServiceInfo> {
        let label = format!("com.msm.{}", server.name);
        let java = server.java_path.as_deref().unwrap_or("/usr/bin/java");
        let jvm_args = server
            .jvm_args
            .clone()
            .unwrap_or_else(|| format!("-Xmx{0} -Xms{0}", server.memory));
        let args_xml: String = jvm_args
            .split_whitespace()
            .map(|arg| format!("        <string>{arg}</string>\n"))
            .collect();

        let content = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
             \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
             <plist version=\"1.0\">\n\
             <dict>\n\
             \x20   <key>Label</key>\n\
             \x20   <string>{label}</string>\n\
             \x20   <key>ProgramArguments</key>\n\
             \x20   <array>\n\
             \x20       <string>{java}</string>\n\
             {args_xml}\
             \x20       <string>-jar</string>\n\
             \x20       <string>{jar}</string>\n\
             \x20       <string>nogui</string>\n\
             \x20   </array>\n\
             \x20   <key>WorkingDirectory</key>\n\
             \x20   <string>{dir}</string>\n\
             \x20   <key>RunAtLoad</key>\n\
             \x20   <false/>\n\
             </dict>\n\
             </plist>\n",
            dir = server.path.display(),
        );

        let dir = home()?.join("Library/LaunchAgents");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{label}.plist"));
        std::fs::write(&path, content)?;
        info!(service = %label, path = %path.display(), "created launchd agent");

        Ok(ServiceInfo {
            service_name: label.clone(),
            service_path: path.clone(),
            kind: "launchd",
            commands: vec![
                ("load".into(), format!("launchctl load {}", path.display())),
                ("unload".into(), format!("launchctl unload {}", path.display())),
                ("start".into(), format!("launchctl start {label}")),
            ],
        })
    }

    fn install_nssm(&self, server: &ServerRecord, jar: &str) -> Result<ServiceInfo> {
        let unit = format!("MSM-{}", server.name);
        let java = server.java_path.as_deref().unwrap_or("java");
        let jvm_args = server
            .jvm_args
            .clone()
            .unwrap_or_else(|| format!("-Xmx{0} -Xms{0}", server.memory));

        let content = format!(
            "@echo off\r\n\
             REM Service setup for {name}; requires NSSM (https://nssm.cc)\r\n\
             nssm install {unit} \"{java}\"\r\n\
             nssm set {unit} AppDirectory \"{dir}\"\r\n\
             nssm set {unit} AppParameters {jvm_args} -jar {jar} nogui\r\n\
             nssm set {unit} DisplayName \"Minecraft Server - {name}\"\r\n\
             nssm set {unit} Start SERVICE_DEMAND_START\r\n",
            name = server.name,
            dir = server.path.display(),
        );

        let path = server.path.join("install_service.bat");
        std::fs::write(&path, content)?;
        info!(service = %unit, path = %path.display(), "created NSSM install script");

        Ok(ServiceInfo {
            service_name: unit.clone(),
            service_path: path,
            kind: "nssm",
            commands: vec![
                ("install".into(), "run install_service.bat as Administrator".into()),
                ("start".into(), format!("nssm start {unit}")),
                ("stop".into(), format!("nssm stop {unit}")),
            ],
        })
    }
}

/// Sanitized service name for a server.
fn unit_name(server_name: &str) -> String {
    let safe: String = server_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("msm-{safe}")
}

fn home() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_else(|| Error::Resource("cannot determine the home directory".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_names_are_sanitized() {
        assert_eq!(unit_name("alpha"), "msm-alpha");
        assert_eq!(unit_name("my server!"), "msm-my-server-");
        assert_eq!(unit_name("ok_name-1"), "msm-ok_name-1");
    }
}
