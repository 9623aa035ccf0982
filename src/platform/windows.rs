//! # Windows backend.
//!
//! - Children are created in a new process group (`CREATE_NEW_PROCESS_GROUP`)
//!   with no console window; `taskkill /T` is used so termination fans out to
//!   the whole tree, approximating a job object.
//! - Graceful stop relies on the lifecycle engine having already written
//!   `stop\n` to the child's stdin; the signal here is a plain `taskkill`,
//!   escalating to `/F` on force.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use crate::error::{Error, Result};

use super::{loopback_bind_succeeds, Platform, PortProbe, ProcessStats, Spawned};

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub struct WindowsPlatform {
    system: Mutex<System>,
}

impl WindowsPlatform {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn taskkill(&self, pid: u32, force: bool) -> Result<()> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/T"]);
        if force {
            cmd.arg("/F");
        }
        let status = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(Error::Io)?;
        // taskkill exits 128 for "not found"; the child being gone is fine.
        if status.success() || status.code() == Some(128) {
            Ok(())
        } else {
            Err(Error::Resource(format!(
                "taskkill for pid {pid} exited with {status}"
            )))
        }
    }
}

#[async_trait]
impl Platform for WindowsPlatform {
    fn spawn(
        &self,
        workdir: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Spawned> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::validation("argv", "empty argument vector"))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            // Overlay only: the inherited environment stays intact.
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW)
            .kill_on_drop(false);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Resource("spawned child exited before pid read".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Resource("child stdout was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Resource("child stderr was not piped".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Resource("child stdin was not piped".into()))?;

        debug!(pid, workdir = %workdir.display(), "spawned child process");
        Ok(Spawned {
            pid,
            stdout,
            stderr,
            stdin,
            child,
        })
    }

    fn signal_graceful(&self, pid: u32) -> Result<()> {
        self.taskkill(pid, false)
    }

    fn signal_force(&self, pid: u32) -> Result<()> {
        self.taskkill(pid, true)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut system = self.system.lock().expect("platform system lock poisoned");
        let target = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing(),
        );
        system.process(target).is_some()
    }

    fn process_stats(&self, pid: u32) -> Option<ProcessStats> {
        let mut system = self.system.lock().expect("platform system lock poisoned");
        let target = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::everything(),
        );
        let proc = system.process(target)?;
        Some(ProcessStats {
            name: proc.name().to_string_lossy().into_owned(),
            cpu_percent: proc.cpu_usage(),
            memory_bytes: proc.memory(),
            uptime_seconds: proc.run_time(),
        })
    }

    async fn free_port(&self, port: u16) -> PortProbe {
        if loopback_bind_succeeds(port) {
            return PortProbe {
                free: true,
                holder_pid: None,
            };
        }
        PortProbe {
            free: false,
            holder_pid: find_port_holder(port).await,
        }
    }

    fn is_elevated(&self) -> bool {
        // `net session` succeeds only from an elevated shell.
        std::process::Command::new("net")
            .arg("session")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Parses `netstat -ano` for the LISTENING holder of `port`. Best effort.
async fn find_port_holder(port: u16) -> Option<u32> {
    let output = tokio::process::Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .output()
        .await
        .ok()?;
    let needle = format!(":{port}");
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if line.contains("LISTENING") && line.contains(&needle) {
            if let Some(pid) = line.split_whitespace().last() {
                return pid.parse().ok();
            }
        }
    }
    None
}
