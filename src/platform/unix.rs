//! # Unix backend (Linux, macOS).
//!
//! - Children are detached with `setsid()` in the pre-exec hook: new session,
//!   no controlling terminal, and a fresh process group whose id equals the
//!   child pid, so signals can address the whole group.
//! - Graceful stop is SIGTERM to the group, force is SIGKILL to the group.
//! - Liveness uses `kill(pid, 0)`, which costs one syscall.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{loopback_bind_succeeds, Platform, PortProbe, ProcessStats, Spawned};

pub struct UnixPlatform {
    system: Mutex<System>,
}

impl UnixPlatform {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Sends `sig` to the child's process group, falling back to the single
    /// pid when the group is already gone.
    fn signal_group(&self, pid: u32, sig: i32) -> Result<()> {
        let group = -(pid as i32);
        let rc = unsafe { libc::kill(group, sig) };
        if rc == 0 {
            return Ok(());
        }
        let rc = unsafe { libc::kill(pid as i32, sig) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone; signalling a dead process is not a failure.
            return Ok(());
        }
        Err(Error::Io(err))
    }
}

#[async_trait]
impl Platform for UnixPlatform {
    fn spawn(
        &self,
        workdir: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Spawned> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::validation("argv", "empty argument vector"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            // Overlay only: the inherited environment stays intact.
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        unsafe {
            cmd.pre_exec(|| {
                // Detach from the controlling terminal and start a new
                // process group in one move.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

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
        self.signal_group(pid, libc::SIGTERM)
    }

    fn signal_force(&self, pid: u32) -> Result<()> {
        self.signal_group(pid, libc::SIGKILL)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let rc = unsafe { libc::kill(pid as i32, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the pid exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
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
        unsafe { libc::geteuid() == 0 }
    }
}

/// Identifies the pid listening on `port` via `lsof`. Best effort: returns
/// `None` when the tool is missing or its output is unparseable.
async fn find_port_holder(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .args(["-ti", &format!("tcp:{port}"), "-sTCP:LISTEN"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let pid = text.lines().next()?.trim().parse::<u32>().ok();
    if pid.is_none() {
        warn!(port, "lsof produced unparseable holder output");
    }
    pid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        let platform = UnixPlatform::new();
        assert!(platform.is_alive(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_dead() {
        let platform = UnixPlatform::new();
        // Above the default pid_max on Linux; guaranteed unused.
        assert!(!platform.is_alive(4_190_000));
    }

    #[tokio::test]
    async fn bound_port_reports_in_use() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let platform = UnixPlatform::new();
        let probe = platform.free_port(port).await;
        assert!(!probe.free);
    }

    #[tokio::test]
    async fn unbound_port_reports_free() {
        // Bind once to learn a free port, then release it.
        let port = {
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let platform = UnixPlatform::new();
        let probe = platform.free_port(port).await;
        assert!(probe.free);
        assert_eq!(probe.holder_pid, None);
    }
}
