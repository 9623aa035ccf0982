//! # Platform backend: process spawn/signal/probe behind one contract.
//!
//! A capability set abstracting the host OS. Exactly one implementation is
//! selected at startup ([`select`]) and shared process-wide behind
//! `Arc<dyn Platform>`.
//!
//! ## Files & responsibilities
//! - **paths.rs**: data-root and layout helpers (leaf; no crate-internal deps).
//! - **unix.rs**: Linux/macOS backend (setsid process groups, signals).
//! - **windows.rs**: Windows backend (new process group, taskkill fan-out).
//! - **runtimes.rs**: Java runtime discovery and `-version` banner parsing.
//!
//! ## Rules
//! - `spawn` never clears the supervisor environment: the child always sees
//!   the full inherited environment plus the caller's overlay.
//! - `is_alive` must return within tens of milliseconds (no tooling calls).
//! - Graceful/force signalling targets the whole child process group so a
//!   terminate fans out to forked helpers.

pub mod paths;
mod runtimes;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use crate::error::Result;

pub use runtimes::{discover_runtimes, probe_runtime, JavaRuntime};

/// Handles returned by a successful [`Platform::spawn`].
pub struct Spawned {
    /// OS process id of the child.
    pub pid: u32,
    /// Piped standard output.
    pub stdout: ChildStdout,
    /// Piped standard error.
    pub stderr: ChildStderr,
    /// Piped standard input.
    pub stdin: ChildStdin,
    /// Remaining child handle; awaiting it yields the exit status.
    pub child: Child,
}

/// Result of a [`Platform::free_port`] probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortProbe {
    /// True when a loopback bind succeeded.
    pub free: bool,
    /// Pid of the listener holding the port, when tooling could identify it.
    pub holder_pid: Option<u32>,
}

/// Point-in-time process statistics for `status`.
#[derive(Debug, Clone)]
pub struct ProcessStats {
    /// Executable name as reported by the OS.
    pub name: String,
    /// CPU usage in percent (may read 0.0 on the first sample).
    pub cpu_percent: f32,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// Seconds since the process started.
    pub uptime_seconds: u64,
}

impl ProcessStats {
    /// Heuristic ownership check: managed children are Java processes.
    /// A recycled pid pointing at an unrelated binary fails this.
    pub fn looks_like_java(&self) -> bool {
        self.name.to_ascii_lowercase().contains("java")
    }
}

/// Contract every OS backend implements.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Spawns a detached child in its own process group with piped stdio.
    ///
    /// `env` is an overlay merged over the supervisor's full environment;
    /// an empty overlay must not strip `PATH`, `JAVA_HOME`, etc.
    fn spawn(&self, workdir: &Path, argv: &[String], env: &HashMap<String, String>)
        -> Result<Spawned>;

    /// Asks the child to terminate (SIGTERM / group terminate).
    fn signal_graceful(&self, pid: u32) -> Result<()>;

    /// Kills the child without appeal (SIGKILL / forced tree terminate).
    fn signal_force(&self, pid: u32) -> Result<()>;

    /// Fast process-table probe. Never blocks on external tooling.
    fn is_alive(&self, pid: u32) -> bool;

    /// Point-in-time stats for a pid, `None` when it is gone.
    fn process_stats(&self, pid: u32) -> Option<ProcessStats>;

    /// Bind-then-close probe on the loopback; on conflict, attempts to name
    /// the holder via platform tooling.
    async fn free_port(&self, port: u16) -> PortProbe;

    /// True when the supervisor runs as root / an elevated Administrator.
    fn is_elevated(&self) -> bool;
}

/// Selects the backend for the current host. Called once at startup.
pub fn select() -> Arc<dyn Platform> {
    #[cfg(unix)]
    {
        Arc::new(unix::UnixPlatform::new())
    }
    #[cfg(windows)]
    {
        Arc::new(windows::WindowsPlatform::new())
    }
}

/// Shared bind-test half of `free_port`; backends add holder lookup.
pub(crate) fn loopback_bind_succeeds(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
