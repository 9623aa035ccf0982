//! # Error types used by the craftvisor runtime.
//!
//! One [`Error`] enum covers the whole taxonomy:
//!
//! - **Validation** bad name, invalid cron, invalid port, missing field.
//! - **Conflict** `AlreadyRunning`, `PortInUse`, `NameInUse`.
//! - **Not found** unknown server, backup, schedule, plugin, key.
//! - **Resource** disk, config, download exhausted its retries.
//! - **Integrity** digest mismatch, truncated download.
//! - **Security** traversal refusal, elevated principal, bad API key.
//!
//! Low-level I/O, database, and HTTP errors are wrapped at component
//! boundaries; the lifecycle engine never surfaces a raw OS error.
//! Every variant has a short stable label (`as_label`) for logs and for the
//! HTTP layer's status mapping.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the supervisor core.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Input failed validation before any side effect.
    #[error("validation failed for '{field}': {message}")]
    Validation {
        /// Field or parameter that failed.
        field: &'static str,
        /// Human-readable reason.
        message: String,
    },

    /// A server with this name already exists.
    #[error("server name already in use: {name}")]
    NameInUse { name: String },

    /// The server is already running (DB and OS agree).
    #[error("server '{name}' is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    /// The requested TCP port is held by another process.
    #[error("port {port} is already in use{}", holder_pid.map(|p| format!(" by pid {p}")).unwrap_or_default())]
    PortInUse {
        port: u16,
        /// Pid of the holder, when platform tooling could identify it.
        holder_pid: Option<u32>,
    },

    /// Entity lookup came up empty.
    #[error("{entity} not found: {ident}")]
    NotFound {
        /// Entity kind ("server", "backup", "schedule", "plugin", "api key").
        entity: &'static str,
        ident: String,
    },

    /// The EULA file is absent or not accepted; never created silently.
    #[error("eula.txt missing or not accepted at {path}; accept the Minecraft EULA to continue")]
    EulaMissing { path: PathBuf },

    /// A downloaded artifact did not match its published digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Download failed after all retry attempts.
    #[error("download failed: {url}: {reason}")]
    Download { url: String, reason: String },

    /// Refused for security reasons (traversal, elevation, bad key).
    #[error("refused: {0}")]
    Security(String),

    /// Operation cannot proceed on this host/platform.
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    /// Backup or archive handling failed.
    #[error("backup error: {0}")]
    Backup(String),

    /// Catch-all resource failure with a stable description.
    #[error("{0}")]
    Resource(String),

    /// Wrapped filesystem / process I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Wrapped HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Returns a short stable label (snake_case) for logs, metrics, and the
    /// HTTP error body.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NameInUse { .. } => "name_in_use",
            Error::AlreadyRunning { .. } => "already_running",
            Error::PortInUse { .. } => "port_in_use",
            Error::NotFound { .. } => "not_found",
            Error::EulaMissing { .. } => "eula_missing",
            Error::DigestMismatch { .. } => "digest_mismatch",
            Error::Download { .. } => "download_failed",
            Error::Security(_) => "security_refused",
            Error::Unsupported(_) => "unsupported_platform",
            Error::Backup(_) => "backup_failed",
            Error::Resource(_) => "resource",
            Error::Io(_) => "io",
            Error::Database(_) => "database",
            Error::Http(_) => "http",
        }
    }

    /// True for errors the HTTP layer maps to 409.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::NameInUse { .. } | Error::AlreadyRunning { .. } | Error::PortInUse { .. }
        )
    }

    /// True for caller mistakes mapped to 400.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. } | Error::EulaMissing { .. })
    }

    /// True for refusals mapped to 403.
    pub fn is_security(&self) -> bool {
        matches!(self, Error::Security(_))
    }

    /// Shorthand for a [`Error::Validation`].
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    /// Shorthand for a [`Error::NotFound`].
    pub fn not_found(entity: &'static str, ident: impl ToString) -> Self {
        Error::NotFound {
            entity,
            ident: ident.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(
            Error::validation("name", "bad characters").as_label(),
            "validation"
        );
        assert_eq!(
            Error::PortInUse {
                port: 25565,
                holder_pid: Some(42)
            }
            .as_label(),
            "port_in_use"
        );
        assert_eq!(Error::not_found("server", "alpha").as_label(), "not_found");
    }

    #[test]
    fn port_in_use_mentions_holder() {
        let msg = Error::PortInUse {
            port: 25565,
            holder_pid: Some(4242),
        }
        .to_string();
        assert!(msg.contains("4242"));

        let msg = Error::PortInUse {
            port: 25565,
            holder_pid: None,
        }
        .to_string();
        assert!(!msg.contains("pid"));
    }

    #[test]
    fn classification_helpers() {
        assert!(Error::NameInUse {
            name: "alpha".into()
        }
        .is_conflict());
        assert!(Error::Security("no".into()).is_security());
        assert!(Error::validation("port", "out of range").is_validation());
        assert!(!Error::Resource("disk full".into()).is_conflict());
    }
}
