//! # Console lines and stream splitting.
//!
//! [`ConsoleLine`] is the ephemeral unit of console history: held in the
//! per-server ring, fanned out to subscribers, never persisted.
//!
//! [`LineSplitter`] turns raw chunks read from a child's pipes into lines.
//! All three terminators are honoured (`\n`, `\r\n`, `\r`), including a
//! `\r\n` pair split across two chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Origin of one console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Operator input echoed back into the history.
    StdinEcho,
    /// Lines injected by the supervisor itself (exit notices).
    System,
}

/// One line of console history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamKind,
    pub line: String,
}

impl ConsoleLine {
    /// Stamps a line with the current wall clock.
    pub fn now(stream: StreamKind, line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            line: line.into(),
        }
    }
}

/// Stateful splitter from byte chunks to lines.
///
/// Lines are emitted eagerly on `\r` so interactive progress output appears
/// promptly; a following `\n` is swallowed even when it arrives in the next
/// chunk.
#[derive(Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
    pending_lf: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' => {
                    if self.pending_lf {
                        // Second half of a \r\n pair; \r already emitted.
                        self.pending_lf = false;
                    } else {
                        lines.push(self.take());
                    }
                }
                b'\r' => {
                    self.pending_lf = true;
                    lines.push(self.take());
                }
                _ => {
                    self.pending_lf = false;
                    self.buf.push(byte);
                }
            }
        }
        lines
    }

    /// Flushes a trailing unterminated line at stream end.
    pub fn finish(&mut self) -> Option<String> {
        self.pending_lf = false;
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}
