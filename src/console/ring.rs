//! # Bounded console history ring.
//!
//! Fixed-capacity, overwrite-oldest buffer of [`ConsoleLine`]s. Not
//! thread-safe by itself; the fabric guards it together with the subscriber
//! list under one lock so a history snapshot and the live tail can never
//! lose or duplicate a line.

use std::collections::VecDeque;

use super::line::ConsoleLine;

/// Fixed-capacity line buffer.
pub struct Ring {
    capacity: usize,
    lines: VecDeque<ConsoleLine>,
}

impl Ring {
    /// Creates a ring holding at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a line, evicting the oldest when full.
    pub fn push(&mut self, line: ConsoleLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Copies the current contents in insertion order.
    pub fn snapshot(&self) -> Vec<ConsoleLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
