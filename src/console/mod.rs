//! # Console I/O and streaming fabric.
//!
//! Captures each managed child's standard output and error, keeps a bounded
//! in-memory history, multiplexes it to any number of subscribers, and
//! injects operator commands into the child's standard input.
//!
//! ## Files & responsibilities
//! - **line.rs**: [`ConsoleLine`] plus the terminator-agnostic
//!   [`LineSplitter`].
//! - **ring.rs**: fixed-capacity overwrite-oldest history buffer.
//! - **frame.rs**: JSON wire frames shared with the WebSocket layer.
//! - **fabric.rs**: child registry, reader/exit-watcher/heartbeat tasks,
//!   subscriber fan-out with backpressure isolation, exit-hook chain.
//!
//! Console history is deliberately ephemeral: it lives only in the ring and
//! is never written to the database.

mod fabric;
mod frame;
mod line;
mod ring;

pub use fabric::{ConsoleFabric, ExitHook, FabricConfig, ManagedChild, Subscription};
pub use frame::{ClientFrame, Frame};
pub use line::{ConsoleLine, LineSplitter, StreamKind};
pub use ring::Ring;
