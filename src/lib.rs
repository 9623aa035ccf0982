//! # craftvisor
//!
//! **Craftvisor** is a local, cross-platform supervisor for long-running
//! Minecraft server processes: create, configure, launch, monitor, and
//! dismantle multiple servers on one host, with the database kept honest
//! against the OS process table across restarts, crashes, and out-of-band
//! kills.
//!
//! ## Subsystems
//!
//! | Area            | Description                                                     | Key types                                   |
//! |-----------------|------------------------------------------------------------------|---------------------------------------------|
//! | **Lifecycle**   | Start/stop/restart/status, create/import/delete, state machine. | [`Supervisor`], [`StopOutcome`]             |
//! | **Console**     | Ring history, subscriber fan-out, stdin injection, heartbeats.  | [`ConsoleFabric`], [`Frame`], [`Ring`]      |
//! | **Reconciler**  | Periodic OS-vs-database healing, dead-console sweep.            | [`Reconciler`]                              |
//! | **Scheduler**   | Durable 5-field cron schedules dispatching lifecycle actions.   | [`Scheduler`], [`CronExpr`]                 |
//! | **Store**       | Scoped unit-of-work over SQLite; value-typed snapshots only.    | [`Store`], [`ServerRecord`]                 |
//! | **Platform**    | Spawn/signal/probe behind one trait; three OS backends.         | [`Platform`]                                |
//! | **Fetchers**    | JAR/runtime/plugin downloads with digest verification.          | [`fetch::download`]                         |
//!
//! ## Wiring
//! ```text
//! Config ─┐
//!         ├─► Store ──► Supervisor ◄── ConsoleFabric ◄── Platform::spawn
//!         │               ▲   ▲
//!         │   Reconciler ─┘   └─ Scheduler / BackupManager / PluginManager
//!         └─► api::serve (REST + WebSocket console)
//! ```
//!
//! Everything is constructed explicitly at startup and injected; there are
//! no ambient singletons, and tests build fresh instances per case.

pub mod api;
pub mod auth;
pub mod backup;
pub mod config;
pub mod console;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod platform;
pub mod plugins;
pub mod properties;
pub mod reconcile;
pub mod sched;
pub mod services;
pub mod store;

// ---- Public re-exports ----

pub use config::Config;
pub use console::{ConsoleFabric, ConsoleLine, Frame, Ring, StreamKind};
pub use error::{Error, Result};
pub use lifecycle::{StatusReport, StopOutcome, Supervisor};
pub use platform::Platform;
pub use reconcile::Reconciler;
pub use sched::{CronExpr, Scheduler};
pub use store::{ServerRecord, Store};
