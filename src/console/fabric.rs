//! # Console fabric: child registry, ring history, subscriber fan-out.
//!
//! Process-wide mapping from server id to a live [`ManagedChild`]. For each
//! registered child the fabric runs three cooperating tasks plus a heartbeat:
//!
//! ```text
//! ConsoleFabric::register(spawned)
//!   ├─► reader-out   stdout → LineSplitter → ring + fan-out
//!   ├─► reader-err   stderr → LineSplitter → ring + fan-out
//!   ├─► exit-watcher child.wait() → system line → exit chain → close sinks
//!   └─► heartbeat    per-sink probe every interval; 2 misses → disconnect
//! ```
//!
//! ## Rules
//! - Ring and subscriber list share **one** lock: a `history` snapshot and
//!   the first live `output` frame can neither lose nor duplicate a line.
//! - Fan-out is non-blocking (`try_send` into bounded per-sink queues); a
//!   sink that cannot keep up is disconnected with a `lagging` log line and
//!   other sinks are unaffected.
//! - Exit chain order: persist stop state (primary hook), notify and close
//!   sinks with `server_stopped`, then user hooks. A failing hook is logged
//!   and later hooks still run.
//! - Gone children keep their ring until the dead-child sweep frees it, so a
//!   late subscriber still receives history plus the stop notice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::platform::Spawned;

use super::frame::Frame;
use super::line::{ConsoleLine, LineSplitter, StreamKind};
use super::ring::Ring;

/// Tunables for the fabric.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Lines retained per server (overwrite-oldest).
    pub ring_capacity: usize,
    /// Frames queued per subscriber before it counts as lagging.
    pub sink_queue_capacity: usize,
    /// Heartbeat probe interval per sink.
    pub heartbeat_interval: Duration,
    /// Idle time after which a gone child's ring is freed.
    pub sweep_ttl: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 2000,
            sink_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(20),
            sweep_ttl: Duration::from_secs(600),
        }
    }
}

/// Hook invoked by the exit-watcher chain.
#[async_trait]
pub trait ExitHook: Send + Sync + 'static {
    async fn on_exit(&self, server_id: i64, exit_code: Option<i32>) -> Result<()>;

    /// Name used in logs when the hook fails.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A live console subscription. Dropping it disconnects the sink.
pub struct Subscription {
    /// Sink id, used for pong and command acknowledgement routing.
    pub id: u64,
    /// Ordered frame stream; closed on disconnect or child exit.
    pub frames: mpsc::Receiver<Frame>,
}

/// Per-sink sender with heartbeat bookkeeping.
struct SinkHandle {
    id: u64,
    tx: mpsc::Sender<Frame>,
    missed_heartbeats: u32,
}

/// Ring plus subscriber list, guarded together (see module rules).
struct ConsoleState {
    ring: Ring,
    sinks: Vec<SinkHandle>,
}

/// One registered child process and its console state.
pub struct ManagedChild {
    pub server_id: i64,
    pub pid: u32,
    stdin: tokio::sync::Mutex<ChildStdin>,
    state: Mutex<ConsoleState>,
    gone: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    last_activity: Mutex<Instant>,
    next_sink_id: AtomicU64,
    /// Cancels the reader and heartbeat tasks on removal.
    cancel: CancellationToken,
    /// Completed (cancelled) the moment the child exits.
    exit_token: CancellationToken,
    sink_queue_capacity: usize,
}

impl ManagedChild {
    /// True once the exit watcher has observed termination.
    pub fn has_exited(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Exit code recorded by the watcher, when the OS reported one.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().expect("exit code lock poisoned")
    }

    /// Resolves when the child has exited; usable with a timeout for the
    /// graceful-stop wait.
    pub async fn wait_exited(&self) {
        self.exit_token.cancelled().await;
    }

    /// Appends a line to the ring and fans it out to every sink.
    fn push_line(&self, line: ConsoleLine) {
        let frame = Frame::Output { data: line.clone() };
        let mut state = self.state.lock().expect("console state lock poisoned");
        state.ring.push(line);
        fan_out(self.server_id, &mut state.sinks, &frame);
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    /// Sends a frame to all sinks, then drops them (used on exit).
    fn close_sinks_with(&self, frame: &Frame) {
        let mut state = self.state.lock().expect("console state lock poisoned");
        fan_out(self.server_id, &mut state.sinks, frame);
        state.sinks.clear();
    }

    /// Writes one command line to the child's stdin and echoes it into the
    /// history. Exactly one line per write; `\n` appended when absent.
    pub(crate) async fn send_command(&self, command: &str) -> Result<()> {
        if self.has_exited() {
            return Err(Error::Resource(format!(
                "server {} is not running",
                self.server_id
            )));
        }
        let mut payload = command.trim_end_matches(['\r', '\n']).to_string();
        payload.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| Error::Resource(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Resource(format!("stdin flush failed: {e}")))?;
        drop(stdin);

        self.push_line(ConsoleLine::now(
            StreamKind::StdinEcho,
            payload.trim_end_matches('\n'),
        ));
        Ok(())
    }

    /// Drains the ring into a new sink and registers it for live tailing.
    fn attach_sink(&self) -> Subscription {
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.sink_queue_capacity.max(2));

        let mut state = self.state.lock().expect("console state lock poisoned");
        // Queue is empty here, so the history frame always fits.
        let _ = tx.try_send(Frame::History {
            lines: state.ring.snapshot(),
        });
        if self.has_exited() {
            let _ = tx.try_send(Frame::ServerStopped {
                exit_code: self.exit_code(),
            });
            // No live tail will ever come; close the sink after the notice.
        } else {
            state.sinks.push(SinkHandle {
                id,
                tx,
                missed_heartbeats: 0,
            });
        }
        Subscription { id, frames: rx }
    }

    fn detach_sink(&self, sink_id: u64) {
        let mut state = self.state.lock().expect("console state lock poisoned");
        state.sinks.retain(|s| s.id != sink_id);
    }

    fn mark_pong(&self, sink_id: u64) {
        let mut state = self.state.lock().expect("console state lock poisoned");
        if let Some(sink) = state.sinks.iter_mut().find(|s| s.id == sink_id) {
            sink.missed_heartbeats = 0;
        }
    }

    /// One heartbeat round: disconnect sinks two intervals behind, probe the
    /// rest.
    fn heartbeat_round(&self) {
        let mut state = self.state.lock().expect("console state lock poisoned");
        let server_id = self.server_id;
        state.sinks.retain_mut(|sink| {
            sink.missed_heartbeats += 1;
            if sink.missed_heartbeats >= 2 {
                info!(server_id, sink = sink.id, "sink missed two heartbeats, disconnecting");
                return false;
            }
            match sink.tx.try_send(Frame::Heartbeat) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(server_id, sink = sink.id, reason = "lagging", "disconnecting sink");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }
}

/// Non-blocking fan-out; prunes sinks that lag or hung up.
fn fan_out(server_id: i64, sinks: &mut Vec<SinkHandle>, frame: &Frame) {
    sinks.retain(|sink| match sink.tx.try_send(frame.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(server_id, sink = sink.id, reason = "lagging", "disconnecting sink");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(server_id, sink = sink.id, "sink hung up");
            false
        }
    });
}

/// Registry of managed children plus the exit-hook chain.
pub struct ConsoleFabric {
    children: RwLock<HashMap<i64, Arc<ManagedChild>>>,
    /// Runs first in the exit chain; persists the stopped state.
    primary_exit: OnceLock<Arc<dyn ExitHook>>,
    hooks: RwLock<Vec<Arc<dyn ExitHook>>>,
    cfg: FabricConfig,
}

impl ConsoleFabric {
    pub fn new(cfg: FabricConfig) -> Arc<Self> {
        Arc::new(Self {
            children: RwLock::new(HashMap::new()),
            primary_exit: OnceLock::new(),
            hooks: RwLock::new(Vec::new()),
            cfg,
        })
    }

    /// Installs the primary exit handler. Call once during wiring; a second
    /// call is ignored.
    pub fn set_exit_handler(&self, hook: Arc<dyn ExitHook>) {
        let _ = self.primary_exit.set(hook);
    }

    /// Appends a user hook to the exit chain.
    pub async fn add_exit_hook(&self, hook: Arc<dyn ExitHook>) {
        self.hooks.write().await.push(hook);
    }

    /// Registers a freshly spawned child and starts its I/O tasks.
    pub async fn register(self: &Arc<Self>, server_id: i64, spawned: Spawned) -> Arc<ManagedChild> {
        let Spawned {
            pid,
            stdout,
            stderr,
            stdin,
            child,
        } = spawned;

        let managed = Arc::new(ManagedChild {
            server_id,
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            state: Mutex::new(ConsoleState {
                ring: Ring::new(self.cfg.ring_capacity),
                sinks: Vec::new(),
            }),
            gone: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            next_sink_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            exit_token: CancellationToken::new(),
            sink_queue_capacity: self.cfg.sink_queue_capacity,
        });

        if let Some(old) = self
            .children
            .write()
            .await
            .insert(server_id, Arc::clone(&managed))
        {
            // A replaced entry means a restart; stop its background tasks.
            old.cancel.cancel();
        }

        spawn_reader(Arc::clone(&managed), stdout, StreamKind::Stdout);
        spawn_reader(Arc::clone(&managed), stderr, StreamKind::Stderr);
        spawn_heartbeat(Arc::clone(&managed), self.cfg.heartbeat_interval);
        spawn_exit_watcher(Arc::clone(self), Arc::clone(&managed), child);

        info!(server_id, pid, "registered managed child");
        managed
    }

    /// Live (not yet exited) child handle for a server.
    pub async fn get_active(&self, server_id: i64) -> Option<Arc<ManagedChild>> {
        let children = self.children.read().await;
        children
            .get(&server_id)
            .filter(|c| !c.has_exited())
            .cloned()
    }

    /// Child handle regardless of exit state (gone children keep history).
    pub async fn get(&self, server_id: i64) -> Option<Arc<ManagedChild>> {
        self.children.read().await.get(&server_id).cloned()
    }

    /// Opens a console subscription: history first, then the live tail.
    pub async fn subscribe(&self, server_id: i64) -> Result<Subscription> {
        let child = self
            .get(server_id)
            .await
            .ok_or_else(|| Error::not_found("server console", server_id))?;
        Ok(child.attach_sink())
    }

    /// Drops one sink explicitly (the usual path is just dropping the
    /// [`Subscription`]).
    pub async fn unsubscribe(&self, server_id: i64, sink_id: u64) {
        if let Some(child) = self.get(server_id).await {
            child.detach_sink(sink_id);
        }
    }

    /// Resets the heartbeat counter for a sink.
    pub async fn pong(&self, server_id: i64, sink_id: u64) {
        if let Some(child) = self.get(server_id).await {
            child.mark_pong(sink_id);
        }
    }

    /// Injects one operator command into the child's stdin.
    pub async fn send_command(&self, server_id: i64, command: &str) -> Result<()> {
        let child = self
            .get_active(server_id)
            .await
            .ok_or_else(|| Error::not_found("server console", server_id))?;
        child.send_command(command).await
    }

    /// Removes a child entry outright (server deletion).
    pub async fn remove(&self, server_id: i64) {
        if let Some(child) = self.children.write().await.remove(&server_id) {
            child.cancel.cancel();
            child.close_sinks_with(&Frame::Error {
                message: "console closed".into(),
            });
        }
    }

    /// Frees rings of gone children idle longer than the TTL. Returns how
    /// many entries were swept.
    pub async fn sweep_dead(&self) -> usize {
        let ttl = self.cfg.sweep_ttl;
        let mut children = self.children.write().await;
        let before = children.len();
        children.retain(|server_id, child| {
            let expired = child.has_exited() && child.idle_for() > ttl;
            if expired {
                debug!(server_id, "sweeping dead console entry");
                child.cancel.cancel();
            }
            !expired
        });
        before - children.len()
    }

    /// Snapshot of registered children for the reconciler:
    /// `(server_id, pid, has_exited)`.
    pub async fn snapshot_children(&self) -> Vec<(i64, u32, bool)> {
        self.children
            .read()
            .await
            .values()
            .map(|c| (c.server_id, c.pid, c.has_exited()))
            .collect()
    }

    /// Applies the exit-callback chain for a server without a live exit
    /// watcher (reconciler path: the row claimed running but the OS process
    /// is gone, typically after a supervisor restart).
    pub async fn fire_exit(&self, server_id: i64, exit_code: Option<i32>) {
        let child = self.get(server_id).await;
        if let Some(c) = &child {
            if !c.has_exited() {
                *c.exit_code.lock().expect("exit code lock poisoned") = exit_code;
                c.gone.store(true, Ordering::Release);
                c.push_line(ConsoleLine::now(
                    StreamKind::System,
                    "process exited with code unknown",
                ));
                c.cancel.cancel();
            }
        }
        self.run_exit_chain(server_id, exit_code, child.as_deref()).await;
        if let Some(c) = &child {
            c.exit_token.cancel();
        }
    }

    /// The chain itself: persist (primary), notify + close sinks, user hooks.
    async fn run_exit_chain(
        &self,
        server_id: i64,
        exit_code: Option<i32>,
        child: Option<&ManagedChild>,
    ) {
        if let Some(primary) = self.primary_exit.get() {
            if let Err(err) = primary.on_exit(server_id, exit_code).await {
                error!(server_id, hook = primary.name(), error = %err, "exit handler failed");
            }
        }

        if let Some(child) = child {
            child.close_sinks_with(&Frame::ServerStopped { exit_code });
        }

        for hook in self.hooks.read().await.iter() {
            if let Err(err) = hook.on_exit(server_id, exit_code).await {
                error!(server_id, hook = hook.name(), error = %err, "exit hook failed");
            }
        }
    }
}

/// Reads one child stream line-by-line into the ring until EOF.
fn spawn_reader(
    child: Arc<ManagedChild>,
    mut stream: impl AsyncRead + Unpin + Send + 'static,
    kind: StreamKind,
) {
    tokio::spawn(async move {
        let mut splitter = LineSplitter::new();
        let mut chunk = [0u8; 8192];
        loop {
            tokio::select! {
                _ = child.cancel.cancelled() => break,
                read = stream.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in splitter.push(&chunk[..n]) {
                            child.push_line(ConsoleLine::now(kind, line));
                        }
                    }
                    Err(err) => {
                        debug!(server_id = child.server_id, ?kind, error = %err, "reader stopped");
                        break;
                    }
                }
            }
        }
        if let Some(rest) = splitter.finish() {
            child.push_line(ConsoleLine::now(kind, rest));
        }
    });
}

/// Awaits child termination, then drives the exit chain.
fn spawn_exit_watcher(
    fabric: Arc<ConsoleFabric>,
    child: Arc<ManagedChild>,
    mut process: tokio::process::Child,
) {
    tokio::spawn(async move {
        let exit_code = match process.wait().await {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(server_id = child.server_id, error = %err, "exit wait failed");
                None
            }
        };

        let code_text = exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".into());
        info!(
            server_id = child.server_id,
            pid = child.pid,
            exit_code = %code_text,
            "managed child exited"
        );

        *child.exit_code.lock().expect("exit code lock poisoned") = exit_code;
        child.gone.store(true, Ordering::Release);
        child.push_line(ConsoleLine::now(
            StreamKind::System,
            format!("process exited with code {code_text}"),
        ));

        fabric
            .run_exit_chain(child.server_id, exit_code, Some(&child))
            .await;
        // Fires only after the chain has persisted the stopped state, so a
        // stop-then-start sequence cannot race the chain.
        child.exit_token.cancel();
    });
}

/// Per-child heartbeat loop; ends when the child is removed or gone with no
/// sinks left.
fn spawn_heartbeat(child: Arc<ManagedChild>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so sinks get a full
        // interval before the first probe.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = child.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if child.has_exited() {
                        break;
                    }
                    child.heartbeat_round();
                }
            }
        }
    });
}

// Fabric behaviour that needs a real child process (stdin injection, exit
// watching, subscription ordering end to end) is covered by the integration
// suite in tests/. The unit tests below exercise the lock-free pieces.
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_preserves_order_for_multiple_sinks() {
        // Exercise fan_out and the ring lock without a ManagedChild.
        let mut state = ConsoleState {
            ring: Ring::new(10),
            sinks: Vec::new(),
        };
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        state.sinks.push(SinkHandle {
            id: 1,
            tx: tx_a,
            missed_heartbeats: 0,
        });
        state.sinks.push(SinkHandle {
            id: 2,
            tx: tx_b,
            missed_heartbeats: 0,
        });

        for text in ["L1", "L2", "L3"] {
            let line = ConsoleLine::now(StreamKind::Stdout, text);
            state.ring.push(line.clone());
            fan_out(7, &mut state.sinks, &Frame::Output { data: line });
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for expected in ["L1", "L2", "L3"] {
                match rx.recv().await {
                    Some(Frame::Output { data }) => assert_eq!(data.line, expected),
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn lagging_sink_is_pruned_and_others_unaffected() {
        let mut state = ConsoleState {
            ring: Ring::new(10),
            sinks: Vec::new(),
        };
        let (tx_slow, _rx_slow_kept_unread) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(64);
        state.sinks.push(SinkHandle {
            id: 1,
            tx: tx_slow,
            missed_heartbeats: 0,
        });
        state.sinks.push(SinkHandle {
            id: 2,
            tx: tx_fast,
            missed_heartbeats: 0,
        });

        // First frame fills the slow sink's queue; second overflows it.
        for text in ["a", "b", "c"] {
            let line = ConsoleLine::now(StreamKind::Stdout, text);
            fan_out(7, &mut state.sinks, &Frame::Output { data: line });
        }

        assert_eq!(state.sinks.len(), 1, "slow sink must be disconnected");
        assert_eq!(state.sinks[0].id, 2);
        for expected in ["a", "b", "c"] {
            match rx_fast.recv().await {
                Some(Frame::Output { data }) => assert_eq!(data.line, expected),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn heartbeat_counter_disconnects_after_two_misses() {
        let mut state = ConsoleState {
            ring: Ring::new(10),
            sinks: Vec::new(),
        };
        let (tx, mut rx) = mpsc::channel(16);
        state.sinks.push(SinkHandle {
            id: 1,
            tx,
            missed_heartbeats: 0,
        });

        // Inline copy of the heartbeat_round retain logic.
        let mut round = |state: &mut ConsoleState| {
            state.sinks.retain_mut(|sink| {
                sink.missed_heartbeats += 1;
                if sink.missed_heartbeats >= 2 {
                    return false;
                }
                sink.tx.try_send(Frame::Heartbeat).is_ok()
            });
        };

        round(&mut state);
        assert_eq!(state.sinks.len(), 1, "one miss keeps the sink");
        assert!(matches!(rx.try_recv(), Ok(Frame::Heartbeat)));

        round(&mut state);
        assert!(state.sinks.is_empty(), "two misses disconnect");
    }
}
