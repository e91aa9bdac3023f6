//! Heartbeat session controller.
//!
//! A [`Heartbeat`] owns at most one active registration. Registration spawns
//! a dedicated task that serializes every event touching session state:
//! liveness notifications, manual resets and timer expiries are handled one
//! at a time, in that priority order when several are ready together.

use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{HeartbeatConfig, HeartbeatPolicy};
use crate::connection::Connection;
use crate::error::HeartbeatError;
use crate::notifier::LivenessSource;
use crate::ops::HeartbeatOperations;

/// Lifecycle state of a heartbeat session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No registration is active
    Unregistered,
    /// Timer running, counting unanswered probes
    Armed {
        /// Probes sent since the last liveness signal
        probe_count: u32,
    },
    /// The broken callback has fired; waiting for `unregister`
    Broken,
}

/// Counters for a registered session
#[derive(Clone, Debug, Default)]
pub struct HeartbeatStats {
    /// Probes that were sent successfully
    pub probes_sent: u64,
    /// Notifications accepted as evidence of liveness
    pub liveness_events: u64,
    /// Manual resets requested by the caller
    pub resets: u64,
    /// Out-of-band read errors that were tolerated
    pub notifier_read_errors: u64,
    /// Time of the most recent successful probe
    pub last_probe: Option<Instant>,
    /// Time of the most recent liveness notification
    pub last_liveness: Option<Instant>,
}

#[derive(Clone, Debug)]
struct Snapshot {
    state: SessionState,
    stats: HeartbeatStats,
}

enum Command {
    Reset,
}

/// One event picked by the session loop
enum Event {
    Notified,
    NotifierClosed,
    Command(Command),
    Expired,
}

/// Liveness detector for one connection handle.
///
/// Dropping a `Heartbeat` unregisters it.
#[derive(Default)]
pub struct Heartbeat {
    active: Option<ActiveSession>,
}

struct ActiveSession {
    label: String,
    policy: HeartbeatPolicy,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    task: JoinHandle<()>,
    closed: Arc<AtomicBool>,
    // Dropped after the task is aborted; restores the prior notifier routing.
    _restore: Option<Box<dyn Any + Send + Sync>>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        // A loop iteration already past `select!` must not dispatch its event
        self.closed.store(true, Ordering::Release);
        self.task.abort();
    }
}

impl Heartbeat {
    /// Create an unregistered heartbeat
    pub fn new() -> Self {
        Self::default()
    }

    /// Start monitoring `conn`.
    ///
    /// The interval and probe ceiling are clamped (see
    /// [`HeartbeatConfig::normalized`]). Must be called from within a tokio
    /// runtime. An existing registration is torn down first. On error no
    /// session state is retained.
    pub fn register<C, O>(
        &mut self,
        conn: Arc<C>,
        config: &HeartbeatConfig,
        ops: O,
    ) -> Result<(), HeartbeatError>
    where
        C: Connection,
        O: HeartbeatOperations,
    {
        self.register_dyn(conn, config, Arc::new(ops))
    }

    /// [`Heartbeat::register`] for already type-erased handles and operations
    pub fn register_dyn(
        &mut self,
        conn: Arc<dyn Connection>,
        config: &HeartbeatConfig,
        ops: Arc<dyn HeartbeatOperations>,
    ) -> Result<(), HeartbeatError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HeartbeatError::NoRuntime)?;

        self.unregister();

        let policy = config.normalized();
        let label = conn.label();

        let subscription = conn.subscribe().map_err(|e| {
            warn!(peer = %label, "Liveness subscription refused: {}", e);
            HeartbeatError::Subscription(e)
        })?;
        let (source, restore) = subscription.into_parts();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
            state: SessionState::Armed { probe_count: 0 },
            stats: HeartbeatStats::default(),
        });

        let closed = Arc::new(AtomicBool::new(false));
        let core = SessionCore {
            label: label.clone(),
            conn,
            ops,
            policy,
            probe_count: 0,
            deadline: Instant::now() + policy.interval,
            stats: HeartbeatStats::default(),
            snapshot: snapshot_tx,
            closed: closed.clone(),
        };
        let task = runtime.spawn(run_session(core, source, command_rx));

        info!(
            peer = %label,
            interval = ?policy.interval,
            max_probes = policy.max_probes,
            "Heartbeat registered"
        );

        self.active = Some(ActiveSession {
            label,
            policy,
            commands: command_tx,
            snapshot: snapshot_rx,
            task,
            closed,
            _restore: restore,
        });
        Ok(())
    }

    /// Stop monitoring and restore the notifier routing saved at registration.
    ///
    /// Safe to call at any time, including when nothing is registered or
    /// after the broken callback has fired.
    pub fn unregister(&mut self) {
        if let Some(active) = self.active.take() {
            info!(peer = %active.label, "Heartbeat unregistered");
        }
    }

    /// Treat the peer as freshly confirmed alive: zero the probe count and
    /// restart a full interval. No-op unless the session is armed.
    pub fn reset(&self) {
        if let Some(active) = &self.active {
            // The task is gone once the session broke; nothing to reset.
            let _ = active.commands.send(Command::Reset);
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map(|active| active.snapshot.borrow().state)
            .unwrap_or(SessionState::Unregistered)
    }

    /// Whether a registration is active (armed or broken)
    pub fn is_registered(&self) -> bool {
        self.active.is_some()
    }

    /// Clamped policy of the active registration
    pub fn policy(&self) -> Option<HeartbeatPolicy> {
        self.active.as_ref().map(|active| active.policy)
    }

    /// Counters of the active registration
    pub fn stats(&self) -> Option<HeartbeatStats> {
        self.active
            .as_ref()
            .map(|active| active.snapshot.borrow().stats.clone())
    }

    /// Wait until the active registration leaves the armed state.
    ///
    /// Returns immediately when nothing is registered.
    pub async fn wait_broken(&self) {
        let Some(active) = &self.active else {
            return;
        };
        let mut snapshot = active.snapshot.clone();
        let _ = snapshot
            .wait_for(|s| !matches!(s.state, SessionState::Armed { .. }))
            .await;
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("state", &self.state())
            .field("policy", &self.policy())
            .finish()
    }
}

/// State owned by the session task
struct SessionCore {
    label: String,
    conn: Arc<dyn Connection>,
    ops: Arc<dyn HeartbeatOperations>,
    policy: HeartbeatPolicy,
    probe_count: u32,
    deadline: Instant,
    stats: HeartbeatStats,
    snapshot: watch::Sender<Snapshot>,
    closed: Arc<AtomicBool>,
}

impl SessionCore {
    fn rearm(&mut self) {
        self.deadline = Instant::now() + self.policy.interval;
    }

    fn publish(&self, state: SessionState) {
        self.snapshot.send_replace(Snapshot {
            state,
            stats: self.stats.clone(),
        });
    }

    fn publish_armed(&self) {
        self.publish(SessionState::Armed {
            probe_count: self.probe_count,
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Out-of-band notification
    fn on_notification(&mut self) {
        let mut buf = [0u8; 1];
        let received = match self.conn.recv_urgent(&mut buf) {
            Ok(n) => Some(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                // EINVAL: nothing pending, the wake-up was for another socket
                let spurious = e.kind() == io::ErrorKind::InvalidInput;
                let err = HeartbeatError::NotifierRead(e);
                if spurious {
                    debug!(peer = %self.label, "No urgent data pending: {}", err);
                } else {
                    warn!(peer = %self.label, "Ignoring liveness notification: {}", err);
                }
                self.stats.notifier_read_errors += 1;
                self.publish_armed();
                return;
            }
        };

        if self.probe_count > 0 {
            debug!(
                peer = %self.label,
                probes = self.probe_count,
                "Peer responsive again"
            );
        }
        self.probe_count = 0;
        self.stats.liveness_events += 1;
        self.stats.last_liveness = Some(Instant::now());
        self.rearm();
        self.publish_armed();

        if let Some(n) = received {
            if let Err(e) = self.ops.acknowledge(&*self.conn, &buf[..n]) {
                warn!(peer = %self.label, "Failed to answer urgent data: {}", e);
            }
        }
    }

    fn on_reset(&mut self) {
        debug!(peer = %self.label, "Manual heartbeat reset");
        self.probe_count = 0;
        self.stats.resets += 1;
        self.rearm();
        self.publish_armed();
    }

    /// Timer expiry. Returns the terminal error once the peer is presumed dead.
    fn on_expiry(&mut self) -> Option<HeartbeatError> {
        self.probe_count = self.probe_count.saturating_add(1);

        if self.probe_count > self.policy.max_probes {
            return Some(HeartbeatError::EscalationExhausted {
                max_probes: self.policy.max_probes,
            });
        }

        match self.ops.probe(&*self.conn) {
            Ok(sent) => {
                debug!(
                    peer = %self.label,
                    probe = self.probe_count,
                    max_probes = self.policy.max_probes,
                    "Sent probe ({} byte(s))",
                    sent
                );
                self.stats.probes_sent += 1;
                self.stats.last_probe = Some(Instant::now());
                self.rearm();
                self.publish_armed();
                None
            }
            Err(source) => Some(HeartbeatError::ProbeFailure {
                probes: self.probe_count,
                source,
            }),
        }
    }

    fn declare_broken(&self, reason: HeartbeatError) {
        error!(peer = %self.label, "Connection presumed broken: {}", reason);
        self.ops.broken(&reason);
        // `wait_broken` observers wake only after the callback has returned
        self.publish(SessionState::Broken);
    }
}

/// Event loop of one registered session
async fn run_session(
    mut core: SessionCore,
    mut source: Box<dyn LivenessSource>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut notifier_open = true;

    loop {
        let event = tokio::select! {
            biased;

            // Liveness beats a simultaneous expiry
            event = source.notified(), if notifier_open => match event {
                Some(()) => Event::Notified,
                None => Event::NotifierClosed,
            },

            Some(command) = commands.recv() => Event::Command(command),

            _ = tokio::time::sleep_until(core.deadline) => Event::Expired,
        };

        if core.is_closed() {
            break;
        }

        match event {
            Event::Notified => core.on_notification(),
            Event::NotifierClosed => {
                warn!(peer = %core.label, "Liveness notifier closed; relying on probes only");
                notifier_open = false;
            }
            Event::Command(Command::Reset) => core.on_reset(),
            Event::Expired => {
                if let Some(reason) = core.on_expiry() {
                    core.declare_broken(reason);
                    break;
                }
            }
        }
    }

    debug!(peer = %core.label, stats = ?core.stats, "Heartbeat task ended");
}
