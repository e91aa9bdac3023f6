//! Liveness notifier plumbing.
//!
//! A [`Subscription`] is what a connection hands back when the session asks
//! for out-of-band notifications: an event source the session task awaits,
//! plus an optional guard that puts the previous notification routing back
//! when it is dropped.

use async_trait::async_trait;
use std::any::Any;
use tokio::sync::mpsc;

/// Asynchronous source of "out-of-band data arrived" events
#[async_trait]
pub trait LivenessSource: Send {
    /// Wait for the next notification. Returns `None` once the source is closed.
    async fn notified(&mut self) -> Option<()>;
}

/// Active notifier subscription for one connection handle
pub struct Subscription {
    source: Box<dyn LivenessSource>,
    restore: Option<Box<dyn Any + Send + Sync>>,
}

impl Subscription {
    /// Wrap an event source with nothing to restore on teardown
    pub fn new<S>(source: S) -> Self
    where
        S: LivenessSource + 'static,
    {
        Self {
            source: Box::new(source),
            restore: None,
        }
    }

    /// Attach a guard whose `Drop` restores the routing saved at subscription time
    pub fn with_restore<G>(mut self, guard: G) -> Self
    where
        G: Send + Sync + 'static,
    {
        self.restore = Some(Box::new(guard));
        self
    }

    pub(crate) fn into_parts(self) -> (Box<dyn LivenessSource>, Option<Box<dyn Any + Send + Sync>>) {
        (self.source, self.restore)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("restore", &self.restore.is_some())
            .finish_non_exhaustive()
    }
}

/// Create an in-process notifier pair.
///
/// Useful for runtimes that surface out-of-band readiness through their own
/// event loop rather than a process signal.
pub fn liveness_channel() -> (LivenessSender, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LivenessSender { tx }, ChannelSource { rx })
}

/// Sending half of [`liveness_channel`]
#[derive(Clone, Debug)]
pub struct LivenessSender {
    tx: mpsc::UnboundedSender<()>,
}

impl LivenessSender {
    /// Deliver one notification. Returns `false` if the subscriber is gone.
    pub fn notify(&self) -> bool {
        self.tx.send(()).is_ok()
    }

    /// Whether the receiving session has been torn down
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of [`liveness_channel`]
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<()>,
}

#[async_trait]
impl LivenessSource for ChannelSource {
    async fn notified(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}
