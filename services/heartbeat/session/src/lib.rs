//! Probe-based liveness detection for long-lived TCP connections.
//!
//! This crate decides whether the peer on one connection has stopped
//! responding, independently of the transport's own keepalive timers. It
//! owns no socket lifecycle: the caller opens and closes the connection, and
//! the heartbeat only probes it and reports when the peer is presumed dead.
//!
//! ## Features
//!
//! - **Probe/Escalation**: one urgent byte per interval, broken after
//!   `max_probes` unanswered intervals or any failed probe
//! - **Liveness Reset**: peer urgent data (`SIGURG`) restarts the countdown
//! - **Probe Answers**: [`AnswerProbes`] replies to peer probes so two
//!   monitoring ends keep each other alive
//! - **Serialized Events**: one task per session handles notifications,
//!   resets and timer expiries strictly one at a time
//! - **Scoped Subscription**: notifier routing is restored on unregister
//!
//! ## Example
//!
//! ```rust,no_run
//! use heartbeat_session::{connect_tcp, Heartbeat, HeartbeatConfig, HeartbeatError, OnBroken, TcpConnection};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let stream = Arc::new(connect_tcp("127.0.0.1:9000".parse()?).await?);
//! let config = HeartbeatConfig::new(Duration::from_secs(5), 3);
//!
//! let mut heartbeat = Heartbeat::new();
//! heartbeat.register(
//!     Arc::new(TcpConnection::new(stream.clone())),
//!     &config,
//!     OnBroken(|reason: &HeartbeatError| eprintln!("peer gone: {}", reason)),
//! )?;
//!
//! heartbeat.wait_broken().await;
//! heartbeat.unregister();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod notifier;
pub mod ops;
pub mod session;
pub mod transport;

// Re-export main types
pub use config::{HeartbeatConfig, HeartbeatPolicy, DEFAULT_MAX_PROBES, MIN_INTERVAL};
pub use connection::Connection;
pub use error::HeartbeatError;
pub use notifier::{liveness_channel, ChannelSource, LivenessSender, LivenessSource, Subscription};
pub use ops::{answer_probe, default_probe, AnswerProbes, HeartbeatOperations, OnBroken, ACK_BYTE, PROBE_BYTE};
pub use session::{Heartbeat, HeartbeatStats, SessionState};
pub use transport::{connect_tcp, listen_tcp};

#[cfg(unix)]
pub use transport::TcpConnection;
