//! TCP transport for heartbeat sessions.
//!
//! This module provides plain TCP helpers plus, on unix, a [`Connection`]
//! implementation that probes with TCP urgent data and learns about the
//! peer's urgent data through `SIGURG`.
//!
//! [`Connection`]: crate::Connection

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

#[cfg(unix)]
pub use self::urgent::TcpConnection;

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

// Urgent-data signalling
#[cfg(unix)]
/// Out-of-band probing and `SIGURG` notification for TCP streams
pub mod urgent {
    use async_trait::async_trait;
    use socket2::SockRef;
    use std::io;
    use std::mem::MaybeUninit;
    use std::os::fd::AsRawFd;
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio::signal::unix::{signal, Signal, SignalKind};
    use tracing::debug;

    use crate::connection::Connection;
    use crate::notifier::{LivenessSource, Subscription};

    /// A caller-owned TCP stream monitored through urgent data.
    ///
    /// Cloning shares the same stream. The heartbeat never shuts the stream
    /// down; dropping the last clone closes it as usual.
    #[derive(Clone, Debug)]
    pub struct TcpConnection {
        stream: Arc<TcpStream>,
    }

    impl TcpConnection {
        /// Wrap a stream shared with the caller
        pub fn new(stream: Arc<TcpStream>) -> Self {
            Self { stream }
        }
    }

    impl Connection for TcpConnection {
        fn send_urgent(&self, data: &[u8]) -> io::Result<usize> {
            SockRef::from(&*self.stream).send_out_of_band(data)
        }

        fn recv_urgent(&self, buf: &mut [u8]) -> io::Result<usize> {
            // SAFETY: `MaybeUninit<u8>` has the same layout as `u8`, and the
            // kernel only writes initialized bytes into the buffer.
            let buf = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
            SockRef::from(&*self.stream).recv_out_of_band(buf)
        }

        fn subscribe(&self) -> io::Result<Subscription> {
            let owner = OwnerGuard::claim(self.stream.clone())?;
            let signal = signal(SignalKind::from_raw(libc::SIGURG))?;
            Ok(Subscription::new(UrgentSignal { signal }).with_restore(owner))
        }

        fn label(&self) -> String {
            self.stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| format!("fd {}", self.stream.as_raw_fd()))
        }
    }

    /// Liveness source fed by the process-wide `SIGURG` stream
    struct UrgentSignal {
        signal: Signal,
    }

    #[async_trait]
    impl LivenessSource for UrgentSignal {
        async fn notified(&mut self) -> Option<()> {
            self.signal.recv().await
        }
    }

    /// Holds `F_SETOWN` on the stream for this process and puts the
    /// previous owner back on drop.
    struct OwnerGuard {
        stream: Arc<TcpStream>,
        previous: libc::c_int,
    }

    impl OwnerGuard {
        fn claim(stream: Arc<TcpStream>) -> io::Result<Self> {
            let fd = stream.as_raw_fd();

            // SAFETY: `fd` stays open for as long as `stream` is alive.
            let previous = unsafe { libc::fcntl(fd, libc::F_GETOWN) };
            if previous == -1 {
                return Err(io::Error::last_os_error());
            }

            let pid = std::process::id() as libc::c_int;
            // SAFETY: as above.
            if unsafe { libc::fcntl(fd, libc::F_SETOWN, pid) } == -1 {
                return Err(io::Error::last_os_error());
            }

            debug!("Claimed SIGURG ownership of fd {} (previous owner: {})", fd, previous);
            Ok(Self { stream, previous })
        }
    }

    impl Drop for OwnerGuard {
        fn drop(&mut self) {
            let fd = self.stream.as_raw_fd();
            // SAFETY: `self.stream` keeps `fd` open.
            if unsafe { libc::fcntl(fd, libc::F_SETOWN, self.previous) } == -1 {
                debug!(
                    "Failed to restore SIGURG owner of fd {}: {}",
                    fd,
                    io::Error::last_os_error()
                );
            }
        }
    }

    /// Current `F_GETOWN` of a stream
    #[cfg(test)]
    pub(crate) fn owner_of(stream: &TcpStream) -> libc::c_int {
        // SAFETY: the borrowed stream keeps its fd open.
        unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_GETOWN) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(connect_tcp(bound_addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let (client, server) = loopback_pair().await;
        assert_eq!(client.peer_addr().unwrap(), server.local_addr().unwrap());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::connection::Connection;
        use crate::ops::{default_probe, AnswerProbes, OnBroken};
        use crate::transport::urgent::owner_of;
        use crate::{Heartbeat, HeartbeatConfig, HeartbeatError, SessionState};
        use std::io;
        use std::sync::Arc;
        use std::time::Duration;

        #[tokio::test]
        async fn test_urgent_byte_round_trip() {
            let (client, server) = loopback_pair().await;
            let client = TcpConnection::new(Arc::new(client));
            let server = TcpConnection::new(Arc::new(server));

            assert_eq!(default_probe(&client).unwrap(), 1);

            let mut buf = [0u8; 1];
            let mut received = None;
            for _ in 0..100 {
                match server.recv_urgent(&mut buf) {
                    Ok(n) => {
                        received = Some(n);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::InvalidInput =>
                    {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(e) => panic!("unexpected out-of-band read error: {}", e),
                }
            }

            assert_eq!(received, Some(1));
            assert_eq!(&buf, b"1");
        }

        #[tokio::test]
        async fn test_subscription_claims_and_restores_owner() {
            let (client, _server) = loopback_pair().await;
            let client = Arc::new(client);
            let conn = TcpConnection::new(client.clone());

            let before = owner_of(&client);
            let subscription = conn.subscribe().unwrap();
            assert_eq!(owner_of(&client), std::process::id() as libc::c_int);

            drop(subscription);
            assert_eq!(owner_of(&client), before);
        }

        #[tokio::test]
        async fn test_label_is_peer_address() {
            let (client, server) = loopback_pair().await;
            let conn = TcpConnection::new(Arc::new(client));
            assert_eq!(conn.label(), server.local_addr().unwrap().to_string());
        }

        #[tokio::test]
        async fn test_staggered_peers_keep_each_other_alive() {
            let (client, server) = loopback_pair().await;
            let client = TcpConnection::new(Arc::new(client));
            let server = TcpConnection::new(Arc::new(server));
            let config = HeartbeatConfig::new(Duration::from_secs(1), 2);
            let window = config.normalized().detection_window();

            let mut a = Heartbeat::new();
            let mut b = Heartbeat::new();
            a.register(
                Arc::new(client),
                &config,
                AnswerProbes(OnBroken(|_: &HeartbeatError| {})),
            )
            .unwrap();
            // `a` always expires first, so `b` never reaches its own timer
            tokio::time::sleep(Duration::from_millis(300)).await;
            b.register(
                Arc::new(server),
                &config,
                AnswerProbes(OnBroken(|_: &HeartbeatError| {})),
            )
            .unwrap();

            tokio::time::sleep(window + Duration::from_millis(1500)).await;

            assert!(matches!(a.state(), SessionState::Armed { .. }), "a: {:?}", a.stats());
            assert!(matches!(b.state(), SessionState::Armed { .. }), "b: {:?}", b.stats());
            let stats_a = a.stats().unwrap();
            let stats_b = b.stats().unwrap();
            assert!(stats_a.probes_sent >= 3);
            assert!(stats_a.liveness_events >= 3);
            assert!(stats_b.liveness_events >= 3);

            a.unregister();
            b.unregister();
        }
    }
}
