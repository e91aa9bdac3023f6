//! Heartbeat node binary.
//!
//! Dials and/or accepts TCP peers and runs an urgent-data heartbeat on every
//! connection. Each end answers the other's probes with an urgent reply, so
//! whichever side's timer fires first, both sides see liveness. Dialed peers
//! are redialed with exponential backoff after the connection is declared
//! broken.

use anyhow::Context;
use clap::Parser;
use heartbeat_session::{
    connect_tcp, listen_tcp, AnswerProbes, Heartbeat, HeartbeatConfig, HeartbeatError, OnBroken,
    TcpConnection,
};
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::NodeLogFormatter;

/// Longest wait between redial attempts
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// TCP peer liveness monitor
#[derive(Parser, Debug)]
#[command(name = "redb-heartbeat", version, about = "TCP peer liveness monitor using urgent-data heartbeats")]
struct Args {
    /// Peer to dial, e.g. 127.0.0.1:9100
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Listen address, e.g. 0.0.0.0:9100
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Heartbeat interval, e.g. 10s (minimum 1s)
    #[arg(long)]
    interval: Option<humantime::Duration>,

    /// Unanswered probes before a connection is declared broken
    #[arg(long, allow_hyphen_values = true)]
    max_probes: Option<i64>,

    /// Do not redial after a broken connection
    #[arg(long)]
    no_reconnect: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

/// How a monitored connection ended
#[derive(Debug, PartialEq, Eq)]
enum ConnectionEnd {
    /// The heartbeat declared the peer dead
    Broken,
    /// The peer closed the stream
    PeerClosed,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("redb_heartbeat={}", args.log_level).parse()?)
        .add_directive(format!("heartbeat_session={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(NodeLogFormatter::new())
        .init();

    info!("Starting reDB Heartbeat v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    apply_args(&mut node_config, &args);

    if node_config.peer.is_none() && node_config.listen.is_none() {
        anyhow::bail!("Nothing to monitor: pass --connect and/or --listen");
    }

    let heartbeat_config = node_config.heartbeat_config();
    let policy = heartbeat_config.normalized();
    info!(
        "Heartbeat policy: interval={:?}, max_probes={}, detection window={:?}",
        policy.interval,
        policy.max_probes,
        policy.detection_window()
    );

    let listener_task = node_config.listen.map(|addr| {
        let config = heartbeat_config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_listener(addr, config).await {
                error!(role = "listener", "Listener on {} failed: {:#}", addr, e);
            }
        })
    });

    let mut dialer_task = node_config.peer.map(|addr| {
        let config = heartbeat_config.clone();
        let reconnect = node_config.reconnect;
        tokio::spawn(async move { run_dialer(addr, config, reconnect).await })
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = async {
            match dialer_task.as_mut() {
                Some(task) if listener_task.is_none() => {
                    let _ = task.await;
                }
                _ => std::future::pending::<()>().await,
            }
        } => info!("Dialer finished, shutting down"),
    }

    // Dropping the tasks' heartbeats unregisters them
    if let Some(task) = dialer_task {
        task.abort();
    }
    if let Some(task) = listener_task {
        task.abort();
    }

    info!("Heartbeat node stopped");
    Ok(())
}

/// Command-line flags take precedence over file and environment settings
fn apply_args(config: &mut NodeConfig, args: &Args) {
    if let Some(peer) = args.connect {
        config.peer = Some(peer);
    }
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }
    if let Some(interval) = &args.interval {
        config.interval = **interval;
    }
    if let Some(max_probes) = args.max_probes {
        config.max_probes = max_probes;
    }
    if args.no_reconnect {
        config.reconnect = false;
    }
}

/// Accept peers and monitor each on its own task
async fn run_listener(addr: SocketAddr, config: HeartbeatConfig) -> anyhow::Result<()> {
    let listener = listen_tcp(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(role = "listener", "Accepting peers on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(role = "listener", "Accept failed: {}", e);
                continue;
            }
        };
        info!(role = "listener", peer = %peer, "Accepted peer");

        let config = config.clone();
        tokio::spawn(async move {
            match monitor_connection(stream, &config).await {
                Ok(ConnectionEnd::Broken) => {
                    warn!(role = "listener", peer = %peer, "Dropped unresponsive peer");
                }
                Ok(ConnectionEnd::PeerClosed) => {
                    info!(role = "listener", peer = %peer, "Peer disconnected");
                }
                Err(e) => {
                    warn!(role = "listener", peer = %peer, "Session ended with error: {:#}", e);
                }
            }
        });
    }
}

/// Dial `addr`, monitor the connection, and redial after it ends
async fn run_dialer(addr: SocketAddr, config: HeartbeatConfig, reconnect: bool) {
    let mut backoff = Duration::from_secs(1);

    loop {
        info!(role = "dialer", peer = %addr, "Connecting");

        match connect_tcp(addr).await {
            Ok(stream) => {
                backoff = Duration::from_secs(1);

                match monitor_connection(stream, &config).await {
                    Ok(ConnectionEnd::Broken) => {
                        warn!(role = "dialer", peer = %addr, "Connection declared broken");
                    }
                    Ok(ConnectionEnd::PeerClosed) => {
                        info!(role = "dialer", peer = %addr, "Connection closed by peer");
                    }
                    Err(e) => {
                        warn!(role = "dialer", peer = %addr, "Connection ended with error: {:#}", e);
                    }
                }

                if !reconnect {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            Err(e) => {
                if !reconnect {
                    error!(role = "dialer", peer = %addr, "Failed to connect: {}", e);
                    return;
                }
                warn!(
                    role = "dialer",
                    peer = %addr,
                    retry_in = ?backoff,
                    "Failed to connect: {}",
                    e
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Run a heartbeat on `stream` until the peer is declared dead or closes.
///
/// Ordinary inbound data also proves the peer alive and resets the
/// heartbeat. The stream is closed when this returns.
async fn monitor_connection(
    stream: TcpStream,
    config: &HeartbeatConfig,
) -> anyhow::Result<ConnectionEnd> {
    let stream = Arc::new(stream);
    let peer = stream.peer_addr()?;

    let mut heartbeat = Heartbeat::new();
    heartbeat
        .register(
            Arc::new(TcpConnection::new(stream.clone())),
            config,
            AnswerProbes(OnBroken(move |reason: &HeartbeatError| {
                error!(role = "conn", peer = %peer, "Peer presumed dead: {}", reason);
            })),
        )
        .with_context(|| format!("Failed to start heartbeat for {}", peer))?;

    let mut buf = vec![0u8; 4096];
    let end = loop {
        tokio::select! {
            _ = heartbeat.wait_broken() => break ConnectionEnd::Broken,

            ready = stream.readable() => {
                ready.with_context(|| format!("Failed to poll {}", peer))?;
                match stream.try_read(&mut buf) {
                    Ok(0) => break ConnectionEnd::PeerClosed,
                    Ok(n) => {
                        debug!(role = "conn", peer = %peer, "Received {} byte(s)", n);
                        heartbeat.reset();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("Failed to read from {}", peer));
                    }
                }
            }
        }
    };

    if let Some(stats) = heartbeat.stats() {
        info!(role = "conn", peer = %peer, stats = ?stats, "Session ended");
    }
    heartbeat.unregister();
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(connect_tcp(bound_addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_monitor_reports_peer_close() {
        let (client, mut server) = loopback_pair().await;
        let config = HeartbeatConfig::new(Duration::from_secs(5), 3);

        let monitor = tokio::spawn(async move { monitor_connection(client, &config).await });

        server.write_all(b"hello").await.unwrap();
        drop(server);

        let end = timeout(Duration::from_secs(2), monitor).await.unwrap().unwrap().unwrap();
        assert_eq!(end, ConnectionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_monitor_declares_silent_peer_broken() {
        // The server side never subscribes, so no urgent data ever comes back
        let (client, _server) = loopback_pair().await;
        let config = HeartbeatConfig::new(Duration::from_secs(1), 1);

        let end = timeout(Duration::from_secs(5), monitor_connection(client, &config))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, ConnectionEnd::Broken);
    }

    #[tokio::test]
    async fn test_two_nodes_stay_connected_when_started_apart() {
        let (client, server) = loopback_pair().await;
        let config = HeartbeatConfig::new(Duration::from_secs(1), 2);
        let window = config.normalized().detection_window();

        let dialer_config = config.clone();
        let dialer = tokio::spawn(async move { monitor_connection(client, &dialer_config).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        let acceptor = tokio::spawn(async move { monitor_connection(server, &config).await });

        tokio::time::sleep(window + Duration::from_millis(1500)).await;
        assert!(!dialer.is_finished());
        assert!(!acceptor.is_finished());

        dialer.abort();
        acceptor.abort();
    }

    #[test]
    fn test_args_keep_sub_second_interval() {
        let args = Args::parse_from([
            "redb-heartbeat",
            "--listen",
            "0.0.0.0:9100",
            "--interval",
            "1500ms",
            "--no-reconnect",
        ]);
        let mut config = NodeConfig::default();
        apply_args(&mut config, &args);

        assert_eq!(config.interval, Duration::from_millis(1500));
        assert_eq!(
            config.heartbeat_config().normalized().interval,
            Duration::from_millis(1500)
        );
        assert_eq!(config.listen, Some("0.0.0.0:9100".parse().unwrap()));
        assert!(!config.reconnect);
    }

    #[test]
    fn test_args_parse_negative_probe_count() {
        let args = Args::parse_from([
            "redb-heartbeat",
            "--connect",
            "127.0.0.1:9100",
            "--interval",
            "2s",
            "--max-probes",
            "-5",
        ]);
        assert_eq!(args.connect, Some("127.0.0.1:9100".parse().unwrap()));
        assert_eq!(Duration::from(args.interval.unwrap()), Duration::from_secs(2));
        assert_eq!(args.max_probes, Some(-5));
        assert!(!args.no_reconnect);
    }
}
