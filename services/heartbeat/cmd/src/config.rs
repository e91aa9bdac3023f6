//! Configuration handling for the heartbeat node.
//!
//! This module reads the `services.heartbeat` section of the shared config
//! file, then applies environment variable overrides. Command-line flags are
//! applied on top by `main`.

use anyhow::{Context, Result};
use heartbeat_session::HeartbeatConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Heartbeat node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Time between heartbeat timer expiries
    pub interval: Duration,
    /// Unanswered probes tolerated before a connection is declared broken
    pub max_probes: i64,
    /// Peer to dial
    pub peer: Option<SocketAddr>,
    /// Address to accept peers on
    pub listen: Option<SocketAddr>,
    /// Whether the dialer reconnects after a broken connection
    pub reconnect: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_probes: 3,
            peer: None,
            listen: None,
            reconnect: true,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    heartbeat: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_environment_overrides();

        info!(
            "Final heartbeat configuration: interval={}, max_probes={}, peer={:?}, listen={:?}",
            humantime::format_duration(config.interval),
            config.max_probes,
            config.peer,
            config.listen
        );

        Ok(config)
    }

    /// Policy handed to each heartbeat session
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig::new(self.interval, self.max_probes)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        if let Some(service) = root_config.services.and_then(|s| s.heartbeat) {
            self.apply_service_config(service)?;
        }
        Ok(())
    }

    fn apply_service_config(&mut self, service_config: ServiceConfig) -> Result<()> {
        if let Some(args) = service_config.args {
            for arg in args {
                if let Some(addr) = arg.strip_prefix("--connect=") {
                    self.peer = Some(addr.parse().with_context(|| format!("invalid {}", arg))?);
                } else if let Some(addr) = arg.strip_prefix("--listen=") {
                    self.listen = Some(addr.parse().with_context(|| format!("invalid {}", arg))?);
                }
            }
        }

        if let Some(config_map) = service_config.config {
            for (key, value) in config_map {
                match key.as_str() {
                    "services.heartbeat.interval" => {
                        self.interval = parse_interval(&value)
                            .with_context(|| format!("invalid services.heartbeat.interval {:?}", value))?;
                    }
                    "services.heartbeat.max_probes" => {
                        if let Ok(probes) = value.parse::<i64>() {
                            self.max_probes = probes;
                        }
                    }
                    "services.heartbeat.reconnect" => {
                        self.reconnect = value.to_lowercase() == "true";
                    }
                    _ => {
                        // Ignore unknown configuration keys
                    }
                }
            }
        }

        Ok(())
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(interval) = std::env::var("HEARTBEAT_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.interval = Duration::from_secs(secs);
                info!("Interval overridden by environment: {}s", secs);
            }
        }

        if let Ok(max_probes) = std::env::var("HEARTBEAT_MAX_PROBES") {
            if let Ok(probes) = max_probes.parse::<i64>() {
                self.max_probes = probes;
                info!("Max probes overridden by environment: {}", probes);
            }
        }

        if let Ok(peer) = std::env::var("HEARTBEAT_PEER") {
            match peer.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.peer = Some(addr);
                    info!("Peer overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring HEARTBEAT_PEER={}: {}", peer, e),
            }
        }

        if let Ok(listen) = std::env::var("HEARTBEAT_LISTEN") {
            match listen.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.listen = Some(addr);
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring HEARTBEAT_LISTEN={}: {}", listen, e),
            }
        }
    }
}

/// Bare numbers are seconds; anything else is a humantime duration (`1500ms`, `2s`)
pub fn parse_interval(value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).with_context(|| format!("not a duration: {:?}", value))
}
