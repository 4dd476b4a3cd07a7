//! Configuration types for dnsroute.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
use crate::node::{BroadcastPolicy, NodeOptions};
use crate::peer::LinkSettings;
use crate::replication::ReplicationSettings;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Watch-list file, one domain per line.
    pub domains: PathBuf,

    /// Entry lifetime in seconds after its last local observation.
    #[serde(default = "default_ttl")]
    pub ttl: u64,

    /// Seconds between expiry sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Persistent cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Route controller configuration.
    #[serde(default)]
    pub routes: RoutesConfig,

    /// Peer replication configuration.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Observation ingest configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.domains.as_os_str().is_empty() {
            return Err(Error::Config("`domains` must name a watch-list file".into()));
        }
        if self.sweep_interval == 0 {
            return Err(Error::Config("`sweep_interval` must be at least 1".into()));
        }
        if self.routes.mode == RouteMode::Command
            && (self.routes.announce.is_empty() || self.routes.withdraw.is_empty())
        {
            return Err(Error::Config(
                "`routes.announce` and `routes.withdraw` are required in command mode".into(),
            ));
        }
        if self.replication.keepalive_interval == 0 {
            return Err(Error::Config(
                "`replication.keepalive_interval` must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Core options.
    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            ttl: Duration::from_secs(self.ttl),
            broadcast: self.replication.broadcast,
        }
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

/// Persistent cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// sled database directory. Without it entries are not persisted.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// How routes are installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    /// Track announced routes in memory only.
    #[default]
    Table,
    /// Run external commands.
    Command,
}

/// Route controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    /// Controller kind.
    #[serde(default)]
    pub mode: RouteMode,

    /// Announce command argv. `{ip}` and `{prefix}` are substituted.
    #[serde(default)]
    pub announce: Vec<String>,

    /// Withdraw command argv. `{ip}` and `{prefix}` are substituted.
    #[serde(default)]
    pub withdraw: Vec<String>,

    /// Per-command timeout in seconds.
    #[serde(default = "default_route_timeout")]
    pub timeout: u64,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            mode: RouteMode::default(),
            announce: Vec::new(),
            withdraw: Vec::new(),
            timeout: default_route_timeout(),
        }
    }
}

/// Peer replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Address to accept peer connections on.
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Peers to dial (`host:port`).
    #[serde(default)]
    pub peers: Vec<String>,

    /// This instance's id. Random if unset.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Outbound queue bound per link.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Frame write timeout in seconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,

    /// Keepalive period in seconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// First reconnect delay in seconds.
    #[serde(default = "default_backoff_min")]
    pub backoff_min: u64,

    /// Reconnect delay ceiling in seconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max: u64,

    /// Which local observations are broadcast.
    #[serde(default)]
    pub broadcast: BroadcastPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            listen: None,
            peers: Vec::new(),
            node_id: None,
            queue_capacity: default_queue_capacity(),
            connect_timeout: default_connect_timeout(),
            write_timeout: default_write_timeout(),
            keepalive_interval: default_keepalive_interval(),
            backoff_min: default_backoff_min(),
            backoff_max: default_backoff_max(),
            broadcast: BroadcastPolicy::default(),
        }
    }
}

impl ReplicationConfig {
    /// Engine settings. A missing node id is replaced with a random UUID.
    pub fn settings(&self) -> ReplicationSettings {
        let node_id = self
            .node_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        ReplicationSettings {
            listen: self.listen,
            peers: self.peers.clone(),
            link: LinkSettings {
                node_id,
                queue_capacity: self.queue_capacity,
                handshake_timeout: Duration::from_secs(self.connect_timeout),
                write_timeout: Duration::from_secs(self.write_timeout),
                keepalive_interval: Duration::from_secs(self.keepalive_interval),
                ..LinkSettings::default()
            },
            connect_timeout: Duration::from_secs(self.connect_timeout),
            backoff_min: Duration::from_secs(self.backoff_min),
            backoff_max: Duration::from_secs(self.backoff_max),
        }
    }
}

/// Observation ingest configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Address to accept NDJSON observation streams on.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "dnsroute=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_ttl() -> u64 {
    86400
}

fn default_sweep_interval() -> u64 {
    1
}

fn default_route_timeout() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_write_timeout() -> u64 {
    5
}

fn default_keepalive_interval() -> u64 {
    10
}

fn default_backoff_min() -> u64 {
    1
}

fn default_backoff_max() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "dnsroute".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(r#"domains = "/etc/dnsroute/domains.txt""#);

        assert_eq!(config.ttl, 86400);
        assert_eq!(config.sweep_interval, 1);
        assert!(config.cache.path.is_none());
        assert_eq!(config.routes.mode, RouteMode::Table);
        assert_eq!(config.replication.queue_capacity, 1024);
        assert_eq!(config.replication.broadcast, BroadcastPolicy::EveryObservation);
        assert_eq!(config.telemetry.log_level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
            domains = "domains.txt"
            ttl = 600

            [routes]
            mode = "command"
            announce = ["ip", "route", "replace", "{prefix}", "dev", "lo"]
            withdraw = ["ip", "route", "del", "{prefix}", "dev", "lo"]

            [replication]
            listen = "0.0.0.0:6000"
            peers = ["10.0.0.2:6000"]
            node_id = "edge-1"
            keepalive_interval = 2
            broadcast = "added_only"
            "#,
        );
        config.validate().unwrap();

        let options = config.node_options();
        assert_eq!(options.ttl, Duration::from_secs(600));
        assert_eq!(options.broadcast, BroadcastPolicy::AddedOnly);

        let settings = config.replication.settings();
        assert_eq!(settings.link.node_id, "edge-1");
        assert_eq!(settings.link.keepalive_interval, Duration::from_secs(2));
        assert_eq!(settings.peers, vec!["10.0.0.2:6000".to_string()]);
    }

    #[test]
    fn test_missing_node_id_is_generated() {
        let settings = ReplicationConfig::default().settings();
        assert!(uuid::Uuid::parse_str(&settings.link.node_id).is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = parse(r#"domains = """#);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.domains = "domains.txt".into();
        config.routes.mode = RouteMode::Command;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
