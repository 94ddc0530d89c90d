//! Client configuration

use std::time::Duration;

use latchkey_common::{DEFAULT_SERVER_PORT, NodeId};
use serde::Deserialize;

use crate::error::{ClientError, Result};

/// Configuration for a client node's lock manager and its server connection.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Lock server address (`host:port`)
    pub server_addr: String,
    /// Node identity; a random id is chosen when unset
    pub node_id: Option<NodeId>,
    /// Number of client lock table shards
    pub shard_count: usize,
    pub connect_timeout_ms: u64,
    /// Initial reconnect delay, doubled after every failed attempt
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
    /// How long query responses and remote try-lock answers are awaited
    pub request_timeout_ms: u64,
    /// Lock GC interval; 0 disables the periodic collector
    pub gc_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", DEFAULT_SERVER_PORT),
            node_id: None,
            shard_count: 64,
            connect_timeout_ms: 3000,
            reconnect_backoff_ms: 200,
            max_reconnect_backoff_ms: 5000,
            request_timeout_ms: 5000,
            gc_interval_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ClientError::Config(e.to_string()))
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff_ms = initial.as_millis() as u64;
        self.max_reconnect_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval_ms = interval.as_millis() as u64;
        self
    }

    /// The configured node id, or a freshly generated random one.
    pub fn resolve_node_id(&self) -> NodeId {
        self.node_id
            .unwrap_or_else(|| NodeId::new(rand::random::<u64>().max(1)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_interval_ms > 0).then(|| Duration::from_millis(self.gc_interval_ms))
    }

    /// Reconnect delay for the given (zero-based) attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let millis = self
            .reconnect_backoff_ms
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server_addr, "127.0.0.1:9420");
        assert_eq!(config.shard_count, 64);
        assert!(config.node_id.is_none());
        assert_eq!(config.gc_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::new("10.0.0.1:7000")
            .with_node_id(NodeId::new(9))
            .with_shard_count(0)
            .with_gc_interval(Duration::ZERO);
        assert_eq!(config.server_addr, "10.0.0.1:7000");
        assert_eq!(config.resolve_node_id(), NodeId::new(9));
        assert_eq!(config.shard_count, 1);
        assert_eq!(config.gc_interval(), None);
    }

    #[test]
    fn test_from_toml() {
        let config = ClientConfig::from_toml(
            r#"
            server_addr = "lock.internal:9420"
            node_id = 77
            request_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.server_addr, "lock.internal:9420");
        assert_eq!(config.node_id, Some(NodeId::new(77)));
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.shard_count, 64);

        assert!(ClientConfig::from_toml("shard_count = \"many\"").is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = ClientConfig::default().with_reconnect_backoff(
            Duration::from_millis(100),
            Duration::from_millis(1000),
        );
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(10), Duration::from_millis(1000));
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_random_node_id_when_unset() {
        let config = ClientConfig::default();
        assert_ne!(config.resolve_node_id().as_u64(), 0);
    }
}
