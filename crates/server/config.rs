//! Server configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use netsched_core::{EngineConfig, NsError, QueueConfig, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the netsched server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP API to.
    pub bind_addr: SocketAddr,
    /// sqlx SQLite URL of the job store.
    pub database_url: String,
    /// Background service and retry settings.
    pub engine: EngineConfig,
    /// Queues mounted at startup.
    pub queues: Vec<QueueConfig>,
    /// Graceful shutdown timeout for in-flight requests.
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
            database_url: "sqlite://netsched.db".to_string(),
            engine: EngineConfig::default(),
            queues: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create a new builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            NsError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Check every queue and reject duplicate names.
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::BTreeSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !names.insert(queue.name.as_str()) {
                return Err(NsError::Config(format!(
                    "queue '{}' is configured twice",
                    queue.name
                )));
            }
        }
        Ok(())
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the API bind address from a string.
    pub fn bind_addr_str(mut self, addr: &str) -> std::result::Result<Self, std::net::AddrParseError> {
        self.config.bind_addr = addr.parse()?;
        Ok(self)
    }

    /// Set the store URL.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Set the engine configuration.
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    /// Add a queue.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queues.push(queue);
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the ServerConfig.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.database_url, "sqlite://netsched.db");
        assert!(config.queues.is_empty());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.watcher_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_server_config_builder_bind_addr_str() {
        let config = ServerConfig::builder()
            .bind_addr_str("0.0.0.0:9200")
            .unwrap()
            .build();
        assert_eq!(config.bind_addr, "0.0.0.0:9200".parse().unwrap());
        assert!(ServerConfig::builder().bind_addr_str("nope").is_err());
    }

    #[test]
    fn test_server_config_builder_fluent_chain() {
        let config = ServerConfig::builder()
            .database_url("sqlite::memory:")
            .queue(QueueConfig::builder("render").timeout(60).build())
            .queue(QueueConfig::builder("batch").build())
            .shutdown_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.queues[0].timeout, 60);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ServerConfig::from_json(
            r#"{
                "bind_addr": "0.0.0.0:8080",
                "queues": [
                    {"name": "render", "timeout": 120, "worker_hosts": ["node1"]},
                    {"name": "batch", "delete_done": true}
                ],
                "engine": {"watcher_interval": 500},
                "shutdown_timeout": 10
            }"#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.database_url, "sqlite://netsched.db");
        assert_eq!(config.queues[0].name, "render");
        assert_eq!(config.queues[0].timeout, 120);
        assert_eq!(config.queues[0].worker_hosts, vec!["node1"]);
        assert_eq!(config.queues[0].max_run_attempts, 5);
        assert!(config.queues[1].delete_done);
        assert_eq!(config.engine.watcher_interval, Duration::from_millis(500));
        assert_eq!(config.engine.purge_batch_size, 100);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_json_rejects_duplicate_queue() {
        let result = ServerConfig::from_json(r#"{"queues": [{"name": "a"}, {"name": "a"}]}"#);
        assert!(matches!(result, Err(NsError::Config(_))));
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        assert!(matches!(
            ServerConfig::from_json("{not json"),
            Err(NsError::Serialization(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let result = ServerConfig::from_file("/nonexistent/netsched.json");
        assert!(matches!(result, Err(NsError::Config(_))));
    }
}
