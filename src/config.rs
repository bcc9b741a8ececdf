//! Node, client and server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::MsgError;

/// Default throughput logging window.
pub const DEFAULT_COUNTER_WINDOW: Duration = Duration::from_secs(5);

/// Default keepalive sweep tick.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Default idle time after which a session is pinged.
pub const DEFAULT_IDLE_SOFT: Duration = Duration::from_secs(20);

/// Default idle time after which a session is closed.
pub const DEFAULT_IDLE_HARD: Duration = Duration::from_secs(60);

/// Default capacity of the completed-response queue.
pub const DEFAULT_RESPONSE_QUEUE_CAPACITY: usize = 1024;

/// Default delay between dial attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration shared by clients and servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Window over which read/write counts are accumulated and logged
    #[serde(with = "millis")]
    pub counter_window: Duration,
    /// How often sessions are checked for idleness
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,
    /// Idle time after which a session receives a ping
    #[serde(with = "millis")]
    pub idle_soft: Duration,
    /// Idle time after which a session is closed
    #[serde(with = "millis")]
    pub idle_hard: Duration,
    /// Capacity of the queue holding finished request handlers' responses
    pub response_queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            counter_window: DEFAULT_COUNTER_WINDOW,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            idle_soft: DEFAULT_IDLE_SOFT,
            idle_hard: DEFAULT_IDLE_HARD,
            response_queue_capacity: DEFAULT_RESPONSE_QUEUE_CAPACITY,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), MsgError> {
        if self.counter_window.is_zero() {
            return Err(MsgError::Config("counter_window must be non-zero".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(MsgError::Config(
                "keepalive_interval must be non-zero".into(),
            ));
        }
        if self.idle_hard <= self.idle_soft {
            return Err(MsgError::Config(format!(
                "idle_hard ({:?}) must be longer than idle_soft ({:?})",
                self.idle_hard, self.idle_soft
            )));
        }
        if self.response_queue_capacity == 0 {
            return Err(MsgError::Config(
                "response_queue_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`crate::tcp::Client`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Address to dial
    pub addr: String,
    /// Keep dialing on failure and reconnect after an unexpected close
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,
    /// Delay between dial attempts
    #[serde(with = "millis", default = "default_retry_interval")]
    pub retry_interval: Duration,
    #[serde(default)]
    pub node: NodeConfig,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            auto_retry: default_auto_retry(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            node: NodeConfig::default(),
        }
    }

    pub fn with_auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, MsgError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MsgError> {
        if self.addr.is_empty() {
            return Err(MsgError::Config("addr must not be empty".into()));
        }
        if self.auto_retry && self.retry_interval.is_zero() {
            return Err(MsgError::Config(
                "retry_interval must be non-zero when auto_retry is enabled".into(),
            ));
        }
        self.node.validate()
    }
}

/// Configuration for a [`crate::tcp::Server`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub addr: String,
    #[serde(default)]
    pub node: NodeConfig,
}

impl ServerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            node: NodeConfig::default(),
        }
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, MsgError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MsgError> {
        if self.addr.is_empty() {
            return Err(MsgError::Config("addr must not be empty".into()));
        }
        self.node.validate()
    }
}

fn default_auto_retry() -> bool {
    true
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

/// Durations as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
