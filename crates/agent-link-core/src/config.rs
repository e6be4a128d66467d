//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::RequestConfig;

/// Default per-exchange and connect timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of automatic reconnection attempts.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Default fixed delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Connection and request settings for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Agent host name or address.
    pub host: String,
    /// Agent port.
    pub port: u16,
    /// Deadline for connecting and for each exchange.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Automatic reconnection attempts after an unexpected close.
    pub reconnect_attempts: u32,
    /// Fixed delay before each reconnection attempt.
    #[serde(rename = "reconnect_delay_ms", with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// Options attached to every request unless overridden.
    pub request: RequestConfig,
    /// Whether the agent may call tools while answering.
    pub use_tools: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            timeout: DEFAULT_TIMEOUT,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            request: RequestConfig {
                max_tokens: Some(2000),
                ask_before_tool_execution: Some(true),
                ..RequestConfig::default()
            },
            use_tools: true,
        }
    }
}

impl ClientConfig {
    /// Create a config for the given endpoint with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse a (possibly partial) JSON document over the defaults.
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON or has wrongly typed fields.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// WebSocket URL of the agent.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_request_config(mut self, request: RequestConfig) -> Self {
        self.request = request;
        self
    }

    #[must_use]
    pub const fn with_use_tools(mut self, use_tools: bool) -> Self {
        self.use_tools = use_tools;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
