//! Gateway limits and timers

use std::net::SocketAddr;
use std::time::Duration;

/// Server-wide configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Frames larger than this are rejected with a protocol error
    pub max_message_bytes: usize,
    /// Maximum concurrently active tasks per connection
    pub max_tasks_per_connection: usize,
    /// Wall-clock budget of a single streaming task
    pub task_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Turns kept in each connection's conversation ring
    pub history_capacity: usize,
    /// Whether `llm:*` actions require an authenticated connection
    pub llm_requires_auth: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            // 6573 is ascii for "AI"
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6573)),
            max_message_bytes: 64 * 1024,
            max_tasks_per_connection: 10,
            task_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            history_capacity: 20,
            llm_requires_auth: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            bind_addr: env_parse("BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_message_bytes: env_parse("MAX_MESSAGE_BYTES").unwrap_or(defaults.max_message_bytes),
            max_tasks_per_connection: env_parse("MAX_TASKS_PER_CONNECTION")
                .unwrap_or(defaults.max_tasks_per_connection),
            task_timeout: env_parse("TASK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_timeout),
            heartbeat_interval: env_parse("HEARTBEAT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            history_capacity: env_parse("HISTORY_CAPACITY").unwrap_or(defaults.history_capacity),
            llm_requires_auth: std::env::var("LLM_REQUIRE_AUTH")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(defaults.llm_requires_auth),
        };

        tracing::info!(
            max_tasks = config.max_tasks_per_connection,
            task_timeout_secs = config.task_timeout.as_secs(),
            heartbeat_secs = config.heartbeat_interval.as_secs(),
            llm_requires_auth = config.llm_requires_auth,
            "Gateway config loaded"
        );

        config
    }
}
