//! Agent configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default HTTP/WebSocket listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8420";

/// Output format of the process logger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, colored lines.
    Pretty,
    /// One JSON object per line.
    #[default]
    Json,
}

/// Per-connection stream bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLimits {
    /// Concurrent `logs` subscriptions per connection.
    pub max_log_streams: usize,
    /// Concurrent `container_stats` subscriptions per connection.
    pub max_stats_streams: usize,
    /// Push period used when the client asks for none (or less than 1s).
    pub default_interval_secs: u64,
    /// Upper bound on a requested push period.
    pub max_interval_secs: u64,
    /// Log lines replayed before following.
    pub log_tail_lines: usize,
    /// Log frames larger than this are skipped.
    pub max_log_frame_bytes: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_log_streams: 3,
            max_stats_streams: 3,
            default_interval_secs: 3,
            max_interval_secs: 30,
            log_tail_lines: 50,
            max_log_frame_bytes: 1024 * 1024,
        }
    }
}

impl StreamLimits {
    /// Clamp a requested push period.
    ///
    /// Missing or sub-second requests fall back to the default; anything above
    /// the maximum is capped.
    #[must_use]
    pub fn interval(&self, requested: Option<i64>) -> Duration {
        let secs = match requested.and_then(|secs| u64::try_from(secs).ok()) {
            Some(secs) if secs >= 1 => secs.min(self.max_interval_secs),
            _ => self.default_interval_secs,
        };
        Duration::from_secs(secs)
    }

    /// Set the per-connection log stream cap.
    #[must_use]
    pub const fn with_max_log_streams(mut self, max: usize) -> Self {
        self.max_log_streams = max;
        self
    }

    /// Set the per-connection container stats stream cap.
    #[must_use]
    pub const fn with_max_stats_streams(mut self, max: usize) -> Self {
        self.max_stats_streams = max;
        self
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Bearer token clients must present.
    pub token: String,
    /// Process log format.
    pub log_format: LogFormat,
    /// Pause before resubscribing to Docker events after a stream failure.
    pub event_reconnect_delay: Duration,
    /// Per-connection stream bounds.
    pub limits: StreamLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8420)),
            token: String::new(),
            log_format: LogFormat::default(),
            event_reconnect_delay: Duration::from_secs(2),
            limits: StreamLimits::default(),
        }
    }
}

impl AgentConfig {
    /// Create a configuration with the given token and defaults otherwise.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// Set the listen address.
    #[must_use]
    pub const fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Set the log format.
    #[must_use]
    pub const fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Set the Docker events reconnect delay.
    #[must_use]
    pub const fn with_event_reconnect_delay(mut self, delay: Duration) -> Self {
        self.event_reconnect_delay = delay;
        self
    }

    /// Set the per-connection stream bounds.
    #[must_use]
    pub fn with_limits(mut self, limits: StreamLimits) -> Self {
        self.limits = limits;
        self
    }
}
