//! Command-line interface.

use std::net::SocketAddr;

use clap::Parser;
use hola_common::{HolaError, HolaResult};

use crate::config::{AgentConfig, DEFAULT_LISTEN, LogFormat, StreamLimits};

/// HoLA agent - Docker Compose host agent
#[derive(Parser, Debug)]
#[command(name = "hola-agent")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Bearer token for API authentication
    #[arg(long, env = "HOLA_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Address to listen on
    #[arg(long, env = "HOLA_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Log output format
    #[arg(long, env = "HOLA_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Concurrent log streams allowed per connection
    #[arg(long, env = "HOLA_MAX_LOG_STREAMS", default_value_t = 3)]
    pub max_log_streams: usize,

    /// Concurrent container stats streams allowed per connection
    #[arg(long, env = "HOLA_MAX_STATS_STREAMS", default_value_t = 3)]
    pub max_stats_streams: usize,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Args {
    /// Default tracing directive for this invocation.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        if self.debug {
            "hola_agent=debug"
        } else {
            "hola_agent=info"
        }
    }

    /// Build the agent configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty.
    pub fn into_config(self) -> HolaResult<AgentConfig> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err(HolaError::Config {
                message: "no auth token provided: set HOLA_TOKEN or use --token".to_string(),
            });
        }

        let limits = StreamLimits::default()
            .with_max_log_streams(self.max_log_streams)
            .with_max_stats_streams(self.max_stats_streams);

        Ok(AgentConfig::new(token)
            .with_listen(self.listen)
            .with_log_format(self.log_format)
            .with_limits(limits))
    }
}
