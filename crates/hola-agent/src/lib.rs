//! # hola-agent
//!
//! Host agent for a single Docker host.
//!
//! The agent exposes a small authenticated HTTP API and a WebSocket endpoint
//! over which clients subscribe to live streams:
//! - Host metrics snapshots
//! - Docker container lifecycle events
//! - Followed container logs
//! - Per-container CPU and memory stats
//!
//! Each connection owns its subscriptions; closing it cancels every stream it
//! started.

#![warn(missing_docs)]

pub mod api;
pub mod cli;
pub mod config;
pub mod docker;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod state;
pub mod streams;
pub mod ws;

#[cfg(test)]
mod testing;

pub use config::{AgentConfig, LogFormat, StreamLimits};
pub use docker::{DockerApi, DockerEngine};
pub use hub::{EventHub, EventSource};
pub use metrics::{MetricsSource, SystemMetrics, SystemSampler};
pub use state::{AgentServices, AppState};
