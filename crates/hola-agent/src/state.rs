//! Shared agent state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::StreamLimits;
use crate::docker::DockerApi;
use crate::hub::EventHub;
use crate::metrics::MetricsSource;

/// Collaborators every WebSocket session uses.
///
/// Docker and the event hub are optional; streams needing a missing one are
/// answered with `NOT_AVAILABLE`.
#[derive(Clone)]
pub struct AgentServices {
    /// Fan-out of Docker container events.
    pub hub: Option<Arc<EventHub>>,
    /// Docker daemon client.
    pub docker: Option<Arc<dyn DockerApi>>,
    /// Host metrics source.
    pub metrics: Arc<dyn MetricsSource>,
    /// Per-connection stream bounds.
    pub limits: StreamLimits,
}

impl AgentServices {
    /// Services with only a metrics source.
    #[must_use]
    pub fn new(metrics: Arc<dyn MetricsSource>) -> Self {
        Self {
            hub: None,
            docker: None,
            metrics,
            limits: StreamLimits::default(),
        }
    }

    /// Attach a Docker client.
    #[must_use]
    pub fn with_docker(mut self, docker: Arc<dyn DockerApi>) -> Self {
        self.docker = Some(docker);
        self
    }

    /// Attach an event hub.
    #[must_use]
    pub fn with_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Set the per-connection stream bounds.
    #[must_use]
    pub fn with_limits(mut self, limits: StreamLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// State shared by HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session collaborators.
    pub services: Arc<AgentServices>,
    /// Bearer token clients must present.
    pub token: Arc<str>,
    /// Root cancellation token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create the state.
    #[must_use]
    pub fn new(services: AgentServices, token: &str, shutdown: CancellationToken) -> Self {
        Self {
            services: Arc::new(services),
            token: Arc::from(token),
            shutdown,
        }
    }
}
