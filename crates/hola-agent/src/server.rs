//! Process wiring.

use std::sync::Arc;

use hola_common::HolaResult;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::config::AgentConfig;
use crate::docker::DockerEngine;
use crate::hub::{EventHub, EventSource};
use crate::metrics::SystemSampler;
use crate::state::{AgentServices, AppState};

/// Serve the API on `listener` until the state's shutdown token is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails to accept connections.
pub async fn serve(listener: TcpListener, state: AppState) -> HolaResult<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Connect to Docker, start the event source and serve until SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns an error if the Docker client cannot be created or the listen
/// address cannot be bound.
pub async fn run(config: AgentConfig) -> HolaResult<()> {
    let docker = Arc::new(DockerEngine::connect()?);
    if let Err(err) = docker.ping().await {
        warn!(error = %err, "Docker daemon not reachable yet");
    }

    let shutdown = CancellationToken::new();
    let hub = Arc::new(EventHub::new());
    let source = EventSource::new(docker.clone(), hub.clone())
        .with_reconnect_delay(config.event_reconnect_delay);
    let events = tokio::spawn(source.run(shutdown.clone()));

    let services = AgentServices::new(Arc::new(SystemSampler::new()))
        .with_docker(docker)
        .with_hub(hub)
        .with_limits(config.limits);
    let state = AppState::new(services, &config.token, shutdown.clone());

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        listen = %listener.local_addr()?,
        version = env!("CARGO_PKG_VERSION"),
        "starting HoLA agent"
    );

    tokio::spawn(wait_for_signal(shutdown.clone()));
    let served = serve(listener, state).await;

    shutdown.cancel();
    let _ = events.await;
    info!("HoLA agent stopped");
    served
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let signal = tokio::select! {
        () = shutdown.cancelled() => return,
        name = signal_received() => name,
    };
    info!(%signal, "shutting down");
    shutdown.cancel();
}

#[cfg(unix)]
async fn signal_received() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn signal_received() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
