//! Docker event fan-out.
//!
//! [`EventSource`] keeps a subscription to the daemon's event feed alive and
//! hands container events to the [`EventHub`], which pushes them to every
//! connection subscribed to `events`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hola_common::id::short_id;
use hola_common::protocol::{ContainerEvent, LifecycleAction};
use hola_common::{Envelope, MessageType};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::docker::{DaemonEvent, DockerApi};
use crate::ws::ConnectionHandle;

/// Label Docker Compose puts on every container of a project.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Build the client-facing event, or `None` for events clients don't get.
#[must_use]
pub fn container_event(raw: &DaemonEvent) -> Option<ContainerEvent> {
    if !raw.is_container() {
        return None;
    }
    let action = LifecycleAction::from_action(&raw.action)?;

    Some(ContainerEvent {
        action,
        container_id: short_id(&raw.actor_id).to_string(),
        container_name: raw.attribute("name").to_string(),
        image: raw.attribute("image").to_string(),
        stack: raw.attribute(COMPOSE_PROJECT_LABEL).to_string(),
        status: action.as_str().to_string(),
        time: raw.time,
    })
}

struct Subscriber {
    conn: ConnectionHandle,
    token: CancellationToken,
}

/// Set of connections subscribed to container events.
///
/// Delivery is best effort: a broadcast never waits on a subscriber, and a
/// failed send is logged and dropped. Subscribers leave only through
/// [`EventHub::unsubscribe`]; cancelled ones are skipped until then.
#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver future events to `conn` until `token` is cancelled.
    ///
    /// Subscribing the same connection twice registers it twice.
    pub fn subscribe(&self, token: CancellationToken, conn: ConnectionHandle) {
        self.subscribers.write().push(Subscriber { conn, token });
    }

    /// Remove every registration of `conn`. A no-op if there are none.
    pub fn unsubscribe(&self, conn: &ConnectionHandle) {
        let id = conn.id();
        self.subscribers.write().retain(|sub| sub.conn.id() != id);
    }

    /// Number of registrations, cancelled ones included.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Push `event` to every live subscriber. Returns the number of delivery
    /// attempts made.
    pub fn broadcast(&self, event: &ContainerEvent) -> usize {
        let envelope = match Envelope::with_payload(MessageType::ContainerEvent, event) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "failed to encode container event");
                return 0;
            }
        };

        let subscribers = self.subscribers.read();
        let mut attempts = 0;
        for sub in subscribers.iter().filter(|sub| !sub.token.is_cancelled()) {
            attempts += 1;
            if let Err(err) = sub.conn.try_send(envelope.clone()) {
                debug!(conn_id = %sub.conn.id(), error = %err, "event send failed");
            }
        }
        attempts
    }

    /// Filter a raw daemon event and broadcast it if clients want it.
    pub fn publish(&self, raw: &DaemonEvent) -> usize {
        container_event(raw).map_or(0, |event| self.broadcast(&event))
    }
}

/// Keeps the hub fed from the Docker event stream.
pub struct EventSource {
    docker: Arc<dyn DockerApi>,
    hub: Arc<EventHub>,
    reconnect_delay: Duration,
}

impl EventSource {
    /// Create an event source resubscribing 2 seconds after a failure.
    #[must_use]
    pub fn new(docker: Arc<dyn DockerApi>, hub: Arc<EventHub>) -> Self {
        Self {
            docker,
            hub,
            reconnect_delay: Duration::from_secs(2),
        }
    }

    /// Set the pause between a stream failure and the next subscription.
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            self.listen_once(&shutdown).await;

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        debug!("event source stopped");
    }

    async fn listen_once(&self, shutdown: &CancellationToken) {
        let mut events = self.docker.events();
        info!("subscribed to Docker events");

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if event.is_container() {
                        self.hub.publish(&event);
                    }
                }
                Some(Err(err)) => {
                    warn!(error = %err, "Docker events stream error");
                    return;
                }
                None => {
                    warn!("Docker events stream ended");
                    return;
                }
            }
        }
    }
}
