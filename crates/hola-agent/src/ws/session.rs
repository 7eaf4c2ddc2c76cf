//! Per-connection subscription state.
//!
//! A [`Session`] is driven by its socket's read loop, one message at a time,
//! so the subscription map needs no lock. Every stream task is spawned on the
//! session's [`TaskTracker`] with a child of the session token; closing the
//! session cancels the token and waits for all of them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use hola_common::protocol::{SubscribePayload, UnsubscribeAck};
use hola_common::{Envelope, ErrorCode, MessageType, StreamKind};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::ConnectionHandle;
use crate::state::AgentServices;
use crate::streams::{follow_logs, stream_container_stats, stream_metrics};

/// A stream task ended on its own.
#[derive(Debug)]
pub struct Finished {
    key: StreamKind,
    generation: u64,
}

struct Subscription {
    token: CancellationToken,
    generation: u64,
}

struct Rejection {
    code: ErrorCode,
    message: String,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Subscription registry and message dispatch for one connection.
pub struct Session {
    conn: ConnectionHandle,
    services: Arc<AgentServices>,
    token: CancellationToken,
    tracker: TaskTracker,
    subscriptions: HashMap<StreamKind, Subscription>,
    next_generation: u64,
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: mpsc::UnboundedReceiver<Finished>,
}

impl Session {
    /// Create a session whose tasks are cancelled along with `parent`.
    #[must_use]
    pub fn new(
        conn: ConnectionHandle,
        services: Arc<AgentServices>,
        parent: &CancellationToken,
    ) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            conn,
            services,
            token: parent.child_token(),
            tracker: TaskTracker::new(),
            subscriptions: HashMap::new(),
            next_generation: 0,
            finished_tx,
            finished_rx,
        }
    }

    /// Whether `key` is currently subscribed.
    #[must_use]
    pub fn is_subscribed(&self, key: &StreamKind) -> bool {
        self.subscriptions.contains_key(key)
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Handle one raw frame from the socket.
    pub async fn handle_frame(&mut self, frame: &[u8]) {
        match serde_json::from_slice::<Envelope>(frame) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(err) => {
                debug!(conn_id = %self.conn.id(), error = %err, "invalid frame");
                self.send(Envelope::error(
                    ErrorCode::BadPayload,
                    format!("invalid message: {err}"),
                ))
                .await;
            }
        }
    }

    /// Handle one decoded envelope.
    pub async fn dispatch(&mut self, envelope: Envelope) {
        match envelope.message_type() {
            Some(MessageType::Subscribe) => self.subscribe(envelope).await,
            Some(MessageType::Unsubscribe) => self.unsubscribe(envelope).await,
            Some(MessageType::Ping) => self.send(Envelope::new(MessageType::Pong)).await,
            _ => {
                let message = format!("unknown message type: {}", envelope.kind);
                self.send(Envelope::error(ErrorCode::UnknownType, message).with_id(envelope.id))
                    .await;
            }
        }
    }

    async fn subscribe(&mut self, envelope: Envelope) {
        match self.admit(&envelope) {
            Ok((kind, request)) => {
                // Ack first so it precedes the stream's first message.
                let ack = reply(MessageType::Subscribed, &kind.ack(), envelope.id);
                self.send(ack).await;
                self.start(kind, request.interval_seconds);
            }
            Err(rejection) => {
                self.send(Envelope::error(rejection.code, rejection.message).with_id(envelope.id))
                    .await;
            }
        }
    }

    fn admit(&self, envelope: &Envelope) -> Result<(StreamKind, SubscribePayload), Rejection> {
        let request: SubscribePayload = envelope.payload_as().map_err(|err| {
            Rejection::new(
                ErrorCode::BadPayload,
                format!("invalid subscribe payload: {err}"),
            )
        })?;

        let kind = StreamKind::from_request(&request).map_err(|code| {
            let message = match code {
                ErrorCode::UnknownStream => format!("unknown stream: {}", request.stream),
                ErrorCode::MissingContainerId => {
                    format!("container_id is required for {}", request.stream)
                }
                _ => "invalid container_id".to_string(),
            };
            Rejection::new(code, message)
        })?;

        if self.subscriptions.contains_key(&kind) {
            return Err(Rejection::new(
                ErrorCode::AlreadySubscribed,
                format!("already subscribed to {kind}"),
            ));
        }

        let limits = &self.services.limits;
        let cap = match &kind {
            StreamKind::Metrics => None,
            StreamKind::Events => {
                if self.services.hub.is_none() {
                    return Err(Rejection::new(
                        ErrorCode::NotAvailable,
                        "event hub not available",
                    ));
                }
                None
            }
            StreamKind::Logs(_) => Some((limits.max_log_streams, "log")),
            StreamKind::ContainerStats(_) => Some((limits.max_stats_streams, "container stats")),
        };

        if let Some((cap, label)) = cap {
            if self.services.docker.is_none() {
                return Err(Rejection::new(
                    ErrorCode::NotAvailable,
                    "docker not available",
                ));
            }
            let active = self
                .subscriptions
                .keys()
                .filter(|key| key.name() == kind.name())
                .count();
            if active >= cap {
                return Err(Rejection::new(
                    ErrorCode::LimitExceeded,
                    format!("max {cap} concurrent {label} subscriptions"),
                ));
            }
        }

        Ok((kind, request))
    }

    fn start(&mut self, kind: StreamKind, interval: Option<i64>) {
        let token = self.token.child_token();
        let generation = self.next_generation;
        self.next_generation += 1;

        let services = &self.services;
        let conn = self.conn.clone();
        match &kind {
            StreamKind::Metrics => {
                let every = services.limits.interval(interval);
                let task = stream_metrics(token.clone(), conn, services.metrics.clone(), every);
                self.spawn(kind.clone(), generation, task);
            }
            StreamKind::Events => {
                if let Some(hub) = &services.hub {
                    hub.subscribe(token.clone(), conn);
                }
            }
            StreamKind::Logs(container_id) => {
                if let Some(docker) = &services.docker {
                    let task = follow_logs(
                        token.clone(),
                        conn,
                        docker.clone(),
                        container_id.clone(),
                        services.limits.clone(),
                    );
                    self.spawn(kind.clone(), generation, task);
                }
            }
            StreamKind::ContainerStats(container_id) => {
                if let Some(docker) = &services.docker {
                    let task = stream_container_stats(
                        token.clone(),
                        conn,
                        self.tracker.clone(),
                        docker.clone(),
                        container_id.clone(),
                        services.limits.interval(interval),
                    );
                    self.spawn(kind.clone(), generation, task);
                }
            }
        }

        info!(conn_id = %self.conn.id(), stream = %kind, "subscribed");
        self.subscriptions
            .insert(kind, Subscription { token, generation });
    }

    fn spawn<F>(&self, key: StreamKind, generation: u64, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let finished = self.finished_tx.clone();
        self.tracker.spawn(async move {
            task.await;
            let _ = finished.send(Finished { key, generation });
        });
    }

    async fn unsubscribe(&mut self, envelope: Envelope) {
        let request: SubscribePayload = match envelope.payload_as() {
            Ok(request) => request,
            Err(err) => {
                let message = format!("invalid unsubscribe payload: {err}");
                self.send(Envelope::error(ErrorCode::BadPayload, message).with_id(envelope.id))
                    .await;
                return;
            }
        };

        let removed = StreamKind::from_request(&request)
            .ok()
            .is_some_and(|kind| self.cancel(&kind));

        let response = if removed {
            reply(
                MessageType::Subscribed,
                &UnsubscribeAck::new(request.stream),
                envelope.id,
            )
        } else {
            let message = format!("not subscribed to {}", request.stream);
            Envelope::error(ErrorCode::NotSubscribed, message).with_id(envelope.id)
        };
        self.send(response).await;
    }

    /// Cancel and forget one subscription. Returns `false` if it was not active.
    fn cancel(&mut self, key: &StreamKind) -> bool {
        let Some(subscription) = self.subscriptions.remove(key) else {
            return false;
        };
        subscription.token.cancel();

        if matches!(key, StreamKind::Events) {
            if let Some(hub) = &self.services.hub {
                hub.unsubscribe(&self.conn);
            }
        }
        info!(conn_id = %self.conn.id(), stream = %key, "unsubscribed");
        true
    }

    /// Wait for a stream task to end on its own.
    pub async fn next_finished(&mut self) -> Finished {
        match self.finished_rx.recv().await {
            Some(finished) => finished,
            // The session holds a sender, so the channel never closes.
            None => std::future::pending().await,
        }
    }

    /// Drop the key of a finished stream so the client can subscribe again.
    ///
    /// A completion from an older subscription under the same key is ignored.
    pub fn retire(&mut self, finished: Finished) {
        let current = self
            .subscriptions
            .get(&finished.key)
            .is_some_and(|sub| sub.generation == finished.generation);

        if current {
            self.subscriptions.remove(&finished.key);
            debug!(conn_id = %self.conn.id(), stream = %finished.key, "stream ended");
        }
    }

    /// Cancel every subscription and wait for their tasks to finish.
    pub async fn close(self) {
        self.token.cancel();
        if self.subscriptions.contains_key(&StreamKind::Events) {
            if let Some(hub) = &self.services.hub {
                hub.unsubscribe(&self.conn);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        debug!(
            conn_id = %self.conn.id(),
            streams = self.subscriptions.len(),
            "session closed"
        );
    }

    async fn send(&self, envelope: Envelope) {
        if let Err(err) = self.conn.send(&self.token, envelope).await {
            debug!(conn_id = %self.conn.id(), error = %err, "reply dropped");
        }
    }

    #[cfg(test)]
    fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }
}

fn reply<T: Serialize>(kind: MessageType, payload: &T, id: Option<String>) -> Envelope {
    Envelope::with_payload(kind, payload)
        .unwrap_or_else(|_| Envelope::new(kind))
        .with_id(id)
}
