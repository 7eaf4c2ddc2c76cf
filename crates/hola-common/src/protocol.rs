//! WebSocket wire protocol.
//!
//! Every frame is a JSON [`Envelope`] `{type, id?, payload?}`. Clients send
//! `subscribe`, `unsubscribe` and `ping`; the agent answers with `subscribed`,
//! `pong` or `error` and pushes `metrics`, `container_event`, `log_line` and
//! `container_stats` messages for active streams.
//!
//! The `id` is a client-chosen correlation token. It is echoed on replies to a
//! specific request and never set on push messages.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::id::ContainerId;

/// Message types carried in [`Envelope::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client request to start a stream.
    Subscribe,
    /// Client request to stop a stream.
    Unsubscribe,
    /// Client keepalive.
    Ping,
    /// Acknowledgement of a subscribe or unsubscribe request.
    Subscribed,
    /// Reply to `ping`.
    Pong,
    /// Request rejected or stream failed.
    Error,
    /// Host metrics snapshot.
    Metrics,
    /// Docker container lifecycle event.
    ContainerEvent,
    /// One line of container output.
    LogLine,
    /// Per-container CPU and memory sample.
    ContainerStats,
}

impl MessageType {
    /// The wire name of this message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Ping => "ping",
            Self::Subscribed => "subscribed",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Metrics => "metrics",
            Self::ContainerEvent => "container_event",
            Self::LogLine => "log_line",
            Self::ContainerStats => "container_stats",
        }
    }

    /// Look up a message type by its wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        let kind = match name {
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "ping" => Self::Ping,
            "subscribed" => Self::Subscribed,
            "pong" => Self::Pong,
            "error" => Self::Error,
            "metrics" => Self::Metrics,
            "container_event" => Self::ContainerEvent,
            "log_line" => Self::LogLine,
            "container_stats" => Self::ContainerStats,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope wrapping every WebSocket message.
///
/// `kind` stays a plain string so that unknown types can be reported back to
/// the client verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type, see [`MessageType`]. Empty if the client sent none.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Client-supplied correlation token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Type-specific body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// An envelope with no id and no payload, e.g. `{"type":"pong"}`.
    #[must_use]
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            id: None,
            payload: None,
        }
    }

    /// An envelope carrying `payload` serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `payload` cannot be represented as JSON.
    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            payload: Some(serde_json::to_value(payload)?),
            ..Self::new(kind)
        })
    }

    /// An `error` envelope with the given code and human-readable message.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            payload: Some(json!({ "error": message.into(), "code": code.as_str() })),
            ..Self::new(MessageType::Error)
        }
    }

    /// Attach (or clear) the correlation id.
    #[must_use]
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// The parsed message type, if it is one the protocol knows.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_wire(&self.kind)
    }

    /// Decode the payload into `T`. A missing payload decodes as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match &self.payload {
            Some(value) => T::deserialize(value),
            None => T::deserialize(&Value::Null),
        }
    }
}

/// Stable error codes reported in `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The envelope `type` is not a client message type.
    UnknownType,
    /// The envelope or its payload could not be decoded.
    BadPayload,
    /// The requested stream does not exist.
    UnknownStream,
    /// The stream key is already active on this connection.
    AlreadySubscribed,
    /// The stream key is not active on this connection.
    NotSubscribed,
    /// A backing service (event hub, Docker) is not configured.
    NotAvailable,
    /// A per-container stream was requested without `container_id`.
    MissingContainerId,
    /// The per-connection cap for this stream kind is reached.
    LimitExceeded,
    /// The container's log stream could not be opened.
    LogStreamError,
    /// The container's stats stream could not be opened.
    StatsStreamError,
}

impl ErrorCode {
    /// The wire form of this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::UnknownStream => "UNKNOWN_STREAM",
            Self::AlreadySubscribed => "ALREADY_SUBSCRIBED",
            Self::NotSubscribed => "NOT_SUBSCRIBED",
            Self::NotAvailable => "NOT_AVAILABLE",
            Self::MissingContainerId => "MISSING_CONTAINER_ID",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::LogStreamError => "LOG_STREAM_ERROR",
            Self::StatsStreamError => "STATS_STREAM_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `error` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable description.
    pub error: String,
    /// Stable machine-readable code.
    pub code: ErrorCode,
}

/// Payload of `subscribe` and `unsubscribe` requests, also echoed in acks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// `metrics`, `events`, `logs` or `container_stats`.
    #[serde(default)]
    pub stream: String,
    /// Target container for `logs` and `container_stats`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Requested push period for `metrics` and `container_stats`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i64>,
}

/// Payload of the `subscribed` message acknowledging an unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeAck {
    /// Stream name from the request.
    pub stream: String,
    /// Always `unsubscribed`.
    pub status: String,
}

impl UnsubscribeAck {
    /// Ack for the given stream name.
    #[must_use]
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            status: "unsubscribed".to_string(),
        }
    }
}

/// A logical stream a connection can subscribe to.
///
/// The [`Display`](fmt::Display) form is the subscription key: `metrics`,
/// `events`, `logs:<container-id>` or `container_stats:<container-id>`.
/// A connection holds at most one subscription per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Periodic host metrics.
    Metrics,
    /// Docker container lifecycle events.
    Events,
    /// Followed output of one container.
    Logs(ContainerId),
    /// Periodic CPU and memory samples of one container.
    ContainerStats(ContainerId),
}

impl StreamKind {
    /// The stream name used in request payloads.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Events => "events",
            Self::Logs(_) => "logs",
            Self::ContainerStats(_) => "container_stats",
        }
    }

    /// The container a per-container stream targets.
    #[must_use]
    pub const fn container_id(&self) -> Option<&ContainerId> {
        match self {
            Self::Logs(id) | Self::ContainerStats(id) => Some(id),
            Self::Metrics | Self::Events => None,
        }
    }

    /// Resolve a subscribe/unsubscribe request to a stream kind.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::UnknownStream`] for an unrecognized stream name
    /// - [`ErrorCode::MissingContainerId`] when a per-container stream has no
    ///   (or an empty) `container_id`
    /// - [`ErrorCode::BadPayload`] when `container_id` is malformed
    pub fn from_request(request: &SubscribePayload) -> Result<Self, ErrorCode> {
        match request.stream.as_str() {
            "metrics" => Ok(Self::Metrics),
            "events" => Ok(Self::Events),
            "logs" => requested_container(request).map(Self::Logs),
            "container_stats" => requested_container(request).map(Self::ContainerStats),
            _ => Err(ErrorCode::UnknownStream),
        }
    }

    /// The payload echoed in a `subscribed` acknowledgement.
    #[must_use]
    pub fn ack(&self) -> SubscribePayload {
        SubscribePayload {
            stream: self.name().to_string(),
            container_id: self.container_id().map(ToString::to_string),
            interval_seconds: None,
        }
    }
}

fn requested_container(request: &SubscribePayload) -> Result<ContainerId, ErrorCode> {
    match request.container_id.as_deref() {
        None | Some("") => Err(ErrorCode::MissingContainerId),
        Some(id) => ContainerId::new(id).map_err(|_| ErrorCode::BadPayload),
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.container_id() {
            Some(id) => write!(f, "{}:{id}", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

/// Container lifecycle actions forwarded to `events` subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    /// Container started.
    Start,
    /// Container stopped.
    Stop,
    /// Container process exited.
    Die,
    /// Container received a signal.
    Kill,
    /// Container restarted.
    Restart,
    /// Container created.
    Create,
    /// Container removed.
    Destroy,
}

impl LifecycleAction {
    /// Parse a Docker event action. Any other action (`exec_start`,
    /// `health_status: healthy`, `attach`, ...) yields `None`.
    #[must_use]
    pub fn from_action(action: &str) -> Option<Self> {
        let action = match action {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "die" => Self::Die,
            "kill" => Self::Kill,
            "restart" => Self::Restart,
            "create" => Self::Create,
            "destroy" => Self::Destroy,
            _ => return None,
        };
        Some(action)
    }

    /// The Docker action name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Die => "die",
            Self::Kill => "kill",
            Self::Restart => "restart",
            Self::Create => "create",
            Self::Destroy => "destroy",
        }
    }
}

/// Payload of `container_event` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// What happened.
    pub action: LifecycleAction,
    /// Short (12 character) container ID.
    pub container_id: String,
    /// Container name.
    pub container_name: String,
    /// Image reference the container runs.
    pub image: String,
    /// Compose project, empty for standalone containers.
    pub stack: String,
    /// Mirrors `action`.
    pub status: String,
    /// Daemon timestamp, seconds since the epoch.
    pub time: i64,
}

/// Output stream a log line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Payload of `log_line` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Container the line came from, as the client addressed it.
    pub container_id: String,
    /// Daemon timestamp (RFC 3339), empty if the line carried none.
    pub timestamp: String,
    /// Output stream.
    pub stream: LogStream,
    /// Line text without the trailing newline.
    pub message: String,
}

/// Payload of `container_stats` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatsPayload {
    /// Container the sample belongs to, as the client addressed it.
    pub container_id: String,
    /// CPU usage since the previous sample, 100 per fully used core.
    pub cpu_percent: f64,
    /// Memory in use, excluding page cache.
    pub mem_used_bytes: u64,
    /// Memory limit of the container's cgroup.
    pub mem_limit_bytes: u64,
    /// `mem_used_bytes / mem_limit_bytes * 100`, zero without a limit.
    pub mem_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(stream: &str, container_id: Option<&str>) -> SubscribePayload {
        SubscribePayload {
            stream: stream.to_string(),
            container_id: container_id.map(ToString::to_string),
            interval_seconds: None,
        }
    }

    #[test]
    fn pong_is_bare() {
        let pong = serde_json::to_string(&Envelope::new(MessageType::Pong)).unwrap();
        assert_eq!(pong, r#"{"type":"pong"}"#);
    }

    #[test]
    fn error_envelope_shape() {
        let envelope = Envelope::error(ErrorCode::LimitExceeded, "max 3 concurrent log subscriptions")
            .with_id(Some("req-7".to_string()));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "error",
                "id": "req-7",
                "payload": {
                    "error": "max 3 concurrent log subscriptions",
                    "code": "LIMIT_EXCEEDED"
                }
            })
        );

        let payload: ErrorPayload = envelope.payload_as().unwrap();
        assert_eq!(payload.code, ErrorCode::LimitExceeded);
    }

    #[test]
    fn envelope_decodes_without_optional_fields() {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(envelope.message_type(), Some(MessageType::Ping));
        assert!(envelope.id.is_none());
        assert!(envelope.payload.is_none());

        let envelope: Envelope = serde_json::from_str(r#"{"type":"foobar","id":"x"}"#).unwrap();
        assert_eq!(envelope.message_type(), None);
    }

    #[test]
    fn missing_type_and_stream_decode_empty() {
        let envelope: Envelope = serde_json::from_str(r#"{"id":"x1"}"#).unwrap();
        assert_eq!(envelope.kind, "");
        assert_eq!(envelope.id.as_deref(), Some("x1"));
        assert_eq!(envelope.message_type(), None);

        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"subscribe","payload":{}}"#).unwrap();
        let request: SubscribePayload = envelope.payload_as().unwrap();
        assert_eq!(request.stream, "");
        assert_eq!(
            StreamKind::from_request(&request),
            Err(ErrorCode::UnknownStream)
        );
    }

    #[test]
    fn missing_payload_does_not_decode_as_request() {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        assert!(envelope.payload_as::<SubscribePayload>().is_err());

        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"subscribe","payload":"not-an-object"}"#).unwrap();
        assert!(envelope.payload_as::<SubscribePayload>().is_err());
    }

    #[test]
    fn stream_kind_from_request() {
        assert_eq!(StreamKind::from_request(&request("metrics", None)), Ok(StreamKind::Metrics));
        assert_eq!(StreamKind::from_request(&request("events", None)), Ok(StreamKind::Events));
        assert_eq!(
            StreamKind::from_request(&request("logs", None)),
            Err(ErrorCode::MissingContainerId)
        );
        assert_eq!(
            StreamKind::from_request(&request("logs", Some(""))),
            Err(ErrorCode::MissingContainerId)
        );
        assert_eq!(
            StreamKind::from_request(&request("logs", Some("bad id"))),
            Err(ErrorCode::BadPayload)
        );
        assert_eq!(
            StreamKind::from_request(&request("nope", None)),
            Err(ErrorCode::UnknownStream)
        );

        let kind = StreamKind::from_request(&request("container_stats", Some("web-1"))).unwrap();
        assert!(matches!(kind, StreamKind::ContainerStats(_)));
        assert_eq!(kind.container_id().map(ContainerId::as_str), Some("web-1"));
    }

    #[test]
    fn subscription_keys() {
        let logs = StreamKind::Logs(ContainerId::new("abc123").unwrap());
        assert_eq!(logs.to_string(), "logs:abc123");

        let stats = StreamKind::ContainerStats(ContainerId::new("db").unwrap());
        assert_eq!(stats.to_string(), "container_stats:db");

        assert_eq!(StreamKind::Metrics.to_string(), "metrics");
        assert_eq!(StreamKind::Events.to_string(), "events");
    }

    #[test]
    fn ack_echoes_stream_and_container() {
        let logs = StreamKind::Logs(ContainerId::new("abc123").unwrap());
        let ack = serde_json::to_value(logs.ack()).unwrap();
        assert_eq!(ack, json!({ "stream": "logs", "container_id": "abc123" }));

        let ack = serde_json::to_value(StreamKind::Metrics.ack()).unwrap();
        assert_eq!(ack, json!({ "stream": "metrics" }));
    }

    #[test]
    fn lifecycle_actions() {
        assert_eq!(LifecycleAction::from_action("die"), Some(LifecycleAction::Die));
        assert_eq!(LifecycleAction::from_action("exec_start: sh"), None);
        assert_eq!(LifecycleAction::from_action("health_status: healthy"), None);
        assert_eq!(
            serde_json::to_value(LifecycleAction::Restart).unwrap(),
            json!("restart")
        );
    }

    #[test]
    fn message_type_names_round_trip() {
        for kind in [
            MessageType::Subscribe,
            MessageType::ContainerEvent,
            MessageType::LogLine,
            MessageType::ContainerStats,
        ] {
            assert_eq!(MessageType::from_wire(kind.as_str()), Some(kind));
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }
}
