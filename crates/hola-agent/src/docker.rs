//! Docker Engine collaborator.
//!
//! The rest of the agent talks to Docker only through [`DockerApi`]. Logs are
//! exposed in the daemon's multiplexed wire format (8-byte frame headers) and
//! stats as newline-delimited JSON, so the stream adapters stay independent of
//! the client library.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, LogOutput, LogsOptions, StatsOptions};
use bollard::models::EventMessage;
use bollard::system::EventsOptions;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use hola_common::protocol::LogStream;
use hola_common::{ContainerId, HolaError, HolaResult};

use crate::streams::codec::LogFrame;

/// Raw bytes from the daemon.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Daemon events as they arrive.
pub type EventStream = BoxStream<'static, HolaResult<DaemonEvent>>;

/// A raw event from the Docker daemon's event feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonEvent {
    /// Object type (`container`, `network`, `image`, ...).
    pub kind: String,
    /// What happened (`start`, `die`, `exec_start: sh`, ...).
    pub action: String,
    /// ID of the object the event is about.
    pub actor_id: String,
    /// Actor attributes such as `name`, `image` and compose labels.
    pub attributes: HashMap<String, String>,
    /// Seconds since the epoch.
    pub time: i64,
}

impl DaemonEvent {
    /// Whether this event is about a container.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.kind == "container"
    }

    /// An actor attribute, or `""` if absent.
    #[must_use]
    pub fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map_or("", String::as_str)
    }
}

impl From<EventMessage> for DaemonEvent {
    fn from(message: EventMessage) -> Self {
        let (actor_id, attributes) = message
            .actor
            .map(|actor| {
                (
                    actor.id.unwrap_or_default(),
                    actor.attributes.unwrap_or_default(),
                )
            })
            .unwrap_or_default();

        Self {
            kind: message.typ.map(|kind| kind.to_string()).unwrap_or_default(),
            action: message.action.unwrap_or_default(),
            actor_id,
            attributes,
            time: message.time.unwrap_or_default(),
        }
    }
}

/// Operations the agent needs from the Docker daemon.
#[async_trait]
pub trait DockerApi: Send + Sync + 'static {
    /// Subscribe to container events. The stream ends or yields an error when
    /// the daemon connection breaks.
    fn events(&self) -> EventStream;

    /// Follow a container's output, replaying the last `tail` lines first.
    ///
    /// The stream carries the multiplexed log format: an 8-byte header
    /// (stream type, 3 reserved bytes, big-endian payload length) before each
    /// payload.
    async fn container_logs(&self, id: &ContainerId, tail: usize) -> HolaResult<ByteStream>;

    /// Stream a container's resource stats as newline-delimited JSON objects.
    async fn container_stats(&self, id: &ContainerId) -> HolaResult<ByteStream>;

    /// The daemon's version string.
    async fn version(&self) -> HolaResult<String>;
}

/// [`DockerApi`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be configured.
    pub fn connect() -> HolaResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(docker_error)?;
        Ok(Self { docker })
    }

    /// Check that the daemon answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable.
    pub async fn ping(&self) -> HolaResult<()> {
        self.docker.ping().await.map_err(docker_error)?;
        Ok(())
    }

    async fn ensure_exists(&self, id: &ContainerId) -> HolaResult<()> {
        self.docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(docker_error)?;
        Ok(())
    }
}

#[async_trait]
impl DockerApi for DockerEngine {
    fn events(&self) -> EventStream {
        let filters = HashMap::from([("type".to_string(), vec!["container".to_string()])]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.docker
            .events(Some(options))
            .map_ok(DaemonEvent::from)
            .map_err(docker_error)
            .boxed()
    }

    async fn container_logs(&self, id: &ContainerId, tail: usize) -> HolaResult<ByteStream> {
        self.ensure_exists(id).await?;

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let frames = self
            .docker
            .logs(id.as_str(), Some(options))
            .map(|output| -> io::Result<Bytes> {
                encode_output(output.map_err(io::Error::other)?)
            });

        Ok(frames.boxed())
    }

    async fn container_stats(&self, id: &ContainerId) -> HolaResult<ByteStream> {
        self.ensure_exists(id).await?;

        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };

        let lines = self
            .docker
            .stats(id.as_str(), Some(options))
            .map(|stats| -> io::Result<Bytes> {
                let mut line = serde_json::to_vec(&stats.map_err(io::Error::other)?)?;
                line.push(b'\n');
                Ok(Bytes::from(line))
            });

        Ok(lines.boxed())
    }

    async fn version(&self) -> HolaResult<String> {
        let version = self.docker.version().await.map_err(docker_error)?;
        Ok(version.version.unwrap_or_default())
    }
}

/// Re-frame a demultiplexed log chunk into the daemon's wire format.
fn encode_output(output: LogOutput) -> io::Result<Bytes> {
    let frame = match output {
        LogOutput::StdErr { message } => LogFrame::new(LogStream::Stderr, message),
        LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => LogFrame::new(LogStream::Stdout, message),
    };

    let mut buf = BytesMut::new();
    frame.encode(&mut buf)?;
    Ok(buf.freeze())
}

pub(crate) fn docker_error(err: bollard::errors::Error) -> HolaError {
    HolaError::Docker {
        message: err.to_string(),
    }
}
