use std::sync::Arc;

use futures::StreamExt;
use hola_common::{ContainerId, Envelope, ErrorCode, MessageType};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::LogFrameCodec;
use super::push;
use crate::config::StreamLimits;
use crate::docker::DockerApi;
use crate::ws::ConnectionHandle;

/// Follow a container's output, pushing one `log_line` per frame.
///
/// The last `log_tail_lines` lines are replayed first. The follower does not
/// restart: when the upstream stream ends or fails, so does the subscription.
pub async fn follow_logs(
    cancel: CancellationToken,
    conn: ConnectionHandle,
    docker: Arc<dyn DockerApi>,
    container_id: ContainerId,
    limits: StreamLimits,
) {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        opened = docker.container_logs(&container_id, limits.log_tail_lines) => opened,
    };

    let bytes = match opened {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%container_id, error = %err, "log stream open failed");
            let envelope = Envelope::error(
                ErrorCode::LogStreamError,
                format!("failed to open log stream: {err}"),
            );
            let _ = conn.send(&cancel, envelope).await;
            return;
        }
    };

    let mut frames = FramedRead::new(
        StreamReader::new(bytes),
        LogFrameCodec::new(limits.max_log_frame_bytes),
    );

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                let line = frame.to_log_line(container_id.as_str());
                if !push(&conn, &cancel, MessageType::LogLine, &line).await {
                    return;
                }
            }
            Some(Err(err)) => {
                if !cancel.is_cancelled() {
                    warn!(%container_id, error = %err, "log stream read failed");
                }
                return;
            }
            None => {
                debug!(%container_id, "log stream ended");
                return;
            }
        }
    }
}
