use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ConnectionHandle, Finished, Session};
use crate::state::AgentServices;

/// Envelopes queued per connection before producers wait (or, for the event
/// hub, drop).
pub const OUTBOUND_CAPACITY: usize = 256;

enum Step {
    Shutdown,
    Finished(Finished),
    Frame(Option<Result<Message, axum::Error>>),
}

/// Drive one upgraded socket until the client leaves or `shutdown` fires.
///
/// All writes go through a single writer task draining the connection's
/// queue. On exit every subscription is cancelled and awaited before the
/// writer is.
pub async fn serve_socket(
    socket: WebSocket,
    services: Arc<AgentServices>,
    shutdown: CancellationToken,
) {
    let (mut sink, mut stream) = socket.split();
    let (conn, mut outbound) = ConnectionHandle::channel(OUTBOUND_CAPACITY);
    let conn_id = conn.id();
    info!(%conn_id, "websocket client connected");

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    debug!(%conn_id, error = %err, "failed to encode envelope");
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Text(text.into())).await {
                debug!(%conn_id, error = %err, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(conn, services, &shutdown);
    loop {
        let step = tokio::select! {
            biased;
            () = shutdown.cancelled() => Step::Shutdown,
            finished = session.next_finished() => Step::Finished(finished),
            frame = stream.next() => Step::Frame(frame),
        };

        match step {
            Step::Shutdown => break,
            Step::Finished(finished) => session.retire(finished),
            Step::Frame(Some(Ok(Message::Text(text)))) => {
                session.handle_frame(text.as_str().as_bytes()).await;
            }
            Step::Frame(Some(Ok(Message::Binary(data)))) => session.handle_frame(&data).await,
            Step::Frame(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Step::Frame(Some(Ok(Message::Close(_))) | None) => break,
            Step::Frame(Some(Err(err))) => {
                debug!(%conn_id, error = %err, "websocket read failed");
                break;
            }
        }
    }

    session.close().await;
    // The session held the last handle, so the writer drains and stops.
    let _ = writer.await;
    info!(%conn_id, "websocket client disconnected");
}
