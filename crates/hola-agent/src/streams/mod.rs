//! Per-subscription stream adapters.
//!
//! Each adapter runs as one task owned by a WebSocket session and pushes
//! messages through the session's [`ConnectionHandle`] until its cancellation
//! token fires, the upstream source ends, or the connection goes away. Faults
//! are logged; nothing propagates out of an adapter.

pub mod codec;
mod logs;
mod metrics;
mod stats;

pub use logs::follow_logs;
pub use metrics::stream_metrics;
pub use stats::{StatsSample, cpu_percent, stream_container_stats};

use hola_common::{Envelope, MessageType};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ws::ConnectionHandle;

/// Queue a push message. Returns `false` once the connection no longer takes
/// messages.
async fn push<T: Serialize>(
    conn: &ConnectionHandle,
    cancel: &CancellationToken,
    kind: MessageType,
    payload: &T,
) -> bool {
    let envelope = match Envelope::with_payload(kind, payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(%kind, error = %err, "failed to encode payload");
            return true;
        }
    };

    match conn.send(cancel, envelope).await {
        Ok(()) => true,
        Err(err) => {
            debug!(conn_id = %conn.id(), %kind, error = %err, "push failed");
            false
        }
    }
}
