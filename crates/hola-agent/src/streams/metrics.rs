use std::sync::Arc;
use std::time::Duration;

use hola_common::MessageType;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::push;
use crate::metrics::MetricsSource;
use crate::ws::ConnectionHandle;

/// Push a host metrics snapshot now and then every `every`.
///
/// A failed collection skips that tick.
pub async fn stream_metrics(
    cancel: CancellationToken,
    conn: ConnectionHandle,
    source: Arc<dyn MetricsSource>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let collected = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            collected = source.collect() => collected,
        };

        match collected {
            Ok(metrics) => {
                if !push(&conn, &cancel, MessageType::Metrics, &metrics).await {
                    return;
                }
            }
            Err(err) => warn!(conn_id = %conn.id(), error = %err, "metrics collect failed"),
        }
    }
}
