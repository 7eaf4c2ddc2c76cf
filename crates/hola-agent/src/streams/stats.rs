use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hola_common::protocol::ContainerStatsPayload;
use hola_common::{ContainerId, Envelope, ErrorCode, MessageType};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::push;
use crate::docker::{ByteStream, DockerApi};
use crate::ws::ConnectionHandle;

const MAX_SAMPLE_BYTES: usize = 1024 * 1024;

/// The fields of a Docker stats object the agent uses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatsSample {
    cpu_stats: CpuStats,
    precpu_stats: CpuStats,
    memory_stats: MemoryStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CpuStats {
    cpu_usage: CpuUsage,
    system_cpu_usage: Option<u64>,
    online_cpus: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CpuUsage {
    total_usage: u64,
    percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct MemoryStats {
    usage: Option<u64>,
    limit: Option<u64>,
    stats: Option<HashMap<String, Value>>,
}

impl StatsSample {
    /// Number of CPUs the container may use: `online_cpus`, else the number
    /// of per-CPU counters, else 1.
    fn cpus(&self) -> u64 {
        let stats = &self.cpu_stats;
        stats
            .online_cpus
            .filter(|&n| n > 0)
            .or_else(|| {
                let n = stats.cpu_usage.percpu_usage.as_ref().map_or(0, Vec::len);
                u64::try_from(n).ok().filter(|&n| n > 0)
            })
            .unwrap_or(1)
    }

    /// Page cache charged to the container: `cache` on cgroup v1,
    /// `inactive_file` on cgroup v2.
    fn page_cache(&self) -> u64 {
        let Some(stats) = &self.memory_stats.stats else {
            return 0;
        };
        ["cache", "inactive_file"]
            .iter()
            .find_map(|key| stats.get(*key).and_then(Value::as_u64))
            .unwrap_or(0)
    }

    /// Derive the client payload.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_payload(&self, container_id: &str) -> ContainerStatsPayload {
        let cpu_delta = self.cpu_stats.cpu_usage.total_usage as f64
            - self.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = self.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - self.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;

        let mem_used = self
            .memory_stats
            .usage
            .unwrap_or(0)
            .saturating_sub(self.page_cache());
        let mem_limit = self.memory_stats.limit.unwrap_or(0);
        let mem_percent = if mem_limit > 0 {
            mem_used as f64 / mem_limit as f64 * 100.0
        } else {
            0.0
        };

        ContainerStatsPayload {
            container_id: container_id.to_string(),
            cpu_percent: cpu_percent(cpu_delta, system_delta, self.cpus() as f64),
            mem_used_bytes: mem_used,
            mem_limit_bytes: mem_limit,
            mem_percent,
        }
    }
}

/// CPU usage between two samples, 100 per fully used CPU.
///
/// Zero when the system delta is not positive or the CPU delta is negative.
#[must_use]
pub fn cpu_percent(cpu_delta: f64, system_delta: f64, cpus: f64) -> f64 {
    if system_delta <= 0.0 || cpu_delta < 0.0 {
        return 0.0;
    }
    cpu_delta / system_delta * cpus * 100.0
}

/// Push a container's CPU and memory usage.
///
/// A reader task spawned on `tracker` decodes the upstream stats stream into a
/// latest-value cell, overwriting samples nobody picked up. The first sample is
/// pushed as soon as it arrives, then the latest one every `every`. The
/// subscription ends at the first tick after the upstream stream does, pushing
/// the last sample if it was not sent yet.
pub async fn stream_container_stats(
    cancel: CancellationToken,
    conn: ConnectionHandle,
    tracker: TaskTracker,
    docker: Arc<dyn DockerApi>,
    container_id: ContainerId,
    every: Duration,
) {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        opened = docker.container_stats(&container_id) => opened,
    };

    let lines = match opened {
        Ok(lines) => lines,
        Err(err) => {
            warn!(%container_id, error = %err, "container stats open failed");
            let envelope = Envelope::error(
                ErrorCode::StatsStreamError,
                format!("failed to open stats stream: {err}"),
            );
            let _ = conn.send(&cancel, envelope).await;
            return;
        }
    };

    let (latest_tx, mut latest_rx) = watch::channel(None);
    let reader_token = cancel.child_token();
    tracker.spawn(read_samples(
        reader_token.clone(),
        lines,
        container_id.to_string(),
        latest_tx,
    ));
    let _reader = reader_token.drop_guard();

    let first = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        changed = latest_rx.changed() => changed,
    };
    if first.is_err() {
        debug!(%container_id, "stats stream ended before the first sample");
        return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let sample = latest_rx.borrow_and_update().clone();
        if let Some(sample) = sample {
            if !push(&conn, &cancel, MessageType::ContainerStats, &sample).await {
                return;
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if latest_rx.has_changed().is_err() {
            let last = {
                let latest = latest_rx.borrow_and_update();
                if latest.has_changed() {
                    (*latest).clone()
                } else {
                    None
                }
            };
            if let Some(sample) = last {
                push(&conn, &cancel, MessageType::ContainerStats, &sample).await;
            }
            debug!(%container_id, "stats stream ended");
            return;
        }
    }
}

async fn read_samples(
    cancel: CancellationToken,
    lines: ByteStream,
    container_id: String,
    latest: watch::Sender<Option<ContainerStatsPayload>>,
) {
    let mut lines = FramedRead::new(
        StreamReader::new(lines),
        LinesCodec::new_with_max_length(MAX_SAMPLE_BYTES),
    );

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = lines.next() => next,
        };

        match next {
            Some(Ok(line)) if line.trim().is_empty() => {}
            Some(Ok(line)) => match serde_json::from_str::<StatsSample>(&line) {
                Ok(sample) => {
                    latest.send_replace(Some(sample.to_payload(&container_id)));
                }
                Err(err) => {
                    debug!(%container_id, error = %err, "container stats decode failed");
                    return;
                }
            },
            Some(Err(err)) => {
                if !cancel.is_cancelled() {
                    warn!(%container_id, error = %err, "container stats read failed");
                }
                return;
            }
            None => return,
        }
    }
}
