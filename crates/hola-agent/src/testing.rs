//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use hola_common::{ContainerId, HolaError, HolaResult};
use parking_lot::Mutex;

use crate::docker::{ByteStream, DaemonEvent, DockerApi, EventStream};
use crate::metrics::{CpuMetrics, MemoryMetrics, MetricsSource, SystemMetrics};

/// Counts itself in a shared gauge while alive.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
enum Tail {
    Follow,
    End,
    Fail,
}

#[derive(Clone)]
struct Script {
    chunks: Vec<Bytes>,
    tail: Tail,
    pace: Option<Duration>,
}

impl Script {
    fn new(chunks: Vec<Bytes>, follow: bool) -> Self {
        Self {
            chunks,
            tail: if follow { Tail::Follow } else { Tail::End },
            pace: None,
        }
    }
}

/// Scripted Docker daemon.
///
/// Log and stats streams replay their chunks and then either stay open
/// (`follow`), end, or fail with a read error. Paced scripts wait before each
/// chunk. Open streams are counted in [`FakeDocker::live_streams`].
#[derive(Default)]
pub struct FakeDocker {
    pub events_calls: AtomicUsize,
    event_batches: Mutex<VecDeque<Vec<DaemonEvent>>>,
    logs: Mutex<HashMap<String, Script>>,
    stats: Mutex<HashMap<String, Script>>,
    live: Arc<AtomicUsize>,
}

impl FakeDocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the events one `events()` call yields before the stream breaks.
    /// Once the queue is empty, `events()` returns a stream that never ends.
    pub fn push_event_batch(&self, batch: Vec<DaemonEvent>) {
        self.event_batches.lock().push_back(batch);
    }

    pub fn with_logs(self, id: &str, chunks: Vec<Bytes>, follow: bool) -> Self {
        self.logs
            .lock()
            .insert(id.to_string(), Script::new(chunks, follow));
        self
    }

    /// Log stream that fails with a read error after its chunks.
    pub fn with_broken_logs(self, id: &str, chunks: Vec<Bytes>) -> Self {
        let script = Script {
            tail: Tail::Fail,
            ..Script::new(chunks, false)
        };
        self.logs.lock().insert(id.to_string(), script);
        self
    }

    pub fn with_stats(self, id: &str, chunks: Vec<Bytes>, follow: bool) -> Self {
        self.stats
            .lock()
            .insert(id.to_string(), Script::new(chunks, follow));
        self
    }

    /// Stats stream yielding one chunk every `pace`, then ending.
    pub fn with_paced_stats(self, id: &str, chunks: Vec<Bytes>, pace: Duration) -> Self {
        let script = Script {
            pace: Some(pace),
            ..Script::new(chunks, false)
        };
        self.stats.lock().insert(id.to_string(), script);
        self
    }

    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn open(
        &self,
        scripts: &Mutex<HashMap<String, Script>>,
        id: &ContainerId,
    ) -> HolaResult<ByteStream> {
        let script = scripts
            .lock()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| HolaError::Docker {
                message: format!("No such container: {id}"),
            })?;

        let guard = LiveGuard::new(&self.live);
        let chunks = stream::iter(script.chunks.into_iter().map(Ok::<_, io::Error>));
        let replay: ByteStream = match script.pace {
            Some(pace) => chunks
                .then(move |chunk| async move {
                    tokio::time::sleep(pace).await;
                    chunk
                })
                .boxed(),
            None => chunks.boxed(),
        };
        let tail: ByteStream = match script.tail {
            Tail::Follow => stream::pending().boxed(),
            Tail::End => stream::empty().boxed(),
            Tail::Fail => stream::once(async {
                Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "daemon connection reset",
                ))
            })
            .boxed(),
        };

        Ok(replay
            .chain(tail)
            .map(move |chunk| {
                let _alive = &guard;
                chunk
            })
            .boxed())
    }
}

#[async_trait]
impl DockerApi for FakeDocker {
    fn events(&self) -> EventStream {
        self.events_calls.fetch_add(1, Ordering::SeqCst);
        match self.event_batches.lock().pop_front() {
            Some(batch) => stream::iter(batch.into_iter().map(Ok))
                .chain(stream::once(async {
                    Err(HolaError::Docker {
                        message: "events stream reset".to_string(),
                    })
                }))
                .boxed(),
            None => stream::pending().boxed(),
        }
    }

    async fn container_logs(&self, id: &ContainerId, _tail: usize) -> HolaResult<ByteStream> {
        self.open(&self.logs, id)
    }

    async fn container_stats(&self, id: &ContainerId) -> HolaResult<ByteStream> {
        self.open(&self.stats, id)
    }

    async fn version(&self) -> HolaResult<String> {
        Ok("27.3.1".to_string())
    }
}

/// Metrics source returning a fixed snapshot, failing the first `failures`
/// calls.
#[derive(Default)]
pub struct FakeMetrics {
    pub calls: AtomicUsize,
    failures: usize,
}

impl FakeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures,
        }
    }
}

pub fn sample_metrics() -> SystemMetrics {
    SystemMetrics {
        hostname: "homelab".to_string(),
        uptime_seconds: 86_400,
        cpu: CpuMetrics {
            usage_percent: 12.5,
            cores: 4,
            temperature_celsius: Some(48.0),
        },
        memory: MemoryMetrics {
            total_bytes: 8 << 30,
            used_bytes: 2 << 30,
            usage_percent: 25.0,
        },
        disk: Vec::new(),
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn collect(&self) -> HolaResult<SystemMetrics> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(HolaError::Metrics {
                message: "disk temporarily unreadable".to_string(),
            });
        }
        Ok(sample_metrics())
    }
}
