//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Event fan-out pipeline
//!
//! The pipeline owns one bounded FIFO queue per sink. [`EventPipeline::emit`]
//! copies the event into every queue and returns immediately; a dedicated
//! worker task per sink drains its queue in order. This gives:
//!
//! - per-sink FIFO delivery (so events of one connection reach each sink in
//!   the order they were emitted)
//! - isolation: a slow or failing sink only ever fills its own queue
//! - bounded memory: a full queue applies the configured [`OverflowPolicy`]
//!
//! ```text
//! emit ──┬──> [queue] ──> worker ──> text sink
//!        ├──> [queue] ──> worker ──> json sink
//!        └──> [queue] ──> worker ──> database sink
//! ```

use crate::config::{EventsConfig, OverflowPolicy};
use crate::event::Event;
use crate::sink::EventSink;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Delivery health of one sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkHealth {
    /// Last write succeeded
    Healthy,
    /// Writes are failing, for less than the unhealthy threshold
    Degraded,
    /// Writes have been failing for longer than the unhealthy threshold
    Unhealthy,
}

impl fmt::Display for SinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time view of one sink
#[derive(Debug, Clone, Serialize)]
pub struct SinkHealthReport {
    /// Sink name
    pub name: String,
    /// Current health
    pub health: SinkHealth,
    /// Events written successfully
    pub written: u64,
    /// Failed write attempts (including retries)
    pub failed_writes: u64,
    /// Events dropped for this sink (overflow or exhausted retries)
    pub dropped: u64,
    /// Events waiting in the queue
    pub queued: usize,
    /// Most recent write error
    pub last_error: Option<String>,
}

/// Outcome of [`EventPipeline::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Whether every worker finished before the deadline
    pub drained: bool,
    /// Events still queued when the deadline passed
    pub abandoned: usize,
}

/// Per-sink queue and counters shared between `emit` and the worker
struct SinkSlot {
    name: String,
    queue: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    capacity: usize,
    overflow: OverflowPolicy,
    /// Set by shutdown; the worker exits once the queue is empty
    draining: AtomicBool,
    /// Milliseconds since the pipeline epoch + 1 when failures began; 0 when healthy
    failing_since: AtomicU64,
    written: AtomicU64,
    failed_writes: AtomicU64,
    dropped: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SinkSlot {
    fn new(name: String, config: &EventsConfig) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::with_capacity(config.buffer_size.min(1024))),
            notify: Notify::new(),
            capacity: config.buffer_size.max(1),
            overflow: config.overflow,
            draining: AtomicBool::new(false),
            failing_since: AtomicU64::new(0),
            written: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Arc<Event>>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: Arc<Event>) {
        {
            let mut queue = self.queue();
            if queue.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("medovina.events.dropped", "reason" => "overflow").increment(1);
                match self.overflow {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                    }
                    OverflowPolicy::DropNewest => return,
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Arc<Event>> {
        self.queue().pop_front()
    }

    fn queued(&self) -> usize {
        self.queue().len()
    }

    fn mark_healthy(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
        self.failing_since.store(0, Ordering::Release);
    }

    fn mark_failing(&self, epoch: Instant, error: String) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
        let now = epoch.elapsed().as_millis() as u64 + 1;
        let _ = self
            .failing_since
            .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire);
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error);
    }

    fn health(&self, epoch: Instant, unhealthy_after: Duration) -> SinkHealth {
        match self.failing_since.load(Ordering::Acquire) {
            0 => SinkHealth::Healthy,
            since => {
                let now = epoch.elapsed().as_millis() as u64 + 1;
                if now.saturating_sub(since) >= unhealthy_after.as_millis() as u64 {
                    SinkHealth::Unhealthy
                } else {
                    SinkHealth::Degraded
                }
            }
        }
    }

    fn report(&self, epoch: Instant, unhealthy_after: Duration) -> SinkHealthReport {
        SinkHealthReport {
            name: self.name.clone(),
            health: self.health(epoch, unhealthy_after),
            written: self.written.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queued: self.queued(),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}

struct PipelineInner {
    slots: Vec<Arc<SinkSlot>>,
    config: EventsConfig,
    epoch: Instant,
    system_sequence: AtomicU64,
    emitted: AtomicU64,
    closed: AtomicBool,
    workers: TaskTracker,
    abandon: CancellationToken,
}

/// Shared handle to the fan-out pipeline (cheap to clone)
#[derive(Clone)]
pub struct EventPipeline {
    inner: Arc<PipelineInner>,
}

/// Builder for [`EventPipeline`]
pub struct PipelineBuilder {
    config: EventsConfig,
    sinks: Vec<Box<dyn EventSink>>,
}

impl PipelineBuilder {
    /// Replace the pipeline options
    pub fn config(mut self, config: EventsConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a sink
    pub fn sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Spawn the sink workers and return the pipeline
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> EventPipeline {
        let abandon = CancellationToken::new();
        let workers = TaskTracker::new();
        let epoch = Instant::now();

        let mut slots = Vec::with_capacity(self.sinks.len());
        for sink in self.sinks {
            let slot = Arc::new(SinkSlot::new(sink.name().to_string(), &self.config));
            workers.spawn(run_worker(
                sink,
                slot.clone(),
                self.config.clone(),
                epoch,
                abandon.clone(),
            ));
            slots.push(slot);
        }

        info!(sinks = slots.len(), "Event pipeline started");

        EventPipeline {
            inner: Arc::new(PipelineInner {
                slots,
                config: self.config,
                epoch,
                system_sequence: AtomicU64::new(0),
                emitted: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                workers,
                abandon,
            }),
        }
    }
}

impl EventPipeline {
    /// Start building a pipeline with default options
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder {
            config: EventsConfig::default(),
            sinks: Vec::new(),
        }
    }

    /// Build a pipeline from configuration and already-constructed sinks
    pub fn from_config(config: &EventsConfig, sinks: Vec<Box<dyn EventSink>>) -> Self {
        sinks
            .into_iter()
            .fold(Self::builder().config(config.clone()), |b, s| b.sink(s))
            .build()
    }

    /// Hand an event to every sink
    ///
    /// Never blocks and never fails: a full queue applies the overflow policy
    /// and sink errors stay inside the sink's worker. Process-level events
    /// (connection id 0, sequence 0) are numbered from a process-wide counter.
    pub fn emit(&self, mut event: Event) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            counter!("medovina.events.dropped", "reason" => "closed").increment(1);
            return;
        }

        if event.connection_id.is_system() && event.sequence == 0 {
            event.sequence = inner.system_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        }

        inner.emitted.fetch_add(1, Ordering::Relaxed);
        counter!("medovina.events.emitted", "kind" => event.kind.as_str()).increment(1);

        let event = Arc::new(event);
        for slot in &inner.slots {
            slot.push(event.clone());
        }
    }

    /// Events accepted by `emit` so far
    pub fn emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    /// Number of configured sinks
    pub fn sink_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Check if `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Health of every sink, in configuration order
    pub fn health(&self) -> Vec<SinkHealthReport> {
        let unhealthy_after = Duration::from_secs(self.inner.config.unhealthy_after_secs);
        self.inner
            .slots
            .iter()
            .map(|slot| slot.report(self.inner.epoch, unhealthy_after))
            .collect()
    }

    /// Stop accepting events, drain queues and flush sinks
    ///
    /// Anything still queued at the deadline is abandoned. Later calls return
    /// immediately with the same outcome as a drained pipeline.
    pub async fn shutdown(&self, timeout: Duration) -> DrainReport {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return DrainReport {
                drained: true,
                abandoned: 0,
            };
        }

        info!("Draining event pipeline");
        inner.workers.close();
        for slot in &inner.slots {
            slot.draining.store(true, Ordering::Release);
            slot.notify.notify_one();
        }

        if tokio::time::timeout(timeout, inner.workers.wait()).await.is_ok() {
            info!("Event pipeline drained");
            return DrainReport {
                drained: true,
                abandoned: 0,
            };
        }

        inner.abandon.cancel();
        let abandoned: usize = inner.slots.iter().map(|s| s.queued()).sum();
        warn!(abandoned, "Event pipeline drain deadline passed");
        counter!("medovina.events.dropped", "reason" => "shutdown").increment(abandoned as u64);
        DrainReport {
            drained: false,
            abandoned,
        }
    }
}

impl fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPipeline")
            .field("sinks", &self.sink_count())
            .field("emitted", &self.emitted())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drain one sink's queue until the pipeline closes
async fn run_worker(
    mut sink: Box<dyn EventSink>,
    slot: Arc<SinkSlot>,
    config: EventsConfig,
    epoch: Instant,
    abandon: CancellationToken,
) {
    debug!(sink = %slot.name, "Sink worker started");
    loop {
        if abandon.is_cancelled() {
            break;
        }
        match slot.pop() {
            Some(event) => {
                gauge!("medovina.sink.queued", "sink" => slot.name.clone()).set(slot.queued() as f64);
                deliver(sink.as_mut(), &slot, &event, &config, epoch, &abandon).await;
            }
            None => {
                if slot.draining.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = slot.notify.notified() => {}
                    _ = abandon.cancelled() => break,
                }
            }
        }
    }

    if let Err(e) = sink.flush().await {
        warn!(sink = %slot.name, error = %e, "Sink flush failed");
    }
    debug!(sink = %slot.name, "Sink worker stopped");
}

/// Write one event, retrying with exponential backoff
async fn deliver(
    sink: &mut dyn EventSink,
    slot: &SinkSlot,
    event: &Event,
    config: &EventsConfig,
    epoch: Instant,
    abandon: &CancellationToken,
) {
    let attempts = config.max_retries.max(1);
    let mut delay = Duration::from_millis(config.retry_initial_ms);
    let max_delay = Duration::from_millis(config.retry_max_ms.max(config.retry_initial_ms));

    for attempt in 1..=attempts {
        match sink.write(event).await {
            Ok(()) => {
                slot.mark_healthy();
                return;
            }
            Err(e) => {
                slot.mark_failing(epoch, e.to_string());
                counter!("medovina.sink.write_failures", "sink" => slot.name.clone()).increment(1);
                warn!(
                    sink = %slot.name,
                    attempt,
                    attempts,
                    error = %e,
                    "Sink write failed"
                );
                if attempt == attempts {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = abandon.cancelled() => break,
                }
                delay = (delay * 2).min(max_delay);
            }
        }
    }

    slot.dropped.fetch_add(1, Ordering::Relaxed);
    counter!("medovina.events.dropped", "reason" => "sink_failure").increment(1);
}
