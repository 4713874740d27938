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

//! Plugin supervisor
//!
//! The Supervisor is responsible for:
//! - Building one plugin instance per enabled descriptor
//! - Starting instances concurrently, isolating failures
//! - Coordinated, bounded shutdown
//! - Status aggregation that never waits on a plugin's connections
//! - The periodic heartbeat and idle sweep

use crate::config::{HoneypotConfig, PluginDescriptor};
use crate::event::{Event, EventKind};
use crate::pipeline::{DrainReport, EventPipeline, SinkHealth, SinkHealthReport};
use crate::plugin::{Plugin, PluginContext};
use crate::registry::PluginRegistry;
use crate::tracker::{ConnectionTracker, TrackerConfig, TrackerStats};
use crate::types::{PluginState, PluginSummary, StatusSnapshot};
use crate::{HoneypotError, Result};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Plugin name used for process-level events
pub const SUPERVISOR: &str = "supervisor";

/// Extra time allowed for a plugin's own `stop` deadline handling
const STOP_SLACK: Duration = Duration::from_secs(2);

/// Result of stopping one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Drained within the deadline
    Stopped,
    /// Stopped after aborting `pending` connections
    Forced {
        /// Connections aborted
        pending: usize,
    },
    /// `stop` failed
    Failed(String),
    /// The plugin was not running
    NotRunning,
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Forced { pending } => write!(f, "forced ({} aborted)", pending),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::NotRunning => write!(f, "not running"),
        }
    }
}

/// Aggregated result of [`Supervisor::stop_all`]
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    /// Outcome per plugin name
    pub outcomes: BTreeMap<String, StopOutcome>,
    /// Event pipeline drain result
    pub events: DrainReport,
}

impl StopReport {
    /// Check if every plugin stopped without force or failure
    pub fn is_clean(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| matches!(o, StopOutcome::Stopped | StopOutcome::NotRunning))
    }

    /// Check if the report carries no work (a repeated `stop_all`)
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Full status: plugins, sinks and connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// Time since the supervisor was created
    pub uptime: Duration,
    /// Per-plugin snapshots
    pub plugins: BTreeMap<String, StatusSnapshot>,
    /// Per-sink health
    pub sinks: Vec<SinkHealthReport>,
    /// Tracker statistics
    pub connections: TrackerStats,
}

/// Runtime object bound to one descriptor
struct PluginInstance {
    descriptor: PluginDescriptor,
    plugin: Arc<dyn Plugin>,
    state: AtomicU8,
    running_since: Mutex<Option<Instant>>,
    uptime: Mutex<Duration>,
    last_error: Mutex<Option<String>>,
}

impl PluginInstance {
    fn new(descriptor: PluginDescriptor, plugin: Box<dyn Plugin>) -> Self {
        Self {
            descriptor,
            plugin: Arc::from(plugin),
            state: AtomicU8::new(PluginState::Created.as_u8()),
            running_since: Mutex::new(None),
            uptime: Mutex::new(Duration::ZERO),
            last_error: Mutex::new(None),
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state if the lifecycle allows it
    fn transition(&self, next: PluginState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !PluginState::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        match next {
            PluginState::Running => {
                *lock(&self.running_since) = Some(Instant::now());
            }
            PluginState::Stopped | PluginState::Failed => {
                if let Some(since) = lock(&self.running_since).take() {
                    *lock(&self.uptime) += since.elapsed();
                }
            }
            _ => {}
        }
        true
    }

    fn uptime(&self) -> Duration {
        let running = lock(&self.running_since)
            .as_ref()
            .map(|since| since.elapsed())
            .unwrap_or_default();
        *lock(&self.uptime) + running
    }

    fn record_error(&self, error: &HoneypotError) {
        *lock(&self.last_error) = Some(error.to_string());
    }

    fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns every plugin instance and drives their lifecycle
///
/// # Example
///
/// ```no_run
/// use medovina_service::{EventPipeline, HoneypotConfig, PluginRegistry, Supervisor};
/// use std::time::Duration;
///
/// # async fn run(registry: PluginRegistry, config: HoneypotConfig) -> medovina_service::Result<()> {
/// let pipeline = EventPipeline::builder().build();
/// let supervisor = Supervisor::new(config, registry, pipeline);
/// supervisor.start_all().await?;
/// // ... wait for a shutdown signal ...
/// let report = supervisor.stop_all(Duration::from_secs(10)).await;
/// assert!(report.is_clean());
/// # Ok(())
/// # }
/// ```
pub struct Supervisor {
    config: HoneypotConfig,
    registry: PluginRegistry,
    pipeline: EventPipeline,
    tracker: Arc<ConnectionTracker>,
    instances: Arc<DashMap<String, Arc<PluginInstance>>>,
    background: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    created_at: Instant,
}

impl Supervisor {
    /// Create a supervisor for `config`
    ///
    /// The connection tracker is created here, from the global limits.
    pub fn new(config: HoneypotConfig, registry: PluginRegistry, pipeline: EventPipeline) -> Self {
        let tracker = Arc::new(ConnectionTracker::new(
            TrackerConfig::from(&config.global),
            pipeline.clone(),
        ));
        Self {
            config,
            registry,
            pipeline,
            tracker,
            instances: Arc::new(DashMap::new()),
            background: CancellationToken::new(),
            background_tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Shared connection tracker
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Shared event pipeline
    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }

    /// Configuration being supervised
    pub fn config(&self) -> &HoneypotConfig {
        &self.config
    }

    fn context(&self) -> PluginContext {
        PluginContext::new(
            self.tracker.clone(),
            self.pipeline.clone(),
            self.config.global.hostname.clone(),
        )
    }

    /// Build and configure an instance; configuration errors leave it `Failed`
    fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<Arc<PluginInstance>> {
        let mut plugin = self.registry.create(&descriptor.kind)?;
        let configured = plugin.configure(descriptor);
        let instance = Arc::new(PluginInstance::new(descriptor.clone(), plugin));
        if let Err(e) = configured {
            self.fail(&instance, e);
        }
        Ok(instance)
    }

    fn fail(&self, instance: &PluginInstance, error: HoneypotError) {
        error!(plugin = instance.name(), error = %error, "Plugin failed");
        instance.record_error(&error);
        instance.transition(PluginState::Failed);
        self.pipeline.emit(
            Event::new(instance.name(), EventKind::PluginFailed)
                .with_field("kind", instance.descriptor.kind.clone())
                .with_field("error", error.to_string()),
        );
    }

    /// Start every enabled plugin
    ///
    /// Unknown kinds and duplicate names fail before anything starts.
    /// Afterwards plugins start concurrently and independently; a plugin that
    /// fails is recorded as `Failed` without affecting the others. Returns the
    /// number of running plugins, or [`HoneypotError::NoPluginsAvailable`]
    /// when none is running. Fails with [`HoneypotError::ShuttingDown`] once
    /// [`stop_all`](Self::stop_all) has been called.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> Result<usize> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HoneypotError::ShuttingDown);
        }
        self.config.validate()?;
        for descriptor in self.config.enabled_plugins() {
            if !self.registry.contains(&descriptor.kind) {
                return Err(HoneypotError::UnknownPluginKind(descriptor.kind.clone()));
            }
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HoneypotError::AlreadyRunning(SUPERVISOR.to_string()));
        }

        let mut pending = Vec::new();
        for descriptor in self.config.enabled_plugins() {
            let instance = self.instantiate(descriptor)?;
            self.instances
                .insert(descriptor.name.clone(), instance.clone());
            if instance.state() == PluginState::Created {
                pending.push(instance);
            }
        }

        join_all(pending.iter().map(|instance| self.start_instance(instance))).await;

        if self.stopped.load(Ordering::SeqCst) {
            let timeout = self.config.global.shutdown_timeout();
            join_all(pending.iter().map(|instance| self.stop_instance(instance, timeout))).await;
            return Err(HoneypotError::ShuttingDown);
        }

        let running = self.running_count();
        info!(
            running,
            configured = self.config.plugins.len(),
            "Plugin startup complete"
        );
        if running == 0 {
            return Err(HoneypotError::NoPluginsAvailable);
        }

        self.spawn_background();
        Ok(running)
    }

    async fn start_instance(&self, instance: &Arc<PluginInstance>) {
        if !instance.transition(PluginState::Starting) {
            return;
        }

        let name = instance.name().to_string();
        let timeout = self.config.global.start_timeout();
        match tokio::time::timeout(timeout, instance.plugin.start(self.context())).await {
            Ok(Ok(())) => {
                instance.transition(PluginState::Running);
                let status = instance.plugin.status();
                info!(plugin = %name, addr = ?status.bind_address, "Plugin running");
                let mut event = Event::new(name, EventKind::PluginStarted)
                    .with_field("kind", instance.descriptor.kind.clone())
                    .with_field("transport", instance.descriptor.transport.to_string());
                if let Some(addr) = status.bind_address {
                    event = event.with_field("bind_address", addr.to_string());
                }
                self.pipeline.emit(event);
            }
            Ok(Err(e)) => self.fail(instance, e),
            Err(_) => {
                // Release anything the abandoned start may have bound
                let _ = instance.plugin.stop(Duration::from_secs(1)).await;
                self.fail(instance, HoneypotError::StartTimeout(name));
            }
        }
    }

    fn spawn_background(&self) {
        let mut tasks = lock(&self.background_tasks);
        tasks.push(
            self.tracker
                .spawn_sweeper(self.config.global.sweep_interval(), self.background.clone()),
        );

        let interval = self.config.global.heartbeat_interval();
        let instances = self.instances.clone();
        let tracker = self.tracker.clone();
        let pipeline = self.pipeline.clone();
        let shutdown = self.background.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pipeline.emit(heartbeat_event(&instances, &tracker, &pipeline));
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        }));
    }

    /// Emit one heartbeat event now
    pub fn heartbeat(&self) {
        self.pipeline
            .emit(heartbeat_event(&self.instances, &self.tracker, &self.pipeline));
    }

    fn running_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|entry| entry.value().state() == PluginState::Running)
            .count()
    }

    /// Stop every running plugin concurrently, then drain the event pipeline
    ///
    /// Only the first call does any work; later calls return an empty report.
    #[instrument(skip(self))]
    pub async fn stop_all(&self, timeout: Duration) -> StopReport {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return StopReport::default();
        }

        info!("Stopping all plugins");
        self.background.cancel();
        let background: Vec<_> = lock(&self.background_tasks).drain(..).collect();
        for task in background {
            let _ = task.await;
        }

        let instances: Vec<Arc<PluginInstance>> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let outcomes = join_all(instances.iter().map(|instance| async move {
            let outcome = self.stop_instance(instance, timeout).await;
            (instance.name().to_string(), outcome)
        }))
        .await;

        let events = self.pipeline.shutdown(timeout).await;
        info!(drained = events.drained, "Shutdown complete");

        StopReport {
            outcomes: outcomes.into_iter().collect(),
            events,
        }
    }

    /// Stop a single plugin
    ///
    /// Stopping a plugin that is not running succeeds with
    /// [`StopOutcome::NotRunning`].
    pub async fn stop_plugin(&self, name: &str, timeout: Duration) -> Result<StopOutcome> {
        let instance = self
            .instance(name)
            .ok_or_else(|| HoneypotError::PluginNotFound(name.to_string()))?;
        Ok(self.stop_instance(&instance, timeout).await)
    }

    async fn stop_instance(&self, instance: &Arc<PluginInstance>, timeout: Duration) -> StopOutcome {
        if !instance.transition(PluginState::Stopping) {
            return StopOutcome::NotRunning;
        }

        let name = instance.name().to_string();
        let outcome = match tokio::time::timeout(timeout + STOP_SLACK, instance.plugin.stop(timeout))
            .await
        {
            Ok(Ok(())) => StopOutcome::Stopped,
            Ok(Err(HoneypotError::ForcedStop { pending, .. })) => StopOutcome::Forced { pending },
            Ok(Err(e)) => StopOutcome::Failed(e.to_string()),
            Err(_) => StopOutcome::Failed("stop did not complete in time".to_string()),
        };

        match &outcome {
            StopOutcome::Failed(reason) => {
                self.fail(
                    instance,
                    HoneypotError::Stop {
                        plugin: name.clone(),
                        reason: reason.clone(),
                    },
                );
            }
            StopOutcome::Forced { pending } => {
                warn!(plugin = %name, pending, "Plugin force-stopped");
                instance.record_error(&HoneypotError::ForcedStop {
                    plugin: name.clone(),
                    pending: *pending,
                });
                instance.transition(PluginState::Stopped);
            }
            _ => {
                instance.transition(PluginState::Stopped);
            }
        }

        if instance.state() == PluginState::Stopped {
            info!(plugin = %name, %outcome, "Plugin stopped");
            self.pipeline.emit(
                Event::new(name, EventKind::PluginStopped).with_field("outcome", outcome.to_string()),
            );
        }
        outcome
    }

    /// Replace a `Stopped` or `Failed` plugin with a fresh instance and start it
    ///
    /// This is the only way out of `Failed`; nothing restarts automatically.
    /// Refused with [`HoneypotError::ShuttingDown`] once
    /// [`stop_all`](Self::stop_all) has been called.
    #[instrument(skip(self))]
    pub async fn restart_plugin(&self, name: &str) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HoneypotError::ShuttingDown);
        }
        let current = self
            .instance(name)
            .ok_or_else(|| HoneypotError::PluginNotFound(name.to_string()))?;
        if !current.state().is_terminal() {
            return Err(HoneypotError::AlreadyRunning(name.to_string()));
        }

        let instance = self.instantiate(&current.descriptor)?;
        self.instances.insert(name.to_string(), instance.clone());
        if instance.state() == PluginState::Created {
            self.start_instance(&instance).await;
        }

        // stop_all began while this instance was starting and may have missed it
        if self.stopped.load(Ordering::SeqCst) {
            let timeout = self.config.global.shutdown_timeout();
            self.stop_instance(&instance, timeout).await;
            return Err(HoneypotError::ShuttingDown);
        }

        match instance.state() {
            PluginState::Running => Ok(()),
            _ => Err(HoneypotError::Start {
                plugin: name.to_string(),
                reason: instance
                    .last_error()
                    .unwrap_or_else(|| "did not reach running".to_string()),
            }),
        }
    }

    fn instance(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.instances.get(name).map(|entry| entry.value().clone())
    }

    /// Lifecycle state of one plugin (`None` if it has no instance)
    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.instance(name).map(|instance| instance.state())
    }

    /// Snapshot of every configured plugin, keyed by name
    ///
    /// Reads only atomics and short-lived locks owned by the supervisor, so a
    /// busy plugin never delays it.
    pub fn status(&self) -> BTreeMap<String, StatusSnapshot> {
        self.config
            .plugins
            .iter()
            .map(|descriptor| {
                let snapshot = match self.instance(&descriptor.name) {
                    Some(instance) => {
                        let reported = instance.plugin.status();
                        StatusSnapshot {
                            kind: descriptor.kind.clone(),
                            enabled: descriptor.enabled,
                            state: Some(instance.state()),
                            uptime: instance.uptime(),
                            active_connections: self.tracker.active_for(&descriptor.name),
                            total_connections: self.tracker.total_for(&descriptor.name),
                            last_error: instance.last_error(),
                            bind_address: reported.bind_address,
                            details: reported.details,
                        }
                    }
                    None => StatusSnapshot {
                        kind: descriptor.kind.clone(),
                        enabled: descriptor.enabled,
                        state: None,
                        uptime: Duration::ZERO,
                        active_connections: 0,
                        total_connections: 0,
                        last_error: None,
                        bind_address: None,
                        details: BTreeMap::new(),
                    },
                };
                (descriptor.name.clone(), snapshot)
            })
            .collect()
    }

    /// Plugin status plus sink health and connection statistics
    pub fn supervisor_status(&self) -> SupervisorStatus {
        SupervisorStatus {
            uptime: self.created_at.elapsed(),
            plugins: self.status(),
            sinks: self.pipeline.health(),
            connections: self.tracker.stats(),
        }
    }

    /// Descriptor summaries in configuration order
    pub fn list_plugins(&self) -> Vec<PluginSummary> {
        self.config.plugins.iter().map(|d| d.summary()).collect()
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("plugins", &self.instances.len())
            .field("running", &self.running_count())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

fn heartbeat_event(
    instances: &DashMap<String, Arc<PluginInstance>>,
    tracker: &ConnectionTracker,
    pipeline: &EventPipeline,
) -> Event {
    let mut running = 0u64;
    let mut failed = 0u64;
    for entry in instances.iter() {
        match entry.value().state() {
            PluginState::Running => running += 1,
            PluginState::Failed => failed += 1,
            _ => {}
        }
    }
    let stats = tracker.stats();
    let top_sources: Vec<serde_json::Value> = stats
        .top_sources
        .iter()
        .map(|(ip, count)| serde_json::json!({ "source": ip.to_string(), "connections": count }))
        .collect();
    let degraded_sinks = pipeline
        .health()
        .iter()
        .filter(|report| report.health != SinkHealth::Healthy)
        .count() as u64;

    Event::new(SUPERVISOR, EventKind::Heartbeat)
        .with_field("running", running)
        .with_field("failed", failed)
        .with_field("active_connections", stats.active as u64)
        .with_field("total_connections", stats.registered)
        .with_field("rejected_connections", stats.rejected)
        .with_field("unique_sources", stats.unique_sources as u64)
        .with_field("top_sources", top_sources)
        .with_field("degraded_sinks", degraded_sinks)
}
