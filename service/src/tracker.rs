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

//! Connection tracker
//!
//! The tracker is the accept-time bookkeeping shared by every plugin:
//! - Assigning process-unique connection ids
//! - Enforcing the global and per-source concurrency ceilings
//! - Tracking activity, byte counters and per-plugin counts
//! - Evicting idle and over-age connections
//! - Per-source statistics

use crate::config::GlobalConfig;
use crate::event::{Event, EventKind};
use crate::pipeline::EventPipeline;
use crate::types::{CloseReason, ConnectionId, LimitScope};
use crate::{HoneypotError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of sources reported by [`ConnectionTracker::stats`]
const TOP_SOURCES: usize = 10;

/// Ceiling on per-source totals kept for statistics
///
/// Datagram sources can be forged, so the table is pruned to its busiest
/// entries when it grows past this size.
pub const MAX_TRACKED_SOURCES: usize = 10_000;

/// Entries kept by a prune
const SOURCES_AFTER_PRUNE: usize = MAX_TRACKED_SOURCES * 9 / 10;

/// Sentinel for "no close reason recorded yet"
const NO_REASON: u8 = u8::MAX;

/// Tracker limits and timeouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Concurrent connection ceiling across all plugins
    pub max_connections: usize,
    /// Concurrent connection ceiling per source IP
    pub max_connections_per_source: usize,
    /// Inactivity before eviction
    pub idle_timeout: Duration,
    /// Age before eviction (`None` disables)
    pub max_lifetime: Option<Duration>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig::from(&GlobalConfig::default())
    }
}

impl From<&GlobalConfig> for TrackerConfig {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_connections_per_source: config.max_connections_per_source,
            idle_timeout: config.idle_timeout(),
            max_lifetime: config.max_connection_lifetime(),
        }
    }
}

struct HandleInner {
    id: ConnectionId,
    plugin: String,
    remote: SocketAddr,
    started: Instant,
    /// Milliseconds after `started` of the last activity
    last_activity: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    sequence: AtomicU64,
    close_reason: AtomicU8,
    cancel: CancellationToken,
}

/// Accounting handle for one registered connection
///
/// Clones share state. The handle carries the connection's event sequence,
/// its byte counters and the cancellation signal used for idle eviction and
/// plugin shutdown.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    fn new(id: ConnectionId, plugin: &str, remote: SocketAddr) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                plugin: plugin.to_string(),
                remote,
                started: Instant::now(),
                last_activity: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                close_reason: AtomicU8::new(NO_REASON),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Owning plugin
    pub fn plugin(&self) -> &str {
        &self.inner.plugin
    }

    /// Remote address
    pub fn remote(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Time since registration
    pub fn age(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.inner.last_activity.load(Ordering::Relaxed));
        self.age().saturating_sub(last)
    }

    /// Record protocol progress
    pub fn touch(&self) {
        let now = self.inner.started.elapsed().as_millis() as u64;
        self.inner.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    /// Record bytes received from the peer
    pub fn record_in(&self, bytes: usize) {
        self.inner.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Record bytes sent to the peer
    pub fn record_out(&self, bytes: usize) {
        self.inner.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Bytes received so far
    pub fn bytes_in(&self) -> u64 {
        self.inner.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes sent so far
    pub fn bytes_out(&self) -> u64 {
        self.inner.bytes_out.load(Ordering::Relaxed)
    }

    /// Allocate the next event sequence number (starting at 1)
    pub fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Start an event attributed to this connection
    pub fn event(&self, kind: EventKind) -> Event {
        Event::new(self.inner.plugin.clone(), kind)
            .with_connection(self.inner.id, self.next_sequence())
            .with_source(self.inner.remote)
    }

    /// Record why the connection is ending; the first reason wins
    ///
    /// Returns `true` if this call recorded the reason.
    pub fn set_close_reason(&self, reason: CloseReason) -> bool {
        self.inner
            .close_reason
            .compare_exchange(NO_REASON, reason.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Overwrite the close reason (used when a task is aborted)
    pub(crate) fn force_close_reason(&self, reason: CloseReason) {
        self.inner
            .close_reason
            .store(reason.as_u8(), Ordering::Release);
    }

    /// Recorded close reason, if any
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.inner.close_reason.load(Ordering::Acquire) {
            NO_REASON => None,
            value => Some(CloseReason::from_u8(value)),
        }
    }

    /// Record `reason` and signal the connection task to finish
    pub fn close(&self, reason: CloseReason) -> bool {
        let recorded = self.set_close_reason(reason);
        self.inner.cancel.cancel();
        recorded
    }

    /// Check if the connection has been asked to finish
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until the connection is asked to finish
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Cancellation token observed by the connection task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("plugin", &self.inner.plugin)
            .field("remote", &self.inner.remote)
            .field("bytes_in", &self.bytes_in())
            .field("bytes_out", &self.bytes_out())
            .finish()
    }
}

/// Tracker-wide statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStats {
    /// Live connections
    pub active: usize,
    /// Successful registrations
    pub registered: u64,
    /// Successful unregistrations
    pub unregistered: u64,
    /// Registrations refused by a ceiling
    pub rejected: u64,
    /// `unregister` calls for unknown or already-released handles
    pub double_releases: u64,
    /// Distinct source IPs seen (a pruned source that returns counts again)
    pub unique_sources: usize,
    /// Sources currently held in the per-source totals
    pub tracked_sources: usize,
    /// Busiest sources by total connections, descending
    pub top_sources: Vec<(IpAddr, u64)>,
}

/// Concurrent counts guarded together so both ceilings are checked atomically
#[derive(Default)]
struct Occupancy {
    active: usize,
    per_source: HashMap<IpAddr, usize>,
}

/// Shared connection accounting
pub struct ConnectionTracker {
    config: TrackerConfig,
    pipeline: EventPipeline,
    next_id: AtomicU64,
    occupancy: Mutex<Occupancy>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    plugin_active: DashMap<String, Arc<AtomicUsize>>,
    plugin_total: DashMap<String, Arc<AtomicU64>>,
    source_totals: DashMap<IpAddr, u64>,
    unique_sources: AtomicUsize,
    pruning: AtomicBool,
    registered: AtomicU64,
    unregistered: AtomicU64,
    rejected: AtomicU64,
    double_releases: AtomicU64,
    sweeping: AtomicBool,
}

impl ConnectionTracker {
    /// Create a tracker reporting evictions to `pipeline`
    pub fn new(config: TrackerConfig, pipeline: EventPipeline) -> Self {
        Self {
            config,
            pipeline,
            next_id: AtomicU64::new(1),
            occupancy: Mutex::new(Occupancy::default()),
            connections: DashMap::new(),
            plugin_active: DashMap::new(),
            plugin_total: DashMap::new(),
            source_totals: DashMap::new(),
            unique_sources: AtomicUsize::new(0),
            pruning: AtomicBool::new(false),
            registered: AtomicU64::new(0),
            unregistered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            double_releases: AtomicU64::new(0),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Tracker limits
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Pipeline eviction events are emitted to
    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }

    fn occupancy(&self) -> MutexGuard<'_, Occupancy> {
        self.occupancy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an accepted connection
    ///
    /// Fails with [`HoneypotError::ConnectionLimitExceeded`] when either
    /// ceiling is reached; the caller must then drop the connection without
    /// running a handler.
    pub fn register(&self, plugin: &str, remote: SocketAddr) -> Result<ConnectionHandle> {
        let source = remote.ip();
        {
            let mut occupancy = self.occupancy();
            if occupancy.active >= self.config.max_connections {
                return Err(self.reject(plugin, remote, LimitScope::Global));
            }
            let from_source = occupancy.per_source.get(&source).copied().unwrap_or(0);
            if from_source >= self.config.max_connections_per_source {
                return Err(self.reject(plugin, remote, LimitScope::Source));
            }
            occupancy.active += 1;
            *occupancy.per_source.entry(source).or_insert(0) += 1;
            gauge!("medovina.connections.active").set(occupancy.active as f64);
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = ConnectionHandle::new(id, plugin, remote);
        self.connections.insert(id, handle.clone());

        self.plugin_active
            .entry(plugin.to_string())
            .or_default()
            .fetch_add(1, Ordering::AcqRel);
        self.plugin_total
            .entry(plugin.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        self.count_source(source);
        self.registered.fetch_add(1, Ordering::Relaxed);
        counter!("medovina.connections.accepted", "plugin" => plugin.to_string()).increment(1);

        debug!(connection_id = %id, plugin, %remote, "Connection registered");
        Ok(handle)
    }

    fn count_source(&self, source: IpAddr) {
        match self.source_totals.entry(source) {
            Entry::Occupied(mut entry) => *entry.get_mut() += 1,
            Entry::Vacant(entry) => {
                entry.insert(1);
                self.unique_sources.fetch_add(1, Ordering::Relaxed);
            }
        }
        if self.source_totals.len() > MAX_TRACKED_SOURCES {
            self.prune_sources();
        }
    }

    /// Drop the least active sources down to [`SOURCES_AFTER_PRUNE`]
    fn prune_sources(&self) {
        if self.pruning.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut totals: Vec<(IpAddr, u64)> = self
            .source_totals
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        totals.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (source, _) in totals.iter().skip(SOURCES_AFTER_PRUNE) {
            self.source_totals.remove(source);
        }
        debug!(
            pruned = totals.len().saturating_sub(SOURCES_AFTER_PRUNE),
            "Pruned per-source totals"
        );
        self.pruning.store(false, Ordering::Release);
    }

    fn reject(&self, plugin: &str, remote: SocketAddr, scope: LimitScope) -> HoneypotError {
        let limit = match scope {
            LimitScope::Global => self.config.max_connections,
            LimitScope::Source => self.config.max_connections_per_source,
        };
        self.rejected.fetch_add(1, Ordering::Relaxed);
        counter!("medovina.connections.rejected", "scope" => scope.to_string()).increment(1);
        debug!(plugin, %remote, %scope, limit, "Connection rejected");
        HoneypotError::ConnectionLimitExceeded { scope, limit }
    }

    /// Release a connection's accounting state
    ///
    /// Must be called exactly once per registered handle. A second call, or a
    /// handle from another tracker, fails with
    /// [`HoneypotError::UnknownConnection`] and is counted as a double release.
    pub fn unregister(&self, handle: &ConnectionHandle) -> Result<()> {
        let id = handle.id();
        if self.connections.remove(&id).is_none() {
            self.double_releases.fetch_add(1, Ordering::Relaxed);
            warn!(connection_id = %id, "Unregister of unknown connection");
            return Err(HoneypotError::UnknownConnection(id));
        }

        {
            let mut occupancy = self.occupancy();
            occupancy.active = occupancy.active.saturating_sub(1);
            let source = handle.remote().ip();
            if let Some(count) = occupancy.per_source.get_mut(&source) {
                *count -= 1;
                if *count == 0 {
                    occupancy.per_source.remove(&source);
                }
            }
            gauge!("medovina.connections.active").set(occupancy.active as f64);
        }

        if let Some(active) = self.plugin_active.get(handle.plugin()) {
            active.fetch_sub(1, Ordering::AcqRel);
        }
        self.unregistered.fetch_add(1, Ordering::Relaxed);
        counter!(
            "medovina.connections.closed",
            "reason" => handle.close_reason().unwrap_or(CloseReason::ClientClosed).as_str()
        )
        .increment(1);

        debug!(connection_id = %id, "Connection unregistered");
        Ok(())
    }

    /// Record activity on a connection
    pub fn touch(&self, handle: &ConnectionHandle) {
        handle.touch();
    }

    /// Look up a live connection
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Check if a connection is still registered
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Live connections across all plugins
    pub fn active_count(&self) -> usize {
        self.occupancy().active
    }

    /// Live connections owned by `plugin`
    pub fn active_for(&self, plugin: &str) -> usize {
        self.plugin_active
            .get(plugin)
            .map(|count| count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Connections ever registered by `plugin`
    pub fn total_for(&self, plugin: &str) -> u64 {
        self.plugin_total
            .get(plugin)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Evict idle and over-age connections
    ///
    /// Records the close reason and fires each evicted connection's
    /// cancellation token. The connection task performs the actual close,
    /// reports the eviction through [`announce_eviction`](Self::announce_eviction)
    /// and unregisters, so every event of a connection comes from its own task
    /// and sequence numbers follow arrival order. Returns the number of
    /// connections evicted.
    pub fn idle_sweep(&self) -> usize {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let mut expired = Vec::new();
        for entry in self.connections.iter() {
            let handle = entry.value();
            if handle.is_cancelled() {
                continue;
            }
            match self.config.max_lifetime {
                Some(max) if handle.age() >= max => {
                    expired.push((handle.clone(), CloseReason::LifetimeExceeded))
                }
                _ if handle.idle_for() >= self.config.idle_timeout => {
                    expired.push((handle.clone(), CloseReason::IdleTimeout))
                }
                _ => {}
            }
        }

        let mut evicted = 0;
        for (handle, reason) in expired {
            if !handle.set_close_reason(reason) {
                continue;
            }
            handle.close(reason);
            counter!("medovina.connections.evicted", "reason" => reason.as_str()).increment(1);
            info!(
                connection_id = %handle.id(),
                plugin = handle.plugin(),
                remote = %handle.remote(),
                %reason,
                "Connection evicted"
            );
            evicted += 1;
        }

        self.sweeping.store(false, Ordering::Release);
        evicted
    }

    /// Emit the eviction event for a connection closed by the sweep
    ///
    /// Called by the task that owns `handle` as it releases the connection.
    /// Emits [`EventKind::IdleTimeout`] or [`EventKind::LifetimeExceeded`] and
    /// returns `true` when the recorded close reason is an eviction.
    pub fn announce_eviction(&self, handle: &ConnectionHandle) -> bool {
        let kind = match handle.close_reason() {
            Some(CloseReason::IdleTimeout) => EventKind::IdleTimeout,
            Some(CloseReason::LifetimeExceeded) => EventKind::LifetimeExceeded,
            _ => return false,
        };
        self.pipeline.emit(
            handle
                .event(kind)
                .with_field("idle_ms", handle.idle_for().as_millis() as u64)
                .with_field("age_ms", handle.age().as_millis() as u64),
        );
        true
    }

    /// Ask every connection of `plugin` to finish
    ///
    /// Returns the number of connections signalled.
    pub fn cancel_plugin(&self, plugin: &str, reason: CloseReason) -> usize {
        let handles: Vec<_> = self
            .connections
            .iter()
            .filter(|entry| entry.value().plugin() == plugin)
            .map(|entry| entry.value().clone())
            .collect();
        for handle in &handles {
            handle.close(reason);
        }
        handles.len()
    }

    /// Snapshot of tracker-wide statistics
    pub fn stats(&self) -> TrackerStats {
        let mut sources: Vec<(IpAddr, u64)> = self
            .source_totals
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        let tracked_sources = sources.len();
        sources.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        sources.truncate(TOP_SOURCES);

        TrackerStats {
            active: self.active_count(),
            registered: self.registered.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            double_releases: self.double_releases.load(Ordering::Relaxed),
            unique_sources: self.unique_sources.load(Ordering::Relaxed),
            tracked_sources,
            top_sources: sources,
        }
    }

    /// Run [`idle_sweep`](Self::idle_sweep) every `interval` until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.idle_sweep();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Idle sweeper stopped");
        })
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("config", &self.config)
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max: usize, per_source: usize) -> ConnectionTracker {
        ConnectionTracker::new(
            TrackerConfig {
                max_connections: max,
                max_connections_per_source: per_source,
                idle_timeout: Duration::from_secs(60),
                max_lifetime: None,
            },
            EventPipeline::builder().build(),
        )
    }

    fn addr(ip: &str, port: u16) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), port)
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let tracker = tracker(10, 10);
        let a = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();
        let b = tracker.register("ssh", addr("10.0.0.2", 1)).unwrap();
        tracker.unregister(&a).unwrap();
        let c = tracker.register("ssh", addr("10.0.0.1", 2)).unwrap();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert!(c.id() > b.id());
    }

    #[tokio::test]
    async fn test_global_ceiling() {
        let tracker = tracker(2, 10);
        let _a = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();
        let _b = tracker.register("ssh", addr("10.0.0.2", 1)).unwrap();

        let err = tracker.register("ssh", addr("10.0.0.3", 1)).unwrap_err();
        assert!(matches!(
            err,
            HoneypotError::ConnectionLimitExceeded {
                scope: LimitScope::Global,
                limit: 2
            }
        ));
        assert_eq!(tracker.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_per_source_ceiling_uses_ip() {
        let tracker = tracker(10, 1);
        let first = tracker.register("ssh", addr("10.0.0.1", 1000)).unwrap();

        let err = tracker.register("ssh", addr("10.0.0.1", 1001)).unwrap_err();
        assert!(matches!(
            err,
            HoneypotError::ConnectionLimitExceeded {
                scope: LimitScope::Source,
                ..
            }
        ));
        assert!(tracker.register("ssh", addr("10.0.0.2", 1000)).is_ok());

        tracker.unregister(&first).unwrap();
        assert!(tracker.register("ssh", addr("10.0.0.1", 1002)).is_ok());
    }

    #[tokio::test]
    async fn test_double_unregister_is_an_error() {
        let tracker = tracker(10, 10);
        let handle = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();

        tracker.unregister(&handle).unwrap();
        let err = tracker.unregister(&handle).unwrap_err();
        assert!(matches!(err, HoneypotError::UnknownConnection(id) if id == handle.id()));
        assert_eq!(tracker.stats().double_releases, 1);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_per_plugin_counts() {
        let tracker = tracker(10, 10);
        let a = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();
        let _b = tracker.register("ssh", addr("10.0.0.2", 1)).unwrap();
        let _c = tracker.register("ftp", addr("10.0.0.3", 1)).unwrap();

        assert_eq!(tracker.active_for("ssh"), 2);
        assert_eq!(tracker.active_for("ftp"), 1);
        assert_eq!(tracker.active_for("telnet"), 0);

        tracker.unregister(&a).unwrap();
        assert_eq!(tracker.active_for("ssh"), 1);
        assert_eq!(tracker.total_for("ssh"), 2);
    }

    #[tokio::test]
    async fn test_handle_sequence_and_bytes() {
        let tracker = tracker(10, 10);
        let handle = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();

        let first = handle.event(EventKind::ConnectionOpened);
        let second = handle.event(EventKind::AuthAttempt);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.connection_id, handle.id());
        assert_eq!(second.source, Some(handle.remote()));

        handle.record_in(10);
        handle.record_out(4);
        assert_eq!(handle.bytes_in(), 10);
        assert_eq!(handle.bytes_out(), 4);
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let tracker = tracker(10, 10);
        let handle = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();

        assert_eq!(handle.close_reason(), None);
        assert!(handle.close(CloseReason::IdleTimeout));
        assert!(!handle.close(CloseReason::Shutdown));
        assert_eq!(handle.close_reason(), Some(CloseReason::IdleTimeout));
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_evicts_once() {
        let tracker = tracker(10, 10);
        let idle = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();
        let busy = tracker.register("ssh", addr("10.0.0.2", 1)).unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        busy.touch();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(tracker.idle_sweep(), 1);
        assert!(idle.is_cancelled());
        assert_eq!(idle.close_reason(), Some(CloseReason::IdleTimeout));
        assert!(!busy.is_cancelled());

        // Already evicted connections are not reported twice
        assert_eq!(tracker.idle_sweep(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_is_announced_by_owner() {
        let memory = crate::sink::MemorySink::default();
        let tracker = ConnectionTracker::new(
            TrackerConfig {
                max_connections: 10,
                max_connections_per_source: 10,
                idle_timeout: Duration::from_secs(60),
                max_lifetime: None,
            },
            EventPipeline::builder().sink(Box::new(memory.clone())).build(),
        );
        let idle = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();
        let open = tracker.register("ssh", addr("10.0.0.2", 1)).unwrap();
        let first = idle.event(EventKind::ConnectionOpened);

        tokio::time::advance(Duration::from_secs(61)).await;
        open.touch();
        assert_eq!(tracker.idle_sweep(), 1);

        // The sweep itself emits nothing
        assert!(memory.events().is_empty());
        assert!(!tracker.announce_eviction(&open));
        assert!(tracker.announce_eviction(&idle));

        assert!(memory.wait_for_kind(EventKind::IdleTimeout, Duration::from_secs(1)).await);
        let evicted = &memory.events_of(EventKind::IdleTimeout)[0];
        assert_eq!(evicted.connection_id, idle.id());
        assert_eq!(evicted.sequence, first.sequence + 1);
        assert_eq!(evicted.field("idle_ms"), Some(&serde_json::json!(61_000)));
    }

    #[tokio::test]
    async fn test_top_sources() {
        let tracker = tracker(100, 100);
        for port in 0..3 {
            let h = tracker.register("ssh", addr("10.0.0.9", port)).unwrap();
            tracker.unregister(&h).unwrap();
        }
        let h = tracker.register("ssh", addr("10.0.0.1", 1)).unwrap();
        tracker.unregister(&h).unwrap();

        let stats = tracker.stats();
        assert_eq!(stats.unique_sources, 2);
        assert_eq!(stats.top_sources[0], ("10.0.0.9".parse().unwrap(), 3));
        assert_eq!(stats.registered, 4);
        assert_eq!(stats.unregistered, 4);
    }
}
