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

//! Listener services shared by all plugins
//!
//! A plugin binds a [`TcpService`] (or [`UdpService`]) in `start` and shuts
//! it down in `stop`. The service owns the accept loop and one task per
//! connection:
//!
//! ```text
//! accept ─> tracker.register ─┬─ rejected: ConnectionRejected event, socket dropped
//!                             └─ accepted: ConnectionOpened event
//!                                          spawn task ─> handler.handle_connection
//!                                          task end  ─> ConnectionClosed event, unregister
//! ```
//!
//! Unregistering happens in a drop guard owned by the connection task, so a
//! handler that returns, fails, panics or is aborted is released exactly once.

use crate::event::{Event, EventKind, hex_preview};
use crate::pipeline::EventPipeline;
use crate::plugin::{Connection, ConnectionHandler, Datagram, DatagramHandler, PluginContext};
use crate::tracker::{ConnectionHandle, ConnectionTracker};
use crate::types::{CloseReason, ConnectionId};
use crate::{HoneypotError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Bytes of a datagram copied into its event preview
const PREVIEW_BYTES: usize = 50;

/// Largest datagram read by a [`UdpService`]
const MAX_DATAGRAM: usize = 64 * 1024;

/// Grace period for aborted tasks to unwind after a forced stop
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Releases a connection when the task owning it ends, however it ends
struct Registration {
    handle: ConnectionHandle,
    tracker: Arc<ConnectionTracker>,
    pipeline: EventPipeline,
    tasks: Arc<DashMap<ConnectionId, AbortHandle>>,
    announce_close: bool,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let handle = &self.handle;
        self.tasks.remove(&handle.id());

        // Every normal exit path records a reason; none means the task was aborted
        let reason = handle.close_reason().unwrap_or(CloseReason::Forced);
        self.tracker.announce_eviction(handle);
        if self.announce_close {
            self.pipeline.emit(
                handle
                    .event(EventKind::ConnectionClosed)
                    .with_field("reason", reason.as_str())
                    .with_field("duration_ms", handle.age().as_millis() as u64)
                    .with_field("bytes_in", handle.bytes_in())
                    .with_field("bytes_out", handle.bytes_out()),
            );
        }
        if let Err(e) = self.tracker.unregister(handle) {
            error!(connection_id = %handle.id(), error = %e, "Connection released twice");
        }
        debug!(connection_id = %handle.id(), %reason, "Connection closed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run a handler future, turning errors and panics into `ProtocolError` events
///
/// Returns `true` when the handler completed successfully.
async fn run_contained<F>(handle: &ConnectionHandle, pipeline: &EventPipeline, work: F) -> bool
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(connection_id = %handle.id(), error = %e, "Handler failed");
            handle.set_close_reason(CloseReason::Error);
            pipeline.emit(
                handle
                    .event(EventKind::ProtocolError)
                    .with_field("error", e.to_string()),
            );
            false
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(connection_id = %handle.id(), panic = %message, "Handler panicked");
            handle.set_close_reason(CloseReason::Error);
            pipeline.emit(
                handle
                    .event(EventKind::ProtocolError)
                    .with_field("error", message)
                    .with_field("panic", true),
            );
            false
        }
    }
}

/// Emit the event for a connection refused by the tracker
fn announce_rejection(pipeline: &EventPipeline, plugin: &str, peer: SocketAddr, err: &HoneypotError) {
    let mut event = Event::new(plugin, EventKind::ConnectionRejected)
        .with_source(peer)
        .with_field("error", err.to_string());
    if let HoneypotError::ConnectionLimitExceeded { scope, limit } = err {
        event = event
            .with_field("scope", scope.to_string())
            .with_field("limit", *limit as u64);
    }
    pipeline.emit(event);
}

/// Task bookkeeping shared by both services
struct ServiceCore {
    plugin: String,
    local_addr: SocketAddr,
    ctx: PluginContext,
    running: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    aborts: Arc<DashMap<ConnectionId, AbortHandle>>,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceCore {
    fn new(plugin: &str, local_addr: SocketAddr, ctx: PluginContext) -> Self {
        Self {
            plugin: plugin.to_string(),
            local_addr,
            ctx,
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            aborts: Arc::new(DashMap::new()),
            receive_loop: Mutex::new(None),
        }
    }

    fn set_receive_loop(&self, handle: JoinHandle<()>) {
        *self
            .receive_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    fn registration(&self, handle: &ConnectionHandle, announce_close: bool) -> Registration {
        Registration {
            handle: handle.clone(),
            tracker: self.ctx.tracker.clone(),
            pipeline: self.ctx.pipeline.clone(),
            tasks: self.aborts.clone(),
            announce_close,
        }
    }

    /// Spawn a connection task and record its abort handle before it runs
    fn spawn_tracked<F>(&self, id: ConnectionId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (go, ready) = oneshot::channel::<()>();
        let join = self.tasks.spawn(async move {
            if ready.await.is_ok() {
                task.await;
            }
        });
        self.aborts.insert(id, join.abort_handle());
        let _ = go.send(());
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!(plugin = %self.plugin, addr = %self.local_addr, "Stopping listener");
        self.shutdown.cancel();

        let receive_loop = self
            .receive_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = receive_loop {
            let _ = handle.await;
        }

        let signalled = self.ctx.tracker.cancel_plugin(&self.plugin, CloseReason::Shutdown);
        debug!(plugin = %self.plugin, signalled, "Signalled open connections");

        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok() {
            info!(plugin = %self.plugin, "Listener stopped");
            return Ok(());
        }

        let stragglers: Vec<(ConnectionId, AbortHandle)> = self
            .aborts
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        let pending = stragglers.len();
        warn!(plugin = %self.plugin, pending, "Shutdown deadline passed, aborting connections");
        for (id, abort) in stragglers {
            if let Some(handle) = self.ctx.tracker.get(id) {
                handle.force_close_reason(CloseReason::Forced);
            }
            abort.abort();
        }
        let _ = tokio::time::timeout(ABORT_GRACE, self.tasks.wait()).await;

        Err(HoneypotError::ForcedStop {
            plugin: self.plugin.clone(),
            pending,
        })
    }

    /// Stop without waiting (listener dropped while running)
    fn abandon(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            warn!(plugin = %self.plugin, "Listener dropped while still running");
            self.shutdown.cancel();
            self.ctx.tracker.cancel_plugin(&self.plugin, CloseReason::Shutdown);
        }
    }
}

/// Stream listener owned by a plugin
///
/// # Example
///
/// ```no_run
/// use medovina_service::{ConnectionHandler, PluginContext, TcpService};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// async fn serve(ctx: PluginContext, handler: Arc<dyn ConnectionHandler>) -> medovina_service::Result<()> {
///     let service = TcpService::bind("ssh", "0.0.0.0:2222".parse().unwrap(), ctx, handler).await?;
///     // ...
///     service.shutdown(Duration::from_secs(10)).await
/// }
/// ```
pub struct TcpService {
    core: Arc<ServiceCore>,
}

impl TcpService {
    /// Bind `addr` and start accepting connections for `plugin`
    ///
    /// Fails with [`HoneypotError::Bind`] when the address is unavailable.
    pub async fn bind(
        plugin: &str,
        addr: SocketAddr,
        ctx: PluginContext,
        handler: Arc<dyn ConnectionHandler<TcpStream>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HoneypotError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| HoneypotError::Bind { addr, source })?;

        info!(plugin, addr = %local_addr, "TCP listener bound");

        let core = Arc::new(ServiceCore::new(plugin, local_addr, ctx));
        let accept_loop = tokio::spawn(accept_loop(core.clone(), listener, handler));
        core.set_receive_loop(accept_loop);

        Ok(Self { core })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    /// Check if the listener is accepting
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Live connections of this plugin
    pub fn active_connections(&self) -> usize {
        self.core.ctx.tracker.active_for(&self.core.plugin)
    }

    /// Stop accepting and finish open connections within `timeout`
    ///
    /// Returns `Ok` when already stopped, and
    /// [`HoneypotError::ForcedStop`] when connections had to be aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.core.shutdown(timeout).await
    }
}

impl Drop for TcpService {
    fn drop(&mut self) {
        self.core.abandon();
    }
}

impl std::fmt::Debug for TcpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpService")
            .field("plugin", &self.core.plugin)
            .field("local_addr", &self.core.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn accept_loop(
    core: Arc<ServiceCore>,
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler<TcpStream>>,
) {
    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = core.shutdown.cancelled() => break,
        };

        match accepted {
            Ok((socket, peer)) => {
                let handle = match core.ctx.tracker.register(&core.plugin, peer) {
                    Ok(handle) => handle,
                    Err(e) => {
                        info!(plugin = %core.plugin, %peer, error = %e, "Rejecting connection");
                        announce_rejection(&core.ctx.pipeline, &core.plugin, peer, &e);
                        drop(socket);
                        continue;
                    }
                };
                spawn_connection(&core, socket, handle, handler.clone());
            }
            Err(e) => {
                error!(plugin = %core.plugin, error = %e, "Failed to accept connection");
                // Back off on errors to avoid a tight loop
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    debug!(plugin = %core.plugin, "Accept loop terminated");
}

fn spawn_connection(
    core: &ServiceCore,
    socket: TcpStream,
    handle: ConnectionHandle,
    handler: Arc<dyn ConnectionHandler<TcpStream>>,
) {
    let registration = core.registration(&handle, true);
    let pipeline = core.ctx.pipeline.clone();
    pipeline.emit(handle.event(EventKind::ConnectionOpened));

    let span = info_span!(
        "connection",
        id = %handle.id(),
        plugin = %handle.plugin(),
        remote = %handle.remote()
    );
    let id = handle.id();
    let task = async move {
        let _registration = registration;
        let conn = Connection::new(socket, handle.clone(), pipeline.clone());
        tokio::select! {
            completed = run_contained(&handle, &pipeline, handler.handle_connection(conn)) => {
                if completed {
                    handle.set_close_reason(CloseReason::ClientClosed);
                }
            }
            _ = handle.cancelled() => {
                debug!("Connection cancelled");
            }
        }
    };
    core.spawn_tracked(id, task.instrument(span));
}

/// Datagram listener owned by a plugin
///
/// Each datagram is registered with the tracker as a short-lived exchange so
/// per-source throttling applies, recorded as a `DatagramReceived` event and
/// passed to the handler, whose optional reply is sent back to the peer.
pub struct UdpService {
    core: Arc<ServiceCore>,
}

impl UdpService {
    /// Bind `addr` and start receiving datagrams for `plugin`
    pub async fn bind(
        plugin: &str,
        addr: SocketAddr,
        ctx: PluginContext,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| HoneypotError::Bind { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| HoneypotError::Bind { addr, source })?;

        info!(plugin, addr = %local_addr, "UDP socket bound");

        let core = Arc::new(ServiceCore::new(plugin, local_addr, ctx));
        let receive_loop = tokio::spawn(receive_loop(core.clone(), Arc::new(socket), handler));
        core.set_receive_loop(receive_loop);

        Ok(Self { core })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    /// Check if the socket is receiving
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Stop receiving and finish in-flight exchanges within `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.core.shutdown(timeout).await
    }
}

impl Drop for UdpService {
    fn drop(&mut self) {
        self.core.abandon();
    }
}

impl std::fmt::Debug for UdpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpService")
            .field("plugin", &self.core.plugin)
            .field("local_addr", &self.core.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn receive_loop(
    core: Arc<ServiceCore>,
    socket: Arc<UdpSocket>,
    handler: Arc<dyn DatagramHandler>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            result = socket.recv_from(&mut buf) => result,
            _ = core.shutdown.cancelled() => break,
        };

        match received {
            Ok((len, peer)) => {
                let handle = match core.ctx.tracker.register(&core.plugin, peer) {
                    Ok(handle) => handle,
                    Err(e) => {
                        announce_rejection(&core.ctx.pipeline, &core.plugin, peer, &e);
                        continue;
                    }
                };
                let payload = Bytes::copy_from_slice(&buf[..len]);
                spawn_exchange(&core, socket.clone(), handle, payload, handler.clone());
            }
            Err(e) => {
                warn!(plugin = %core.plugin, error = %e, "Failed to receive datagram");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    debug!(plugin = %core.plugin, "Receive loop terminated");
}

fn spawn_exchange(
    core: &ServiceCore,
    socket: Arc<UdpSocket>,
    handle: ConnectionHandle,
    payload: Bytes,
    handler: Arc<dyn DatagramHandler>,
) {
    let registration = core.registration(&handle, false);
    let pipeline = core.ctx.pipeline.clone();
    handle.record_in(payload.len());
    pipeline.emit(
        handle
            .event(EventKind::DatagramReceived)
            .with_field("size", payload.len() as u64)
            .with_field("preview", hex_preview(&payload, PREVIEW_BYTES)),
    );

    let id = handle.id();
    let task = async move {
        let _registration = registration;
        let peer = handle.remote();
        let datagram = Datagram {
            handle: handle.clone(),
            payload,
            pipeline: pipeline.clone(),
        };

        let mut reply = None;
        let work = async {
            reply = handler.handle_datagram(datagram).await?;
            Ok::<(), HoneypotError>(())
        };
        tokio::select! {
            _ = run_contained(&handle, &pipeline, work) => {}
            _ = handle.cancelled() => return,
        }

        if let Some(reply) = reply {
            match socket.send_to(&reply, peer).await {
                Ok(sent) => handle.record_out(sent),
                Err(e) => debug!(%peer, error = %e, "Failed to send reply"),
            }
        }
        handle.set_close_reason(CloseReason::ClientClosed);
    };
    core.spawn_tracked(id, task);
}
