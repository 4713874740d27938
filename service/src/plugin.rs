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

//! Plugin contract
//!
//! Every emulator implements [`Plugin`] for its lifecycle and one of
//! [`ConnectionHandler`] (stream transports) or [`DatagramHandler`]
//! (datagram transports) for protocol work. The listener services in
//! [`crate::listener`] bridge the two: they accept, register with the
//! tracker, and invoke the handler once per connection.
//!
//! # Example
//!
//! ```no_run
//! use medovina_service::{Connection, ConnectionHandler, EventKind, Result};
//! use async_trait::async_trait;
//! use tokio::io::AsyncWriteExt;
//! use tokio::net::TcpStream;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl ConnectionHandler<TcpStream> for Greeter {
//!     async fn handle_connection(&self, mut conn: Connection<TcpStream>) -> Result<()> {
//!         conn.stream.write_all(b"220 ready\r\n").await?;
//!         conn.emit(conn.event(EventKind::ProtocolProbe).with_field("greeting", true));
//!         Ok(())
//!     }
//! }
//! ```

use crate::config::PluginDescriptor;
use crate::event::{Event, EventKind};
use crate::pipeline::EventPipeline;
use crate::stream::TrackedStream;
use crate::tracker::{ConnectionHandle, ConnectionTracker};
use crate::types::{CloseReason, ConnectionId, PluginStatus};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Shared services handed to a plugin when it starts
#[derive(Clone, Debug)]
pub struct PluginContext {
    /// Connection accounting shared by all plugins
    pub tracker: Arc<ConnectionTracker>,
    /// Event fan-out
    pub pipeline: EventPipeline,
    /// Hostname emulators should present
    pub hostname: String,
}

impl PluginContext {
    /// Bundle the shared services
    pub fn new(
        tracker: Arc<ConnectionTracker>,
        pipeline: EventPipeline,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            pipeline,
            hostname: hostname.into(),
        }
    }
}

/// Lifecycle contract of an emulated service
///
/// The supervisor drives an instance through `configure`, `start` and
/// `stop`, and is the only writer of its lifecycle state. Implementations
/// must be safe to `stop` at any time and must not block `status`.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Registry kind this plugin implements
    fn kind(&self) -> &'static str;

    /// Apply the descriptor; called exactly once, before `start`
    ///
    /// Invalid emulator options fail with
    /// [`HoneypotError::Configuration`](crate::HoneypotError::Configuration).
    fn configure(&mut self, descriptor: &PluginDescriptor) -> Result<()>;

    /// Bind the listener and begin accepting
    ///
    /// Fails with [`HoneypotError::AlreadyRunning`](crate::HoneypotError::AlreadyRunning)
    /// when called while running, and with
    /// [`HoneypotError::Bind`](crate::HoneypotError::Bind) when the address
    /// is unavailable.
    async fn start(&self, ctx: PluginContext) -> Result<()>;

    /// Release the listener and finish in-flight connections within `timeout`
    ///
    /// Returns `Ok` when the plugin is not running. Connections still open at
    /// the deadline are aborted and the call fails with
    /// [`HoneypotError::ForcedStop`](crate::HoneypotError::ForcedStop).
    async fn stop(&self, timeout: Duration) -> Result<()>;

    /// Emulator-reported status
    fn status(&self) -> PluginStatus;
}

/// One accepted stream connection, handed to a [`ConnectionHandler`]
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    /// Byte-counting stream to the peer
    pub stream: TrackedStream<S>,
    /// Tracker handle (sequence numbers, cancellation, counters)
    pub handle: ConnectionHandle,
    /// Event fan-out
    pub pipeline: EventPipeline,
}

impl<S> Connection<S> {
    /// Wrap `stream` for the connection described by `handle`
    pub fn new(stream: S, handle: ConnectionHandle, pipeline: EventPipeline) -> Self {
        Self {
            stream: TrackedStream::new(stream, handle.clone()),
            handle,
            pipeline,
        }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Remote address
    pub fn remote(&self) -> SocketAddr {
        self.handle.remote()
    }

    /// Start an event attributed to this connection
    pub fn event(&self, kind: EventKind) -> Event {
        self.handle.event(kind)
    }

    /// Send an event to the pipeline
    pub fn emit(&self, event: Event) {
        self.pipeline.emit(event);
    }

    /// Record why the connection is ending (first reason wins)
    pub fn set_close_reason(&self, reason: CloseReason) {
        self.handle.set_close_reason(reason);
    }

    /// Wait until the connection is evicted or its plugin stops
    pub async fn cancelled(&self) {
        self.handle.cancelled().await
    }

    /// Check if the connection has been asked to finish
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

/// Per-connection protocol logic for stream transports
///
/// Invoked once per accepted connection and run to completion or until the
/// connection's cancellation fires. Returning an error closes the connection
/// and records a `ProtocolError` event; errors never reach other connections.
#[async_trait]
pub trait ConnectionHandler<S = TcpStream>: Send + Sync + 'static
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Serve one connection
    async fn handle_connection(&self, conn: Connection<S>) -> Result<()>;
}

/// One received datagram, handed to a [`DatagramHandler`]
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Tracker handle for the exchange
    pub handle: ConnectionHandle,
    /// Datagram contents
    pub payload: Bytes,
    /// Event fan-out
    pub pipeline: EventPipeline,
}

/// Per-datagram protocol logic for datagram transports
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    /// Inspect a datagram and optionally produce a reply
    async fn handle_datagram(&self, datagram: Datagram) -> Result<Option<Bytes>>;
}
