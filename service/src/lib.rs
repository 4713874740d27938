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

//! Honeypot Host Framework
//!
//! This crate hosts any number of emulated network services ("plugins") in
//! one process, under one connection-accounting and event-logging
//! discipline:
//!
//! - One plugin failing to configure, bind or stop never affects the others
//! - Every accepted connection is registered, throttled and released exactly once
//! - Idle and over-age connections are evicted
//! - Every notable occurrence becomes an [`Event`] fanned out to independent sinks
//! - A failing sink degrades only itself
//!
//! # Architecture
//!
//! ```text
//! Supervisor ──> PluginRegistry ──> Plugin (per descriptor)
//!     │                               │
//!     │                          TcpService / UdpService
//!     │                               │
//!     ├──> ConnectionTracker <────────┤ register / unregister
//!     │                               │
//!     └──> EventPipeline <────────────┘ emit
//!              │
//!              └──> text / json / database / syslog sinks
//! ```
//!
//! # Example
//!
//! ```no_run
//! use medovina_service::{
//!     EventPipeline, HoneypotConfig, MemorySink, PluginRegistry, Supervisor,
//! };
//! use std::time::Duration;
//!
//! # fn registry() -> PluginRegistry { PluginRegistry::new() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HoneypotConfig::default();
//!     let pipeline = EventPipeline::builder()
//!         .config(config.global.events.clone())
//!         .sink(Box::new(MemorySink::default()))
//!         .build();
//!
//!     let supervisor = Supervisor::new(config, registry(), pipeline);
//!     supervisor.start_all().await?;
//!     // tokio::signal::ctrl_c().await?;
//!     supervisor.stop_all(Duration::from_secs(10)).await;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod event;
mod listener;
mod pipeline;
mod plugin;
mod registry;
pub mod sink;
mod stream;
mod supervisor;
mod tracker;
mod types;

pub use config::{
    EventsConfig, GlobalConfig, HoneypotConfig, LoggingConfig, OverflowPolicy, PluginDescriptor,
    SinkConfig,
};
pub use error::{HoneypotError, Result, SinkError};
pub use event::{Event, EventKind, Payload, Severity, hex_preview};
pub use listener::{TcpService, UdpService};
pub use pipeline::{DrainReport, EventPipeline, PipelineBuilder, SinkHealth, SinkHealthReport};
pub use plugin::{
    Connection, ConnectionHandler, Datagram, DatagramHandler, Plugin, PluginContext,
};
pub use registry::{PluginFactory, PluginRegistry};
pub use sink::{EventSink, MemorySink};
pub use stream::TrackedStream;
pub use supervisor::{SUPERVISOR, StopOutcome, StopReport, Supervisor, SupervisorStatus};
pub use tracker::{
    ConnectionHandle, ConnectionTracker, MAX_TRACKED_SOURCES, TrackerConfig, TrackerStats,
};
pub use types::{
    CloseReason, ConnectionId, LimitScope, PluginState, PluginStatus, PluginSummary,
    StatusSnapshot, Transport,
};
