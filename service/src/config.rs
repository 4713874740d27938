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

//! Resolved host configuration
//!
//! These types describe an already-loaded configuration. Reading them from
//! disk is the job of the embedding binary; the host only validates the
//! structural rules it depends on (unique names, non-zero limits).
//!
//! # Example
//!
//! ```
//! use medovina_service::{GlobalConfig, HoneypotConfig, PluginDescriptor};
//! use std::time::Duration;
//!
//! let config = HoneypotConfig::default()
//!     .with_global(
//!         GlobalConfig::default()
//!             .with_max_connections(500)
//!             .with_idle_timeout(Duration::from_secs(60)),
//!     )
//!     .with_plugin(PluginDescriptor::new("ssh", "ssh", 2222));
//! assert!(config.validate().is_ok());
//! ```

use crate::types::{PluginSummary, Transport};
use crate::{HoneypotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Complete resolved configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HoneypotConfig {
    /// Process-wide options
    #[serde(default)]
    pub global: GlobalConfig,
    /// One descriptor per configured service
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
    /// Event sinks
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    /// Diagnostic logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HoneypotConfig {
    /// Replace the global options
    pub fn with_global(mut self, global: GlobalConfig) -> Self {
        self.global = global;
        self
    }

    /// Append a plugin descriptor
    pub fn with_plugin(mut self, descriptor: PluginDescriptor) -> Self {
        self.plugins.push(descriptor);
        self
    }

    /// Append a sink
    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Descriptors with `enabled = true`, in configuration order
    pub fn enabled_plugins(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.iter().filter(|d| d.enabled)
    }

    /// Validate the structural rules the host relies on
    pub fn validate(&self) -> Result<()> {
        self.global.validate()?;

        let mut names = HashSet::new();
        for descriptor in &self.plugins {
            descriptor.validate()?;
            if !names.insert(descriptor.name.as_str()) {
                return Err(HoneypotError::DuplicatePlugin(descriptor.name.clone()));
            }
        }
        Ok(())
    }
}

/// Process-wide options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Hostname presented by emulators
    pub hostname: String,
    /// Concurrent connection ceiling across all plugins
    pub max_connections: usize,
    /// Concurrent connection ceiling per source address
    pub max_connections_per_source: usize,
    /// Seconds without traffic before a connection is evicted
    pub idle_timeout_secs: u64,
    /// Maximum connection age in seconds (0 disables)
    pub max_connection_lifetime_secs: u64,
    /// Seconds between tracker sweeps
    pub sweep_interval_secs: u64,
    /// Seconds between heartbeat events
    pub heartbeat_interval_secs: u64,
    /// Seconds a plugin may take to start
    pub start_timeout_secs: u64,
    /// Seconds a plugin may take to drain on stop
    pub shutdown_timeout_secs: u64,
    /// Event pipeline options
    pub events: EventsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            hostname: "honeypot.local".to_string(),
            max_connections: 1000,
            max_connections_per_source: 32,
            idle_timeout_secs: 60,
            max_connection_lifetime_secs: 300,
            sweep_interval_secs: 5,
            heartbeat_interval_secs: 60,
            start_timeout_secs: 10,
            shutdown_timeout_secs: 10,
            events: EventsConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Set the global concurrent connection ceiling
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-source concurrent connection ceiling
    pub fn with_max_connections_per_source(mut self, max: usize) -> Self {
        self.max_connections_per_source = max;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the connection lifetime ceiling (`None` disables it)
    pub fn with_max_connection_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_connection_lifetime_secs = lifetime.map(|d| d.as_secs()).unwrap_or(0);
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_secs = interval.as_secs();
        self
    }

    /// Set the plugin start timeout
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_secs = timeout.as_secs();
        self
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Lifetime ceiling as a duration, if enabled
    pub fn max_connection_lifetime(&self) -> Option<Duration> {
        (self.max_connection_lifetime_secs > 0)
            .then(|| Duration::from_secs(self.max_connection_lifetime_secs))
    }

    /// Sweep interval as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Heartbeat interval as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Start timeout as a duration
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Shutdown timeout as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.max_connections == 0, "max_connections must be greater than 0"),
            (
                self.max_connections_per_source == 0,
                "max_connections_per_source must be greater than 0",
            ),
            (self.idle_timeout_secs == 0, "idle_timeout_secs must be greater than 0"),
            (self.sweep_interval_secs == 0, "sweep_interval_secs must be greater than 0"),
            (
                self.heartbeat_interval_secs == 0,
                "heartbeat_interval_secs must be greater than 0",
            ),
            (self.start_timeout_secs == 0, "start_timeout_secs must be greater than 0"),
            (self.events.buffer_size == 0, "events.buffer_size must be greater than 0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(HoneypotError::configuration("global", reason)),
            None => Ok(()),
        }
    }
}

/// What `emit` does when a sink queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room
    #[default]
    DropOldest,
    /// Discard the event being emitted
    DropNewest,
}

/// Event pipeline options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Queue capacity per sink
    pub buffer_size: usize,
    /// Overflow behaviour
    pub overflow: OverflowPolicy,
    /// First retry delay in milliseconds
    pub retry_initial_ms: u64,
    /// Retry delay cap in milliseconds
    pub retry_max_ms: u64,
    /// Attempts per event before it is dropped for that sink
    pub max_retries: u32,
    /// Seconds of continuous failure before a sink is reported unhealthy
    pub unhealthy_after_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            overflow: OverflowPolicy::DropOldest,
            retry_initial_ms: 100,
            retry_max_ms: 5000,
            max_retries: 5,
            unhealthy_after_secs: 30,
        }
    }
}

/// Identity and options of one emulated service
///
/// Immutable once handed to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique name
    pub name: String,
    /// Registry kind (e.g. `"ssh"`)
    pub kind: String,
    /// Listener transport
    #[serde(default)]
    pub transport: Transport,
    /// Interface to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Port to bind (0 picks an ephemeral port)
    pub port: u16,
    /// Whether the service is started
    #[serde(default)]
    pub enabled: bool,
    /// Emulator-specific options, opaque to the host
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl PluginDescriptor {
    /// Create an enabled TCP descriptor bound to all interfaces
    pub fn new(name: impl Into<String>, kind: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            transport: Transport::Tcp,
            bind_address: default_bind_address(),
            port,
            enabled: true,
            options: serde_json::Value::Null,
        }
    }

    /// Set the bind interface
    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the transport
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Enable or disable the service
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the emulator options
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Socket address to bind
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Summary used by `list_plugins`
    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.name.clone(),
            kind: self.kind.clone(),
            transport: self.transport,
            bind: self.socket_addr(),
            enabled: self.enabled,
        }
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HoneypotError::configuration("<unnamed>", "plugin name is empty"));
        }
        if self.kind.trim().is_empty() {
            return Err(HoneypotError::configuration(&self.name, "plugin kind is empty"));
        }
        Ok(())
    }
}

fn default_max_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_backups() -> usize {
    5
}

fn default_facility() -> u8 {
    16
}

fn default_app_name() -> String {
    "medovina".to_string()
}

/// Event sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Human-readable lines
    Text {
        /// File path
        path: PathBuf,
        /// Rotate once the file exceeds this size
        #[serde(default = "default_max_bytes")]
        max_bytes: u64,
        /// Rotated files to keep
        #[serde(default = "default_backups")]
        backups: usize,
    },
    /// One JSON object per line
    Json {
        /// File path
        path: PathBuf,
        /// Rotate once the file exceeds this size
        #[serde(default = "default_max_bytes")]
        max_bytes: u64,
        /// Rotated files to keep
        #[serde(default = "default_backups")]
        backups: usize,
    },
    /// Append-only relational table
    Database {
        /// Connection URL (e.g. `sqlite://events.db?mode=rwc`)
        url: String,
    },
    /// RFC 5424 over UDP
    Syslog {
        /// Collector address
        address: SocketAddr,
        /// Syslog facility code (16 = local0)
        #[serde(default = "default_facility")]
        facility: u8,
        /// APP-NAME header field
        #[serde(default = "default_app_name")]
        app_name: String,
    },
}

impl SinkConfig {
    /// Name used for health reporting
    pub fn name(&self) -> String {
        match self {
            SinkConfig::Text { path, .. } => format!("text:{}", path.display()),
            SinkConfig::Json { path, .. } => format!("json:{}", path.display()),
            SinkConfig::Database { .. } => "database".to_string(),
            SinkConfig::Syslog { address, .. } => format!("syslog:{}", address),
        }
    }
}

/// Diagnostic logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit diagnostic logs as JSON
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
