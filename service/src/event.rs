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

//! Canonical event record
//!
//! Every notable occurrence (a connection opening, a login attempt, a shell
//! command) becomes one [`Event`]. Events are built once and then shared
//! read-only by every sink. Wall-clock timestamps may step backwards, so
//! ordering within a connection is carried by `sequence`, not by time.

use crate::types::ConnectionId;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::net::SocketAddr;

/// Structured payload attached to an event
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Connection accepted and registered
    ConnectionOpened,
    /// Connection ended (payload carries reason, duration and byte totals)
    ConnectionClosed,
    /// Connection refused at accept time by a connection ceiling
    ConnectionRejected,
    /// Client identification string received
    ClientVersion,
    /// Credentials submitted
    AuthAttempt,
    /// Authentication attempts exhausted
    AuthExhausted,
    /// Line entered in a fake shell
    CommandExecuted,
    /// Non-text or unexpected protocol data
    ProtocolProbe,
    /// Handler failed or panicked
    ProtocolError,
    /// Connection evicted for inactivity
    IdleTimeout,
    /// Connection evicted for exceeding its lifetime
    LifetimeExceeded,
    /// Datagram received on a UDP service
    DatagramReceived,
    /// Plugin reached `Running`
    PluginStarted,
    /// Plugin entered `Failed`
    PluginFailed,
    /// Plugin reached `Stopped`
    PluginStopped,
    /// Periodic liveness summary
    Heartbeat,
}

impl EventKind {
    /// Stable label used by the sinks
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionOpened => "connection_opened",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionRejected => "connection_rejected",
            Self::ClientVersion => "client_version",
            Self::AuthAttempt => "auth_attempt",
            Self::AuthExhausted => "auth_exhausted",
            Self::CommandExecuted => "command_executed",
            Self::ProtocolProbe => "protocol_probe",
            Self::ProtocolError => "protocol_error",
            Self::IdleTimeout => "idle_timeout",
            Self::LifetimeExceeded => "lifetime_exceeded",
            Self::DatagramReceived => "datagram_received",
            Self::PluginStarted => "plugin_started",
            Self::PluginFailed => "plugin_failed",
            Self::PluginStopped => "plugin_stopped",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Severity used when the producer does not pick one
    pub fn default_severity(self) -> Severity {
        match self {
            Self::Heartbeat => Severity::Debug,
            Self::ConnectionOpened
            | Self::ConnectionClosed
            | Self::ClientVersion
            | Self::PluginStarted
            | Self::PluginStopped
            | Self::DatagramReceived => Severity::Info,
            Self::ConnectionRejected
            | Self::IdleTimeout
            | Self::LifetimeExceeded
            | Self::ProtocolProbe => Severity::Notice,
            Self::AuthAttempt | Self::CommandExecuted | Self::ProtocolError => Severity::Warning,
            Self::AuthExhausted | Self::PluginFailed => Severity::Critical,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much attention an event deserves
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Diagnostic chatter
    Debug,
    /// Routine activity
    Info,
    /// Worth a look
    Notice,
    /// Attacker activity
    Warning,
    /// Needs attention
    Critical,
}

impl Severity {
    /// RFC 5424 severity code
    pub fn syslog_code(self) -> u8 {
        match self {
            Self::Debug => 7,
            Self::Info => 6,
            Self::Notice => 5,
            Self::Warning => 4,
            Self::Critical => 2,
        }
    }

    /// Upper-case label for text output
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warning => "WARN",
            Self::Critical => "CRIT",
        }
    }
}

/// One immutable record of a notable occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// UTC creation time
    pub timestamp: DateTime<Utc>,
    /// Plugin (or `"supervisor"`) that produced the event
    pub plugin: String,
    /// Owning connection, [`ConnectionId::SYSTEM`] for process-level events
    pub connection_id: ConnectionId,
    /// Position within the connection's event stream
    pub sequence: u64,
    /// What happened
    pub kind: EventKind,
    /// Severity
    pub severity: Severity,
    /// Remote address, when there is one
    pub source: Option<SocketAddr>,
    /// Structured details
    pub payload: Payload,
}

impl Event {
    /// Create a process-level event stamped with the current time
    pub fn new(plugin: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            plugin: plugin.into(),
            connection_id: ConnectionId::SYSTEM,
            sequence: 0,
            kind,
            severity: kind.default_severity(),
            source: None,
            payload: Payload::new(),
        }
    }

    /// Attach the event to a connection
    pub fn with_connection(mut self, id: ConnectionId, sequence: u64) -> Self {
        self.connection_id = id;
        self.sequence = sequence;
        self
    }

    /// Set the remote address
    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    /// Override the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Add one payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Merge a payload map
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload.extend(payload);
        self
    }

    /// Look up a payload field
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    /// Render the single human-readable line used by the text sink
    pub fn to_text_line(&self) -> String {
        let mut line = format!(
            "{} [{}] {} {} {} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.severity.as_str(),
            self.plugin,
            self.connection_id,
            self.source
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.kind,
        );
        for (key, value) in &self.payload {
            let _ = write!(line, " {}={}", key, value);
        }
        line
    }
}

/// Lower-case hex of at most the first `limit` bytes of `bytes`
pub fn hex_preview(bytes: &[u8], limit: usize) -> String {
    let mut out = String::with_capacity(bytes.len().min(limit) * 2);
    for byte in bytes.iter().take(limit) {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text_line())
    }
}
