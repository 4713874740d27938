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

//! Core types shared by the host framework and its plugins

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Unique identifier for a connection (monotonically increasing, never reused)
///
/// Id `0` is reserved for process-level events that belong to no connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Reserved id for events not tied to a connection
    pub const SYSTEM: ConnectionId = ConnectionId(0);

    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Check whether this is the reserved process-level id
    pub fn is_system(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport a plugin listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Stream listener
    #[default]
    Tcp,
    /// Datagram socket
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Plugin instance lifecycle state (stored as atomic u8 for lock-free reads)
///
/// States advance along `Created -> Starting -> Running -> Stopping -> Stopped`.
/// `Failed` is reachable from every non-terminal state and is itself terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PluginState {
    /// Instance built and configured, never started
    Created = 0,
    /// `start` in progress
    Starting = 1,
    /// Listener bound and accepting
    Running = 2,
    /// `stop` in progress
    Stopping = 3,
    /// Stopped cleanly
    Stopped = 4,
    /// Failed to configure, start or stop
    Failed = 5,
}

impl PluginState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Check if the transition `self -> next` respects the lifecycle order
    pub fn can_transition_to(self, next: PluginState) -> bool {
        match (self, next) {
            (from, Self::Failed) => !from.is_terminal(),
            (Self::Created, Self::Starting) => true,
            (Self::Starting, Self::Running) => true,
            (Self::Running, Self::Stopping) => true,
            (Self::Stopping, Self::Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a connection ended (stored as atomic u8 on the connection handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CloseReason {
    /// Peer closed the stream
    ClientClosed = 0,
    /// Peer asked to leave (e.g. `exit` in a fake shell)
    ClientExit = 1,
    /// Too many failed authentication attempts
    AuthExhausted = 2,
    /// Evicted by the tracker for inactivity
    IdleTimeout = 3,
    /// Evicted by the tracker for exceeding the lifetime ceiling
    LifetimeExceeded = 4,
    /// Plugin stop requested
    Shutdown = 5,
    /// Handler returned an error or panicked
    Error = 6,
    /// Task aborted after the shutdown deadline
    Forced = 7,
}

impl CloseReason {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::ClientClosed,
            1 => Self::ClientExit,
            2 => Self::AuthExhausted,
            3 => Self::IdleTimeout,
            4 => Self::LifetimeExceeded,
            5 => Self::Shutdown,
            6 => Self::Error,
            _ => Self::Forced,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Stable label used in event payloads
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ClientExit => "client_exit",
            Self::AuthExhausted => "auth_exhausted",
            Self::IdleTimeout => "idle_timeout",
            Self::LifetimeExceeded => "lifetime_exceeded",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
            Self::Forced => "forced",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which connection ceiling was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    /// Process-wide concurrent connection ceiling
    Global,
    /// Per-source-address ceiling
    Source,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Source => write!(f, "per-source"),
        }
    }
}

/// Emulator-reported status, returned by [`Plugin::status`](crate::Plugin::status)
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginStatus {
    /// Address the listener is actually bound to (if running)
    pub bind_address: Option<SocketAddr>,
    /// Emulator-specific details (banner, user counts, ...)
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Per-plugin status snapshot assembled by the supervisor
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Registry kind of the plugin
    pub kind: String,
    /// Whether the descriptor is enabled
    pub enabled: bool,
    /// Lifecycle state; `None` for disabled descriptors (no instance exists)
    pub state: Option<PluginState>,
    /// Time spent in `Running` so far
    pub uptime: Duration,
    /// Live connections owned by the plugin
    pub active_connections: usize,
    /// Connections accepted since the instance was created
    pub total_connections: u64,
    /// Last error recorded against the instance
    pub last_error: Option<String>,
    /// Bound address reported by the plugin
    pub bind_address: Option<SocketAddr>,
    /// Emulator-specific details
    pub details: BTreeMap<String, serde_json::Value>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            Some(state) => state.to_string(),
            None => "disabled".to_string(),
        };
        write!(
            f,
            "{} {{ state: {}, active: {}, total: {}, uptime: {:?} }}",
            self.kind, state, self.active_connections, self.total_connections, self.uptime
        )?;
        if let Some(err) = &self.last_error {
            write!(f, " last_error: {}", err)?;
        }
        Ok(())
    }
}

/// Descriptor summary returned by `list_plugins`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    /// Unique plugin name
    pub name: String,
    /// Registry kind
    pub kind: String,
    /// Transport
    pub transport: Transport,
    /// Configured bind address
    pub bind: SocketAddr,
    /// Enabled flag
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id() {
        let id1 = ConnectionId::new(1);
        let id2 = ConnectionId::new(2);

        assert_eq!(id1.as_u64(), 1);
        assert_ne!(id1, id2);
        assert!(id1 < id2);
        assert!(ConnectionId::SYSTEM.is_system());
        assert_eq!(id2.to_string(), "conn-2");
    }

    #[test]
    fn test_plugin_state_conversion() {
        for state in [
            PluginState::Created,
            PluginState::Starting,
            PluginState::Running,
            PluginState::Stopping,
            PluginState::Stopped,
            PluginState::Failed,
        ] {
            assert_eq!(PluginState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_plugin_state_transitions() {
        use PluginState::*;

        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));

        assert!(Created.can_transition_to(Failed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Starting));

        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Created.can_transition_to(Running));
    }

    #[test]
    fn test_close_reason_conversion() {
        for reason in [
            CloseReason::ClientClosed,
            CloseReason::ClientExit,
            CloseReason::AuthExhausted,
            CloseReason::IdleTimeout,
            CloseReason::LifetimeExceeded,
            CloseReason::Shutdown,
            CloseReason::Error,
            CloseReason::Forced,
        ] {
            assert_eq!(CloseReason::from_u8(reason.as_u8()), reason);
        }
        assert_eq!(CloseReason::IdleTimeout.as_str(), "idle_timeout");
    }

    #[test]
    fn test_transport_serde() {
        let t: Transport = serde_json::from_str("\"udp\"").unwrap();
        assert_eq!(t, Transport::Udp);
        assert_eq!(Transport::default(), Transport::Tcp);
    }
}
