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

//! Error types for the honeypot host

use crate::types::{ConnectionId, LimitScope};
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for host operations
pub type Result<T> = std::result::Result<T, HoneypotError>;

/// Host framework error types
#[derive(Debug, Error)]
pub enum HoneypotError {
    /// A descriptor or emulator option set is invalid
    #[error("Configuration error in {plugin}: {reason}")]
    Configuration {
        /// Plugin the descriptor belongs to
        plugin: String,
        /// What is wrong with it
        reason: String,
    },

    /// No factory is registered for the requested kind
    #[error("Unknown plugin kind '{0}'")]
    UnknownPluginKind(String),

    /// Two descriptors share the same name
    #[error("Duplicate plugin name '{0}'")]
    DuplicatePlugin(String),

    /// No plugin with the given name exists
    #[error("Plugin '{0}' not found")]
    PluginNotFound(String),

    /// The listener address could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// `start` called while the plugin is running
    #[error("Plugin '{0}' is already running")]
    AlreadyRunning(String),

    /// `start` failed for a plugin-specific reason
    #[error("Plugin '{plugin}' failed to start: {reason}")]
    Start {
        /// Plugin name
        plugin: String,
        /// Failure description
        reason: String,
    },

    /// `start` did not complete within the configured timeout
    #[error("Plugin '{0}' did not start in time")]
    StartTimeout(String),

    /// `stop` failed for a plugin-specific reason
    #[error("Plugin '{plugin}' failed to stop: {reason}")]
    Stop {
        /// Plugin name
        plugin: String,
        /// Failure description
        reason: String,
    },

    /// `stop` exceeded its deadline and connections were force-closed
    #[error("Plugin '{plugin}' force-stopped with {pending} connection(s) still open")]
    ForcedStop {
        /// Plugin name
        plugin: String,
        /// Connections that had to be aborted
        pending: usize,
    },

    /// A connection ceiling would be exceeded
    #[error("Connection limit exceeded ({scope} limit {limit})")]
    ConnectionLimitExceeded {
        /// Which ceiling
        scope: LimitScope,
        /// Configured value of that ceiling
        limit: usize,
    },

    /// The handle was never registered or has already been released
    #[error("Connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    /// No plugin reached `Running`
    #[error("No plugins available")]
    NoPluginsAvailable,

    /// The supervisor has already begun `stop_all`
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HoneypotError {
    /// Check if the error must terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, HoneypotError::NoPluginsAvailable)
    }

    /// Check if the error is scoped to a single plugin
    pub fn is_plugin_error(&self) -> bool {
        matches!(
            self,
            HoneypotError::Configuration { .. }
                | HoneypotError::Bind { .. }
                | HoneypotError::AlreadyRunning(_)
                | HoneypotError::Start { .. }
                | HoneypotError::StartTimeout(_)
                | HoneypotError::Stop { .. }
                | HoneypotError::ForcedStop { .. }
        )
    }

    /// Check if the error is scoped to a single connection
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            HoneypotError::ConnectionLimitExceeded { .. }
                | HoneypotError::UnknownConnection(_)
                | HoneypotError::Io(_)
        )
    }

    /// Shorthand for a configuration error
    pub fn configuration(plugin: impl Into<String>, reason: impl ToString) -> Self {
        HoneypotError::Configuration {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised at a sink boundary
///
/// These never leave the pipeline; they only degrade the health of the sink
/// that produced them.
#[derive(Debug, Error)]
pub enum SinkError {
    /// File or socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event could not be serialized
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Database rejected the write or is unreachable
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Sink has been shut down
    #[error("Sink closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_fatal() {
        assert!(HoneypotError::NoPluginsAvailable.is_fatal());
        assert!(!HoneypotError::StartTimeout("ssh".into()).is_fatal());
        assert!(!HoneypotError::UnknownPluginKind("ftp".into()).is_fatal());
        assert!(!HoneypotError::ShuttingDown.is_fatal());
    }

    #[test]
    fn test_error_scopes() {
        assert!(HoneypotError::AlreadyRunning("ssh".into()).is_plugin_error());
        assert!(HoneypotError::configuration("ssh", "bad banner").is_plugin_error());
        assert!(
            HoneypotError::ConnectionLimitExceeded {
                scope: LimitScope::Global,
                limit: 10
            }
            .is_connection_error()
        );
        assert!(!HoneypotError::NoPluginsAvailable.is_plugin_error());
        assert!(!HoneypotError::ShuttingDown.is_plugin_error());
    }

    #[test]
    fn test_error_display() {
        let err = HoneypotError::UnknownConnection(ConnectionId::new(42));
        assert_eq!(err.to_string(), "Connection conn-42 is not registered");

        let err = HoneypotError::ConnectionLimitExceeded {
            scope: LimitScope::Source,
            limit: 4,
        };
        assert_eq!(err.to_string(), "Connection limit exceeded (per-source limit 4)");

        let err = HoneypotError::ForcedStop {
            plugin: "ssh".into(),
            pending: 2,
        };
        assert_eq!(
            err.to_string(),
            "Plugin 'ssh' force-stopped with 2 connection(s) still open"
        );
    }
}
