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

//! SSH session state machine
//!
//! The session is pure: it consumes decoded [`Input`] and returns the
//! [`Action`]s the connection task must carry out (write output, emit an
//! event, close). It never touches a socket, so every dialogue can be driven
//! directly in tests.
//!
//! ```text
//!            connect
//!               │ banner, "login as: "
//!               v
//!          BannerSent ──SSH-x line──> ClientVersion event
//!               │ any other line
//!               v
//!     ┌──> AwaitingAuth ── username, then password ──> AuthAttempt event
//!     │         │                  │
//!     └─ failed ┘                  │ accepted
//!               │ max attempts     v
//!               v              ShellActive ── line ──> CommandExecuted event
//!            Closed <──────────────┘ exit
//! ```

use crate::codec::{Input, Output};
use crate::config::SshConfig;
use crate::shell::FakeShell;
use medovina_service::{CloseReason, EventKind, Payload, Severity, hex_preview};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Bytes of non-text input copied into a probe event
const PROBE_PREVIEW_BYTES: usize = 50;

/// Dialogue state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Banner written, waiting for the client's first line
    BannerSent,
    /// Collecting username and password
    AwaitingAuth,
    /// Logged in to the fake shell
    ShellActive,
    /// No further input is processed
    Closed,
}

impl SessionState {
    /// Stable label used in event payloads
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BannerSent => "banner_sent",
            Self::AwaitingAuth => "awaiting_auth",
            Self::ShellActive => "shell_active",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the connection task must do
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write output to the client
    Send(Output),
    /// Emit an event attributed to the connection
    Emit {
        /// Event kind
        kind: EventKind,
        /// Severity override, if any
        severity: Option<Severity>,
        /// Event payload
        payload: Payload,
    },
    /// End the connection with a reason
    Close(CloseReason),
}

impl Action {
    fn line(text: impl Into<String>) -> Self {
        Action::Send(Output::Line(text.into()))
    }

    fn prompt(text: impl Into<String>) -> Self {
        Action::Send(Output::Prompt(text.into()))
    }

    fn emit(kind: EventKind, payload: serde_json::Value) -> Self {
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        };
        Action::Emit {
            kind,
            severity: None,
            payload,
        }
    }
}

/// Per-connection dialogue
#[derive(Debug)]
pub struct Session {
    config: Arc<SshConfig>,
    commands: Arc<BTreeMap<String, String>>,
    hostname: String,
    state: SessionState,
    attempts: u32,
    pending_user: Option<String>,
    shell: Option<FakeShell>,
}

impl Session {
    /// Create a session presenting `hostname`
    pub fn new(config: Arc<SshConfig>, hostname: impl Into<String>) -> Self {
        let commands = Arc::new(config.commands.clone());
        Self {
            config,
            commands,
            hostname: hostname.into(),
            state: SessionState::BannerSent,
            attempts: 0,
            pending_user: None,
            shell: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Failed authentication attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Logged-in user, once the shell is active
    pub fn user(&self) -> Option<&str> {
        self.shell.as_ref().map(|shell| shell.user())
    }

    /// Greeting written when the connection is accepted
    pub fn open(&mut self) -> Vec<Action> {
        self.state = SessionState::BannerSent;
        vec![
            Action::line(self.config.banner.clone()),
            Action::prompt("login as: "),
        ]
    }

    /// Feed one unit of input
    pub fn on_input(&mut self, input: Input) -> Vec<Action> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        match input {
            Input::Binary(bytes) => self.on_probe(&bytes),
            Input::Line(line) => self.on_line(line),
        }
    }

    fn on_probe(&mut self, bytes: &[u8]) -> Vec<Action> {
        debug!(state = %self.state, size = bytes.len(), "Protocol probe");
        vec![Action::emit(
            EventKind::ProtocolProbe,
            json!({
                "state": self.state.as_str(),
                "size": bytes.len(),
                "preview": hex_preview(bytes, PROBE_PREVIEW_BYTES),
            }),
        )]
    }

    fn on_line(&mut self, line: String) -> Vec<Action> {
        match self.state {
            SessionState::BannerSent | SessionState::AwaitingAuth if line.starts_with("SSH-") => {
                self.state = SessionState::AwaitingAuth;
                self.pending_user = None;
                vec![
                    Action::emit(EventKind::ClientVersion, json!({ "client_version": line })),
                    Action::prompt("login as: "),
                ]
            }
            SessionState::BannerSent | SessionState::AwaitingAuth => {
                self.state = SessionState::AwaitingAuth;
                match self.pending_user.take() {
                    None => self.on_username(line),
                    Some(username) => self.on_password(username, line),
                }
            }
            SessionState::ShellActive => self.on_command(line),
            SessionState::Closed => Vec::new(),
        }
    }

    fn on_username(&mut self, line: String) -> Vec<Action> {
        let username = line.trim().to_string();
        if username.is_empty() {
            return vec![Action::prompt("login as: ")];
        }
        let prompt = format!("{}@{}'s password: ", username, self.hostname);
        self.pending_user = Some(username);
        vec![Action::prompt(prompt)]
    }

    fn on_password(&mut self, username: String, password: String) -> Vec<Action> {
        let success = self.config.accepts(&username, &password);
        let attempt = self.attempts + 1;
        let mut actions = vec![Action::Emit {
            kind: EventKind::AuthAttempt,
            severity: success.then_some(Severity::Critical),
            payload: match json!({
                "username": username,
                "password": password,
                "success": success,
                "attempt": attempt,
            }) {
                serde_json::Value::Object(map) => map,
                _ => Payload::new(),
            },
        }];

        if success {
            debug!(%username, "Fake login accepted");
            let shell = FakeShell::new(username, self.hostname.clone(), self.commands.clone());
            if let Some(motd) = &self.config.motd {
                actions.extend(motd.lines().map(Action::line));
                actions.push(Action::line(""));
            }
            actions.push(Action::prompt(shell.prompt()));
            self.shell = Some(shell);
            self.state = SessionState::ShellActive;
            return actions;
        }

        self.attempts = attempt;
        if self.attempts >= self.config.max_auth_attempts {
            debug!(attempts = self.attempts, "Authentication attempts exhausted");
            self.state = SessionState::Closed;
            actions.push(Action::emit(
                EventKind::AuthExhausted,
                json!({ "attempts": self.attempts, "last_username": username }),
            ));
            actions.push(Action::line("Too many authentication failures"));
            actions.push(Action::Close(CloseReason::AuthExhausted));
        } else {
            actions.push(Action::line("Permission denied, please try again."));
            actions.push(Action::prompt("login as: "));
        }
        actions
    }

    fn on_command(&mut self, line: String) -> Vec<Action> {
        let Some(shell) = self.shell.as_mut() else {
            self.state = SessionState::Closed;
            return vec![Action::Close(CloseReason::Error)];
        };

        let mut actions = Vec::new();
        let command = line.trim();
        if !command.is_empty() {
            actions.push(Action::emit(
                EventKind::CommandExecuted,
                json!({ "command": command, "cwd": shell.cwd(), "user": shell.user() }),
            ));
        }

        let reply = shell.execute(command);
        actions.extend(reply.lines.into_iter().map(Action::line));
        if reply.exit {
            self.state = SessionState::Closed;
            actions.push(Action::Close(CloseReason::ClientExit));
        } else {
            actions.push(Action::prompt(shell.prompt()));
        }
        actions
    }
}
