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

//! SSH emulator options
//!
//! Parsed from the opaque `options` value of a plugin descriptor:
//!
//! ```toml
//! [[plugins]]
//! name = "ssh"
//! kind = "ssh"
//! port = 2222
//! enabled = true
//!
//! [plugins.options]
//! banner = "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1"
//! max_auth_attempts = 3
//! fake_users = [{ username = "admin", password = "admin" }]
//! ```

use medovina_service::{HoneypotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Username and password pair the emulator accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Accepted username
    pub username: String,
    /// Accepted password
    pub password: String,
}

impl Credential {
    /// Create a credential pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Options of one SSH emulator instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    /// Identification string sent on connect
    pub banner: String,
    /// Credentials that open the fake shell
    pub fake_users: Vec<Credential>,
    /// Accept every credential pair
    pub accept_all: bool,
    /// Failed attempts before the connection is closed
    pub max_auth_attempts: u32,
    /// Authentication methods advertised in status details
    pub auth_methods: Vec<String>,
    /// Hostname shown in prompts (defaults to the global hostname)
    pub hostname: Option<String>,
    /// Message of the day printed after login
    pub motd: Option<String>,
    /// Canned output for extra commands, keyed by command name
    pub commands: BTreeMap<String, String>,
    /// Longest accepted input line in bytes
    pub max_line_length: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            banner: "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1".to_string(),
            fake_users: Vec::new(),
            accept_all: false,
            max_auth_attempts: 3,
            auth_methods: vec!["password".to_string(), "keyboard-interactive".to_string()],
            hostname: None,
            motd: Some("Welcome to Ubuntu 22.04.3 LTS (GNU/Linux 5.15.0-91-generic x86_64)".to_string()),
            commands: BTreeMap::new(),
            max_line_length: 1024,
        }
    }
}

impl SshConfig {
    /// Parse and validate descriptor options (`null` gives the defaults)
    pub fn from_options(plugin: &str, options: &serde_json::Value) -> Result<Self> {
        let config = if options.is_null() {
            SshConfig::default()
        } else {
            serde_json::from_value(options.clone())
                .map_err(|e| HoneypotError::configuration(plugin, e))?
        };
        config.validate(plugin)?;
        Ok(config)
    }

    /// Add an accepted credential pair
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.fake_users.push(Credential::new(username, password));
        self
    }

    /// Accept every credential pair
    pub fn with_accept_all(mut self, accept_all: bool) -> Self {
        self.accept_all = accept_all;
        self
    }

    /// Set the attempt ceiling
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts;
        self
    }

    /// Set or clear the message of the day
    pub fn with_motd(mut self, motd: Option<String>) -> Self {
        self.motd = motd;
        self
    }

    /// Check the options for values the session cannot work with
    pub fn validate(&self, plugin: &str) -> Result<()> {
        if !self.banner.starts_with("SSH-") {
            return Err(HoneypotError::configuration(plugin, "banner must start with 'SSH-'"));
        }
        if self.banner.contains(['\r', '\n']) {
            return Err(HoneypotError::configuration(plugin, "banner must be a single line"));
        }
        if self.max_auth_attempts == 0 {
            return Err(HoneypotError::configuration(
                plugin,
                "max_auth_attempts must be greater than 0",
            ));
        }
        if self.max_line_length < 16 {
            return Err(HoneypotError::configuration(
                plugin,
                "max_line_length must be at least 16",
            ));
        }
        if let Some(index) = self.fake_users.iter().position(|c| c.username.is_empty()) {
            return Err(HoneypotError::configuration(
                plugin,
                format!("fake_users[{}] has an empty username", index),
            ));
        }
        Ok(())
    }

    /// Check a credential pair against the fake user list
    pub fn accepts(&self, username: &str, password: &str) -> bool {
        self.accept_all
            || self
                .fake_users
                .iter()
                .any(|c| c.username == username && c.password == password)
    }

    /// Label of the authentication policy
    pub fn auth_mode(&self) -> &'static str {
        if self.accept_all { "accept_all" } else { "credentials" }
    }
}
