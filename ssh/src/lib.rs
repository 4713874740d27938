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

//! Low-interaction SSH emulator
//!
//! A line-oriented imitation of an OpenSSH server. It does not speak the SSH
//! transport protocol; it presents the identification banner, walks
//! interactive clients and scripted bots through a `login as:` / password
//! dialogue, and hands accepted logins a fake shell. Client versions,
//! credentials, commands and binary probes all become events.
//!
//! # Registration
//!
//! ```no_run
//! use medovina_service::PluginRegistry;
//!
//! let registry = PluginRegistry::new().with(medovina_ssh::KIND, medovina_ssh::factory);
//! assert!(registry.contains("ssh"));
//! ```

mod codec;
mod config;
mod plugin;
mod session;
mod shell;

pub use codec::{Input, LineCodec, Output};
pub use config::{Credential, SshConfig};
pub use plugin::{KIND, SshHandler, SshPlugin, factory};
pub use session::{Action, Session, SessionState};
pub use shell::{FakeShell, ShellReply};
