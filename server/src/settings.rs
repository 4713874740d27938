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

//! TOML settings loader
//!
//! ```toml
//! [global]
//! hostname = "web-01"
//! max_connections = 500
//!
//! [[plugins]]
//! name = "ssh"
//! kind = "ssh"
//! port = 2222
//! enabled = true
//!
//! [[sinks]]
//! type = "json"
//! path = "logs/attacks.json"
//! ```

use medovina_service::HoneypotConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Settings loading errors
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that was requested
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid configuration
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Underlying TOML error
        #[source]
        source: toml::de::Error,
    },
}

/// Parse configuration text; `origin` only labels errors
pub fn parse(text: &str, origin: &Path) -> Result<HoneypotConfig, SettingsError> {
    toml::from_str(text).map_err(|source| SettingsError::Parse {
        path: origin.to_path_buf(),
        source,
    })
}

/// Read and parse a configuration file
pub fn load(path: &Path) -> Result<HoneypotConfig, SettingsError> {
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medovina_service::{OverflowPolicy, SinkConfig, Transport};
    use std::io::Write;

    const SAMPLE: &str = r#"
        [global]
        hostname = "web-01"
        max_connections = 500
        idle_timeout_secs = 120

        [global.events]
        overflow = "drop_newest"

        [logging]
        level = "debug"
        json = true

        [[plugins]]
        name = "ssh"
        kind = "ssh"
        port = 2222
        enabled = true

        [plugins.options]
        banner = "SSH-2.0-OpenSSH_7.4"
        fake_users = [{ username = "admin", password = "admin" }]

        [[plugins]]
        name = "dns"
        kind = "dns"
        transport = "udp"
        bind_address = "127.0.0.1"
        port = 5353

        [[sinks]]
        type = "json"
        path = "logs/attacks.json"
        backups = 2

        [[sinks]]
        type = "syslog"
        address = "127.0.0.1:514"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = parse(SAMPLE, Path::new("sample.toml")).unwrap();

        assert_eq!(config.global.hostname, "web-01");
        assert_eq!(config.global.max_connections, 500);
        assert_eq!(config.global.max_connections_per_source, 32);
        assert_eq!(config.global.idle_timeout_secs, 120);
        assert_eq!(config.global.events.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);

        assert_eq!(config.plugins.len(), 2);
        assert!(config.plugins[0].enabled);
        assert_eq!(config.plugins[0].options["fake_users"][0]["username"], "admin");
        assert!(!config.plugins[1].enabled);
        assert_eq!(config.plugins[1].transport, Transport::Udp);

        assert_eq!(
            config.sinks[0],
            SinkConfig::Json {
                path: PathBuf::from("logs/attacks.json"),
                max_bytes: 100 * 1024 * 1024,
                backups: 2,
            }
        );
        assert!(matches!(config.sinks[1], SinkConfig::Syslog { facility: 16, .. }));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = parse("", Path::new("empty.toml")).unwrap();
        assert!(config.plugins.is_empty());
        assert_eq!(config.global.max_connections, 1000);
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse("[[plugins]]\nname = 3", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
        assert!(err.to_string().starts_with("Failed to parse bad.toml"));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.plugins[0].port, 2222);
    }

    #[test]
    fn test_missing_file() {
        let err = load(Path::new("/nonexistent/medovina.toml")).unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
    }
}
