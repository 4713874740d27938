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

//! Event sinks
//!
//! A sink is a destination the pipeline copies every event into. Each sink is
//! driven by its own worker task, so a sink only ever sees one write at a
//! time and may keep plain mutable state.

mod database;
mod file;
mod memory;
mod syslog;

pub use database::DatabaseSink;
pub use file::{FileSink, LineFormat};
pub use memory::MemorySink;
pub use syslog::SyslogSink;

use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::event::Event;
use async_trait::async_trait;

/// Destination for events
#[async_trait]
pub trait EventSink: Send + 'static {
    /// Name used in health reports
    fn name(&self) -> &str;

    /// Durably write one event
    ///
    /// Errors are retried by the pipeline and never reach the producer.
    async fn write(&mut self, event: &Event) -> Result<(), SinkError>;

    /// Flush buffered output (called on shutdown)
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Build the sink described by `config`
///
/// Sinks open their files, sockets and database connections lazily on first
/// write, so construction cannot fail; an unreachable destination shows up as
/// a degraded sink instead.
pub fn build(config: &SinkConfig, hostname: &str) -> Box<dyn EventSink> {
    match config {
        SinkConfig::Text {
            path,
            max_bytes,
            backups,
        } => Box::new(FileSink::new(
            config.name(),
            LineFormat::Text,
            path.clone(),
            *max_bytes,
            *backups,
        )),
        SinkConfig::Json {
            path,
            max_bytes,
            backups,
        } => Box::new(FileSink::new(
            config.name(),
            LineFormat::Json,
            path.clone(),
            *max_bytes,
            *backups,
        )),
        SinkConfig::Database { url } => Box::new(DatabaseSink::new(url.clone())),
        SinkConfig::Syslog {
            address,
            facility,
            app_name,
        } => Box::new(SyslogSink::new(
            *address,
            *facility,
            app_name.clone(),
            hostname.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_build_names() {
        let text = build(
            &SinkConfig::Text {
                path: PathBuf::from("logs/honeypot.log"),
                max_bytes: 1024,
                backups: 1,
            },
            "honeypot.local",
        );
        assert_eq!(text.name(), "text:logs/honeypot.log");

        let db = build(
            &SinkConfig::Database {
                url: "sqlite::memory:".into(),
            },
            "honeypot.local",
        );
        assert_eq!(db.name(), "database");

        let syslog = build(
            &SinkConfig::Syslog {
                address: "127.0.0.1:514".parse().unwrap(),
                facility: 16,
                app_name: "medovina".into(),
            },
            "honeypot.local",
        );
        assert_eq!(syslog.name(), "syslog:127.0.0.1:514");
    }
}
