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

//! RFC 5424 syslog sink over UDP
//!
//! Each event becomes one datagram:
//!
//! ```text
//! <PRI>1 TIMESTAMP HOSTNAME APP-NAME PROCID MSGID - {"timestamp":...}
//! ```
//!
//! `MSGID` is the event kind and the message body is the event's JSON form.

use super::EventSink;
use crate::error::SinkError;
use crate::event::Event;
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Sends events to a syslog collector
#[derive(Debug)]
pub struct SyslogSink {
    name: String,
    address: SocketAddr,
    facility: u8,
    app_name: String,
    hostname: String,
    socket: Option<UdpSocket>,
}

impl SyslogSink {
    /// Create a sink; the socket is bound on first write
    pub fn new(
        address: SocketAddr,
        facility: u8,
        app_name: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            name: format!("syslog:{}", address),
            address,
            facility: facility.min(23),
            app_name: app_name.into(),
            hostname: hostname.into(),
            socket: None,
        }
    }

    /// Render the syslog frame for `event`
    pub fn frame(&self, event: &Event) -> Result<String, SinkError> {
        let pri = u16::from(self.facility) * 8 + u16::from(event.severity.syslog_code());
        Ok(format!(
            "<{}>1 {} {} {} {} {} - {}",
            pri,
            event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            header_field(&self.hostname),
            header_field(&self.app_name),
            std::process::id(),
            event.kind.as_str(),
            serde_json::to_string(event)?,
        ))
    }

    async fn socket(&mut self) -> Result<&UdpSocket, SinkError> {
        if self.socket.is_none() {
            let local: SocketAddr = match self.address {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(self.address).await?;
            self.socket = Some(socket);
        }
        self.socket.as_ref().ok_or(SinkError::Closed)
    }
}

/// Header fields are printable ASCII without spaces; `-` means nil
fn header_field(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_graphic())
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "-".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl EventSink for SyslogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, event: &Event) -> Result<(), SinkError> {
        let frame = self.frame(event)?;
        let result = self.socket().await?.send(frame.as_bytes()).await;
        if let Err(e) = result {
            self.socket = None;
            return Err(e.into());
        }
        Ok(())
    }
}
