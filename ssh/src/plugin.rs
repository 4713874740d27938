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

use crate::codec::LineCodec;
use crate::config::SshConfig;
use crate::session::{Action, Session};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use medovina_service::{
    CloseReason, Connection, ConnectionHandle, ConnectionHandler, EventPipeline, HoneypotError,
    Plugin, PluginContext, PluginDescriptor, PluginStatus, Result, TcpService, TrackedStream,
    Transport,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// Registry kind of the SSH emulator
pub const KIND: &str = "ssh";

/// Registry factory for [`SshPlugin`]
pub fn factory() -> Box<dyn Plugin> {
    Box::new(SshPlugin::default())
}

/// Per-connection driver for the SSH dialogue
///
/// Generic over the stream so it runs over TCP sockets and in-memory pipes
/// alike.
#[derive(Debug, Clone)]
pub struct SshHandler {
    config: Arc<SshConfig>,
    hostname: String,
}

impl SshHandler {
    /// Create a handler presenting `hostname`
    pub fn new(config: Arc<SshConfig>, hostname: impl Into<String>) -> Self {
        Self {
            config,
            hostname: hostname.into(),
        }
    }
}

/// Carry out session actions; returns the close reason if one was requested
async fn apply<S>(
    framed: &mut Framed<TrackedStream<S>, LineCodec>,
    handle: &ConnectionHandle,
    pipeline: &EventPipeline,
    actions: Vec<Action>,
) -> Result<Option<CloseReason>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut close = None;
    for action in actions {
        match action {
            Action::Send(output) => framed.feed(output).await?,
            Action::Emit {
                kind,
                severity,
                payload,
            } => {
                let mut event = handle.event(kind).with_payload(payload);
                if let Some(severity) = severity {
                    event = event.with_severity(severity);
                }
                pipeline.emit(event);
            }
            Action::Close(reason) => close = Some(reason),
        }
    }
    framed.flush().await?;
    Ok(close)
}

#[async_trait]
impl<S> ConnectionHandler<S> for SshHandler
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handle_connection(&self, conn: Connection<S>) -> Result<()> {
        let Connection {
            stream,
            handle,
            pipeline,
        } = conn;
        let mut framed = Framed::new(stream, LineCodec::new(self.config.max_line_length));
        let mut session = Session::new(self.config.clone(), self.hostname.clone());

        let mut close = apply(&mut framed, &handle, &pipeline, session.open()).await?;
        while close.is_none() {
            let Some(input) = framed.next().await else {
                debug!(state = %session.state(), "Client closed the connection");
                break;
            };
            close = apply(&mut framed, &handle, &pipeline, session.on_input(input?)).await?;
        }

        if let Some(reason) = close {
            debug!(%reason, "Session closed by emulator");
            handle.set_close_reason(reason);
        }
        Ok(())
    }
}

/// SSH emulator plugin
///
/// Presents an OpenSSH banner, a login dialogue against the configured fake
/// users and, after a successful login, a fake shell. Every credential and
/// command is reported as an event.
#[derive(Debug, Default)]
pub struct SshPlugin {
    name: String,
    bind: Option<SocketAddr>,
    config: Arc<SshConfig>,
    service: Mutex<Option<TcpService>>,
}

impl SshPlugin {
    /// Options currently in effect
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

#[async_trait]
impl Plugin for SshPlugin {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn configure(&mut self, descriptor: &PluginDescriptor) -> Result<()> {
        if descriptor.transport != Transport::Tcp {
            return Err(HoneypotError::configuration(
                &descriptor.name,
                "the ssh emulator requires the tcp transport",
            ));
        }
        self.config = Arc::new(SshConfig::from_options(&descriptor.name, &descriptor.options)?);
        self.name = descriptor.name.clone();
        self.bind = Some(descriptor.socket_addr());
        Ok(())
    }

    async fn start(&self, ctx: PluginContext) -> Result<()> {
        if self
            .service
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
        {
            return Err(HoneypotError::AlreadyRunning(self.name.clone()));
        }
        let addr = self
            .bind
            .ok_or_else(|| HoneypotError::configuration(&self.name, "plugin was not configured"))?;

        let hostname = self
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| ctx.hostname.clone());
        let handler = Arc::new(SshHandler::new(self.config.clone(), hostname));
        let service = TcpService::bind(&self.name, addr, ctx, handler).await?;

        info!(
            plugin = %self.name,
            addr = %service.local_addr(),
            auth_mode = self.config.auth_mode(),
            "SSH emulator listening"
        );
        *self.service.lock().unwrap_or_else(|p| p.into_inner()) = Some(service);
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        let service = self
            .service
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match service {
            Some(service) => service.shutdown(timeout).await,
            None => Ok(()),
        }
    }

    fn status(&self) -> PluginStatus {
        let bind_address = self
            .service
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| s.local_addr());

        let mut status = PluginStatus {
            bind_address,
            ..PluginStatus::default()
        };
        status
            .details
            .insert("banner".to_string(), json!(self.config.banner));
        status
            .details
            .insert("fake_users".to_string(), json!(self.config.fake_users.len()));
        status
            .details
            .insert("auth_mode".to_string(), json!(self.config.auth_mode()));
        status.details.insert(
            "max_auth_attempts".to_string(),
            json!(self.config.max_auth_attempts),
        );
        status
            .details
            .insert("auth_methods".to_string(), json!(self.config.auth_methods));
        status
    }
}
