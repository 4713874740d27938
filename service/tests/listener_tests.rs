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

//! Listener service tests over real sockets

use async_trait::async_trait;
use bytes::Bytes;
use medovina_service::{
    Connection, ConnectionHandler, ConnectionTracker, Datagram, DatagramHandler, EventKind,
    EventPipeline, HoneypotError, MemorySink, PluginContext, Result, TcpService, TrackerConfig,
    UdpService,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn context(config: TrackerConfig) -> (PluginContext, MemorySink) {
    let memory = MemorySink::default();
    let pipeline = EventPipeline::builder().sink(Box::new(memory.clone())).build();
    let tracker = Arc::new(ConnectionTracker::new(config, pipeline.clone()));
    (PluginContext::new(tracker, pipeline, "test-host"), memory)
}

/// Echoes lines back until the peer disconnects
struct Echo;

#[async_trait]
impl ConnectionHandler<TcpStream> for Echo {
    async fn handle_connection(&self, conn: Connection<TcpStream>) -> Result<()> {
        let mut lines = BufReader::new(conn.stream).lines();
        while let Some(line) = lines.next_line().await? {
            let stream = lines.get_mut().get_mut();
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
        }
        Ok(())
    }
}

/// Holds the connection open until cancelled, counting invocations
#[derive(Default)]
struct Hold {
    invocations: AtomicUsize,
}

#[async_trait]
impl ConnectionHandler<TcpStream> for Hold {
    async fn handle_connection(&self, conn: Connection<TcpStream>) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        conn.cancelled().await;
        Ok(())
    }
}

/// Waits for input that never comes
struct Silent;

#[async_trait]
impl ConnectionHandler<TcpStream> for Silent {
    async fn handle_connection(&self, mut conn: Connection<TcpStream>) -> Result<()> {
        let mut buf = [0u8; 64];
        while conn.stream.read(&mut buf).await? > 0 {}
        Ok(())
    }
}

/// Blocks its worker thread, so cancellation cannot reach it in time
struct Stubborn;

#[async_trait]
impl ConnectionHandler<TcpStream> for Stubborn {
    async fn handle_connection(&self, _conn: Connection<TcpStream>) -> Result<()> {
        std::thread::sleep(Duration::from_millis(600));
        Ok(())
    }
}

struct Panics;

#[async_trait]
impl ConnectionHandler<TcpStream> for Panics {
    async fn handle_connection(&self, _conn: Connection<TcpStream>) -> Result<()> {
        panic!("emulator bug");
    }
}

struct EchoDatagram;

#[async_trait]
impl DatagramHandler for EchoDatagram {
    async fn handle_datagram(&self, datagram: Datagram) -> Result<Option<Bytes>> {
        Ok(Some(datagram.payload))
    }
}

#[tokio::test]
async fn test_echo_round_trip_and_lifecycle_events() {
    let (ctx, memory) = context(TrackerConfig::default());
    let service = TcpService::bind("echo", loopback(), ctx.clone(), Arc::new(Echo))
        .await
        .unwrap();

    let mut client = TcpStream::connect(service.local_addr()).await.unwrap();
    client.write_all(b"hello\n").await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello\n");
    drop(client);

    assert!(memory.wait_for_kind(EventKind::ConnectionClosed, WAIT).await);
    let closed = &memory.events_of(EventKind::ConnectionClosed)[0];
    assert_eq!(closed.field("reason"), Some(&json!("client_closed")));
    assert_eq!(closed.field("bytes_in"), Some(&json!(6)));
    assert_eq!(closed.field("bytes_out"), Some(&json!(6)));

    let stream = memory.events_for(closed.connection_id);
    assert_eq!(stream[0].kind, EventKind::ConnectionOpened);
    assert_eq!(stream.last().unwrap().kind, EventKind::ConnectionClosed);
    assert_eq!(ctx.tracker.active_count(), 0);

    service.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_connection_over_ceiling_is_rejected_without_handler() {
    let config = TrackerConfig {
        max_connections: 2,
        ..TrackerConfig::default()
    };
    let (ctx, memory) = context(config);
    let hold = Arc::new(Hold::default());
    let service = TcpService::bind("ssh", loopback(), ctx.clone(), hold.clone())
        .await
        .unwrap();

    let _first = TcpStream::connect(service.local_addr()).await.unwrap();
    let _second = TcpStream::connect(service.local_addr()).await.unwrap();
    assert!(
        memory
            .wait_until(WAIT, |events| {
                events.iter().filter(|e| e.kind == EventKind::ConnectionOpened).count() == 2
            })
            .await
    );

    let mut third = TcpStream::connect(service.local_addr()).await.unwrap();
    assert!(memory.wait_for_kind(EventKind::ConnectionRejected, WAIT).await);

    // The rejected socket is closed without a byte written
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, third.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let rejected = &memory.events_of(EventKind::ConnectionRejected)[0];
    assert_eq!(rejected.field("scope"), Some(&json!("global")));
    assert_eq!(rejected.field("limit"), Some(&json!(2)));
    assert_eq!(hold.invocations.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.tracker.active_count(), 2);
    assert_eq!(ctx.tracker.stats().rejected, 1);

    service.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_idle_connection_is_evicted() {
    let config = TrackerConfig {
        idle_timeout: Duration::from_millis(100),
        ..TrackerConfig::default()
    };
    let (ctx, memory) = context(config);
    let stop_sweeper = CancellationToken::new();
    let sweeper = ctx
        .tracker
        .spawn_sweeper(Duration::from_millis(20), stop_sweeper.clone());
    let service = TcpService::bind("telnet", loopback(), ctx.clone(), Arc::new(Silent))
        .await
        .unwrap();

    let mut client = TcpStream::connect(service.local_addr()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(memory.wait_for_kind(EventKind::ConnectionClosed, WAIT).await);
    let kinds: Vec<EventKind> = memory
        .events()
        .iter()
        .filter(|e| !e.connection_id.is_system())
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::ConnectionOpened,
            EventKind::IdleTimeout,
            EventKind::ConnectionClosed
        ]
    );
    let closed = &memory.events_of(EventKind::ConnectionClosed)[0];
    assert_eq!(closed.field("reason"), Some(&json!("idle_timeout")));
    assert_eq!(ctx.tracker.active_count(), 0);

    stop_sweeper.cancel();
    sweeper.await.unwrap();
    service.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_lifetime_ceiling_closes_busy_connection() {
    let config = TrackerConfig {
        idle_timeout: Duration::from_secs(60),
        max_lifetime: Some(Duration::from_millis(300)),
        ..TrackerConfig::default()
    };
    let (ctx, memory) = context(config);
    let stop_sweeper = CancellationToken::new();
    let sweeper = ctx
        .tracker
        .spawn_sweeper(Duration::from_millis(20), stop_sweeper.clone());
    let service = TcpService::bind("ssh", loopback(), ctx.clone(), Arc::new(Silent))
        .await
        .unwrap();

    // Keep the connection busy until the server closes it
    let client = TcpStream::connect(service.local_addr()).await.unwrap();
    let (mut reader, mut writer) = client.into_split();
    let chatter = tokio::spawn(async move {
        while writer.write_all(b"x").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, reader.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(memory.wait_for_kind(EventKind::ConnectionClosed, WAIT).await);
    let stream: Vec<_> = memory
        .events()
        .into_iter()
        .filter(|e| !e.connection_id.is_system())
        .collect();
    let kinds: Vec<EventKind> = stream.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::ConnectionOpened,
            EventKind::LifetimeExceeded,
            EventKind::ConnectionClosed
        ]
    );
    assert!(stream.windows(2).all(|w| w[0].sequence < w[1].sequence));
    let closed = &memory.events_of(EventKind::ConnectionClosed)[0];
    assert_eq!(closed.field("reason"), Some(&json!("lifetime_exceeded")));
    assert!(closed.field("bytes_in").and_then(|v| v.as_u64()).unwrap() > 0);

    chatter.abort();
    stop_sweeper.cancel();
    sweeper.await.unwrap();
    service.shutdown(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_deadline_forces_closure() {
    let (ctx, memory) = context(TrackerConfig::default());
    let service = TcpService::bind("ssh", loopback(), ctx.clone(), Arc::new(Stubborn))
        .await
        .unwrap();

    let _client = TcpStream::connect(service.local_addr()).await.unwrap();
    assert!(memory.wait_for_kind(EventKind::ConnectionOpened, WAIT).await);

    let err = service
        .shutdown(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, HoneypotError::ForcedStop { pending: 1, .. }));
    assert!(err.is_plugin_error());
    assert!(!service.is_running());

    assert!(memory.wait_for_kind(EventKind::ConnectionClosed, WAIT).await);
    let released = tokio::time::timeout(WAIT, async {
        while ctx.tracker.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok());
    let closed = &memory.events_of(EventKind::ConnectionClosed)[0];
    assert_eq!(closed.field("reason"), Some(&json!("forced")));
    assert_eq!(ctx.tracker.stats().double_releases, 0);
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let (ctx, memory) = context(TrackerConfig::default());
    let service = TcpService::bind("ftp", loopback(), ctx.clone(), Arc::new(Panics))
        .await
        .unwrap();

    let _client = TcpStream::connect(service.local_addr()).await.unwrap();
    assert!(memory.wait_for_kind(EventKind::ConnectionClosed, WAIT).await);

    let error = &memory.events_of(EventKind::ProtocolError)[0];
    assert_eq!(error.field("panic"), Some(&json!(true)));
    assert_eq!(error.field("error"), Some(&json!("emulator bug")));
    let closed = &memory.events_of(EventKind::ConnectionClosed)[0];
    assert_eq!(closed.field("reason"), Some(&json!("error")));
    assert_eq!(ctx.tracker.active_count(), 0);

    // The listener keeps serving after a panic
    assert!(service.is_running());
    let _again = TcpStream::connect(service.local_addr()).await.unwrap();
    assert!(
        memory
            .wait_until(WAIT, |events| {
                events.iter().filter(|e| e.kind == EventKind::ProtocolError).count() == 2
            })
            .await
    );

    service.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let (ctx, memory) = context(TrackerConfig::default());
    let service = TcpService::bind("ssh", loopback(), ctx.clone(), Arc::new(Hold::default()))
        .await
        .unwrap();

    let _client = TcpStream::connect(service.local_addr()).await.unwrap();
    assert!(memory.wait_for_kind(EventKind::ConnectionOpened, WAIT).await);
    assert_eq!(service.active_connections(), 1);

    service.shutdown(WAIT).await.unwrap();
    assert!(!service.is_running());
    assert_eq!(ctx.tracker.active_count(), 0);

    assert!(memory.wait_for_kind(EventKind::ConnectionClosed, WAIT).await);
    let closed = &memory.events_of(EventKind::ConnectionClosed)[0];
    assert_eq!(closed.field("reason"), Some(&json!("shutdown")));

    // Second shutdown is a no-op and the port no longer accepts
    service.shutdown(WAIT).await.unwrap();
    assert!(TcpStream::connect(service.local_addr()).await.is_err());
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let (ctx, _memory) = context(TrackerConfig::default());
    let first = TcpService::bind("ssh", loopback(), ctx.clone(), Arc::new(Echo))
        .await
        .unwrap();

    let second = TcpService::bind("ssh2", first.local_addr(), ctx, Arc::new(Echo)).await;

    assert!(matches!(second, Err(HoneypotError::Bind { .. })));
    first.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_udp_echo_with_datagram_event() {
    let (ctx, memory) = context(TrackerConfig::default());
    let service = UdpService::bind("dns", loopback(), ctx.clone(), Arc::new(EchoDatagram))
        .await
        .unwrap();

    let client = UdpSocket::bind(loopback()).await.unwrap();
    client.send_to(b"ping", service.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let (len, from) = tokio::time::timeout(WAIT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"ping");
    assert_eq!(from, service.local_addr());

    assert!(memory.wait_for_kind(EventKind::DatagramReceived, WAIT).await);
    let received = &memory.events_of(EventKind::DatagramReceived)[0];
    assert_eq!(received.field("size"), Some(&json!(4)));
    assert_eq!(received.field("preview"), Some(&json!("70696e67")));
    assert_eq!(received.source, Some(client.local_addr().unwrap()));
    assert!(memory.events_of(EventKind::ConnectionOpened).is_empty());

    service.shutdown(WAIT).await.unwrap();
    assert!(!service.is_running());
}
