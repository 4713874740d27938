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

//! Event pipeline delivery, isolation and overflow tests

use async_trait::async_trait;
use medovina_service::{
    ConnectionId, Event, EventKind, EventPipeline, EventSink, EventsConfig, MemorySink,
    OverflowPolicy, SinkError, SinkHealth,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Sink whose writes always fail
struct BrokenSink;

#[async_trait]
impl EventSink for BrokenSink {
    fn name(&self) -> &str {
        "broken"
    }

    async fn write(&mut self, _event: &Event) -> Result<(), SinkError> {
        Err(SinkError::Io(std::io::Error::other("disk on fire")))
    }
}

/// Sink that fails its first `failures` writes, then forwards to memory
struct FlakySink {
    failures: usize,
    attempts: Arc<AtomicUsize>,
    inner: MemorySink,
}

#[async_trait]
impl EventSink for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn write(&mut self, event: &Event) -> Result<(), SinkError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(SinkError::Closed);
        }
        self.inner.write(event).await
    }
}

fn fast_retries() -> EventsConfig {
    EventsConfig {
        retry_initial_ms: 1,
        retry_max_ms: 4,
        max_retries: 3,
        ..EventsConfig::default()
    }
}

fn connection_event(id: u64, seq: u64) -> Event {
    Event::new("ssh", EventKind::CommandExecuted)
        .with_connection(ConnectionId::new(id), seq)
        .with_field("command", format!("cmd-{}", seq))
}

#[tokio::test]
async fn test_per_connection_order_on_every_sink() {
    let first = MemorySink::new("first");
    let second = MemorySink::new("second");
    let pipeline = EventPipeline::builder()
        .sink(Box::new(first.clone()))
        .sink(Box::new(second.clone()))
        .build();

    for seq in 1..=50 {
        pipeline.emit(connection_event(1, seq));
        pipeline.emit(connection_event(2, seq));
    }
    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    assert!(report.drained);

    for sink in [&first, &second] {
        for id in [1, 2] {
            let sequences: Vec<u64> = sink
                .events_for(ConnectionId::new(id))
                .iter()
                .map(|e| e.sequence)
                .collect();
            assert_eq!(sequences, (1..=50).collect::<Vec<_>>());
        }
    }
}

#[tokio::test]
async fn test_failing_sink_does_not_affect_others() {
    let memory = MemorySink::default();
    let pipeline = EventPipeline::builder()
        .config(fast_retries())
        .sink(Box::new(BrokenSink))
        .sink(Box::new(memory.clone()))
        .build();

    for seq in 1..=5 {
        pipeline.emit(connection_event(7, seq));
    }

    assert!(memory.wait_until(Duration::from_secs(5), |events| events.len() == 5).await);

    let health = pipeline.health();
    assert_eq!(health[0].name, "broken");
    assert_ne!(health[0].health, SinkHealth::Healthy);
    assert!(health[0].failed_writes >= 1);
    assert_eq!(health[0].last_error.as_deref(), Some("I/O error: disk on fire"));
    assert_eq!(health[1].health, SinkHealth::Healthy);

    pipeline.shutdown(Duration::from_secs(5)).await;
    let health = pipeline.health();
    assert_eq!(health[0].dropped, 5);
    assert_eq!(health[0].failed_writes, 15);
    assert_eq!(health[1].written, 5);
}

#[tokio::test]
async fn test_sink_becomes_unhealthy_after_threshold() {
    let pipeline = EventPipeline::builder()
        .config(EventsConfig {
            unhealthy_after_secs: 0,
            ..fast_retries()
        })
        .sink(Box::new(BrokenSink))
        .build();

    pipeline.emit(connection_event(1, 1));
    pipeline.shutdown(Duration::from_secs(5)).await;

    assert_eq!(pipeline.health()[0].health, SinkHealth::Unhealthy);
}

#[tokio::test]
async fn test_retry_recovers_and_restores_health() {
    let memory = MemorySink::default();
    let attempts = Arc::new(AtomicUsize::new(0));
    let pipeline = EventPipeline::builder()
        .config(fast_retries())
        .sink(Box::new(FlakySink {
            failures: 2,
            attempts: attempts.clone(),
            inner: memory.clone(),
        }))
        .build();

    pipeline.emit(connection_event(3, 1));
    pipeline.shutdown(Duration::from_secs(5)).await;

    assert_eq!(memory.len(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let health = &pipeline.health()[0];
    assert_eq!(health.health, SinkHealth::Healthy);
    assert_eq!(health.failed_writes, 2);
    assert_eq!(health.dropped, 0);
}

#[tokio::test]
async fn test_overflow_drop_newest() {
    let memory = MemorySink::default();
    let pipeline = EventPipeline::builder()
        .config(EventsConfig {
            buffer_size: 2,
            overflow: OverflowPolicy::DropNewest,
            ..EventsConfig::default()
        })
        .sink(Box::new(memory.clone()))
        .build();

    // The single-threaded test runtime does not poll the worker until we await
    for seq in 1..=5 {
        pipeline.emit(connection_event(1, seq));
    }
    assert_eq!(pipeline.health()[0].dropped, 3);

    pipeline.shutdown(Duration::from_secs(5)).await;
    let kept: Vec<u64> = memory.events().iter().map(|e| e.sequence).collect();
    assert_eq!(kept, vec![1, 2]);
}

#[tokio::test]
async fn test_overflow_drop_oldest() {
    let memory = MemorySink::default();
    let pipeline = EventPipeline::builder()
        .config(EventsConfig {
            buffer_size: 2,
            overflow: OverflowPolicy::DropOldest,
            ..EventsConfig::default()
        })
        .sink(Box::new(memory.clone()))
        .build();

    for seq in 1..=5 {
        pipeline.emit(connection_event(1, seq));
    }

    pipeline.shutdown(Duration::from_secs(5)).await;
    let kept: Vec<u64> = memory.events().iter().map(|e| e.sequence).collect();
    assert_eq!(kept, vec![4, 5]);
    assert_eq!(pipeline.health()[0].dropped, 3);
}

#[tokio::test]
async fn test_system_events_are_numbered() {
    let memory = MemorySink::default();
    let pipeline = EventPipeline::builder().sink(Box::new(memory.clone())).build();

    for _ in 0..3 {
        pipeline.emit(Event::new("supervisor", EventKind::Heartbeat));
    }
    pipeline.shutdown(Duration::from_secs(5)).await;

    let sequences: Vec<u64> = memory
        .events_for(ConnectionId::SYSTEM)
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_emit_after_shutdown_is_discarded() {
    let memory = MemorySink::default();
    let pipeline = EventPipeline::builder().sink(Box::new(memory.clone())).build();

    pipeline.emit(connection_event(1, 1));
    let first = pipeline.shutdown(Duration::from_secs(5)).await;
    let second = pipeline.shutdown(Duration::from_secs(5)).await;
    pipeline.emit(connection_event(1, 2));

    assert!(first.drained);
    assert!(second.drained);
    assert!(pipeline.is_closed());
    assert_eq!(memory.len(), 1);
    assert_eq!(pipeline.emitted(), 1);
}

#[tokio::test]
async fn test_file_sinks_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let json_path = dir.path().join("attacks.json");
    let text_path = dir.path().join("honeypot.log");
    let sinks = vec![
        medovina_service::sink::build(
            &medovina_service::SinkConfig::Json {
                path: json_path.clone(),
                max_bytes: 1024 * 1024,
                backups: 1,
            },
            "honeypot.local",
        ),
        medovina_service::sink::build(
            &medovina_service::SinkConfig::Text {
                path: text_path.clone(),
                max_bytes: 1024 * 1024,
                backups: 1,
            },
            "honeypot.local",
        ),
    ];
    let pipeline = EventPipeline::from_config(&EventsConfig::default(), sinks);

    pipeline.emit(
        connection_event(4, 1)
            .with_source("192.0.2.10:50000".parse().unwrap()),
    );
    pipeline.shutdown(Duration::from_secs(5)).await;

    let json = std::fs::read_to_string(&json_path).unwrap();
    let value: serde_json::Value = serde_json::from_str(json.trim_end()).unwrap();
    assert_eq!(value["kind"], "command_executed");
    assert_eq!(value["source"], "192.0.2.10:50000");

    let text = std::fs::read_to_string(&text_path).unwrap();
    assert!(text.contains("ssh conn-4 192.0.2.10:50000 command_executed command=\"cmd-1\""));
}
