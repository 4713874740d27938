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

//! In-memory sink for observing the event stream

use super::EventSink;
use crate::error::SinkError;
use crate::event::{Event, EventKind};
use crate::types::ConnectionId;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Collects events in memory; clones share the same buffer
#[derive(Debug, Clone)]
pub struct MemorySink {
    name: String,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemorySink {
    /// Create an empty sink
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of everything received so far
    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Events belonging to one connection, in arrival order
    pub fn events_for(&self, id: ConnectionId) -> Vec<Event> {
        self.lock()
            .iter()
            .filter(|e| e.connection_id == id)
            .cloned()
            .collect()
    }

    /// Events of one kind, in arrival order
    pub fn events_of(&self, kind: EventKind) -> Vec<Event> {
        self.lock().iter().filter(|e| e.kind == kind).cloned().collect()
    }

    /// Number of events received
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nothing has been received
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Poll until `predicate` holds or `timeout` elapses
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[Event]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until at least one event of `kind` arrived
    pub async fn wait_for_kind(&self, kind: EventKind, timeout: Duration) -> bool {
        self.wait_until(timeout, |events| events.iter().any(|e| e.kind == kind))
            .await
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, event: &Event) -> Result<(), SinkError> {
        self.lock().push(event.clone());
        Ok(())
    }
}
