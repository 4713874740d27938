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

//! Connection accounting tests

use medovina_service::{
    CloseReason, ConnectionHandle, ConnectionTracker, EventPipeline, HoneypotError, LimitScope,
    MAX_TRACKED_SOURCES, TrackerConfig,
};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

fn tracker(max_connections: usize, per_source: usize) -> ConnectionTracker {
    ConnectionTracker::new(
        TrackerConfig {
            max_connections,
            max_connections_per_source: per_source,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: None,
        },
        EventPipeline::builder().build(),
    )
}

fn addr(host: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), port)
}

#[derive(Debug, Clone)]
enum Op {
    Register { host: u8 },
    Unregister { index: usize },
    Release { index: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(|host| Op::Register { host }),
        any::<usize>().prop_map(|index| Op::Unregister { index }),
        any::<usize>().prop_map(|index| Op::Release { index }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Counts always match a simple model, whatever the interleaving
    #[test]
    fn prop_accounting_matches_model(ops in prop::collection::vec(op(), 1..80)) {
        let tracker = tracker(8, 3);
        let mut live: Vec<(u8, ConnectionHandle)> = Vec::new();
        let mut released: Vec<ConnectionHandle> = Vec::new();
        let mut per_host = [0usize; 4];
        let mut double_releases = 0u64;

        for op in ops {
            match op {
                Op::Register { host } => {
                    let result = tracker.register("ssh", addr(host, 40000));
                    let total: usize = per_host.iter().sum();
                    if total >= 8 {
                        let is_global = matches!(
                            result,
                            Err(HoneypotError::ConnectionLimitExceeded { scope: LimitScope::Global, .. })
                        );
                        prop_assert!(is_global);
                    } else if per_host[host as usize] >= 3 {
                        let is_source = matches!(
                            result,
                            Err(HoneypotError::ConnectionLimitExceeded { scope: LimitScope::Source, .. })
                        );
                        prop_assert!(is_source);
                    } else {
                        let handle = result.unwrap();
                        per_host[host as usize] += 1;
                        live.push((host, handle));
                    }
                }
                Op::Unregister { index } => {
                    if live.is_empty() {
                        continue;
                    }
                    let (host, handle) = live.swap_remove(index % live.len());
                    prop_assert!(tracker.unregister(&handle).is_ok());
                    per_host[host as usize] -= 1;
                    released.push(handle);
                }
                Op::Release { index } => {
                    if released.is_empty() {
                        continue;
                    }
                    let handle = &released[index % released.len()];
                    let is_unknown = matches!(
                        tracker.unregister(handle),
                        Err(HoneypotError::UnknownConnection(id)) if id == handle.id()
                    );
                    prop_assert!(is_unknown);
                    double_releases += 1;
                }
            }

            prop_assert_eq!(tracker.active_count(), live.len());
            prop_assert_eq!(tracker.active_for("ssh"), live.len());
            for (_, handle) in &live {
                prop_assert!(tracker.contains(handle.id()));
            }
        }

        let stats = tracker.stats();
        prop_assert_eq!(stats.active, live.len());
        prop_assert_eq!(stats.double_releases, double_releases);
        prop_assert_eq!(stats.registered - stats.unregistered, live.len() as u64);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_unregister() {
    let tracker = Arc::new(tracker(1000, 1000));

    let mut tasks = Vec::new();
    for worker in 0..8u16 {
        let tracker = tracker.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..200u16 {
                let handle = tracker
                    .register("telnet", addr((worker % 4) as u8, n))
                    .unwrap();
                tokio::task::yield_now().await;
                tracker.unregister(&handle).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = tracker.stats();
    assert_eq!(tracker.active_count(), 0);
    assert_eq!(stats.registered, 1600);
    assert_eq!(stats.unregistered, 1600);
    assert_eq!(stats.double_releases, 0);
    assert_eq!(tracker.total_for("telnet"), 1600);
    assert_eq!(tracker.active_for("telnet"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_ceiling_holds_under_contention() {
    let tracker = Arc::new(tracker(10, 1000));

    let mut tasks = Vec::new();
    for worker in 0..50u8 {
        let tracker = tracker.clone();
        tasks.push(tokio::spawn(async move {
            tracker.register("ssh", addr(worker, 22)).ok()
        }));
    }
    let mut accepted = Vec::new();
    for task in tasks {
        if let Some(handle) = task.await.unwrap() {
            accepted.push(handle);
        }
    }

    assert_eq!(accepted.len(), 10);
    assert_eq!(tracker.active_count(), 10);
    assert_eq!(tracker.stats().rejected, 40);
}

#[tokio::test]
async fn test_cancel_plugin_only_touches_its_connections() {
    let tracker = tracker(10, 10);
    let ssh = tracker.register("ssh", addr(1, 1000)).unwrap();
    let telnet = tracker.register("telnet", addr(1, 1001)).unwrap();

    let cancelled = tracker.cancel_plugin("ssh", CloseReason::Shutdown);

    assert_eq!(cancelled, 1);
    assert!(ssh.is_cancelled());
    assert_eq!(ssh.close_reason(), Some(CloseReason::Shutdown));
    assert!(!telnet.is_cancelled());
    assert_eq!(telnet.close_reason(), None);
}

#[tokio::test]
async fn test_source_totals_stay_bounded() {
    let tracker = tracker(10, 10);
    let busy = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 22);
    for _ in 0..5 {
        let handle = tracker.register("dns", busy).unwrap();
        tracker.unregister(&handle).unwrap();
    }

    // One sender cycling through forged addresses
    let forged = 3 * MAX_TRACKED_SOURCES as u32;
    for n in 0..forged {
        let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + n)), 53);
        let handle = tracker.register("dns", remote).unwrap();
        tracker.unregister(&handle).unwrap();
    }

    let stats = tracker.stats();
    assert!(stats.tracked_sources <= MAX_TRACKED_SOURCES);
    assert_eq!(stats.unique_sources, forged as usize + 1);
    assert_eq!(stats.top_sources[0], (busy.ip(), 5));
    assert_eq!(stats.registered, forged as u64 + 5);
    assert_eq!(stats.active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_lifetime_ceiling_evicts_active_connection() {
    let tracker = ConnectionTracker::new(
        TrackerConfig {
            max_connections: 10,
            max_connections_per_source: 10,
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Some(Duration::from_secs(30)),
        },
        EventPipeline::builder().build(),
    );
    let chatty = tracker.register("ssh", addr(1, 40000)).unwrap();

    for _ in 0..2 {
        tokio::time::advance(Duration::from_secs(10)).await;
        chatty.touch();
        assert_eq!(tracker.idle_sweep(), 0);
    }
    tokio::time::advance(Duration::from_secs(10)).await;
    chatty.touch();

    assert_eq!(tracker.idle_sweep(), 1);
    assert!(chatty.is_cancelled());
    assert_eq!(chatty.close_reason(), Some(CloseReason::LifetimeExceeded));
    assert_eq!(CloseReason::LifetimeExceeded.as_str(), "lifetime_exceeded");
    assert!(chatty.idle_for() < Duration::from_secs(1));

    tracker.unregister(&chatty).unwrap();
    assert_eq!(tracker.active_count(), 0);
}
