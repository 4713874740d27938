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

//! Medovina honeypot server
//!
//! Composition root: binds the built-in emulators to the host framework,
//! builds the configured event sinks and runs the supervisor until asked to
//! stop.

pub mod logging;
pub mod settings;
pub mod signals;

use medovina_service::{
    EventPipeline, HoneypotConfig, HoneypotError, PluginRegistry, PluginSummary, Result,
    StopReport, Supervisor, sink,
};
use std::future::Future;
use tracing::{error, info, warn};

/// Registry of every emulator compiled into this binary
pub fn builtin_registry() -> PluginRegistry {
    PluginRegistry::new().with(medovina_ssh::KIND, medovina_ssh::factory)
}

/// Event pipeline with one sink per configured entry
pub fn build_pipeline(config: &HoneypotConfig) -> EventPipeline {
    let sinks = config
        .sinks
        .iter()
        .map(|sink| sink::build(sink, &config.global.hostname))
        .collect();
    EventPipeline::from_config(&config.global.events, sinks)
}

/// Validate `config` against the built-in registry without binding anything
///
/// Returns the descriptor summaries on success.
pub fn check(config: &HoneypotConfig) -> Result<Vec<PluginSummary>> {
    config.validate()?;
    let registry = builtin_registry();
    if let Some(unknown) = config
        .enabled_plugins()
        .find(|d| !registry.contains(&d.kind))
    {
        return Err(HoneypotError::UnknownPluginKind(unknown.kind.clone()));
    }
    Ok(config.plugins.iter().map(|d| d.summary()).collect())
}

/// Start every enabled plugin, wait for `shutdown`, then stop everything
///
/// Fails with [`HoneypotError::NoPluginsAvailable`] (after releasing whatever
/// did start) when no plugin reaches `Running`.
pub async fn run<F>(config: HoneypotConfig, shutdown: F) -> Result<StopReport>
where
    F: Future<Output = ()>,
{
    let timeout = config.global.shutdown_timeout();
    let pipeline = build_pipeline(&config);
    let supervisor = Supervisor::new(config, builtin_registry(), pipeline);

    match supervisor.start_all().await {
        Ok(running) => info!(running, "Honeypot running"),
        Err(e) => {
            error!(error = %e, "Startup failed");
            supervisor.stop_all(timeout).await;
            return Err(e);
        }
    }

    shutdown.await;

    let report = supervisor.stop_all(timeout).await;
    for (name, outcome) in &report.outcomes {
        info!(plugin = %name, %outcome, "Plugin stop outcome");
    }
    if report.events.abandoned > 0 {
        warn!(abandoned = report.events.abandoned, "Events abandoned at shutdown");
    }
    Ok(report)
}
