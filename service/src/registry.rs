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

//! Closed registry of plugin kinds
//!
//! Kinds are registered by the composition root at startup; there is no
//! runtime discovery. An unknown kind fails fast with
//! [`HoneypotError::UnknownPluginKind`].

use crate::plugin::Plugin;
use crate::{HoneypotError, Result};
use std::collections::BTreeMap;

/// Builds a fresh, unconfigured plugin instance
pub type PluginFactory = fn() -> Box<dyn Plugin>;

/// Maps a kind name (e.g. `"ssh"`) to its factory
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<&'static str, PluginFactory>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for `kind`
    pub fn register(&mut self, kind: &'static str, factory: PluginFactory) -> &mut Self {
        self.factories.insert(kind, factory);
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, kind: &'static str, factory: PluginFactory) -> Self {
        self.register(kind, factory);
        self
    }

    /// Check if `kind` is known
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Known kinds, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Build an unconfigured instance of `kind`
    pub fn create(&self, kind: &str) -> Result<Box<dyn Plugin>> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| HoneypotError::UnknownPluginKind(kind.to_string()))
    }
}
