// Copyright 2024 The caphost Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Static description of the plugins the host may spawn, and a catalog
//! collecting them by name.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use caphost_urn::CapUrn;

/// Environment variable pointing at a directory of debug plugin
/// executables, checked before falling back to the directory the host
/// binary itself lives in.
pub const PLUGIN_DIR_VAR: &str = "CAPHOST_PLUGIN_DIR";

/// Whether a plugin should be spawned at startup or only on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Spawn and handshake immediately when the host starts.
    Autorun,
    /// Spawn lazily, the first time a request needs one of its caps.
    OnDemand,
}

/// Static description of a plugin the host is willing to spawn.
#[derive(Debug, Clone)]
pub struct PluginDescription {
    pub name: String,
    pub exec_path: PathBuf,
    /// Caps this plugin is registered for ahead of its first handshake.
    /// Used to keep advertising its caps across a respawn, and as the
    /// fallback list if it is never actually spawned.
    pub known_caps: Vec<CapUrn>,
    pub activation: Activation,
}

impl PluginDescription {
    pub fn new(name: impl Into<String>, exec_path: impl Into<PathBuf>, known_caps: Vec<CapUrn>) -> Self {
        PluginDescription { name: name.into(), exec_path: exec_path.into(), known_caps, activation: Activation::OnDemand }
    }

    pub fn autorun(mut self) -> Self {
        self.activation = Activation::Autorun;
        self
    }
}

/// Example plugins for local development, discovered next to the host
/// binary (or under `CAPHOST_PLUGIN_DIR` if set), mirroring how a test
/// rig exercises the router without a real config file.
pub fn debug_plugins() -> Vec<PluginDescription> {
    let plugin_dir = match env::var(PLUGIN_DIR_VAR).map(PathBuf::from) {
        Ok(p) => p,
        Err(_) => env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_owned()))
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let make_path = |p: &str| plugin_dir.join(p);

    vec![PluginDescription::new("demo", make_path("demo-plugin"), Vec::new()).autorun()]
        .into_iter()
        .filter(|desc| {
            if !desc.exec_path.exists() {
                log::debug!("missing debug plugin {} at {:?}", desc.name, desc.exec_path);
                false
            } else {
                true
            }
        })
        .collect()
}

/// A catalog of all available plugins, by name.
#[derive(Default)]
pub struct PluginCatalog {
    items: HashMap<String, PluginDescription>,
}

impl PluginCatalog {
    pub fn new(plugins: Vec<PluginDescription>) -> Self {
        let mut items = HashMap::with_capacity(plugins.len());
        for plugin in plugins {
            if items.contains_key(&plugin.name) {
                log::warn!("duplicate plugin name {}, keeping first registration", plugin.name);
                continue;
            }
            items.insert(plugin.name.clone(), plugin);
        }
        PluginCatalog { items }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginDescription> {
        self.items.values()
    }

    pub fn get_named(&self, name: &str) -> Option<&PluginDescription> {
        self.items.get(name)
    }
}
