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

//! Loads the plugin registry and negotiated-limit defaults from a TOML
//! file, falling back to the debug catalog when none is present.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use caphost_core::catalog::{self, PluginCatalog, PluginDescription};
use caphost_protocol::Limits;

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    plugin: Vec<RawPlugin>,
    limits: Option<RawLimits>,
}

#[derive(Debug, Deserialize)]
struct RawPlugin {
    name: String,
    exec_path: PathBuf,
    #[serde(default)]
    known_caps: Vec<String>,
    #[serde(default)]
    autorun: bool,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    max_frame: Option<u32>,
    max_chunk: Option<u32>,
    max_reorder_buffer: Option<u32>,
}

pub struct Config {
    pub catalog: PluginCatalog,
    pub limits: Limits,
}

/// `$XDG_CONFIG_HOME/caphost/plugins.toml`, or `./caphost/plugins.toml`
/// if no config directory can be resolved.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("caphost").join("plugins.toml")
}

/// Reads `path`. Missing file is not an error: it means "run with the
/// debug catalog", same as the teacher's `XI_PLUGIN_DIR` fallback.
pub fn load(path: &Path) -> Config {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::info!("no config file at {:?} ({}), using debug plugin catalog", path, e);
            return Config { catalog: PluginCatalog::new(catalog::debug_plugins()), limits: Limits::default_offer() };
        }
    };
    let raw: RawConfig = match toml::from_str(&text) {
        Ok(raw) => raw,
        Err(e) => {
            log::error!("failed to parse config {:?}: {}, using debug plugin catalog", path, e);
            return Config { catalog: PluginCatalog::new(catalog::debug_plugins()), limits: Limits::default_offer() };
        }
    };

    let mut descriptions = Vec::with_capacity(raw.plugin.len());
    for p in raw.plugin {
        let caps = p
            .known_caps
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(cap) => Some(cap),
                Err(e) => {
                    log::warn!("plugin {} has invalid known_caps entry {:?}: {:?}", p.name, s, e);
                    None
                }
            })
            .collect();
        let mut desc = PluginDescription::new(p.name, p.exec_path, caps);
        if p.autorun {
            desc = desc.autorun();
        }
        descriptions.push(desc);
    }

    let mut limits = Limits::default_offer();
    if let Some(raw_limits) = raw.limits {
        if let Some(v) = raw_limits.max_frame {
            limits.max_frame = v;
        }
        if let Some(v) = raw_limits.max_chunk {
            limits.max_chunk = v;
        }
        if let Some(v) = raw_limits.max_reorder_buffer {
            limits.max_reorder_buffer = v;
        }
    }

    Config { catalog: PluginCatalog::new(descriptions), limits }
}
