//! Persisted settings blob: one JSON file, written pretty, read
//! tolerantly (missing file means defaults, unknown fields are ignored).

use crate::engine::{EngineConfig, Protocol};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Router history keeps this many most-recently-used entries.
pub const MAX_HISTORY: usize = 10;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub protocol: Protocol,
    pub inputs: u16,
    pub outputs: u16,
    pub levels: u16,
    pub port: u16,
    pub model_name: String,
    pub friendly_name: String,
    pub auto_start: bool,
    pub controller_host: String,
    pub controller_port: u16,
    pub auto_reconnect: bool,
    pub router_history: Vec<HistoryEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            protocol: engine.protocol,
            inputs: engine.inputs,
            outputs: engine.outputs,
            levels: engine.levels,
            port: engine.port,
            model_name: engine.model_name,
            friendly_name: engine.friendly_name,
            auto_start: true,
            controller_host: String::new(),
            controller_port: Protocol::Videohub.default_port(),
            auto_reconnect: true,
            router_history: Vec::new(),
        }
    }
}

impl Settings {
    /// Read the blob; a missing file yields defaults, a corrupt one is an
    /// error (the caller decides whether to fall back).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing settings from {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("writing settings to {}", path.display()))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            protocol: self.protocol,
            inputs: self.inputs,
            outputs: self.outputs,
            levels: self.levels,
            port: self.port,
            model_name: self.model_name.clone(),
            friendly_name: self.friendly_name.clone(),
            ..EngineConfig::default()
        }
    }

    /// LRU by the `(host, port, protocol)` triple.
    pub fn remember_router(&mut self, host: impl Into<String>, port: u16, protocol: Protocol) {
        let entry = HistoryEntry {
            host: host.into(),
            port,
            protocol,
        };
        self.router_history.retain(|e| *e != entry);
        self.router_history.insert(0, entry);
        self.router_history.truncate(MAX_HISTORY);
    }
}
