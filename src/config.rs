//! Runtime configuration types.

use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Output format for the metrics report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetricsFormat {
    #[default]
    Human,
    Json,
}

/// Runtime configuration for the machine
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Instruction budget for a single run (bounds runaway programs)
    pub max_instructions: u64,
    /// Visit count a pc must exceed to become a compilation candidate
    pub jit_threshold: u64,
    /// Whether to trace hot-spot detection events
    pub trace_jit: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            jit_threshold: 10,
            trace_jit: false,
        }
    }
}

/// Project manifest (vm.toml)
#[derive(Debug, Default, Deserialize)]
pub struct EngineManifest {
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct EngineSection {
    pub entry: Option<String>,
    pub max_instructions: Option<u64>,
    pub jit_threshold: Option<u64>,
    pub trace_jit: Option<bool>,
}

impl EngineManifest {
    /// Load a manifest from a directory, if one is present.
    pub fn load(dir: &Path) -> Result<Self, String> {
        let manifest_path = dir.join("vm.toml");
        let content = fs::read_to_string(&manifest_path)
            .map_err(|e| format!("failed to read vm.toml: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse vm.toml: {}", e))
    }

    /// Produce a runtime configuration from the manifest defaults.
    pub fn runtime_config(&self) -> RuntimeConfig {
        let defaults = RuntimeConfig::default();
        RuntimeConfig {
            max_instructions: self.engine.max_instructions.unwrap_or(defaults.max_instructions),
            jit_threshold: self.engine.jit_threshold.unwrap_or(defaults.jit_threshold),
            trace_jit: self.engine.trace_jit.unwrap_or(defaults.trace_jit),
        }
    }
}
