//! Engine configuration: load from YAML or use the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::RemainingInstancePolicy;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine. Every field has a default, so a YAML file
/// only needs to list what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts at a firing transaction before `FiringConflict`.
    pub max_fire_retries: u32,
    /// Upper bound on automatic task firings triggered by one command.
    pub max_auto_steps: u32,
    /// Capacity of each case controller's command mailbox.
    pub mailbox_capacity: usize,
    /// Capacity of the broadcast event channel. Slow subscribers lag.
    pub event_buffer: usize,
    /// Policy for multi-instance tasks that do not set one.
    pub default_remaining_policy: RemainingInstancePolicy,
    /// Write a snapshot to the case store after every command.
    pub persist_snapshots: bool,
    /// Finished cases whose final state stays queryable after their
    /// controller is released. Oldest are forgotten first.
    pub finished_case_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fire_retries: 3,
            max_auto_steps: 1_000,
            mailbox_capacity: 64,
            event_buffer: 1_024,
            default_remaining_policy: RemainingInstancePolicy::ForceComplete,
            persist_snapshots: true,
            finished_case_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml).context("Parsing engine config")?;
        Ok(config.sanitized())
    }

    /// Load from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        Ok(config.sanitized())
    }

    // Channels cannot be created with zero capacity.
    fn sanitized(mut self) -> Self {
        self.max_fire_retries = self.max_fire_retries.max(1);
        self.mailbox_capacity = self.mailbox_capacity.max(1);
        self.event_buffer = self.event_buffer.max(1);
        self
    }
}
