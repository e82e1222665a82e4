//! Engine configuration types for Weft.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! scheduler limits and defaults applied to every workflow instance.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.weft/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to activities that do not declare their own.
    #[serde(default = "default_activity_timeout_secs")]
    pub default_activity_timeout_secs: u64,

    /// Maximum activities of one instance executing at the same time.
    #[serde(default = "default_max_concurrent_activities")]
    pub max_concurrent_activities: usize,

    /// Upper bound on orchestrator advances per drive, guarding against
    /// definitions that never terminate.
    #[serde(default = "default_max_advances")]
    pub max_advances: u32,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_activity_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_activities() -> usize {
    8
}

fn default_max_advances() -> u32 {
    1000
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_activity_timeout_secs: default_activity_timeout_secs(),
            max_concurrent_activities: default_max_concurrent_activities(),
            max_advances: default_max_advances(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}
