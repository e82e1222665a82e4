//! Engine configuration loader for Weft.
//!
//! Reads `config.toml` from the data directory (`~/.weft/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when
//! the file is missing or malformed, so a bad edit never blocks recovery of
//! running instances.

use std::path::Path;

use weft_types::config::EngineConfig;

use crate::filesystem::config_path;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - Otherwise the parsed config, with zero limits clamped to 1.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

fn sanitize(mut config: EngineConfig) -> EngineConfig {
    if config.max_concurrent_activities == 0 {
        tracing::warn!("max_concurrent_activities = 0 would deadlock the scheduler, using 1");
        config.max_concurrent_activities = 1;
    }
    if config.max_advances == 0 {
        tracing::warn!("max_advances = 0 would fail every instance, using 1");
        config.max_advances = 1;
    }
    config
}
