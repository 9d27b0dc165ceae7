//! Engine configuration loader.
//!
//! Reads `stepwise.toml` from the data directory (`~/.stepwise/` by default)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use stepwise_types::config::EngineConfig;

const CONFIG_FILE: &str = "stepwise.toml";
const DATABASE_FILE: &str = "stepwise.db";

/// Load engine configuration from `{data_dir}/stepwise.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Data directory: `STEPWISE_DATA_DIR`, else `~/.stepwise`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("STEPWISE_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stepwise"),
    }
}

/// `sqlite://{data_dir}/stepwise.db`
pub fn database_url_for(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join(DATABASE_FILE).display())
}

/// Database URL under [`default_data_dir`].
pub fn default_database_url() -> String {
    database_url_for(&default_data_dir())
}

/// The configured `database_url`, or the one derived from `data_dir`.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_for(data_dir))
}
