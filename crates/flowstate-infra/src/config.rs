//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.flowstate/` by default)
//! into [`EngineSettings`]. Falls back to defaults when the file is missing
//! or malformed.

use std::path::{Path, PathBuf};

use flowstate_types::config::EngineSettings;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "FLOWSTATE_DATA_DIR";

/// `$FLOWSTATE_DATA_DIR`, else `~/.flowstate`, else `./.flowstate`.
pub fn resolve_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".flowstate")
}

/// Directory scanned for machine definitions at start-up.
pub fn machines_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("machines")
}

/// Load engine settings from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineSettings::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_settings(data_dir: &Path) -> EngineSettings {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineSettings::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineSettings::default();
        }
    };

    match toml::from_str::<EngineSettings>(&content) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineSettings::default()
        }
    }
}
