use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use spaces_engine::{ConfigError, EngineConfig, default_config_path, default_storage_root};

/// Daemon-level settings. Shares `~/.spaces/config.toml` with
/// [`EngineConfig`]; each side ignores the other's keys.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonSettings {
    /// Verbose logging plus the diagnostics log file
    pub debug: bool,
    pub profile: String,
    /// Overrides the per-profile socket under `~/.spaces/run`
    pub socket_path: Option<PathBuf>,
    /// Overrides `~/.spaces` as the storage root
    pub storage_root: Option<PathBuf>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            debug: false,
            profile: "default".to_string(),
            socket_path: None,
            storage_root: None,
        }
    }
}

impl DaemonSettings {
    /// Load settings from `path`, or return defaults if the file doesn't
    /// exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| spaces_shared::socket_path::socket_path_for(&self.profile))
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage_root.clone().unwrap_or_else(default_storage_root)
    }
}

/// Everything the daemon reads from its config file.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub settings: DaemonSettings,
    pub engine: EngineConfig,
}

impl LoadedConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        Ok(Self {
            settings: DaemonSettings::load(&path)?,
            engine: EngineConfig::load(&path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shared_file_feeds_both_sections() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            "profile = \"work\"\ndebug = true\nflush_delay_ms = 50\n",
        )
        .unwrap();

        let loaded = LoadedConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.settings.profile, "work");
        assert!(loaded.settings.debug);
        assert_eq!(loaded.engine.flush_delay_ms, 50, "engine keys must be read too");
        assert_eq!(loaded.engine.debounce_ms, 100);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = DaemonSettings::load(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(settings, DaemonSettings::default());
        let socket = settings.socket_path();
        assert!(
            socket.to_string_lossy().contains("spaces-default"),
            "socket is named after the profile"
        );
    }

    #[test]
    fn test_explicit_paths_win() {
        let settings = DaemonSettings {
            socket_path: Some(PathBuf::from("/tmp/custom.sock")),
            storage_root: Some(PathBuf::from("/tmp/spaces-root")),
            ..DaemonSettings::default()
        };
        assert_eq!(settings.socket_path(), PathBuf::from("/tmp/custom.sock"));
        assert_eq!(settings.storage_root(), PathBuf::from("/tmp/spaces-root"));
    }
}
