use crate::error::{Result, UpdateError};
use crate::utils::fs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Group name the build pattern must capture the numeric build id into.
pub const BUILD_GROUP: &str = "build";

pub const DEFAULT_BUILD_PATTERN: &str = r#"(?i)https?://[^\s"'<>]*?-(?P<build>\d+)\.zip"#;
pub const DEFAULT_SELF_UPDATE_FILTER: &str =
    r"+\.exe$;+\.pdb$;+\.dll$;+^stagehand$;+^selfupdate$;-^nlog\.dll$";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub stagehand_dir: PathBuf,
    pub target_name: String,
    pub install_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub version_file: PathBuf,
    pub build_feed_url: String,
    pub build_pattern: String,
    pub archive_root: Option<String>,
    pub user_data_marker: String,
    pub protected_file: String,
    pub auto_shutdown: bool,
    pub lock_grace_ms: u64,
    pub atomic_install: bool,
    pub request_timeout_secs: u64,
    pub self_update_url: String,
    pub self_update_name: String,
    pub self_update_filter: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let stagehand_dir =
            get_stagehand_dir().unwrap_or_else(|_| PathBuf::from(".stagehand"));
        Self::rooted_at(stagehand_dir)
    }
}

impl Config {
    /// Builds a default configuration with every path under `stagehand_dir`.
    pub fn rooted_at(stagehand_dir: PathBuf) -> Self {
        Config {
            install_dir: stagehand_dir.join("app"),
            temp_dir: stagehand_dir.join("temp"),
            version_file: stagehand_dir.join("version.json"),
            stagehand_dir,
            target_name: "xbmc".to_string(),
            build_feed_url: "http://builds.example.org/nightly/".to_string(),
            build_pattern: DEFAULT_BUILD_PATTERN.to_string(),
            archive_root: None,
            user_data_marker: "userdata".to_string(),
            protected_file: "keymap.xml".to_string(),
            auto_shutdown: true,
            lock_grace_ms: 1000,
            atomic_install: true,
            request_timeout_secs: 30,
            self_update_url: "http://builds.example.org/stagehand/".to_string(),
            self_update_name: "stagehand".to_string(),
            self_update_filter: DEFAULT_SELF_UPDATE_FILTER.to_string(),
            log_level: "info".to_string(),
        }
    }

    pub fn load() -> Result<Self> {
        let config_path = get_config_path()?;

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let config = Self::load_from(&config_path)?;
        fs::ensure_dir_exists(&config.stagehand_dir)?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| UpdateError::filesystem(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::ensure_dir_exists(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| UpdateError::filesystem(path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_name.trim().is_empty() {
            return Err(UpdateError::config("target_name must not be empty"));
        }
        if self.build_feed_url.trim().is_empty() {
            return Err(UpdateError::config("build_feed_url must not be empty"));
        }
        if self.self_update_url.trim().is_empty() {
            return Err(UpdateError::config("self_update_url must not be empty"));
        }

        let pattern = Regex::new(&self.build_pattern)
            .map_err(|e| UpdateError::config(format!("invalid build_pattern: {e}")))?;
        if !pattern.capture_names().flatten().any(|n| n == BUILD_GROUP) {
            return Err(UpdateError::config(format!(
                "build_pattern must capture a named group '{BUILD_GROUP}'"
            )));
        }

        Ok(())
    }

    pub fn lock_grace(&self) -> Duration {
        Duration::from_millis(self.lock_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Directory new self-update binaries are staged in until the next launch.
    pub fn get_self_update_staging_dir(&self) -> PathBuf {
        self.stagehand_dir.join("selfupdate")
    }

    pub fn get_self_update_temp_dir(&self) -> PathBuf {
        self.temp_dir.join("selfupdate")
    }
}

fn get_stagehand_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".stagehand"))
        .ok_or(UpdateError::HomeDirectoryNotFound)
}

fn get_config_path() -> Result<PathBuf> {
    Ok(get_stagehand_dir()?.join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::rooted_at(PathBuf::from("/opt/stagehand"));
        assert!(config.validate().is_ok());
        assert_eq!(config.temp_dir, PathBuf::from("/opt/stagehand/temp"));
        assert_eq!(
            config.get_self_update_temp_dir(),
            PathBuf::from("/opt/stagehand/temp/selfupdate")
        );
        assert_eq!(config.lock_grace(), Duration::from_secs(1));
    }

    #[test]
    fn test_pattern_without_build_group_is_rejected() {
        let mut config = Config::rooted_at(PathBuf::from("/tmp/x"));
        config.build_pattern = r"https?://\S+\.zip".to_string();
        assert!(matches!(config.validate(), Err(UpdateError::Config { .. })));

        config.build_pattern = "(unclosed".to_string();
        assert!(matches!(config.validate(), Err(UpdateError::Config { .. })));
    }

    #[test]
    fn test_save_and_load_round_trip_with_missing_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");

        std::fs::write(
            &path,
            r#"{ "target_name": "kodi", "build_feed_url": "http://mirror/builds" }"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.target_name, "kodi");
        assert_eq!(config.user_data_marker, "userdata");
        assert!(config.atomic_install);

        config.save_to(&path).unwrap();
        let again = Config::load_from(&path).unwrap();
        assert_eq!(again.build_feed_url, "http://mirror/builds");
    }
}
